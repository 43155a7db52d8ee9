//! bulletin.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulletinConfig {
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub converger: ConvergenceConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// redb file; an in-memory store is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Pause between retries of a write that timed out.
    #[serde(with = "duration_str")]
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Value written into held locks and presences.
    pub owner_id: String,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    #[serde(with = "duration_str")]
    pub retry_interval: Duration,
    /// How often a blocked acquirer re-checks a contended lock.
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Period between convergence ticks.
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// A pending task older than this is failed.
    #[serde(with = "duration_str")]
    pub time_to_claim: Duration,
    /// Records untouched for this long are republished, and stale claims demoted.
    #[serde(with = "duration_str")]
    pub convergence_interval: Duration,
    /// A resolving task older than this is handed back to Completed.
    #[serde(with = "duration_str")]
    pub time_to_resolve: Duration,
    /// A completed task nobody resolved is deleted after this.
    #[serde(with = "duration_str")]
    pub expire_completed_duration: Duration,
    /// Pending auctions older than this are rewritten to re-fire watchers.
    #[serde(with = "duration_str")]
    pub kick_pending_duration: Duration,
    /// Claimed auctions older than this are deleted.
    #[serde(with = "duration_str")]
    pub expire_claimed_duration: Duration,
    /// Per-request deadline for cell stop calls.
    #[serde(with = "duration_str")]
    pub cell_request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// How often expired TTL keys are purged from the store.
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            retry_interval: Duration::from_millis(500),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            owner_id: "bulletind".to_string(),
            ttl: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            time_to_claim: Duration::from_secs(30 * 60),
            convergence_interval: Duration::from_secs(30),
            time_to_resolve: Duration::from_secs(60),
            expire_completed_duration: Duration::from_secs(2 * 60),
            kick_pending_duration: Duration::from_secs(30),
            expire_claimed_duration: Duration::from_secs(5 * 60),
            cell_request_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

impl BulletinConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: BulletinConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Render a duration in the largest unit that divides it exactly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{millis}ms")
    } else {
        let secs = d.as_secs();
        if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }
}

/// serde adapter for human duration strings.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{raw}'")))
    }
}
