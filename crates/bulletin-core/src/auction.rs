//! Transient placement requests consumed by the auctioneer.

use serde::{Deserialize, Serialize};

use crate::error::{FieldError, ValidationErrors};
use crate::keys;
use crate::lrp::DesiredLrp;
use crate::record::{Record, require_guid};
use crate::state::numeric_state;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AuctionState {
    #[default]
    Pending,
    Claimed,
}

numeric_state!(AuctionState {
    Pending = 0,
    Claimed = 1,
});

/// "Please place instance `index` of this desired LRP."
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LrpStartAuction {
    pub desired_lrp: DesiredLrp,
    pub index: i32,
    #[serde(default)]
    pub state: AuctionState,
    #[serde(default)]
    pub updated_at: i64,
}

impl LrpStartAuction {
    pub fn new(desired_lrp: DesiredLrp, index: i32, now: i64) -> Self {
        Self {
            desired_lrp,
            index,
            state: AuctionState::Pending,
            updated_at: now,
        }
    }

    pub fn process_guid(&self) -> &str {
        &self.desired_lrp.process_guid
    }
}

impl Record for LrpStartAuction {
    fn key(&self) -> String {
        keys::start_auction_key(&self.desired_lrp.process_guid, self.index)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Err(desired) = self.desired_lrp.validate() {
            errs.extend(desired);
        }
        if self.index < 0 {
            errs.push(FieldError::invalid("index"));
        }
        errs.into_result()
    }
}

/// "Please stop the instances of this process beyond `instances`."
///
/// One record per process guid; repeated requests coalesce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LrpStopAuction {
    pub process_guid: String,
    /// Desired instance count when the auction was requested. Indices at or
    /// above it are excess.
    pub instances: u32,
    #[serde(default)]
    pub state: AuctionState,
    #[serde(default)]
    pub updated_at: i64,
}

impl LrpStopAuction {
    pub fn new(process_guid: &str, instances: u32, now: i64) -> Self {
        Self {
            process_guid: process_guid.to_string(),
            instances,
            state: AuctionState::Pending,
            updated_at: now,
        }
    }
}

impl Record for LrpStopAuction {
    fn key(&self) -> String {
        keys::stop_auction_key(&self.process_guid)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        require_guid(&mut errs, "process_guid", &self.process_guid);
        errs.into_result()
    }
}
