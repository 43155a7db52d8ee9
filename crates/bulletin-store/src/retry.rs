//! Constant-interval retry for store writes.
//!
//! Writes are retried for as long as the store reports a transient error
//! (`Timeout`, `Unavailable`). Logical errors return immediately.

use std::time::Duration;

use tracing::warn;

use crate::error::StoreResult;

/// Default pause between attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// How long to wait between attempts. There is no jitter and no growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl RetryPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

/// Run `op` until it succeeds or fails with a non-transient error.
pub async fn retry_indefinitely<T>(
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let mut attempt: u64 = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() => {
                warn!(
                    op = what,
                    attempt,
                    error = %e,
                    retry_in_ms = policy.interval.as_millis() as u64,
                    "transient store error, retrying"
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
