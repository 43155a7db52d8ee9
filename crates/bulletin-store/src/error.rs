//! Error types for the KV gateway.

use thiserror::Error;

/// Result type alias for KV gateway operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors a KV gateway call can produce.
///
/// `KeyExists`, `KeyNotFound`, `IndexMismatch`, and `ValueMismatch` are
/// logical outcomes that callers act on. `Timeout` and `Unavailable` are
/// transient and absorbed by [`crate::retry`] for writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("key already exists: {0}")]
    KeyExists(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("index mismatch at {key}: expected {expected}, found {actual}")]
    IndexMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("value mismatch at {0}")]
    ValueMismatch(String),

    #[error("store operation timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to open store: {0}")]
    Open(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("watch on {0} dropped events")]
    WatchDropped(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Unavailable(_))
    }

    /// A compare failed because someone else wrote first.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::IndexMismatch { .. } | StoreError::ValueMismatch(_)
        )
    }
}
