//! Error types for leases and their runners.

use bulletin_store::StoreError;
use thiserror::Error;

/// Result type alias for lease operations.
pub type LeaseResult<T> = Result<T, LeaseError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// A held lock was invalidated. Fatal for the holder; restart the
    /// runner to contend again.
    #[error("lock lost")]
    LockLost,

    #[error("presence already held at {0}")]
    PresenceHeld(String),

    #[error("session {0} is destroyed")]
    SessionDestroyed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
