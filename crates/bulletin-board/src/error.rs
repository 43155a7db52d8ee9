//! State machine error types.

use bulletin_core::{ModelError, ValidationErrors};
use bulletin_store::StoreError;
use thiserror::Error;

/// Errors returned by state machine operations.
///
/// Validation and policy errors come back to callers unchanged. Transient
/// store errors on writes are retried away before they get here; reads
/// propagate them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BbsError {
    #[error("invalid record: {0}")]
    Model(#[from] ModelError),

    #[error("{record} already exists at {key}")]
    AlreadyExists { record: &'static str, key: String },

    #[error("{record} at {key}: transition from {from} to {to} not allowed")]
    TransitionNotAllowed {
        record: &'static str,
        key: String,
        from: String,
        to: String,
    },

    #[error("task {task_guid} is running on {actual}, not {expected}")]
    CellMismatch {
        task_guid: String,
        expected: String,
        actual: String,
    },

    #[error("no active auctioneer")]
    NoAuctioneer,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ValidationErrors> for BbsError {
    fn from(errs: ValidationErrors) -> Self {
        BbsError::Model(ModelError::Invalid(errs))
    }
}

impl BbsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BbsError::Store(StoreError::KeyNotFound(_)))
    }

    /// Someone else wrote the record between our read and our write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BbsError::Store(e) if e.is_conflict())
    }

    pub(crate) fn transition(
        record: &'static str,
        key: &str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        BbsError::TransitionNotAllowed {
            record,
            key: key.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Result type alias for state machine operations.
pub type BbsResult<T> = Result<T, BbsError>;
