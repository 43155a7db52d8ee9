//! Convergence and cell client error types.

use bulletin_board::BbsError;
use bulletin_store::StoreError;
use thiserror::Error;

/// A pass that could not run to completion.
///
/// Per-record failures never surface here; they are logged and the record
/// is retried on the next tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvergeError {
    #[error("board error: {0}")]
    Board(#[from] BbsError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type ConvergeResult<T> = Result<T, ConvergeError>;

/// Failure to deliver a request to a cell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellClientError {
    #[error("failed to connect to cell at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("cell at {address} answered {status}")]
    Status { address: String, status: u16 },

    #[error("request to cell at {address} timed out")]
    Timeout { address: String },

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl CellClientError {
    /// Whether the same request may succeed on a later tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            CellClientError::Connect { .. } | CellClientError::Timeout { .. } => true,
            CellClientError::Status { status, .. } => *status >= 500,
            CellClientError::Encode(_) => false,
        }
    }
}

pub type CellClientResult<T> = Result<T, CellClientError>;
