//! Error types for the sync engine.

use cuesync_protocol::LocalId;
use cuesync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote could not be reached, or a call timed out.
    #[error("remote unreachable: {reason}")]
    Unreachable {
        /// What failed.
        reason: String,
    },

    /// The remote refused the request.
    #[error("remote rejected request: {reason}")]
    Rejected {
        /// Reason given by the remote.
        reason: String,
    },

    /// A conflict needs a human decision.
    #[error("unresolved conflict on {local_id}")]
    ConflictUnresolved {
        /// The conflicted entity.
        local_id: LocalId,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The cycle was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Another cycle is already running.
    #[error("cycle already running")]
    CycleInProgress,
}

impl SyncError {
    /// Creates an unreachable error.
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }

    /// Creates a rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Returns true if running the cycle again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Unreachable { .. } => true,
            SyncError::Cancelled => true,
            SyncError::CycleInProgress => true,
            SyncError::Rejected { .. } => false,
            SyncError::ConflictUnresolved { .. } => false,
            SyncError::Store(_) => false,
        }
    }
}
