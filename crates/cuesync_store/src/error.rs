//! Error types for the local store.

use cuesync_protocol::{LocalId, ProtocolError};
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
///
/// A [`StoreError::StorageFault`] is fatal to the operation that hit it but
/// not to the process; callers retry later.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage failed or is corrupted.
    #[error("storage fault: {message}")]
    StorageFault {
        /// Description of the fault.
        message: String,
    },

    /// No entity with this id exists.
    #[error("entity not found: {local_id}")]
    NotFound {
        /// The id that was looked up.
        local_id: LocalId,
    },

    /// A table is already linked to a client.
    #[error("table {table_id} is already assigned to client {client_id}")]
    AlreadyAssigned {
        /// The table.
        table_id: LocalId,
        /// The client holding it.
        client_id: LocalId,
    },

    /// An entity failed validation.
    #[error("invalid entity: {message}")]
    InvalidEntity {
        /// Description of the problem.
        message: String,
    },
}

impl StoreError {
    /// Creates a storage fault.
    pub fn storage_fault(message: impl Into<String>) -> Self {
        Self::StorageFault {
            message: message.into(),
        }
    }

    /// Creates an invalid entity error.
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            message: message.into(),
        }
    }

    /// Returns true if this error comes from the storage layer.
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, StoreError::StorageFault { .. })
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::storage_fault(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage_fault(format!("journal encoding: {err}"))
    }
}

impl From<ProtocolError> for StoreError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::AlreadyAssigned {
                table_id,
                client_id,
            } => Self::AlreadyAssigned {
                table_id,
                client_id,
            },
            ProtocolError::InvalidPayload { message } => Self::InvalidEntity { message },
        }
    }
}
