//! Error types for the sync data model.

use crate::entity::LocalId;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by the sync data model.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A payload does not have the shape its entity type requires.
    #[error("invalid payload: {message}")]
    InvalidPayload {
        /// Description of the problem.
        message: String,
    },

    /// A table is already linked to a client.
    #[error("table {table_id} is already assigned to client {client_id}")]
    AlreadyAssigned {
        /// The table.
        table_id: LocalId,
        /// The client currently holding the table.
        client_id: LocalId,
    },
}

impl ProtocolError {
    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }
}
