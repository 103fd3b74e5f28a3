//! Outbound mutations.

use crate::entity::{EntityType, LocalId, SyncableEntity};
use serde::{Deserialize, Serialize};

/// Kind of outbound change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Entity was created locally and has no remote copy yet.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted (tombstoned).
    Delete,
}

impl Operation {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            Operation::Create => 1,
            Operation::Update => 2,
            Operation::Delete => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Operation::Create),
            2 => Some(Operation::Update),
            3 => Some(Operation::Delete),
            _ => None,
        }
    }

    /// The operation that describes a write of `entity`.
    pub fn for_entity(entity: &SyncableEntity) -> Self {
        if entity.deleted {
            Operation::Delete
        } else if entity.remote_id.is_none() {
            Operation::Create
        } else {
            Operation::Update
        }
    }
}

/// One pending outbound change.
///
/// Entries are created in the same atomic unit as the local mutation they
/// describe and are removed only once the remote confirms the change, or once
/// the change is declared permanently unrecoverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationLogEntry {
    /// Total order of local intent.
    pub sequence: u64,
    /// Target entity.
    pub local_id: LocalId,
    /// Target entity type.
    pub entity_type: EntityType,
    /// Kind of change.
    pub operation: Operation,
    /// Entity state at logging time.
    pub snapshot: SyncableEntity,
    /// Number of failed push attempts.
    pub attempts: u32,
    /// Last push error, if any.
    pub last_error: Option<String>,
    /// Set once the entry has been handed to the remote. A create that was
    /// sent may exist remotely even if no reply came back.
    #[serde(default)]
    pub sent: bool,
}

impl MutationLogEntry {
    /// Creates a fresh entry.
    pub fn new(sequence: u64, operation: Operation, snapshot: SyncableEntity) -> Self {
        Self {
            sequence,
            local_id: snapshot.local_id,
            entity_type: snapshot.entity_type,
            operation,
            snapshot,
            attempts: 0,
            last_error: None,
            sent: false,
        }
    }
}
