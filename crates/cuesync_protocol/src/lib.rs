//! # cuesync Protocol
//!
//! Sync data model for the cuesync offline-first engine.
//!
//! This crate provides:
//! - [`SyncableEntity`] and its identity/timestamp/state metadata
//! - [`MutationLog`] of pending outbound changes with coalescing
//! - [`ConflictResolver`] with last-writer-wins and field-level overrides
//! - [`TableAssignment`], the table ↔ client link model
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod assignment;
mod conflict;
mod entity;
mod error;
mod operation;
mod oplog;

pub use assignment::{AssignmentState, TableAssignment};
pub use conflict::{ConflictResolution, ConflictResolver, FieldPolicy};
pub use entity::{
    EntityType, LocalId, OwnerId, Payload, RemoteId, SyncState, SyncableEntity, Timestamp,
};
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{MutationLogEntry, Operation};
pub use oplog::{group_batches, MutationLog, Recorded};
