//! The local side of a sync cycle.
//!
//! The orchestrator never touches storage directly. It goes through
//! [`SyncApplier`], which [`LocalStore`] implements.

use crate::error::SyncResult;
use cuesync_protocol::{
    EntityType, LocalId, MutationLogEntry, OwnerId, RemoteId, SyncableEntity, Timestamp,
};
use cuesync_store::{LocalStore, ResolutionWrite};
use std::collections::BTreeMap;

/// Local state operations needed by a sync cycle.
pub trait SyncApplier: Send + Sync {
    /// An owner's pending mutations ready to push, oldest first.
    fn pushable_mutations(&self, owner_id: &OwnerId) -> SyncResult<Vec<MutationLogEntry>>;

    /// Records that `entries` are about to be pushed.
    fn mark_sent(&self, entries: &[MutationLogEntry]) -> SyncResult<()>;

    /// The pending mutation of one entity.
    fn pending_entry(&self, local_id: LocalId) -> SyncResult<Option<MutationLogEntry>>;

    /// Reads an entity.
    fn entity(&self, local_id: LocalId) -> SyncResult<Option<SyncableEntity>>;

    /// Looks up an entity by remote identity.
    fn entity_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> SyncResult<Option<SyncableEntity>>;

    /// Records that the remote applied `pushed`.
    fn confirm_push(
        &self,
        pushed: &MutationLogEntry,
        remote_id: RemoteId,
        remote_ts: Timestamp,
    ) -> SyncResult<()>;

    /// Records a failed push; returns the new attempt count.
    fn record_push_failure(
        &self,
        pushed: &MutationLogEntry,
        error: &str,
        conflicted: bool,
    ) -> SyncResult<Option<u32>>;

    /// Drops an unpushable mutation.
    fn discard_mutation(&self, local_id: LocalId) -> SyncResult<Option<MutationLogEntry>>;

    /// Stores resolved entities with compare-and-set semantics.
    fn write_resolutions(&self, writes: Vec<ResolutionWrite>) -> SyncResult<Vec<bool>>;

    /// Entities in the conflicted state.
    fn conflicted(&self) -> SyncResult<Vec<SyncableEntity>>;

    /// Pull watermark of an entity type.
    fn watermark(&self, entity_type: EntityType) -> SyncResult<Timestamp>;

    /// Moves watermarks forward.
    fn advance_watermarks(&self, marks: &BTreeMap<EntityType, Timestamp>) -> SyncResult<()>;
}

impl SyncApplier for LocalStore {
    fn pushable_mutations(&self, owner_id: &OwnerId) -> SyncResult<Vec<MutationLogEntry>> {
        Ok(LocalStore::pushable_mutations(self, owner_id, usize::MAX))
    }

    fn mark_sent(&self, entries: &[MutationLogEntry]) -> SyncResult<()> {
        Ok(LocalStore::mark_sent(self, entries)?)
    }

    fn pending_entry(&self, local_id: LocalId) -> SyncResult<Option<MutationLogEntry>> {
        Ok(LocalStore::pending_entry(self, local_id))
    }

    fn entity(&self, local_id: LocalId) -> SyncResult<Option<SyncableEntity>> {
        Ok(self.find(local_id))
    }

    fn entity_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> SyncResult<Option<SyncableEntity>> {
        Ok(self.find_by_remote_id(entity_type, remote_id))
    }

    fn confirm_push(
        &self,
        pushed: &MutationLogEntry,
        remote_id: RemoteId,
        remote_ts: Timestamp,
    ) -> SyncResult<()> {
        Ok(LocalStore::confirm_push(self, pushed, remote_id, remote_ts)?)
    }

    fn record_push_failure(
        &self,
        pushed: &MutationLogEntry,
        error: &str,
        conflicted: bool,
    ) -> SyncResult<Option<u32>> {
        Ok(LocalStore::record_push_failure(self, pushed, error, conflicted)?)
    }

    fn discard_mutation(&self, local_id: LocalId) -> SyncResult<Option<MutationLogEntry>> {
        Ok(LocalStore::discard_mutation(self, local_id)?)
    }

    fn write_resolutions(&self, writes: Vec<ResolutionWrite>) -> SyncResult<Vec<bool>> {
        Ok(LocalStore::write_resolutions(self, writes)?)
    }

    fn conflicted(&self) -> SyncResult<Vec<SyncableEntity>> {
        Ok(LocalStore::conflicted(self))
    }

    fn watermark(&self, entity_type: EntityType) -> SyncResult<Timestamp> {
        Ok(LocalStore::watermark(self, entity_type))
    }

    fn advance_watermarks(&self, marks: &BTreeMap<EntityType, Timestamp>) -> SyncResult<()> {
        Ok(LocalStore::advance_watermarks(self, marks)?)
    }
}
