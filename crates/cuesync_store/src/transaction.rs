//! User-facing read-modify-write transactions.

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::store::StoreInner;
use cuesync_protocol::{LocalId, SyncableEntity, Timestamp};
use std::collections::HashMap;

/// A transaction over the local store.
///
/// Reads see committed state plus the transaction's own staged writes. All
/// staged writes are committed as one journal record when the closure passed
/// to [`crate::LocalStore::transaction`] returns `Ok`, and discarded
/// otherwise. The store lock is held for the whole transaction.
pub struct StoreTransaction<'a> {
    inner: &'a StoreInner,
    clock: &'a dyn Clock,
    staged: Vec<SyncableEntity>,
    index: HashMap<LocalId, usize>,
    last_ts: Timestamp,
}

impl<'a> StoreTransaction<'a> {
    pub(crate) fn new(inner: &'a StoreInner, clock: &'a dyn Clock) -> Self {
        Self {
            inner,
            clock,
            staged: Vec::new(),
            index: HashMap::new(),
            last_ts: inner.last_timestamp(),
        }
    }

    /// Reads an entity, including writes staged in this transaction.
    pub fn get(&self, local_id: LocalId) -> Option<SyncableEntity> {
        match self.index.get(&local_id) {
            Some(&i) => Some(self.staged[i].clone()),
            None => self.inner.entity(local_id).cloned(),
        }
    }

    /// Inserts or replaces an entity.
    ///
    /// The store owns the sync metadata: the entity gets a fresh mutation
    /// timestamp and a pending state, keeps any remote identity it already
    /// has, and is undeleted if it was a tombstone.
    pub fn upsert(&mut self, mut entity: SyncableEntity) -> StoreResult<SyncableEntity> {
        let previous = self.get(entity.local_id);
        match &previous {
            Some(prev) if prev.entity_type != entity.entity_type => {
                return Err(StoreError::invalid_entity(format!(
                    "{} is a {}, not a {}",
                    entity.local_id, prev.entity_type, entity.entity_type
                )));
            }
            Some(prev) => {
                entity.remote_id = prev.remote_id.clone();
                entity.updated_at_remote = prev.updated_at_remote;
            }
            None => {
                entity.remote_id = None;
                entity.updated_at_remote = None;
            }
        }

        entity.deleted = false;
        entity.updated_at_local = self.next_timestamp(previous.as_ref());
        entity.sync_state = entity.pending_state();
        self.stage(entity.clone());
        Ok(entity)
    }

    /// Tombstones an entity. Deleting a tombstone is a no-op.
    pub fn soft_delete(&mut self, local_id: LocalId) -> StoreResult<SyncableEntity> {
        let mut entity = self.get(local_id).ok_or(StoreError::NotFound { local_id })?;
        if entity.deleted {
            return Ok(entity);
        }

        entity.updated_at_local = self.next_timestamp(Some(&entity));
        entity.deleted = true;
        entity.sync_state = entity.pending_state();
        self.stage(entity.clone());
        Ok(entity)
    }

    /// Number of staged writes.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn stage(&mut self, entity: SyncableEntity) {
        match self.index.get(&entity.local_id) {
            Some(&i) => self.staged[i] = entity,
            None => {
                self.index.insert(entity.local_id, self.staged.len());
                self.staged.push(entity);
            }
        }
    }

    /// Strictly greater than every timestamp handed out before and than the
    /// version being replaced.
    fn next_timestamp(&mut self, previous: Option<&SyncableEntity>) -> Timestamp {
        let floor = previous
            .map(|p| p.version().max(p.updated_at_local))
            .unwrap_or(Timestamp::ZERO)
            .max(self.last_ts);
        let ts = self.clock.now().max(floor.next());
        self.last_ts = ts;
        ts
    }

    pub(crate) fn into_writes(self) -> (Vec<SyncableEntity>, Timestamp) {
        (self.staged, self.last_ts)
    }
}

impl std::fmt::Debug for StoreTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransaction")
            .field("staged", &self.staged.len())
            .field("last_ts", &self.last_ts)
            .finish_non_exhaustive()
    }
}
