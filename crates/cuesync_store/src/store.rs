//! The local store: entities, mutation log and watermarks behind one lock.

use crate::change_feed::{ChangeEvent, ChangeFeed, ChangeStream};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreOptions;
use crate::error::{StoreError, StoreResult};
use crate::journal::{
    CommitRecord, FileJournal, Journal, JournalBackend, JournalOp, MemoryJournal,
};
use crate::transaction::StoreTransaction;
use cuesync_protocol::{
    EntityType, LocalId, MutationLog, MutationLogEntry, Operation, OwnerId, Recorded, RemoteId,
    SyncState, SyncableEntity, Timestamp,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A compare-and-set write of a sync result.
///
/// The write applies only if the stored entity still equals `expected`
/// (`None` meaning "absent"), so a user write that landed after the sync
/// engine read the entity is never overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionWrite {
    /// Entity state the resolution was computed from.
    pub expected: Option<SyncableEntity>,
    /// Entity state to store.
    pub resolved: SyncableEntity,
}

/// Counters describing the store contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Entities including tombstones.
    pub entities: usize,
    /// Tombstoned entities.
    pub tombstones: usize,
    /// Pending mutation log entries.
    pub pending_mutations: usize,
    /// Entities in the conflicted state.
    pub conflicted: usize,
    /// Last commit sequence.
    pub commit_sequence: u64,
}

pub(crate) struct StoreInner {
    entities: HashMap<LocalId, SyncableEntity>,
    by_remote: HashMap<(EntityType, RemoteId), LocalId>,
    log: MutationLog,
    watermarks: BTreeMap<EntityType, Timestamp>,
    journal: Journal,
    commit_seq: u64,
    last_ts: Timestamp,
}

impl StoreInner {
    fn new(journal: Journal) -> Self {
        Self {
            entities: HashMap::new(),
            by_remote: HashMap::new(),
            log: MutationLog::new(),
            watermarks: BTreeMap::new(),
            journal,
            commit_seq: 0,
            last_ts: Timestamp::ZERO,
        }
    }

    pub(crate) fn entity(&self, local_id: LocalId) -> Option<&SyncableEntity> {
        self.entities.get(&local_id)
    }

    pub(crate) fn last_timestamp(&self) -> Timestamp {
        self.last_ts
    }

    /// Journals `ops` as one commit, then applies them.
    fn commit(
        &mut self,
        ops: Vec<JournalOp>,
        next_mutation: u64,
        clock: Timestamp,
    ) -> StoreResult<Vec<ChangeEvent>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let record = CommitRecord {
            sequence: self.commit_seq + 1,
            next_mutation,
            clock: clock.max(self.last_ts),
            ops,
        };
        self.journal.append(&record)?;
        Ok(self.apply_record(record))
    }

    fn apply_record(&mut self, record: CommitRecord) -> Vec<ChangeEvent> {
        let CommitRecord {
            sequence,
            next_mutation,
            clock,
            ops,
        } = record;
        self.commit_seq = sequence;
        self.log.reserve_through(next_mutation);
        self.last_ts = self.last_ts.max(clock);
        ops.into_iter()
            .filter_map(|op| self.apply(sequence, op))
            .collect()
    }

    fn apply(&mut self, sequence: u64, op: JournalOp) -> Option<ChangeEvent> {
        match op {
            JournalOp::PutEntity { entity } => {
                let previous = self.entities.insert(entity.local_id, entity.clone());
                if let Some(old_remote) = previous.as_ref().and_then(|p| p.remote_id.clone()) {
                    self.by_remote.remove(&(entity.entity_type, old_remote));
                }
                if let Some(remote_id) = entity.remote_id.clone() {
                    self.by_remote
                        .insert((entity.entity_type, remote_id), entity.local_id);
                }
                Some(ChangeEvent::written(sequence, previous.is_some(), entity))
            }
            JournalOp::PurgeEntity {
                local_id,
                entity_type,
                owner_id,
            } => {
                self.log.take(local_id);
                let removed = self.entities.remove(&local_id)?;
                if let Some(remote_id) = removed.remote_id {
                    self.by_remote.remove(&(entity_type, remote_id));
                }
                Some(ChangeEvent::purged(sequence, local_id, entity_type, owner_id))
            }
            JournalOp::PutMutation { entry } => {
                self.log.restore(entry);
                None
            }
            JournalOp::RemoveMutation { local_id } => {
                self.log.take(local_id);
                None
            }
            JournalOp::SetWatermark { entity_type, at } => {
                self.watermarks.insert(entity_type, at);
                None
            }
        }
    }
}

/// Journal ops for recording `operation` on `entity` into `work`.
fn record_ops(
    work: &mut MutationLog,
    operation: Operation,
    entity: SyncableEntity,
) -> Vec<JournalOp> {
    let local_id = entity.local_id;
    match work.record(operation, entity.clone()) {
        Recorded::Cancelled => vec![JournalOp::PurgeEntity {
            local_id,
            entity_type: entity.entity_type,
            owner_id: entity.owner_id,
        }],
        Recorded::Appended(_) | Recorded::Coalesced(_) => {
            let mut ops = vec![JournalOp::PutEntity { entity }];
            if let Some(entry) = work.get(local_id) {
                ops.push(JournalOp::PutMutation {
                    entry: entry.clone(),
                });
            }
            ops
        }
    }
}

/// The local store adapter.
///
/// Owns persisted entity state, the mutation log and the pull watermarks.
/// Every mutation persists the entity change and the matching mutation log
/// change in one journal record.
///
/// ```rust,ignore
/// let store = LocalStore::open(Path::new("route.journal"))?;
/// let client = store.upsert(SyncableEntity::new(EntityType::Client, owner, payload))?;
/// store.soft_delete(client.local_id)?;
/// ```
pub struct LocalStore {
    inner: Mutex<StoreInner>,
    feed: ChangeFeed,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl LocalStore {
    /// Opens or creates a store backed by the journal file at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Opens a file-backed store with custom options.
    pub fn open_with_options(path: &Path, options: StoreOptions) -> StoreResult<Self> {
        let backend = FileJournal::open(path)?;
        Self::open_with_backend(Box::new(backend), options, Arc::new(SystemClock))
    }

    /// Opens a fresh in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open_with_backend(
            Box::new(MemoryJournal::new()),
            StoreOptions::default(),
            Arc::new(SystemClock),
        )
    }

    /// Opens a store over any journal backend, replaying what it holds.
    pub fn open_with_backend(
        backend: Box<dyn JournalBackend>,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let mut journal = Journal::new(backend, options.sync_on_commit);
        let replay = journal.replay()?;

        if let Some(offset) = replay.torn_at {
            if !options.repair_torn_tail {
                return Err(StoreError::storage_fault(format!(
                    "torn journal record at offset {offset}"
                )));
            }
            journal.truncate(offset)?;
        }

        let commits = replay.commits.len();
        let mut inner = StoreInner::new(journal);
        for record in replay.commits {
            inner.apply_record(record);
        }

        info!(
            commits,
            entities = inner.entities.len(),
            pending = inner.log.len(),
            "local store opened"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            feed: ChangeFeed::new(),
            clock,
            options,
        })
    }

    /// Returns the store options.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Runs `f` in a transaction.
    ///
    /// Staged writes commit atomically when `f` returns `Ok`; on `Err`
    /// nothing is written.
    pub fn transaction<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> StoreResult<T>,
    {
        let mut inner = self.inner.lock();
        let (result, writes, last_ts) = {
            let mut txn = StoreTransaction::new(&inner, self.clock.as_ref());
            let result = f(&mut txn)?;
            let (writes, last_ts) = txn.into_writes();
            (result, writes, last_ts)
        };

        let mut work = inner.log.clone();
        let mut ops = Vec::new();
        for entity in writes {
            let operation = Operation::for_entity(&entity);
            ops.extend(record_ops(&mut work, operation, entity));
        }

        let events = inner.commit(ops, work.next_sequence(), last_ts)?;
        self.feed.emit_batch(events);
        Ok(result)
    }

    /// Inserts or replaces an entity and logs the mutation.
    pub fn upsert(&self, entity: SyncableEntity) -> StoreResult<SyncableEntity> {
        self.transaction(|txn| txn.upsert(entity))
    }

    /// Tombstones an entity and logs the deletion.
    ///
    /// A record whose create was never sent to the remote is purged instead.
    pub fn soft_delete(&self, local_id: LocalId) -> StoreResult<SyncableEntity> {
        self.transaction(|txn| txn.soft_delete(local_id))
    }

    /// Reads an entity.
    pub fn get(&self, local_id: LocalId) -> StoreResult<SyncableEntity> {
        self.find(local_id).ok_or(StoreError::NotFound { local_id })
    }

    /// Reads an entity if it exists.
    pub fn find(&self, local_id: LocalId) -> Option<SyncableEntity> {
        self.inner.lock().entities.get(&local_id).cloned()
    }

    /// Looks up an entity by its remote identity.
    pub fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Option<SyncableEntity> {
        let inner = self.inner.lock();
        inner
            .by_remote
            .get(&(entity_type, remote_id.clone()))
            .and_then(|id| inner.entities.get(id))
            .cloned()
    }

    /// Every entity of an owner, tombstones included, ordered by id.
    pub fn entities_by_owner(&self, owner_id: &OwnerId) -> Vec<SyncableEntity> {
        let inner = self.inner.lock();
        Self::owned(&inner, owner_id)
    }

    fn owned(inner: &StoreInner, owner_id: &OwnerId) -> Vec<SyncableEntity> {
        let mut entities: Vec<_> = inner
            .entities
            .values()
            .filter(|e| e.owner_id == *owner_id)
            .cloned()
            .collect();
        entities.sort_by_key(|e| e.local_id);
        entities
    }

    /// Streams an owner's records, then their live changes.
    ///
    /// The snapshot and the subscription are taken under the store lock, so
    /// no change falls between them.
    pub fn stream_by_owner(&self, owner_id: &OwnerId) -> ChangeStream {
        let inner = self.inner.lock();
        let snapshot = Self::owned(&inner, owner_id);
        let live = self.feed.subscribe_owner(owner_id.clone());
        drop(inner);
        ChangeStream::new(snapshot, live)
    }

    /// Returns up to `limit` pending mutations, oldest first.
    pub fn pending_mutations(&self, limit: usize) -> Vec<MutationLogEntry> {
        self.inner.lock().log.pending_batch(limit)
    }

    /// Returns an owner's pending mutations whose entity is not conflicted,
    /// oldest first. Conflicted entities are reconciled before they are
    /// pushed.
    pub fn pushable_mutations(&self, owner_id: &OwnerId, limit: usize) -> Vec<MutationLogEntry> {
        let inner = self.inner.lock();
        inner
            .log
            .pending()
            .filter(|entry| {
                inner.entities.get(&entry.local_id).is_some_and(|e| {
                    e.owner_id == *owner_id && e.sync_state != SyncState::Conflicted
                })
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Flags entries as sent before they are pushed.
    ///
    /// Only creates are journaled: a sent create is no longer cancelled by a
    /// delete, since the remote may hold it without having replied.
    pub fn mark_sent(&self, entries: &[MutationLogEntry]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let mut work = inner.log.clone();
        let mut ops = Vec::new();
        for entry in entries {
            if entry.operation != Operation::Create
                || !work.mark_sent(entry.local_id, entry.sequence)
            {
                continue;
            }
            if let Some(marked) = work.get(entry.local_id) {
                ops.push(JournalOp::PutMutation {
                    entry: marked.clone(),
                });
            }
        }

        let (next, last_ts) = (work.next_sequence(), inner.last_ts);
        let events = inner.commit(ops, next, last_ts)?;
        self.feed.emit_batch(events);
        Ok(())
    }

    /// The pending mutation of one entity.
    pub fn pending_entry(&self, local_id: LocalId) -> Option<MutationLogEntry> {
        self.inner.lock().log.get(local_id).cloned()
    }

    /// Number of pending mutations.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Records that the remote applied a pushed entry.
    ///
    /// If the entry is unchanged since it was read, it is removed and the
    /// entity becomes clean. If a newer local mutation replaced it, the
    /// entity keeps its pending state and the newer entry is pointed at the
    /// remote record. If the entity was purged while the create was in
    /// flight, a tombstone is recreated so the deletion reaches the remote.
    pub fn confirm_push(
        &self,
        pushed: &MutationLogEntry,
        remote_id: RemoteId,
        remote_ts: Timestamp,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let mut work = inner.log.clone();
        let mut ops = Vec::new();
        let mut clock = remote_ts;

        match inner.entities.get(&pushed.local_id).cloned() {
            Some(mut entity) => {
                entity.remote_id = Some(remote_id.clone());
                entity.updated_at_remote = Some(remote_ts);
                let unchanged = work
                    .get(pushed.local_id)
                    .is_some_and(|e| e.sequence == pushed.sequence);

                if unchanged {
                    ops.push(JournalOp::RemoveMutation {
                        local_id: pushed.local_id,
                    });
                    entity.updated_at_local = entity.updated_at_local.min(remote_ts);
                    entity.sync_state = SyncState::Clean;
                } else if work.get(pushed.local_id).is_some() {
                    work.rebase_onto_remote(pushed.local_id, &remote_id);
                    if let Some(entry) = work.get(pushed.local_id) {
                        ops.push(JournalOp::PutMutation {
                            entry: entry.clone(),
                        });
                    }
                    if entity.sync_state.is_pending() {
                        entity.sync_state = entity.pending_state();
                    }
                }
                ops.insert(0, JournalOp::PutEntity { entity });
            }
            None if pushed.operation == Operation::Create => {
                let mut tombstone = pushed.snapshot.clone();
                tombstone.remote_id = Some(remote_id.clone());
                tombstone.updated_at_remote = Some(remote_ts);
                tombstone.updated_at_local = inner.last_ts.max(remote_ts).next();
                tombstone.deleted = true;
                tombstone.sync_state = SyncState::PendingDelete;
                clock = tombstone.updated_at_local;
                debug!(local_id = %pushed.local_id, "recreating tombstone for purged create");
                ops.extend(record_ops(&mut work, Operation::Delete, tombstone));
            }
            None => {}
        }

        let events = inner.commit(ops, work.next_sequence(), clock)?;
        self.feed.emit_batch(events);
        debug!(local_id = %pushed.local_id, remote_id = %remote_id, "push confirmed");
        Ok(())
    }

    /// Records a failed push of `pushed`.
    ///
    /// Increments the entry's attempt counter and stores the error. With
    /// `conflicted` set, the entity is also marked [`SyncState::Conflicted`].
    /// Returns the new attempt count, or `None` if the entry was replaced
    /// since it was read.
    pub fn record_push_failure(
        &self,
        pushed: &MutationLogEntry,
        error: &str,
        conflicted: bool,
    ) -> StoreResult<Option<u32>> {
        let mut inner = self.inner.lock();
        let mut work = inner.log.clone();
        let Some(attempts) = work.record_failure(pushed.local_id, pushed.sequence, error) else {
            return Ok(None);
        };

        let mut ops = Vec::new();
        if let Some(entry) = work.get(pushed.local_id) {
            ops.push(JournalOp::PutMutation {
                entry: entry.clone(),
            });
        }
        if conflicted {
            if let Some(mut entity) = inner.entities.get(&pushed.local_id).cloned() {
                entity.sync_state = SyncState::Conflicted;
                ops.push(JournalOp::PutEntity { entity });
            }
        }

        let last_ts = inner.last_ts;
        let events = inner.commit(ops, work.next_sequence(), last_ts)?;
        self.feed.emit_batch(events);
        Ok(Some(attempts))
    }

    /// Drops the mutation log entry of an entity that cannot be pushed.
    ///
    /// The entity is left conflicted so it stays visible in
    /// [`LocalStore::conflicted`].
    pub fn discard_mutation(&self, local_id: LocalId) -> StoreResult<Option<MutationLogEntry>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.log.get(local_id).cloned() else {
            return Ok(None);
        };

        let mut ops = vec![JournalOp::RemoveMutation { local_id }];
        if let Some(mut entity) = inner.entities.get(&local_id).cloned() {
            entity.sync_state = SyncState::Conflicted;
            ops.push(JournalOp::PutEntity { entity });
        }

        let (next, last_ts) = (inner.log.next_sequence(), inner.last_ts);
        let events = inner.commit(ops, next, last_ts)?;
        self.feed.emit_batch(events);
        warn!(
            local_id = %local_id,
            attempts = entry.attempts,
            error = entry.last_error.as_deref().unwrap_or(""),
            "discarded unpushable mutation"
        );
        Ok(Some(entry))
    }

    /// Stores sync results with compare-and-set semantics.
    ///
    /// All applicable writes commit as one journal record. Returns, per
    /// write, whether it was applied. A resolved entity in a pending state
    /// is logged for push; a clean one clears any log entry.
    pub fn write_resolutions(&self, writes: Vec<ResolutionWrite>) -> StoreResult<Vec<bool>> {
        let mut inner = self.inner.lock();
        let mut work = inner.log.clone();
        let mut overlay: HashMap<LocalId, Option<SyncableEntity>> = HashMap::new();
        let mut applied = Vec::with_capacity(writes.len());
        let mut ops = Vec::new();
        let mut clock = inner.last_ts;

        for ResolutionWrite { expected, resolved } in writes {
            let local_id = resolved.local_id;
            let current = match overlay.get(&local_id) {
                Some(staged) => staged.clone(),
                None => inner.entities.get(&local_id).cloned(),
            };
            if current != expected {
                debug!(local_id = %local_id, "resolution skipped, entity changed concurrently");
                applied.push(false);
                continue;
            }

            clock = clock.max(resolved.updated_at_local);
            match resolved.sync_state {
                SyncState::Clean => {
                    if work.take(local_id).is_some() {
                        ops.push(JournalOp::RemoveMutation { local_id });
                    }
                    ops.push(JournalOp::PutEntity {
                        entity: resolved.clone(),
                    });
                    overlay.insert(local_id, Some(resolved));
                }
                SyncState::Conflicted => {
                    ops.push(JournalOp::PutEntity {
                        entity: resolved.clone(),
                    });
                    overlay.insert(local_id, Some(resolved));
                }
                _ => {
                    let operation = Operation::for_entity(&resolved);
                    let recorded = record_ops(&mut work, operation, resolved.clone());
                    let purged = matches!(recorded.first(), Some(JournalOp::PurgeEntity { .. }));
                    ops.extend(recorded);
                    overlay.insert(local_id, (!purged).then_some(resolved));
                }
            }
            applied.push(true);
        }

        let events = inner.commit(ops, work.next_sequence(), clock)?;
        self.feed.emit_batch(events);
        Ok(applied)
    }

    /// Entities currently in the conflicted state, ordered by id.
    pub fn conflicted(&self) -> Vec<SyncableEntity> {
        let inner = self.inner.lock();
        let mut entities: Vec<_> = inner
            .entities
            .values()
            .filter(|e| e.sync_state == SyncState::Conflicted)
            .cloned()
            .collect();
        entities.sort_by_key(|e| e.local_id);
        entities
    }

    /// The pull watermark of an entity type.
    pub fn watermark(&self, entity_type: EntityType) -> Timestamp {
        self.inner
            .lock()
            .watermarks
            .get(&entity_type)
            .copied()
            .unwrap_or(Timestamp::ZERO)
    }

    /// Every pull watermark.
    pub fn watermarks(&self) -> BTreeMap<EntityType, Timestamp> {
        self.inner.lock().watermarks.clone()
    }

    /// Moves watermarks forward in one commit. Watermarks never move back.
    pub fn advance_watermarks(&self, marks: &BTreeMap<EntityType, Timestamp>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let ops: Vec<_> = marks
            .iter()
            .filter(|&(ty, at)| inner.watermarks.get(ty).map_or(true, |cur| at > cur))
            .map(|(&entity_type, &at)| JournalOp::SetWatermark { entity_type, at })
            .collect();
        let (next, last_ts) = (inner.log.next_sequence(), inner.last_ts);
        inner.commit(ops, next, last_ts)?;
        Ok(())
    }

    /// Number of entities, tombstones included.
    pub fn entity_count(&self) -> usize {
        self.inner.lock().entities.len()
    }

    /// Counters describing the store contents.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            entities: inner.entities.len(),
            tombstones: inner.entities.values().filter(|e| e.deleted).count(),
            pending_mutations: inner.log.len(),
            conflicted: inner
                .entities
                .values()
                .filter(|e| e.sync_state == SyncState::Conflicted)
                .count(),
            commit_sequence: inner.commit_seq,
        }
    }

    /// Subscribes to every committed change.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use cuesync_protocol::Payload;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn store() -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = LocalStore::open_with_backend(
            Box::new(MemoryJournal::new()),
            StoreOptions::default(),
            clock.clone(),
        )
        .unwrap();
        (store, clock)
    }

    fn client(name: &str) -> SyncableEntity {
        SyncableEntity::new(
            EntityType::Client,
            OwnerId::new("route-1"),
            payload(json!({ "name": name })),
        )
    }

    #[test]
    fn upsert_logs_a_create() {
        let (store, _) = store();
        let saved = store.upsert(client("Bar Sol")).unwrap();

        assert_eq!(saved.sync_state, SyncState::PendingCreate);
        assert_eq!(saved.updated_at_local, Timestamp::from_millis(1_000));
        let pending = store.pending_mutations(10);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Create);
    }

    #[test]
    fn timestamps_strictly_increase_with_a_stuck_clock() {
        let (store, _) = store();
        let a = store.upsert(client("a")).unwrap();
        let b = store.upsert(client("b")).unwrap();
        let a2 = store.upsert(a.clone()).unwrap();

        assert!(b.updated_at_local > a.updated_at_local);
        assert!(a2.updated_at_local > b.updated_at_local);
    }

    #[test]
    fn upsert_cannot_change_type() {
        let (store, _) = store();
        let saved = store.upsert(client("a")).unwrap();
        let mut other = saved.clone();
        other.entity_type = EntityType::Table;

        let err = store.upsert(other).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntity { .. }));
    }

    #[test]
    fn delete_of_unsynced_entity_purges() {
        let (store, _) = store();
        let saved = store.upsert(client("a")).unwrap();
        store.soft_delete(saved.local_id).unwrap();

        assert!(store.find(saved.local_id).is_none());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn delete_after_sent_create_keeps_tombstone() {
        let journal = MemoryJournal::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let store = LocalStore::open_with_backend(
            Box::new(journal.clone()),
            StoreOptions::default(),
            clock.clone(),
        )
        .unwrap();
        let saved = store.upsert(client("a")).unwrap();
        store.mark_sent(&store.pending_mutations(1)).unwrap();
        let tombstone = store.soft_delete(saved.local_id).unwrap();

        assert!(tombstone.deleted);
        assert_eq!(tombstone.sync_state, SyncState::PendingDelete);
        let entry = store.pending_entry(saved.local_id).unwrap();
        assert_eq!(entry.operation, Operation::Delete);
        assert!(entry.sent);

        let reopened =
            LocalStore::open_with_backend(Box::new(journal), StoreOptions::default(), clock)
                .unwrap();
        assert!(reopened.pending_entry(saved.local_id).unwrap().sent);
    }

    #[test]
    fn delete_of_missing_entity_is_not_found() {
        let (store, _) = store();
        let id = LocalId::new();
        assert!(matches!(
            store.soft_delete(id),
            Err(StoreError::NotFound { local_id }) if local_id == id
        ));
        assert!(matches!(store.get(id), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let (store, _) = store();
        let result: StoreResult<()> = store.transaction(|txn| {
            txn.upsert(client("a"))?;
            Err(StoreError::invalid_entity("abort"))
        });

        assert!(result.is_err());
        assert_eq!(store.entity_count(), 0);
        assert_eq!(store.stats().commit_sequence, 0);
    }

    #[test]
    fn confirm_push_cleans_entity() {
        let (store, _) = store();
        let saved = store.upsert(client("a")).unwrap();
        let entry = store.pending_mutations(1).remove(0);

        store
            .confirm_push(&entry, RemoteId::new("r-1"), saved.updated_at_local)
            .unwrap();

        let entity = store.get(saved.local_id).unwrap();
        assert!(entity.is_consistently_clean());
        assert_eq!(store.pending_count(), 0);
        assert_eq!(
            store
                .find_by_remote_id(EntityType::Client, &RemoteId::new("r-1"))
                .map(|e| e.local_id),
            Some(saved.local_id)
        );
    }

    #[test]
    fn confirm_push_after_newer_edit_keeps_pending() {
        let (store, _) = store();
        let saved = store.upsert(client("a")).unwrap();
        let entry = store.pending_mutations(1).remove(0);
        let mut edited = saved.clone();
        edited.payload.insert("name".into(), json!("b"));
        store.upsert(edited).unwrap();

        store
            .confirm_push(&entry, RemoteId::new("r-1"), saved.updated_at_local)
            .unwrap();

        let entity = store.get(saved.local_id).unwrap();
        assert_eq!(entity.sync_state, SyncState::PendingUpdate);
        let pending = store.pending_mutations(10);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Update);
        assert_eq!(pending[0].snapshot.remote_id, Some(RemoteId::new("r-1")));
    }

    #[test]
    fn confirm_push_of_purged_create_recreates_tombstone() {
        let (store, _) = store();
        let saved = store.upsert(client("a")).unwrap();
        let entry = store.pending_mutations(1).remove(0);
        store.soft_delete(saved.local_id).unwrap();

        store
            .confirm_push(&entry, RemoteId::new("r-1"), saved.updated_at_local)
            .unwrap();

        let tombstone = store.get(saved.local_id).unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.sync_state, SyncState::PendingDelete);
        assert_eq!(store.pending_mutations(1)[0].operation, Operation::Delete);
    }

    #[test]
    fn push_failures_count_and_conflict() {
        let (store, _) = store();
        let saved = store.upsert(client("a")).unwrap();
        let entry = store.pending_mutations(1).remove(0);

        assert_eq!(store.record_push_failure(&entry, "timeout", false).unwrap(), Some(1));
        assert_eq!(store.get(saved.local_id).unwrap().sync_state, SyncState::PendingCreate);
        assert_eq!(store.record_push_failure(&entry, "rejected", true).unwrap(), Some(2));
        assert_eq!(store.get(saved.local_id).unwrap().sync_state, SyncState::Conflicted);
        assert_eq!(store.conflicted().len(), 1);

        let discarded = store.discard_mutation(saved.local_id).unwrap().unwrap();
        assert_eq!(discarded.last_error.as_deref(), Some("rejected"));
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn resolution_is_compare_and_set() {
        let (store, _) = store();
        let saved = store.upsert(client("a")).unwrap();
        let mut stale_view = saved.clone();
        stale_view.payload.insert("name".into(), json!("remote"));
        stale_view.remote_id = Some(RemoteId::new("r-1"));
        stale_view.updated_at_remote = Some(Timestamp::from_millis(5_000));
        stale_view.updated_at_local = Timestamp::from_millis(5_000);
        stale_view.sync_state = SyncState::Clean;

        let mut edited = saved.clone();
        edited.payload.insert("name".into(), json!("user"));
        store.upsert(edited).unwrap();

        let applied = store
            .write_resolutions(vec![ResolutionWrite {
                expected: Some(saved.clone()),
                resolved: stale_view,
            }])
            .unwrap();
        assert_eq!(applied, vec![false]);
        assert_eq!(
            store.get(saved.local_id).unwrap().field("name"),
            Some(&json!("user"))
        );
    }

    #[test]
    fn clean_resolution_clears_log_and_raises_clock() {
        let (store, _) = store();
        let saved = store.upsert(client("a")).unwrap();
        let remote = SyncableEntity::from_remote(
            saved.local_id,
            RemoteId::new("r-1"),
            EntityType::Client,
            saved.owner_id.clone(),
            payload(json!({"name": "remote"})),
            Timestamp::from_millis(9_000),
            false,
        );

        store
            .write_resolutions(vec![ResolutionWrite {
                expected: Some(saved.clone()),
                resolved: remote,
            }])
            .unwrap();
        assert_eq!(store.pending_count(), 0);

        let next = store.upsert(client("b")).unwrap();
        assert!(next.updated_at_local > Timestamp::from_millis(9_000));
    }

    #[test]
    fn watermarks_only_move_forward() {
        let (store, _) = store();
        let mut marks = BTreeMap::new();
        marks.insert(EntityType::Table, Timestamp::from_millis(50));
        store.advance_watermarks(&marks).unwrap();
        marks.insert(EntityType::Table, Timestamp::from_millis(40));
        store.advance_watermarks(&marks).unwrap();

        assert_eq!(store.watermark(EntityType::Table), Timestamp::from_millis(50));
        assert_eq!(store.watermark(EntityType::Client), Timestamp::ZERO);
    }

    #[test]
    fn stream_by_owner_replays_and_follows() {
        let (store, _) = store();
        let existing = store.upsert(client("a")).unwrap();
        let mut other = client("x");
        other.owner_id = OwnerId::new("route-2");
        store.upsert(other).unwrap();

        let mut stream = store.stream_by_owner(&OwnerId::new("route-1"));
        let first = stream.try_next().unwrap();
        assert_eq!(first.local_id, existing.local_id);
        assert!(stream.try_next().is_none());

        let added = store.upsert(client("b")).unwrap();
        let live = stream.try_next().unwrap();
        assert_eq!(live.local_id, added.local_id);
    }
}
