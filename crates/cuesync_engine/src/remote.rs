//! Remote store abstraction.
//!
//! The remote store is the authoritative copy of every tenant's records,
//! keyed by entity type and scoped by owner. [`MemoryRemote`] is a complete
//! in-process implementation used by tests and the CLI simulator.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use cuesync_protocol::{
    EntityType, LocalId, MutationLogEntry, Operation, OwnerId, Payload, RemoteId, SyncableEntity,
    Timestamp,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// One mutation sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushItem {
    /// Local id, used as the idempotency key on create.
    pub local_id: LocalId,
    /// Kind of change.
    pub operation: Operation,
    /// Entity state to store.
    pub snapshot: SyncableEntity,
    /// Version timestamp of the change.
    pub updated_at: Timestamp,
}

impl PushItem {
    /// Builds the push item for a log entry.
    pub fn from_entry(entry: &MutationLogEntry) -> Self {
        Self {
            local_id: entry.local_id,
            operation: entry.operation,
            snapshot: entry.snapshot.clone(),
            updated_at: entry.snapshot.updated_at_local,
        }
    }
}

/// A record as held by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Remote identifier.
    pub remote_id: RemoteId,
    /// Local id of the device that created the record, if known.
    pub local_id: Option<LocalId>,
    /// Entity type.
    pub entity_type: EntityType,
    /// Owner.
    pub owner_id: OwnerId,
    /// Version timestamp.
    pub updated_at: Timestamp,
    /// When the remote committed this version, on the remote's clock.
    pub committed_at: Timestamp,
    /// Business fields.
    pub payload: Payload,
    /// Tombstone flag.
    pub deleted: bool,
}

impl RemoteChange {
    /// The clean local copy of this version under `local_id`.
    pub fn to_entity(&self, local_id: LocalId) -> SyncableEntity {
        SyncableEntity::from_remote(
            local_id,
            self.remote_id.clone(),
            self.entity_type,
            self.owner_id.clone(),
            self.payload.clone(),
            self.updated_at,
            self.deleted,
        )
    }
}

/// Per-item result of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushOutcome {
    /// The remote stored the change.
    Applied {
        /// Remote identifier of the record.
        remote_id: RemoteId,
        /// Version timestamp the remote holds.
        remote_updated_at: Timestamp,
    },
    /// The remote already holds a newer version; nothing was written.
    Stale {
        /// The remote's current version.
        current: RemoteChange,
    },
    /// The remote refused the change. Not retryable.
    Rejected {
        /// Reason given by the remote.
        reason: String,
    },
    /// The item could not be processed this time.
    Unreachable {
        /// What failed.
        reason: String,
    },
}

/// An authoritative remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Pushes a batch of changes of one entity type.
    ///
    /// Returns one outcome per pushed `local_id`. Items missing from the map
    /// are treated as unreachable.
    async fn push(
        &self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        batch: &[PushItem],
    ) -> SyncResult<HashMap<LocalId, PushOutcome>>;

    /// Returns every record committed after `since`, in commit order.
    async fn pull(
        &self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        since: Timestamp,
    ) -> SyncResult<Vec<RemoteChange>>;

    /// Fetches the current version of one record.
    async fn fetch(
        &self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        remote_id: &RemoteId,
    ) -> SyncResult<Option<RemoteChange>>;
}

type RecordKey = (OwnerId, EntityType, RemoteId);

#[derive(Debug, Default)]
struct RemoteState {
    records: BTreeMap<RecordKey, RemoteChange>,
    by_local: HashMap<(OwnerId, EntityType, LocalId), RemoteId>,
    rejections: HashMap<LocalId, String>,
    commit_clock: u64,
    next_id: u64,
}

impl RemoteState {
    fn commit(&mut self, mut change: RemoteChange) -> RemoteChange {
        self.commit_clock += 1;
        change.committed_at = Timestamp::from_millis(self.commit_clock);
        let key = (
            change.owner_id.clone(),
            change.entity_type,
            change.remote_id.clone(),
        );
        self.records.insert(key, change.clone());
        change
    }

    fn allocate_id(&mut self, entity_type: EntityType) -> RemoteId {
        self.next_id += 1;
        RemoteId::new(format!("{}-{:06}", entity_type.collection(), self.next_id))
    }

    fn push_one(
        &mut self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        item: &PushItem,
    ) -> PushOutcome {
        if let Some(reason) = self.rejections.get(&item.local_id) {
            return PushOutcome::Rejected {
                reason: reason.clone(),
            };
        }

        let local_key = (owner_id.clone(), entity_type, item.local_id);
        let remote_id = item
            .snapshot
            .remote_id
            .clone()
            .or_else(|| self.by_local.get(&local_key).cloned());
        let existing = remote_id
            .as_ref()
            .and_then(|id| self.records.get(&(owner_id.clone(), entity_type, id.clone())))
            .cloned();

        match existing {
            Some(current) => {
                let same = current.payload == item.snapshot.payload
                    && current.deleted == item.snapshot.deleted;
                if current.updated_at > item.updated_at
                    || (current.updated_at == item.updated_at && !same)
                {
                    return PushOutcome::Stale { current };
                }
                if current.updated_at < item.updated_at {
                    self.commit(RemoteChange {
                        payload: item.snapshot.payload.clone(),
                        deleted: item.snapshot.deleted,
                        updated_at: item.updated_at,
                        ..current.clone()
                    });
                }
                PushOutcome::Applied {
                    remote_id: current.remote_id,
                    remote_updated_at: item.updated_at,
                }
            }
            None if item.snapshot.remote_id.is_some() => PushOutcome::Rejected {
                reason: "unknown remote record".into(),
            },
            None => {
                let remote_id = self.allocate_id(entity_type);
                self.by_local.insert(local_key, remote_id.clone());
                self.commit(RemoteChange {
                    remote_id: remote_id.clone(),
                    local_id: Some(item.local_id),
                    entity_type,
                    owner_id: owner_id.clone(),
                    updated_at: item.updated_at,
                    committed_at: Timestamp::ZERO,
                    payload: item.snapshot.payload.clone(),
                    deleted: item.snapshot.deleted,
                });
                PushOutcome::Applied {
                    remote_id,
                    remote_updated_at: item.updated_at,
                }
            }
        }
    }
}

/// In-process remote store.
///
/// Supports toggling reachability, adding latency, scripting per-item
/// rejections and injecting edits made by other devices.
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    push_calls: AtomicU64,
    pull_calls: AtomicU64,
}

impl MemoryRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            push_calls: AtomicU64::new(0),
            pull_calls: AtomicU64::new(0),
        }
    }

    /// Makes every call fail as unreachable, or not.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delays every call.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Rejects every push of `local_id` with `reason`.
    pub fn reject(&self, local_id: LocalId, reason: impl Into<String>) {
        self.state.lock().rejections.insert(local_id, reason.into());
    }

    /// Stops rejecting pushes of `local_id`.
    pub fn clear_rejection(&self, local_id: LocalId) {
        self.state.lock().rejections.remove(&local_id);
    }

    /// Simulates another device creating a record.
    pub fn insert_external(
        &self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        payload: Payload,
        updated_at: Timestamp,
    ) -> RemoteChange {
        let mut state = self.state.lock();
        let remote_id = state.allocate_id(entity_type);
        state.commit(RemoteChange {
            remote_id,
            local_id: Some(LocalId::new()),
            entity_type,
            owner_id: owner_id.clone(),
            updated_at,
            committed_at: Timestamp::ZERO,
            payload,
            deleted: false,
        })
    }

    /// Simulates another device editing a record.
    ///
    /// Returns `None` if the record does not exist.
    pub fn edit_external(
        &self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        remote_id: &RemoteId,
        payload: Payload,
        updated_at: Timestamp,
        deleted: bool,
    ) -> Option<RemoteChange> {
        let mut state = self.state.lock();
        let key = (owner_id.clone(), entity_type, remote_id.clone());
        let current = state.records.get(&key)?.clone();
        Some(state.commit(RemoteChange {
            payload,
            updated_at,
            deleted,
            ..current
        }))
    }

    /// Current records of one collection, ordered by remote id.
    pub fn records(&self, entity_type: EntityType, owner_id: &OwnerId) -> Vec<RemoteChange> {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| r.entity_type == entity_type && r.owner_id == *owner_id)
            .cloned()
            .collect()
    }

    /// Total records across all tenants.
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Number of push calls served.
    pub fn push_calls(&self) -> u64 {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Number of pull calls served.
    pub fn pull_calls(&self) -> u64 {
        self.pull_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> SyncResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::unreachable("remote offline"));
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn push(
        &self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        batch: &[PushItem],
    ) -> SyncResult<HashMap<LocalId, PushOutcome>> {
        self.enter().await?;
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Ok(batch
            .iter()
            .map(|item| (item.local_id, state.push_one(entity_type, owner_id, item)))
            .collect())
    }

    async fn pull(
        &self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        since: Timestamp,
    ) -> SyncResult<Vec<RemoteChange>> {
        self.enter().await?;
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let mut changes: Vec<_> = state
            .records
            .values()
            .filter(|r| {
                r.entity_type == entity_type && r.owner_id == *owner_id && r.committed_at > since
            })
            .cloned()
            .collect();
        changes.sort_by_key(|c| c.committed_at);
        Ok(changes)
    }

    async fn fetch(
        &self,
        entity_type: EntityType,
        owner_id: &OwnerId,
        remote_id: &RemoteId,
    ) -> SyncResult<Option<RemoteChange>> {
        self.enter().await?;
        let key = (owner_id.clone(), entity_type, remote_id.clone());
        Ok(self.state.lock().records.get(&key).cloned())
    }
}
