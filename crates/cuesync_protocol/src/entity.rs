//! Syncable entity model.
//!
//! Every business record that takes part in sync carries the same metadata:
//! a stable local identity, an optional remote identity, a mutation
//! timestamp, a tombstone flag and a [`SyncState`]. Business fields live in an
//! opaque JSON [`Payload`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque business fields of an entity.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Namespace for identifiers derived from other identifiers.
const DERIVED_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x1c, 0x2a, 0x9e, 0x53, 0x4b, 0x4d, 0x0a, 0x8e, 0x17, 0xc4, 0x3b, 0x90, 0x55, 0xd2, 0x71,
]);

/// Stable local primary key. Never reused.
///
/// The local id doubles as the idempotency key for remote creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derives a deterministic id from another id and a discriminator.
    ///
    /// Two devices deriving from the same inputs get the same id.
    #[must_use]
    pub fn derived(kind: EntityType, parent: LocalId) -> Self {
        let mut name = Vec::with_capacity(17);
        name.push(kind.code());
        name.extend_from_slice(parent.0.as_bytes());
        Self(Uuid::new_v5(&DERIVED_ID_NAMESPACE, &name))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    /// Creates a remote id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tenant that owns a set of records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates an owner id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp, older than every real mutation.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp in milliseconds.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns the next representable timestamp.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Kind of business record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A customer on the route.
    Client,
    /// A billiard table.
    Table,
    /// Link between a table and the client renting it.
    TableAssignment,
    /// A financial settlement with a client.
    Settlement,
    /// A route expense.
    Expense,
}

impl EntityType {
    /// Every entity type, in pull order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Client,
        EntityType::Table,
        EntityType::TableAssignment,
        EntityType::Settlement,
        EntityType::Expense,
    ];

    /// Remote collection name for this type.
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        match self {
            EntityType::Client => "clients",
            EntityType::Table => "tables",
            EntityType::TableAssignment => "table_assignments",
            EntityType::Settlement => "settlements",
            EntityType::Expense => "expenses",
        }
    }

    /// Converts to a numeric code.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            EntityType::Client => 1,
            EntityType::Table => 2,
            EntityType::TableAssignment => 3,
            EntityType::Settlement => 4,
            EntityType::Expense => 5,
        }
    }

    /// Converts from a numeric code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// Sync status of a local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local copy matches the remote.
    Clean,
    /// Created locally, never pushed.
    PendingCreate,
    /// Updated locally since the last push.
    PendingUpdate,
    /// Deleted locally since the last push.
    PendingDelete,
    /// Local and remote disagree and were not reconciled yet.
    Conflicted,
}

impl SyncState {
    /// Returns true if local changes are waiting to be pushed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SyncState::PendingCreate | SyncState::PendingUpdate | SyncState::PendingDelete
        )
    }

    /// Returns true if the local copy holds work the remote has not seen.
    #[must_use]
    pub fn has_local_changes(&self) -> bool {
        self.is_pending() || matches!(self, SyncState::Conflicted)
    }
}

/// A business record participating in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableEntity {
    /// Stable local primary key.
    pub local_id: LocalId,
    /// Remote identifier, assigned on first successful push.
    pub remote_id: Option<RemoteId>,
    /// Entity type discriminator.
    pub entity_type: EntityType,
    /// Tenant owning the record.
    pub owner_id: OwnerId,
    /// Business fields.
    pub payload: Payload,
    /// Local mutation timestamp.
    pub updated_at_local: Timestamp,
    /// Last known remote timestamp.
    pub updated_at_remote: Option<Timestamp>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Sync status.
    pub sync_state: SyncState,
}

impl SyncableEntity {
    /// Creates a new, never-synced entity with a fresh local id.
    pub fn new(entity_type: EntityType, owner_id: OwnerId, payload: Payload) -> Self {
        Self::with_id(LocalId::new(), entity_type, owner_id, payload)
    }

    /// Creates a new, never-synced entity with the given local id.
    pub fn with_id(
        local_id: LocalId,
        entity_type: EntityType,
        owner_id: OwnerId,
        payload: Payload,
    ) -> Self {
        Self {
            local_id,
            remote_id: None,
            entity_type,
            owner_id,
            payload,
            updated_at_local: Timestamp::ZERO,
            updated_at_remote: None,
            deleted: false,
            sync_state: SyncState::PendingCreate,
        }
    }

    /// Builds a clean local copy of a remote version.
    #[allow(clippy::too_many_arguments)]
    pub fn from_remote(
        local_id: LocalId,
        remote_id: RemoteId,
        entity_type: EntityType,
        owner_id: OwnerId,
        payload: Payload,
        updated_at: Timestamp,
        deleted: bool,
    ) -> Self {
        Self {
            local_id,
            remote_id: Some(remote_id),
            entity_type,
            owner_id,
            payload,
            updated_at_local: updated_at,
            updated_at_remote: Some(updated_at),
            deleted,
            sync_state: SyncState::Clean,
        }
    }

    /// Timestamp of the version this copy represents.
    ///
    /// For a clean copy this is the remote timestamp; otherwise the local
    /// mutation time.
    #[must_use]
    pub fn version(&self) -> Timestamp {
        match (self.sync_state, self.updated_at_remote) {
            (SyncState::Clean, Some(remote)) => remote,
            _ => self.updated_at_local,
        }
    }

    /// Returns true if this record satisfies the clean-state invariant.
    #[must_use]
    pub fn is_consistently_clean(&self) -> bool {
        self.sync_state == SyncState::Clean
            && self.remote_id.is_some()
            && self
                .updated_at_remote
                .is_some_and(|remote| self.updated_at_local <= remote)
    }

    /// The pending state this record should carry if it has unpushed changes.
    #[must_use]
    pub fn pending_state(&self) -> SyncState {
        if self.deleted {
            SyncState::PendingDelete
        } else if self.remote_id.is_none() {
            SyncState::PendingCreate
        } else {
            SyncState::PendingUpdate
        }
    }

    /// Reads a payload field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }
}
