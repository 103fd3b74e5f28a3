//! Needs-attention queue.
//!
//! Entities the engine gave up on, or cannot merge without a human, are
//! surfaced here instead of being dropped. The host can poll a snapshot or
//! subscribe to new items.

use cuesync_protocol::{EntityType, LocalId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Why an entity needs attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttentionKind {
    /// A push kept failing and its log entry was discarded.
    PermanentFailure {
        /// Last push error.
        reason: String,
        /// Failed attempts.
        attempts: u32,
    },
    /// Local and remote disagree on a protected field.
    ConflictUnresolved {
        /// The diverging field, if known.
        field: Option<String>,
    },
}

/// An entity that needs attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttentionItem {
    /// The entity.
    pub local_id: LocalId,
    /// Its type.
    pub entity_type: EntityType,
    /// What went wrong.
    #[serde(flatten)]
    pub kind: AttentionKind,
}

impl AttentionItem {
    fn same_issue(&self, other: &AttentionItem) -> bool {
        self.local_id == other.local_id
            && std::mem::discriminant(&self.kind) == std::mem::discriminant(&other.kind)
    }
}

/// Queue of entities needing attention.
#[derive(Debug)]
pub struct AttentionQueue {
    items: Mutex<Vec<AttentionItem>>,
    tx: broadcast::Sender<AttentionItem>,
}

impl AttentionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            items: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Adds an item. An entity already queued for the same kind of issue
    /// has its item replaced and subscribers are not notified again.
    ///
    /// Returns true if the item is new.
    pub fn push(&self, item: AttentionItem) -> bool {
        let mut items = self.items.lock();
        if let Some(existing) = items.iter_mut().find(|i| i.same_issue(&item)) {
            *existing = item;
            return false;
        }
        items.push(item.clone());
        // No receivers is fine.
        let _ = self.tx.send(item);
        true
    }

    /// Current items, oldest first.
    pub fn snapshot(&self) -> Vec<AttentionItem> {
        self.items.lock().clone()
    }

    /// Removes and returns every item.
    pub fn drain(&self) -> Vec<AttentionItem> {
        std::mem::take(&mut *self.items.lock())
    }

    /// Removes the items of one entity, e.g. after a human fixed it.
    pub fn dismiss(&self, local_id: LocalId) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|i| i.local_id != local_id);
        before - items.len()
    }

    /// Subscribes to new items.
    pub fn subscribe(&self) -> broadcast::Receiver<AttentionItem> {
        self.tx.subscribe()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing needs attention.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Default for AttentionQueue {
    fn default() -> Self {
        Self::new()
    }
}
