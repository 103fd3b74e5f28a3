//! Change feed for observing committed entity changes.
//!
//! Events are emitted only after the journal record of a commit is written,
//! in commit order. Subscribers may restrict themselves to one owner.
//!
//! ```rust,ignore
//! let stream = store.stream_by_owner(&OwnerId::new("route-7"))?;
//! for event in stream {
//!     println!("{:?} {}", event.change_type, event.local_id);
//! }
//! ```

use cuesync_protocol::{EntityType, LocalId, OwnerId, SyncableEntity};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Type of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Current state replayed when a stream is opened.
    Snapshot,
    /// Entity was inserted.
    Insert,
    /// Entity was updated.
    Update,
    /// Entity was tombstoned.
    Delete,
    /// Entity was physically removed.
    Purge,
}

/// A single change event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Commit sequence that produced the event. Zero for snapshots.
    pub sequence: u64,
    /// Changed entity.
    pub local_id: LocalId,
    /// Its type.
    pub entity_type: EntityType,
    /// Its owner.
    pub owner_id: OwnerId,
    /// Type of change.
    pub change_type: ChangeType,
    /// Entity state after the change. `None` for purges.
    pub entity: Option<SyncableEntity>,
}

impl ChangeEvent {
    /// Event describing the current state of an entity.
    pub fn snapshot(entity: SyncableEntity) -> Self {
        Self::of(0, ChangeType::Snapshot, entity)
    }

    /// Event for a committed write of `entity`.
    pub fn written(sequence: u64, existed: bool, entity: SyncableEntity) -> Self {
        let change_type = if entity.deleted {
            ChangeType::Delete
        } else if existed {
            ChangeType::Update
        } else {
            ChangeType::Insert
        };
        Self::of(sequence, change_type, entity)
    }

    /// Event for a purged entity.
    pub fn purged(
        sequence: u64,
        local_id: LocalId,
        entity_type: EntityType,
        owner_id: OwnerId,
    ) -> Self {
        Self {
            sequence,
            local_id,
            entity_type,
            owner_id,
            change_type: ChangeType::Purge,
            entity: None,
        }
    }

    fn of(sequence: u64, change_type: ChangeType, entity: SyncableEntity) -> Self {
        Self {
            sequence,
            local_id: entity.local_id,
            entity_type: entity.entity_type,
            owner_id: entity.owner_id.clone(),
            change_type,
            entity: Some(entity),
        }
    }
}

struct Subscriber {
    owner: Option<OwnerId>,
    tx: Sender<ChangeEvent>,
}

/// Distributes committed changes to subscribers.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl ChangeFeed {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to every future event.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.subscribe_filtered(None)
    }

    /// Subscribes to future events of one owner.
    pub fn subscribe_owner(&self, owner: OwnerId) -> Receiver<ChangeEvent> {
        self.subscribe_filtered(Some(owner))
    }

    fn subscribe_filtered(&self, owner: Option<OwnerId>) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(Subscriber { owner, tx });
        rx
    }

    /// Emits the events of one commit, dropping disconnected subscribers.
    pub fn emit_batch(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sub| {
            events
                .iter()
                .filter(|e| sub.owner.as_ref().map_or(true, |o| *o == e.owner_id))
                .all(|e| sub.tx.send(e.clone()).is_ok())
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A lazy stream of an owner's records followed by live changes.
///
/// Iteration blocks waiting for the next change and ends only when the store
/// is dropped. Opening a new stream restarts from the current state.
#[derive(Debug)]
pub struct ChangeStream {
    replay: VecDeque<ChangeEvent>,
    live: Receiver<ChangeEvent>,
}

impl ChangeStream {
    pub(crate) fn new(snapshot: Vec<SyncableEntity>, live: Receiver<ChangeEvent>) -> Self {
        Self {
            replay: snapshot.into_iter().map(ChangeEvent::snapshot).collect(),
            live,
        }
    }

    /// Returns the next event if one is available without blocking.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.replay
            .pop_front()
            .or_else(|| self.live.try_recv().ok())
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<ChangeEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        match self.live.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Iterator for ChangeStream {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.replay
            .pop_front()
            .or_else(|| self.live.recv().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuesync_protocol::Payload;
    use std::sync::Arc;
    use std::thread;

    fn entity(owner: &str) -> SyncableEntity {
        SyncableEntity::new(EntityType::Client, OwnerId::new(owner), Payload::new())
    }

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        let event = ChangeEvent::written(1, false, entity("a"));
        feed.emit_batch(vec![event.clone()]);

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received, event);
        assert_eq!(received.change_type, ChangeType::Insert);
    }

    #[test]
    fn owner_filter() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe_owner(OwnerId::new("a"));

        feed.emit_batch(vec![
            ChangeEvent::written(1, false, entity("b")),
            ChangeEvent::written(1, false, entity("a")),
        ]);

        assert_eq!(rx.recv().unwrap().owner_id, OwnerId::new("a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit_batch(vec![ChangeEvent::written(1, false, entity("a"))]);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn delete_and_purge_events() {
        let mut e = entity("a");
        e.deleted = true;
        assert_eq!(ChangeEvent::written(2, true, e.clone()).change_type, ChangeType::Delete);

        let purge = ChangeEvent::purged(3, e.local_id, e.entity_type, e.owner_id);
        assert_eq!(purge.change_type, ChangeType::Purge);
        assert!(purge.entity.is_none());
    }

    #[test]
    fn stream_replays_then_follows() {
        let feed = Arc::new(ChangeFeed::new());
        let existing = entity("a");
        let mut stream = ChangeStream::new(vec![existing.clone()], feed.subscribe());

        let feed_clone = Arc::clone(&feed);
        let handle = thread::spawn(move || {
            feed_clone.emit_batch(vec![ChangeEvent::written(1, false, entity("a"))]);
        });

        let first = stream.next().unwrap();
        assert_eq!(first.change_type, ChangeType::Snapshot);
        assert_eq!(first.local_id, existing.local_id);

        let second = stream.next_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(second.change_type, ChangeType::Insert);
        handle.join().unwrap();

        assert!(stream.try_next().is_none());
    }
}
