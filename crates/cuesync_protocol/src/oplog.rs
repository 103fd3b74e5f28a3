//! Mutation log: the ordered set of local changes not yet confirmed remotely.

use crate::entity::{LocalId, RemoteId, SyncableEntity};
use crate::operation::{MutationLogEntry, Operation};
use std::collections::{BTreeMap, HashMap};

/// What happened when a mutation was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// A new entry was appended with this sequence.
    Appended(u64),
    /// An existing entry for the same entity absorbed the change and moved
    /// to this sequence.
    Coalesced(u64),
    /// The change cancelled out a create that was never sent to the remote;
    /// the entity should be purged.
    Cancelled,
}

/// A log of pending outbound mutations.
///
/// # Invariants
///
/// - Entries are ordered by `sequence`, which is strictly increasing.
/// - There is at most one entry per `local_id`; later mutations coalesce
///   into the existing entry.
/// - A create followed by a delete leaves no entry behind, unless the
///   create was already sent. Then the delete is kept so the remote copy,
///   if the create landed, is tombstoned too.
#[derive(Debug, Clone)]
pub struct MutationLog {
    entries: BTreeMap<u64, MutationLogEntry>,
    by_entity: HashMap<LocalId, u64>,
    next_sequence: u64,
}

impl MutationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_entity: HashMap::new(),
            next_sequence: 1,
        }
    }

    /// Rebuilds a log from persisted entries.
    ///
    /// `next_sequence` is raised past every restored entry.
    pub fn from_entries(
        next_sequence: u64,
        entries: impl IntoIterator<Item = MutationLogEntry>,
    ) -> Self {
        let mut log = Self::new();
        log.next_sequence = next_sequence.max(1);
        for entry in entries {
            log.restore(entry);
        }
        log
    }

    /// Records a mutation of `snapshot`, coalescing with any existing entry.
    pub fn record(&mut self, operation: Operation, snapshot: SyncableEntity) -> Recorded {
        let local_id = snapshot.local_id;
        let previous = self.take(local_id);

        let unsent_create = previous
            .as_ref()
            .is_some_and(|p| p.operation == Operation::Create && !p.sent);
        if operation == Operation::Delete && snapshot.remote_id.is_none() && unsent_create {
            return Recorded::Cancelled;
        }

        let sequence = self.allocate();
        match previous {
            Some(prev) => {
                let operation = match (prev.operation, operation) {
                    (Operation::Create, Operation::Create | Operation::Update) => {
                        Operation::Create
                    }
                    (_, next) => next,
                };
                self.restore(MutationLogEntry {
                    sequence,
                    local_id,
                    entity_type: snapshot.entity_type,
                    operation,
                    snapshot,
                    attempts: prev.attempts,
                    last_error: prev.last_error,
                    sent: prev.sent,
                });
                Recorded::Coalesced(sequence)
            }
            None => {
                self.restore(MutationLogEntry::new(sequence, operation, snapshot));
                Recorded::Appended(sequence)
            }
        }
    }

    /// Returns the pending entry for an entity.
    pub fn get(&self, local_id: LocalId) -> Option<&MutationLogEntry> {
        self.by_entity
            .get(&local_id)
            .and_then(|seq| self.entries.get(seq))
    }

    /// Returns pending entries, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &MutationLogEntry> {
        self.entries.values()
    }

    /// Returns up to `limit` pending entries, oldest first.
    pub fn pending_batch(&self, limit: usize) -> Vec<MutationLogEntry> {
        self.pending().take(limit).cloned().collect()
    }

    /// Removes the entry for `local_id` if it still has `sequence`.
    ///
    /// Returns false when a newer mutation has replaced the entry since it
    /// was read.
    pub fn acknowledge(&mut self, local_id: LocalId, sequence: u64) -> bool {
        if self.by_entity.get(&local_id) != Some(&sequence) {
            return false;
        }
        self.take(local_id);
        true
    }

    /// Points a newer create entry at the remote record a confirmed push
    /// created, turning it into an update.
    pub fn rebase_onto_remote(&mut self, local_id: LocalId, remote_id: &RemoteId) {
        let Some(seq) = self.by_entity.get(&local_id) else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(seq) {
            entry.snapshot.remote_id = Some(remote_id.clone());
            if entry.operation == Operation::Create {
                entry.operation = Operation::Update;
            }
        }
    }

    /// Marks the entry with `sequence` as sent.
    ///
    /// Returns true if the flag changed.
    pub fn mark_sent(&mut self, local_id: LocalId, sequence: u64) -> bool {
        if self.by_entity.get(&local_id) != Some(&sequence) {
            return false;
        }
        match self.entries.get_mut(&sequence) {
            Some(entry) if !entry.sent => {
                entry.sent = true;
                true
            }
            _ => false,
        }
    }

    /// Records a failed push attempt for the entry with `sequence`.
    ///
    /// Returns the new attempt count, or `None` if the entry is gone or was
    /// replaced.
    pub fn record_failure(
        &mut self,
        local_id: LocalId,
        sequence: u64,
        error: impl Into<String>,
    ) -> Option<u32> {
        if self.by_entity.get(&local_id) != Some(&sequence) {
            return None;
        }
        let entry = self.entries.get_mut(&sequence)?;
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_error = Some(error.into());
        Some(entry.attempts)
    }

    /// Removes and returns the entry for an entity regardless of sequence.
    pub fn take(&mut self, local_id: LocalId) -> Option<MutationLogEntry> {
        let seq = self.by_entity.remove(&local_id)?;
        self.entries.remove(&seq)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The sequence the next recorded mutation will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Raises the next sequence to at least `next`.
    pub fn reserve_through(&mut self, next: u64) {
        self.next_sequence = self.next_sequence.max(next);
    }

    fn allocate(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Puts an entry back verbatim, replacing any entry for the same entity.
    ///
    /// Used when replaying persisted state.
    pub fn restore(&mut self, entry: MutationLogEntry) {
        if let Some(old) = self.by_entity.insert(entry.local_id, entry.sequence) {
            self.entries.remove(&old);
        }
        self.next_sequence = self.next_sequence.max(entry.sequence + 1);
        self.entries.insert(entry.sequence, entry);
    }
}

impl Default for MutationLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits entries into push batches.
///
/// Consecutive entries of the same entity type share a batch, and no batch
/// exceeds `max_batch` entries. Order is preserved.
pub fn group_batches(entries: &[MutationLogEntry], max_batch: usize) -> Vec<&[MutationLogEntry]> {
    let max_batch = max_batch.max(1);
    let mut batches = Vec::new();
    let mut start = 0;

    for i in 1..=entries.len() {
        let boundary = i == entries.len()
            || entries[i].entity_type != entries[start].entity_type
            || i - start == max_batch;
        if boundary {
            batches.push(&entries[start..i]);
            start = i;
        }
    }

    batches
}
