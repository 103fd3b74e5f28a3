//! Integration tests for the local store: durability, coalescing and table
//! assignments.

use cuesync_protocol::{
    AssignmentState, EntityType, LocalId, Operation, OwnerId, Payload, RemoteId, SyncState,
    SyncableEntity, Timestamp,
};
use cuesync_store::{
    JournalBackend, LocalStore, ManualClock, MemoryJournal, StoreError, StoreOptions,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

fn owner() -> OwnerId {
    OwnerId::new("route-1")
}

fn open(journal: &MemoryJournal, clock: &Arc<ManualClock>) -> LocalStore {
    LocalStore::open_with_backend(
        Box::new(journal.clone()),
        StoreOptions::default(),
        clock.clone(),
    )
    .unwrap()
}

#[test]
fn reopen_restores_entities_log_and_watermarks() {
    let journal = MemoryJournal::new();
    let clock = Arc::new(ManualClock::new(100));

    let (client, table) = {
        let store = open(&journal, &clock);
        let client = store
            .upsert(SyncableEntity::new(
                EntityType::Client,
                owner(),
                payload(json!({"name": "Bar Sol"})),
            ))
            .unwrap();
        let table = store
            .upsert(SyncableEntity::new(
                EntityType::Table,
                owner(),
                payload(json!({"number": 5})),
            ))
            .unwrap();
        let entry = store.pending_mutations(1).remove(0);
        store
            .confirm_push(&entry, RemoteId::new("c-1"), client.updated_at_local)
            .unwrap();

        let mut marks = BTreeMap::new();
        marks.insert(EntityType::Client, Timestamp::from_millis(77));
        store.advance_watermarks(&marks).unwrap();
        (client, table)
    };

    let store = open(&journal, &clock);
    assert!(store.get(client.local_id).unwrap().is_consistently_clean());
    assert_eq!(store.get(table.local_id).unwrap(), table);
    assert_eq!(store.watermark(EntityType::Client), Timestamp::from_millis(77));

    let pending = store.pending_mutations(10);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].local_id, table.local_id);

    // Sequences and timestamps continue past what was replayed.
    let next = store
        .upsert(SyncableEntity::new(EntityType::Expense, owner(), Payload::new()))
        .unwrap();
    assert!(next.updated_at_local > table.updated_at_local);
    assert!(store.pending_mutations(10)[1].sequence > pending[0].sequence);
}

#[test]
fn torn_tail_is_truncated_on_open() {
    let journal = MemoryJournal::new();
    let clock = Arc::new(ManualClock::new(100));
    let kept = {
        let store = open(&journal, &clock);
        let kept = store
            .upsert(SyncableEntity::new(EntityType::Client, owner(), Payload::new()))
            .unwrap();
        store
            .upsert(SyncableEntity::new(EntityType::Client, owner(), Payload::new()))
            .unwrap();
        kept
    };

    // Simulate a crash halfway through the second commit.
    let mut bytes = journal.bytes();
    bytes.truncate(bytes.len() - 7);
    let torn = MemoryJournal::with_data(bytes);

    let store = open(&torn, &clock);
    assert_eq!(store.entity_count(), 1);
    assert!(store.find(kept.local_id).is_some());
    assert_eq!(store.pending_count(), 1);

    // The torn bytes are gone, so new commits replay cleanly.
    store
        .upsert(SyncableEntity::new(EntityType::Table, owner(), Payload::new()))
        .unwrap();
    drop(store);
    assert_eq!(open(&torn, &clock).entity_count(), 2);
}

#[test]
fn torn_tail_fails_open_when_repair_is_disabled() {
    let journal = MemoryJournal::new();
    let clock = Arc::new(ManualClock::new(100));
    open(&journal, &clock)
        .upsert(SyncableEntity::new(EntityType::Client, owner(), Payload::new()))
        .unwrap();

    let mut bytes = journal.bytes();
    bytes.pop();
    let result = LocalStore::open_with_backend(
        Box::new(MemoryJournal::with_data(bytes)),
        StoreOptions::default().repair_torn_tail(false),
        clock,
    );
    assert!(matches!(result, Err(StoreError::StorageFault { .. })));
}

#[test]
fn damaged_header_in_the_middle_fails_open() {
    let journal = MemoryJournal::new();
    let clock = Arc::new(ManualClock::new(100));
    let second_at = {
        let store = open(&journal, &clock);
        store
            .upsert(SyncableEntity::new(EntityType::Client, owner(), Payload::new()))
            .unwrap();
        let second_at = journal.bytes().len();
        for _ in 0..2 {
            store
                .upsert(SyncableEntity::new(EntityType::Client, owner(), Payload::new()))
                .unwrap();
        }
        second_at
    };

    for byte in [0, 9] {
        let mut bytes = journal.bytes();
        bytes[second_at + byte] ^= 0xFF;
        let damaged = MemoryJournal::with_data(bytes.clone());

        let result = LocalStore::open_with_backend(
            Box::new(damaged.clone()),
            StoreOptions::default(),
            clock.clone(),
        );
        assert!(matches!(result, Err(StoreError::StorageFault { .. })));
        // Later commits are not cut away.
        assert_eq!(damaged.bytes(), bytes);
    }
}

#[test]
fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("route.journal");

    let saved = {
        let store = LocalStore::open(&path).unwrap();
        store
            .upsert(SyncableEntity::new(
                EntityType::Settlement,
                owner(),
                payload(json!({"total": 250})),
            ))
            .unwrap()
    };

    let store = LocalStore::open(&path).unwrap();
    assert_eq!(store.get(saved.local_id).unwrap().field("total"), Some(&json!(250)));
}

#[test]
fn coalescing_keeps_one_entry_per_entity() {
    let store = LocalStore::open_in_memory().unwrap();
    let mut client = store
        .upsert(SyncableEntity::new(EntityType::Client, owner(), Payload::new()))
        .unwrap();
    for i in 0..5 {
        client.payload.insert("visits".into(), json!(i));
        client = store.upsert(client).unwrap();
    }

    let pending = store.pending_mutations(10);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Create);
    assert_eq!(pending[0].snapshot.field("visits"), Some(&json!(4)));
}

#[test]
fn deleting_a_synced_entity_logs_a_delete() {
    let store = LocalStore::open_in_memory().unwrap();
    let saved = store
        .upsert(SyncableEntity::new(EntityType::Expense, owner(), Payload::new()))
        .unwrap();
    let entry = store.pending_mutations(1).remove(0);
    store
        .confirm_push(&entry, RemoteId::new("e-1"), saved.updated_at_local)
        .unwrap();

    let tombstone = store.soft_delete(saved.local_id).unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.sync_state, SyncState::PendingDelete);
    assert_eq!(store.pending_mutations(1)[0].operation, Operation::Delete);

    // Deleting again is a no-op.
    let again = store.soft_delete(saved.local_id).unwrap();
    assert_eq!(again, tombstone);

    // Upserting a tombstone resurrects it as an update.
    let revived = store.upsert(again).unwrap();
    assert!(!revived.deleted);
    assert_eq!(store.pending_mutations(1)[0].operation, Operation::Update);
}

#[test]
fn table_five_scenario() {
    let store = LocalStore::open_in_memory().unwrap();
    let tables = store.assignments(owner());
    let table5 = LocalId::new();
    let (x, y) = (LocalId::new(), LocalId::new());

    assert_eq!(tables.link(table5, x).unwrap().state(), AssignmentState::Assigned(x));
    assert!(matches!(
        tables.link(table5, y),
        Err(StoreError::AlreadyAssigned { client_id, .. }) if client_id == x
    ));
    assert!(tables.unlink(table5).unwrap());
    assert!(!tables.unlink(table5).unwrap());
    assert_eq!(tables.get(table5).unwrap().client_id(), None);
}

#[test]
fn concurrent_links_admit_exactly_one_winner() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let table = LocalId::new();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let client = LocalId::new();
                barrier.wait();
                store.assignments(owner()).link(table, client).map(|_| client)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, StoreError::AlreadyAssigned { .. })));

    let assignment = store.assignments(owner()).get(table).unwrap();
    assert_eq!(assignment.client_id(), Some(*winners[0]));
}

#[test]
fn journal_grows_one_record_per_commit() {
    let journal = MemoryJournal::new();
    let clock = Arc::new(ManualClock::new(1));
    let store = open(&journal, &clock);

    store
        .transaction(|txn| {
            txn.upsert(SyncableEntity::new(EntityType::Client, owner(), Payload::new()))?;
            txn.upsert(SyncableEntity::new(EntityType::Table, owner(), Payload::new()))?;
            Ok(())
        })
        .unwrap();

    let replay = cuesync_store::decode_frames(&journal.read_all().unwrap()).unwrap();
    assert_eq!(replay.commits.len(), 1);
    assert_eq!(replay.commits[0].ops.len(), 4);
    assert_eq!(store.stats().commit_sequence, 1);
}
