//! Table ↔ client links stored as ordinary entities.

use crate::error::StoreResult;
use crate::store::LocalStore;
use crate::transaction::StoreTransaction;
use cuesync_protocol::{EntityType, LocalId, OwnerId, SyncableEntity, TableAssignment};
use tracing::debug;

/// Table assignment operations of one owner.
///
/// Each call checks the current state and writes the new one inside a single
/// store transaction, so two concurrent `link` calls on the same table never
/// both succeed.
#[derive(Debug)]
pub struct TableAssignments<'a> {
    store: &'a LocalStore,
    owner_id: OwnerId,
}

impl LocalStore {
    /// Table assignment operations scoped to `owner_id`.
    pub fn assignments(&self, owner_id: OwnerId) -> TableAssignments<'_> {
        TableAssignments {
            store: self,
            owner_id,
        }
    }
}

impl TableAssignments<'_> {
    /// Current assignment of a table.
    pub fn get(&self, table_id: LocalId) -> StoreResult<TableAssignment> {
        self.store.transaction(|txn| current(txn, table_id))
    }

    /// Links a table to a client.
    ///
    /// Fails with [`crate::StoreError::AlreadyAssigned`] if any client,
    /// including `client_id` itself, already holds the table.
    pub fn link(&self, table_id: LocalId, client_id: LocalId) -> StoreResult<TableAssignment> {
        self.store.transaction(|txn| {
            let linked = current(txn, table_id)?.link(client_id)?;
            self.write(txn, &linked)?;
            debug!(table = %table_id, client = %client_id, "table linked");
            Ok(linked)
        })
    }

    /// Unlinks a table. Returns false if it was not linked.
    pub fn unlink(&self, table_id: LocalId) -> StoreResult<bool> {
        self.store.transaction(|txn| {
            let Some(unlinked) = current(txn, table_id)?.unlink() else {
                return Ok(false);
            };
            self.write(txn, &unlinked)?;
            debug!(table = %table_id, "table unlinked");
            Ok(true)
        })
    }

    fn write(
        &self,
        txn: &mut StoreTransaction<'_>,
        assignment: &TableAssignment,
    ) -> StoreResult<()> {
        let id = TableAssignment::record_id(assignment.table_id());
        let entity = match txn.get(id) {
            Some(mut existing) => {
                existing.payload = assignment.to_payload();
                existing
            }
            None => SyncableEntity::with_id(
                id,
                EntityType::TableAssignment,
                self.owner_id.clone(),
                assignment.to_payload(),
            ),
        };
        txn.upsert(entity)?;
        Ok(())
    }
}

fn current(txn: &StoreTransaction<'_>, table_id: LocalId) -> StoreResult<TableAssignment> {
    match txn.get(TableAssignment::record_id(table_id)) {
        Some(entity) if !entity.deleted => Ok(TableAssignment::from_payload(&entity.payload)?),
        _ => Ok(TableAssignment::unassigned(table_id)),
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StoreError;
    use crate::store::LocalStore;
    use cuesync_protocol::{AssignmentState, LocalId, OwnerId, SyncState};

    #[test]
    fn link_then_unlink() {
        let store = LocalStore::open_in_memory().unwrap();
        let tables = store.assignments(OwnerId::new("route-1"));
        let (table, client) = (LocalId::new(), LocalId::new());

        let linked = tables.link(table, client).unwrap();
        assert_eq!(linked.state(), AssignmentState::Assigned(client));
        assert!(tables.unlink(table).unwrap());
        assert!(!tables.unlink(table).unwrap());
        assert_eq!(tables.get(table).unwrap().state(), AssignmentState::Unassigned);
    }

    #[test]
    fn second_link_is_rejected() {
        let store = LocalStore::open_in_memory().unwrap();
        let tables = store.assignments(OwnerId::new("route-1"));
        let table = LocalId::new();
        let (a, b) = (LocalId::new(), LocalId::new());

        tables.link(table, a).unwrap();
        let err = tables.link(table, b).unwrap_err();
        assert!(matches!(
            err,
            StoreError::AlreadyAssigned { table_id, client_id } if table_id == table && client_id == a
        ));
    }

    #[test]
    fn assignment_is_a_syncable_entity() {
        let store = LocalStore::open_in_memory().unwrap();
        let tables = store.assignments(OwnerId::new("route-1"));
        let table = LocalId::new();
        tables.link(table, LocalId::new()).unwrap();

        let id = cuesync_protocol::TableAssignment::record_id(table);
        let entity = store.get(id).unwrap();
        assert_eq!(entity.sync_state, SyncState::PendingCreate);
        assert_eq!(store.pending_count(), 1);
    }
}
