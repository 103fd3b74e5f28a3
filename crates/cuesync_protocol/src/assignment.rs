//! Table ↔ client assignment model.
//!
//! A table is either unassigned or linked to exactly one client. The record
//! is stored as an ordinary syncable entity whose id is derived from the
//! table id, so every device addresses the same record.

use crate::entity::{EntityType, LocalId, Payload};
use crate::error::{ProtocolError, ProtocolResult};
use serde_json::Value;

/// Assignment state of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentState {
    /// No client holds the table.
    Unassigned,
    /// The table is rented by this client.
    Assigned(LocalId),
}

/// Link between a billiard table and a client.
///
/// `active` is true exactly when `client_id` is set; the fields are private
/// so no other combination can be constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableAssignment {
    table_id: LocalId,
    client_id: Option<LocalId>,
    active: bool,
}

impl TableAssignment {
    /// An unassigned table.
    pub fn unassigned(table_id: LocalId) -> Self {
        Self {
            table_id,
            client_id: None,
            active: false,
        }
    }

    /// Local id of the assignment record for `table_id`.
    pub fn record_id(table_id: LocalId) -> LocalId {
        LocalId::derived(EntityType::TableAssignment, table_id)
    }

    /// The table.
    pub fn table_id(&self) -> LocalId {
        self.table_id
    }

    /// The client holding the table, if any.
    pub fn client_id(&self) -> Option<LocalId> {
        self.client_id
    }

    /// Whether the table is currently rented.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current state.
    pub fn state(&self) -> AssignmentState {
        match self.client_id {
            Some(client) => AssignmentState::Assigned(client),
            None => AssignmentState::Unassigned,
        }
    }

    /// Links the table to `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::AlreadyAssigned`] if any client already holds
    /// the table, including `client_id` itself.
    pub fn link(&self, client_id: LocalId) -> ProtocolResult<Self> {
        match self.state() {
            AssignmentState::Assigned(current) => Err(ProtocolError::AlreadyAssigned {
                table_id: self.table_id,
                client_id: current,
            }),
            AssignmentState::Unassigned => Ok(Self {
                table_id: self.table_id,
                client_id: Some(client_id),
                active: true,
            }),
        }
    }

    /// Unlinks the table. Returns `None` when it was already unassigned.
    pub fn unlink(&self) -> Option<Self> {
        match self.state() {
            AssignmentState::Unassigned => None,
            AssignmentState::Assigned(_) => Some(Self::unassigned(self.table_id)),
        }
    }

    /// Encodes the assignment as an entity payload.
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("table_id".into(), Value::String(self.table_id.to_string()));
        payload.insert(
            "client_id".into(),
            self.client_id
                .map_or(Value::Null, |c| Value::String(c.to_string())),
        );
        payload.insert("active".into(), Value::Bool(self.active));
        payload
    }

    /// Decodes and validates an assignment payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] if a field is missing or
    /// `active` disagrees with `client_id`.
    pub fn from_payload(payload: &Payload) -> ProtocolResult<Self> {
        let table_id = parse_id(payload.get("table_id"), "table_id")?
            .ok_or_else(|| ProtocolError::invalid_payload("missing table_id"))?;
        let client_id = parse_id(payload.get("client_id"), "client_id")?;
        let active = payload
            .get("active")
            .and_then(Value::as_bool)
            .ok_or_else(|| ProtocolError::invalid_payload("missing active flag"))?;

        if active != client_id.is_some() {
            return Err(ProtocolError::invalid_payload(format!(
                "active={active} disagrees with client_id for table {table_id}"
            )));
        }

        Ok(Self {
            table_id,
            client_id,
            active,
        })
    }
}

fn parse_id(value: Option<&Value>, field: &str) -> ProtocolResult<Option<LocalId>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => uuid::Uuid::parse_str(text)
            .map(|u| Some(LocalId::from_uuid(u)))
            .map_err(|e| ProtocolError::invalid_payload(format!("{field}: {e}"))),
        Some(other) => Err(ProtocolError::invalid_payload(format!(
            "{field}: expected string, got {other}"
        ))),
    }
}
