//! Conflict detection and resolution.
//!
//! The default policy is last-writer-wins on the version timestamp, with ties
//! going to the remote copy and tombstones dominating unless the live side is
//! strictly newer. Entity types may protect individual fields: when a
//! protected field differs between two live versions, resolution escalates
//! to [`SyncState::Conflicted`] instead of picking a winner.

use crate::entity::{EntityType, SyncState, SyncableEntity};
use std::collections::BTreeMap;

/// Outcome of comparing a local and a remote version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the local version.
    KeepLocal,
    /// Accept the remote version.
    AcceptRemote,
    /// Leave the entity conflicted for external resolution.
    Escalate,
}

/// Per-type fields that must never be merged automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicy {
    protected: BTreeMap<EntityType, Vec<String>>,
}

impl FieldPolicy {
    /// A policy with no protected fields.
    pub fn none() -> Self {
        Self {
            protected: BTreeMap::new(),
        }
    }

    /// Protects `fields` of `entity_type`.
    pub fn protect<I, S>(mut self, entity_type: EntityType, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected
            .entry(entity_type)
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Protected fields of `entity_type`.
    pub fn protected_fields(&self, entity_type: EntityType) -> &[String] {
        self.protected
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns the first protected field on which the two versions differ.
    pub fn diverging_field<'a>(
        &'a self,
        local: &SyncableEntity,
        remote: &SyncableEntity,
    ) -> Option<&'a str> {
        self.protected_fields(local.entity_type)
            .iter()
            .find(|field| local.field(field) != remote.field(field))
            .map(String::as_str)
    }
}

impl Default for FieldPolicy {
    /// Monetary totals never auto-merge.
    fn default() -> Self {
        Self::none()
            .protect(EntityType::Settlement, ["total", "amount", "paid"])
            .protect(EntityType::Expense, ["amount"])
    }
}

/// Resolves local/remote version pairs.
///
/// Resolution is a pure function of its inputs: calling it twice with the
/// same arguments yields identical output, and re-resolving a result against
/// the same remote version is a no-op.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: FieldPolicy,
}

impl ConflictResolver {
    /// Creates a resolver with the given field policy.
    pub fn new(policy: FieldPolicy) -> Self {
        Self { policy }
    }

    /// Returns the field policy.
    pub fn policy(&self) -> &FieldPolicy {
        &self.policy
    }

    /// Decides which side wins.
    pub fn decide(&self, local: &SyncableEntity, remote: &SyncableEntity) -> ConflictResolution {
        let local_ts = local.version();
        let remote_ts = remote.version();

        if local.sync_state.has_local_changes()
            && !local.deleted
            && !remote.deleted
            && self.policy.diverging_field(local, remote).is_some()
        {
            return ConflictResolution::Escalate;
        }

        match (local.deleted, remote.deleted) {
            (true, true) => ConflictResolution::AcceptRemote,
            (true, false) => {
                if remote_ts > local_ts {
                    ConflictResolution::AcceptRemote
                } else {
                    ConflictResolution::KeepLocal
                }
            }
            (false, true) => {
                if local_ts > remote_ts {
                    ConflictResolution::KeepLocal
                } else {
                    ConflictResolution::AcceptRemote
                }
            }
            (false, false) => {
                if local_ts > remote_ts {
                    ConflictResolution::KeepLocal
                } else {
                    ConflictResolution::AcceptRemote
                }
            }
        }
    }

    /// Produces the merged entity for a local/remote pair.
    pub fn resolve(&self, local: &SyncableEntity, remote: &SyncableEntity) -> SyncableEntity {
        match self.decide(local, remote) {
            ConflictResolution::Escalate => SyncableEntity {
                sync_state: SyncState::Conflicted,
                ..local.clone()
            },
            ConflictResolution::AcceptRemote => {
                let ts = remote.version();
                SyncableEntity {
                    local_id: local.local_id,
                    remote_id: remote.remote_id.clone().or_else(|| local.remote_id.clone()),
                    entity_type: local.entity_type,
                    owner_id: remote.owner_id.clone(),
                    payload: remote.payload.clone(),
                    updated_at_local: ts,
                    updated_at_remote: Some(ts),
                    deleted: remote.deleted,
                    sync_state: SyncState::Clean,
                }
            }
            ConflictResolution::KeepLocal if local.sync_state == SyncState::Clean => local.clone(),
            ConflictResolution::KeepLocal => {
                let mut kept = SyncableEntity {
                    remote_id: local.remote_id.clone().or_else(|| remote.remote_id.clone()),
                    updated_at_remote: Some(remote.version()),
                    ..local.clone()
                };
                kept.sync_state = kept.pending_state();
                kept
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{OwnerId, Payload, RemoteId, Timestamp};
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn local(ty: EntityType, ts: u64, body: serde_json::Value) -> SyncableEntity {
        let mut e = SyncableEntity::new(ty, OwnerId::new("route-1"), payload(body));
        e.remote_id = Some(RemoteId::new("r-1"));
        e.updated_at_local = Timestamp::from_millis(ts);
        e.updated_at_remote = Some(Timestamp::from_millis(1));
        e.sync_state = SyncState::PendingUpdate;
        e
    }

    fn remote_of(l: &SyncableEntity, ts: u64, body: serde_json::Value) -> SyncableEntity {
        SyncableEntity::from_remote(
            l.local_id,
            RemoteId::new("r-1"),
            l.entity_type,
            l.owner_id.clone(),
            payload(body),
            Timestamp::from_millis(ts),
            false,
        )
    }

    #[test]
    fn newer_local_is_kept() {
        let resolver = ConflictResolver::default();
        let l = local(EntityType::Client, 30, json!({"name": "local"}));
        let r = remote_of(&l, 20, json!({"name": "remote"}));

        let merged = resolver.resolve(&l, &r);
        assert_eq!(merged.field("name"), Some(&json!("local")));
        assert_eq!(merged.sync_state, SyncState::PendingUpdate);
        assert_eq!(merged.updated_at_remote, Some(Timestamp::from_millis(20)));
    }

    #[test]
    fn newer_remote_wins_and_is_clean() {
        let resolver = ConflictResolver::default();
        let l = local(EntityType::Client, 10, json!({"name": "local"}));
        let r = remote_of(&l, 20, json!({"name": "remote"}));

        let merged = resolver.resolve(&l, &r);
        assert_eq!(merged.field("name"), Some(&json!("remote")));
        assert!(merged.is_consistently_clean());
        assert_eq!(merged.local_id, l.local_id);
    }

    #[test]
    fn tie_goes_to_remote() {
        let resolver = ConflictResolver::default();
        let l = local(EntityType::Table, 20, json!({"felt": "green"}));
        let r = remote_of(&l, 20, json!({"felt": "blue"}));

        assert_eq!(resolver.decide(&l, &r), ConflictResolution::AcceptRemote);
    }

    #[test]
    fn tombstone_dominates_unless_other_side_strictly_newer() {
        let resolver = ConflictResolver::default();
        let mut l = local(EntityType::Table, 20, json!({}));
        l.deleted = true;
        l.sync_state = SyncState::PendingDelete;

        let same = remote_of(&l, 20, json!({}));
        let merged = resolver.resolve(&l, &same);
        assert!(merged.deleted);
        assert_eq!(merged.sync_state, SyncState::PendingDelete);

        let newer = remote_of(&l, 21, json!({"felt": "red"}));
        let merged = resolver.resolve(&l, &newer);
        assert!(!merged.deleted);
        assert_eq!(merged.sync_state, SyncState::Clean);

        let live = local(EntityType::Table, 20, json!({}));
        let mut gone = remote_of(&live, 20, json!({}));
        gone.deleted = true;
        assert!(resolver.resolve(&live, &gone).deleted);
    }

    #[test]
    fn protected_field_escalates() {
        let resolver = ConflictResolver::default();
        let l = local(EntityType::Settlement, 30, json!({"total": 100, "note": "a"}));
        let r = remote_of(&l, 20, json!({"total": 120, "note": "a"}));

        assert_eq!(resolver.decide(&l, &r), ConflictResolution::Escalate);
        let merged = resolver.resolve(&l, &r);
        assert_eq!(merged.sync_state, SyncState::Conflicted);
        assert_eq!(merged.field("total"), Some(&json!(100)));
    }

    #[test]
    fn unprotected_settlement_fields_merge_normally() {
        let resolver = ConflictResolver::default();
        let l = local(EntityType::Settlement, 30, json!({"total": 100, "note": "a"}));
        let r = remote_of(&l, 20, json!({"total": 100, "note": "b"}));

        assert_eq!(resolver.decide(&l, &r), ConflictResolution::KeepLocal);
    }

    #[test]
    fn clean_local_is_never_escalated() {
        let resolver = ConflictResolver::default();
        let base = local(EntityType::Expense, 10, json!({"amount": 5}));
        let clean = remote_of(&base, 10, json!({"amount": 5}));
        let incoming = remote_of(&base, 40, json!({"amount": 9}));

        let merged = resolver.resolve(&clean, &incoming);
        assert_eq!(merged.field("amount"), Some(&json!(9)));
        assert_eq!(merged.sync_state, SyncState::Clean);
    }

    #[test]
    fn stale_remote_does_not_dirty_clean_local() {
        let resolver = ConflictResolver::default();
        let base = local(EntityType::Client, 10, json!({}));
        let clean = remote_of(&base, 50, json!({"name": "new"}));
        let stale = remote_of(&base, 40, json!({"name": "old"}));

        assert_eq!(resolver.resolve(&clean, &stale), clean);
    }

    #[test]
    fn custom_policy() {
        let resolver = ConflictResolver::new(FieldPolicy::none());
        let l = local(EntityType::Settlement, 30, json!({"total": 100}));
        let r = remote_of(&l, 20, json!({"total": 120}));
        assert_eq!(resolver.decide(&l, &r), ConflictResolution::KeepLocal);

        let policy = FieldPolicy::none().protect(EntityType::Client, ["credit_limit"]);
        assert_eq!(policy.protected_fields(EntityType::Client), ["credit_limit"]);
        assert!(policy.protected_fields(EntityType::Table).is_empty());
    }
}
