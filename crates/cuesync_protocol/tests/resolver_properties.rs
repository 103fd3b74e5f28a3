//! Property tests for conflict resolution.

use cuesync_protocol::{
    ConflictResolver, EntityType, LocalId, OwnerId, Payload, RemoteId, SyncState, SyncableEntity,
    Timestamp,
};
use proptest::prelude::*;
use uuid::Uuid;

fn entity_type_strategy() -> impl Strategy<Value = EntityType> {
    prop::sample::select(EntityType::ALL.to_vec())
}

fn sync_state_strategy() -> impl Strategy<Value = SyncState> {
    prop::sample::select(vec![
        SyncState::Clean,
        SyncState::PendingCreate,
        SyncState::PendingUpdate,
        SyncState::PendingDelete,
        SyncState::Conflicted,
    ])
}

fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map(
        prop::sample::select(vec!["total", "amount", "paid", "name", "note"]),
        0i64..4,
        0..4,
    )
    .prop_map(|fields| {
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(v)))
            .collect()
    })
}

prop_compose! {
    fn entity_strategy(ty: EntityType, id: LocalId)(
        state in sync_state_strategy(),
        payload in payload_strategy(),
        local_ts in 0u64..8,
        remote_ts in prop::option::of(0u64..8),
        has_remote in any::<bool>(),
        deleted in any::<bool>(),
    ) -> SyncableEntity {
        SyncableEntity {
            local_id: id,
            remote_id: has_remote.then(|| RemoteId::new("r-1")),
            entity_type: ty,
            owner_id: OwnerId::new("route"),
            payload,
            updated_at_local: Timestamp::from_millis(local_ts),
            updated_at_remote: remote_ts.map(Timestamp::from_millis),
            deleted,
            sync_state: state,
        }
    }
}

prop_compose! {
    fn remote_strategy(ty: EntityType, id: LocalId)(
        payload in payload_strategy(),
        ts in 0u64..8,
        deleted in any::<bool>(),
    ) -> SyncableEntity {
        SyncableEntity::from_remote(
            id,
            RemoteId::new("r-1"),
            ty,
            OwnerId::new("route"),
            payload,
            Timestamp::from_millis(ts),
            deleted,
        )
    }
}

fn pair_strategy() -> impl Strategy<Value = (SyncableEntity, SyncableEntity)> {
    (entity_type_strategy(), any::<u128>()).prop_flat_map(|(ty, raw)| {
        let id = LocalId::from_uuid(Uuid::from_u128(raw));
        (entity_strategy(ty, id), remote_strategy(ty, id))
    })
}

proptest! {
    #[test]
    fn resolve_is_deterministic((local, remote) in pair_strategy()) {
        let resolver = ConflictResolver::default();
        prop_assert_eq!(resolver.resolve(&local, &remote), resolver.resolve(&local, &remote));
    }

    #[test]
    fn resolve_is_stable_under_reapplication((local, remote) in pair_strategy()) {
        let resolver = ConflictResolver::default();
        let once = resolver.resolve(&local, &remote);
        let twice = resolver.resolve(&once, &remote);
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn resolve_keeps_identity((local, remote) in pair_strategy()) {
        let resolver = ConflictResolver::default();
        let merged = resolver.resolve(&local, &remote);
        prop_assert_eq!(merged.local_id, local.local_id);
        prop_assert_eq!(merged.entity_type, local.entity_type);
    }

    #[test]
    fn clean_results_satisfy_invariant((local, remote) in pair_strategy()) {
        let resolver = ConflictResolver::default();
        let merged = resolver.resolve(&local, &remote);
        if merged.sync_state == SyncState::Clean && local.sync_state != SyncState::Clean {
            prop_assert!(merged.is_consistently_clean());
        }
    }

    #[test]
    fn live_side_must_be_strictly_newer_than_tombstone((local, remote) in pair_strategy()) {
        let resolver = ConflictResolver::default();
        let merged = resolver.resolve(&local, &remote);
        if merged.sync_state != SyncState::Conflicted
            && (local.deleted || remote.deleted)
            && !merged.deleted
        {
            let live_ts = if local.deleted { remote.version() } else { local.version() };
            let dead_ts = if local.deleted { local.version() } else { remote.version() };
            prop_assert!(live_ts > dead_ts);
        }
    }
}
