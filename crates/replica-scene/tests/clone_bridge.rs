//! End-to-end clone bridging against the in-memory scene
//!
//! Tests validate:
//! - Private, polymorphic and container fields restored on the clone
//! - Identity tokens following into the clone, passive tokens staying put
//! - Shared and circular managed objects
//! - Asset duplication
//! - Lifecycle callback ordering and suspension
//! - Skips and structural failures
//!
//! # Running Tests
//! ```bash
//! cargo test -p replica-scene --test clone_bridge
//! ```

mod common;

use common::Fixture;
use replica_core::{
    BridgeConfig, BridgeError, Host, Liveness, ObjectId, ObjectKind, OperationStatus, SkipReason,
    Value,
};
use replica_scene::CloneQuirks;

/// Root with children `Left` and `Right`, an inventory on the root
fn inventory_tree(f: &mut Fixture) -> (ObjectId, ObjectId, ObjectId) {
    let root = f.scene.spawn_entity("Root");
    let left = f.scene.spawn_child(root, "Left").unwrap();
    f.scene.spawn_child(root, "Right").unwrap();
    let inventory = f.scene.add_member(root, f.types.inventory).unwrap();
    (root, left, inventory)
}

fn only_member(f: &Fixture, entity: ObjectId) -> ObjectId {
    let members = f.scene.members(entity);
    assert_eq!(members.len(), 1);
    members[0]
}

// ===== Field Restoration =====

#[test]
fn test_private_and_container_fields_restored() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    f.set(inv, "gold", Value::Int(120));
    f.set(inv, "secret", Value::Int(7));
    f.set(inv, "cache", Value::Int(99));
    let scores = f.scores(&[("alice", 3), ("bob", 5)]);
    f.set(inv, "scores", scores.clone());

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    assert!(outcome.report.is_completed());
    assert!(outcome.report.fields_restored > 0);
    assert_eq!(outcome.report.fields_failed, 0);

    let copy = only_member(&f, outcome.clone);
    assert_ne!(copy, inv);
    assert_eq!(f.field(copy, "gold").as_int(), Some(120));
    assert_eq!(f.field(copy, "secret").as_int(), Some(7));
    // Excluded from every serializer
    assert_eq!(f.field(copy, "cache").as_int(), Some(0));

    let restored = f.field(copy, "scores");
    assert!(restored.structurally_eq(&scores));
    assert!(!restored.same(&scores));
}

#[test]
fn test_polymorphic_field_keeps_concrete_type() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    let circle = f.object(f.types.circle, &[("radius", Value::Float(2.5))]);
    f.set(inv, "shape", circle.clone());

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);

    let shape = f.field(copy, "shape");
    let object = shape.as_object().expect("shape restored");
    assert_eq!(object.ty(), f.types.circle);
    assert!(!shape.same(&circle));
    assert!(shape.structurally_eq(&circle));
}

#[test]
fn test_circular_links_survive() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    let a = f.object(f.types.link, &[("label", Value::str("a"))]);
    let b = f.object(f.types.link, &[("label", Value::str("b")), ("next", a.clone())]);
    let next = f.registry.find_field(f.types.link, "next").unwrap().slot.unwrap();
    a.as_object().unwrap().write().set_slot(next, b.clone());
    f.set(inv, "ring", a.clone());

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);

    let ring = f.field(copy, "ring");
    let first = ring.as_object().unwrap().clone();
    let second = first.read().slot(next).cloned().unwrap();
    let back = second.as_object().unwrap().read().slot(next).cloned().unwrap();

    assert!(back.same(&ring));
    assert!(!ring.same(&a));
    assert!(ring.structurally_eq(&a));
}

#[test]
fn test_shared_objects_inside_one_field() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    let shared = f.object(f.types.link, &[("label", Value::str("shared"))]);
    f.set(inv, "chain", Value::list(f.types.link, vec![shared.clone(), shared.clone()]));

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);

    let chain = f.field(copy, "chain");
    let items = chain.as_list().unwrap().read().items.clone();
    assert_eq!(items.len(), 2);
    assert!(items[0].same(&items[1]));
    assert!(!items[0].same(&shared));
}

#[test]
fn test_null_and_empty_collections_stay_distinct() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    let empty = f.scores(&[]);
    f.set(inv, "scores", empty);
    f.set(inv, "missing", Value::Null);

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);

    let scores = f.field(copy, "scores");
    assert_eq!(scores.as_map().map(|m| m.len()), Some(0));
    assert!(f.field(copy, "missing").is_null());
}

// ===== Identity =====

#[test]
fn test_identity_tokens_follow_into_clone() {
    let mut f = Fixture::new();
    let (root, left, inv) = inventory_tree(&mut f);
    f.set(inv, "owner", Value::Host(left));
    f.set(inv, "also_owner", Value::Host(left));

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);
    let clone_left = f.scene.find_child(outcome.clone, "Left").unwrap();

    assert_ne!(clone_left, left);
    assert_eq!(f.field(copy, "owner").as_host(), Some(clone_left));
    assert_eq!(f.field(copy, "also_owner").as_host(), Some(clone_left));
}

#[test]
fn test_passive_reference_keeps_original() {
    let mut f = Fixture::new();
    let (root, left, inv) = inventory_tree(&mut f);
    f.set(inv, "home", Value::Host(left));

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);

    assert_eq!(f.field(copy, "home").as_host(), Some(left));
}

#[test]
fn test_reference_outside_tree_kept() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    let world = f.scene.spawn_entity("World");
    f.set(inv, "owner", Value::Host(world));

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);

    assert_eq!(f.field(copy, "owner").as_host(), Some(world));
}

#[test]
fn test_assets_duplicated_once_per_operation() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    let profile = f.scene.add_asset(f.types.profile).unwrap();
    f.set(profile, "level", Value::Int(7));
    let loadout = Value::map(
        f.types.string,
        f.types.profile,
        vec![
            (Value::str("main"), Value::Host(profile)),
            (Value::str("spare"), Value::Host(profile)),
        ],
    );
    f.set(inv, "loadout", loadout);

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);

    let restored = f.field(copy, "loadout");
    let map = restored.as_map().unwrap().read();
    let main = map.get(&Value::str("main")).and_then(Value::as_host).unwrap();
    let spare = map.get(&Value::str("spare")).and_then(Value::as_host).unwrap();

    assert_ne!(main, profile);
    assert_eq!(main, spare);
    assert!(f.scene.is_alive(main));
    assert_eq!(f.field(main, "level").as_int(), Some(7));
}

// ===== Native Behaviour =====

#[test]
fn test_plain_types_left_to_native_clone() {
    let mut f = Fixture::new();
    let root = f.scene.spawn_entity("Root");
    let child = f.scene.spawn_child(root, "Child").unwrap();
    let plain = f.scene.add_member(root, f.types.plain).unwrap();
    f.set(plain, "speed", Value::Float(4.0));
    f.set(plain, "target", Value::Host(child));

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    assert_eq!(
        outcome.report.status,
        OperationStatus::Skipped(SkipReason::NothingToBridge)
    );

    let copy = only_member(&f, outcome.clone);
    let clone_child = f.scene.find_child(outcome.clone, "Child").unwrap();
    assert_eq!(f.field(copy, "speed").as_float(), Some(4.0));
    assert_eq!(f.field(copy, "target").as_host(), Some(clone_child));
    assert!(f.gate.is_empty());
}

#[test]
fn test_cloning_a_member_returns_its_counterpart() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    f.set(inv, "scores", f.scores(&[("x", 1)]));

    let outcome = f.bridge.instantiate(&mut f.scene, inv).unwrap();
    assert_eq!(f.scene.object_kind(outcome.clone), Some(ObjectKind::Member));

    let clone_root = f.scene.entity_of(outcome.clone).unwrap();
    assert_ne!(clone_root, root);
    assert_eq!(f.scene.name(clone_root), Some("Root (Clone)"));
    assert_eq!(f.field(outcome.clone, "scores").as_map().map(|m| m.len()), Some(1));
}

#[test]
fn test_asset_clone_is_not_bridged() {
    let mut f = Fixture::new();
    let profile = f.scene.add_asset(f.types.profile).unwrap();
    f.set(profile, "level", Value::Int(3));

    let outcome = f.bridge.instantiate(&mut f.scene, profile).unwrap();
    assert_eq!(outcome.report.status, OperationStatus::Skipped(SkipReason::NotATree));
    assert_eq!(f.field(outcome.clone, "level").as_int(), Some(3));
}

// ===== Lifecycle =====

#[test]
fn test_lifecycle_order_across_ancestor_levels() {
    let mut f = Fixture::new();
    let root = f.scene.spawn_entity("Root");
    let tracked = f.scene.add_member(root, f.types.tracked).unwrap();
    f.set(tracked, "scores", f.scores(&[("a", 1)]));
    f.set(tracked, "base_scores", f.scores(&[("b", 2)]));
    f.drain_log();

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let copy = only_member(&f, outcome.clone);
    let (src, dst) = (tracked.as_u64(), copy.as_u64());

    assert_eq!(
        f.drain_log(),
        vec![
            format!("before_serialize:{src}"),
            format!("after_deserialize:{dst}"),
            format!("initialize:{dst}"),
            format!("enable:{dst}"),
        ]
    );
    assert_eq!(outcome.report.hooks_invoked, 4);
    assert!(f.field(copy, "base_scores").structurally_eq(&f.scores(&[("b", 2)])));
    assert!(f.gate.is_empty());
}

#[test]
fn test_inactive_and_disabled_members_skip_callbacks() {
    let mut f = Fixture::new();
    let root = f.scene.spawn_entity("Root");
    let sleeping = f.scene.spawn_child(root, "Sleeping").unwrap();
    f.scene.set_active(sleeping, false).unwrap();
    f.scene.add_member(sleeping, f.types.tracked).unwrap();
    let disabled = f.scene.add_member(root, f.types.tracked).unwrap();
    f.scene.set_enabled(disabled, false).unwrap();
    f.drain_log();

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    let clone_disabled = only_member(&f, outcome.clone).as_u64();
    let clone_sleeping = f.scene.find_child(outcome.clone, "Sleeping").unwrap();
    let clone_asleep = only_member(&f, clone_sleeping).as_u64();

    let log = f.drain_log();
    let after: Vec<&String> = log.iter().filter(|e| !e.starts_with("before_serialize")).collect();
    assert_eq!(
        after,
        vec![
            &format!("after_deserialize:{clone_disabled}"),
            &format!("initialize:{clone_disabled}"),
            &format!("after_deserialize:{clone_asleep}"),
        ]
    );
}

#[test]
fn test_failing_callback_does_not_stop_replay() {
    let mut f = Fixture::new();
    let root = f.scene.spawn_entity("Root");
    let child = f.scene.spawn_child(root, "Child").unwrap();
    f.scene.add_member(root, f.types.faulty).unwrap();
    f.scene.add_member(child, f.types.tracked).unwrap();
    f.drain_log();

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    assert!(outcome.report.is_completed());
    assert_eq!(outcome.report.hooks_failed, 1);

    let faulty_copy = only_member(&f, outcome.clone).as_u64();
    let log = f.drain_log();
    assert!(log.contains(&format!("initialize:{faulty_copy}")));
    assert_eq!(log.iter().filter(|e| e.starts_with("enable")).count(), 1);
}

// ===== Skips and Failures =====

#[test]
fn test_helper_children_are_ignored() {
    let mut f = Fixture::new();
    let (root, left, inv) = inventory_tree(&mut f);
    f.set(inv, "owner", Value::Host(left));
    f.scene.set_quirks(CloneQuirks {
        helper_child: true,
        ..Default::default()
    });

    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    assert!(outcome.report.is_completed());
    assert_eq!(outcome.report.nodes_mismatched, 0);
    assert_eq!(f.scene.children(outcome.clone).len(), 3);

    let copy = only_member(&f, outcome.clone);
    let clone_left = f.scene.find_child(outcome.clone, "Left").unwrap();
    assert_eq!(f.field(copy, "owner").as_host(), Some(clone_left));
}

#[test]
fn test_dropped_children_is_structure_mismatch() {
    let mut f = Fixture::new();
    let (root, _, _) = inventory_tree(&mut f);
    f.scene.set_quirks(CloneQuirks {
        drop_children: true,
        ..Default::default()
    });

    let err = f.bridge.instantiate(&mut f.scene, root).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::StructureMismatch {
            matched: 1,
            mismatched: 2,
            ..
        }
    ));
    assert!(f.gate.is_empty());
}

#[test]
fn test_structure_mismatch_still_replays_matched_callbacks() {
    let mut f = Fixture::new();
    let root = f.scene.spawn_entity("Root");
    f.scene.spawn_child(root, "A").unwrap();
    f.scene.spawn_child(root, "B").unwrap();
    let tracked = f.scene.add_member(root, f.types.tracked).unwrap();
    f.scene.set_quirks(CloneQuirks {
        drop_children: true,
        ..Default::default()
    });
    f.drain_log();

    let err = f.bridge.instantiate(&mut f.scene, root).unwrap_err();
    let BridgeError::StructureMismatch { clone, .. } = err else {
        panic!("expected a structure mismatch, got {err:?}");
    };
    let copy = only_member(&f, clone);
    let (src, dst) = (tracked.as_u64(), copy.as_u64());

    assert_eq!(
        f.drain_log(),
        vec![
            format!("before_serialize:{src}"),
            format!("after_deserialize:{dst}"),
            format!("initialize:{dst}"),
            format!("enable:{dst}"),
        ]
    );
    assert!(f.gate.is_empty());
}

#[test]
fn test_unknown_source_releases_gate() {
    let mut f = Fixture::new();
    let err = f
        .bridge
        .instantiate(&mut f.scene, ObjectId::from_u64(9_999))
        .unwrap_err();
    assert!(matches!(err, BridgeError::Host(_)));
    assert!(f.gate.is_empty());
}

#[test]
fn test_off_thread_clone_is_not_bridged() {
    let mut f = Fixture::new();
    let (root, _, inv) = inventory_tree(&mut f);
    f.set(inv, "scores", f.scores(&[("a", 1)]));
    f.set(inv, "gold", Value::Int(10));

    let bridge = &f.bridge;
    let scene = &mut f.scene;
    let outcome = std::thread::scope(|s| {
        s.spawn(move || bridge.instantiate(scene, root))
            .join()
            .unwrap()
    })
    .unwrap();

    assert_eq!(outcome.report.status, OperationStatus::Skipped(SkipReason::WrongThread));
    let copy = only_member(&f, outcome.clone);
    assert_eq!(f.field(copy, "gold").as_int(), Some(10));
    assert!(f.field(copy, "scores").is_null());
    assert!(f.gate.is_empty());
}

#[test]
fn test_debug_logging_configuration() {
    let config = BridgeConfig::from_toml_str(
        r#"
        [debugging]
        enable_debug_logs = true

        [performance]
        type_caching_limit = 50
        "#,
    )
    .unwrap();
    let mut f = Fixture::with_config(&config);
    assert!(f.bridge.cache_sizes().types >= 1);

    let (root, _, inv) = inventory_tree(&mut f);
    f.set(inv, "scores", f.scores(&[("a", 1)]));
    let outcome = f.bridge.instantiate(&mut f.scene, root).unwrap();
    assert!(outcome.report.is_completed());
}
