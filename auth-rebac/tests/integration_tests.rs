//! Integration tests for the authorization engine
//!
//! These tests exercise the engine end to end over the in-memory store:
//! 1. Note lifecycle (create, share with a group, membership changes, delete)
//! 2. Write/delete round trip and idempotence
//! 3. Owner implies edit implies view
//! 4. Group indirection through usersets and bare group grants
//! 5. Cyclic membership terminates with deny
//! 6. Reverse lookup agrees with per-resource checks
//! 7. DSL and YAML documents of the notes schema evaluate identically

use auth_rebac::check::PermissionChecker;
use auth_rebac::lookup::ResourceLookup;
use auth_rebac::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

// Helper to create test engine
fn create_test_engine() -> (Arc<InMemoryRelationStore>, AuthorizationEngine) {
    let store = Arc::new(InMemoryRelationStore::new());
    let schema = Arc::new(Schema::notes_schema().compile().unwrap());
    let engine = AuthorizationEngine::new(store.clone(), schema, EngineConfig::default());
    (store, engine)
}

fn tuple(raw: &str) -> RelationTuple {
    raw.parse().unwrap()
}

#[tokio::test]
async fn test_note_lifecycle_scenario() {
    let (_, engine) = create_test_engine();
    let n1 = ObjectRef::note("N1");
    let u1 = Subject::user("U1");
    let u2 = Subject::user("U2");

    // U1 creates N1
    engine.write_relation(&tuple("note:N1#owner@user:U1")).await.unwrap();
    assert!(engine.check(&n1, "owner", &u1).await.unwrap());
    assert!(!engine.check(&n1, "can_view", &u2).await.unwrap());

    // N1 shared with G1's members as viewer, then U2 joins G1
    engine
        .write_relation(&tuple("note:N1#viewer@group:G1#member"))
        .await
        .unwrap();
    assert!(!engine.check(&n1, "can_view", &u2).await.unwrap());
    engine.write_relation(&tuple("group:G1#member@user:U2")).await.unwrap();
    assert!(engine.check(&n1, "can_view", &u2).await.unwrap());
    assert!(!engine.check(&n1, "can_edit", &u2).await.unwrap());

    // U2 leaves G1
    engine.delete_relation(&tuple("group:G1#member@user:U2")).await.unwrap();
    assert!(!engine.check(&n1, "can_view", &u2).await.unwrap());

    // N1 deleted
    assert_eq!(engine.delete_all_for_resource(&n1).await.unwrap(), 2);
    assert!(engine.list_grantees(&n1, "owner").await.unwrap().is_empty());
    assert!(!engine.check(&n1, "can_view", &u1).await.unwrap());
}

#[tokio::test]
async fn test_write_delete_round_trip_and_idempotence() {
    let (store, engine) = create_test_engine();
    let grant = tuple("note:N1#editor@user:alice");

    engine.write_relation(&grant).await.unwrap();
    engine.write_relation(&grant).await.unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(
        engine.lookup_by_resource(&ObjectRef::note("N1")).await.unwrap(),
        vec![grant.clone()]
    );
    assert_eq!(engine.lookup_by_target("user", "alice").await.unwrap(), vec![grant.clone()]);

    engine.delete_relation(&grant).await.unwrap();
    engine.delete_relation(&grant).await.unwrap();
    assert!(store.is_empty());
    assert!(!engine
        .check(&ObjectRef::note("N1"), "editor", &Subject::user("alice"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_permission_monotonicity() {
    let (_, engine) = create_test_engine();
    let note = ObjectRef::note("N1");

    engine.write_relation(&tuple("note:N1#owner@user:olga")).await.unwrap();
    engine.write_relation(&tuple("note:N1#editor@user:ed")).await.unwrap();
    engine.write_relation(&tuple("note:N1#viewer@user:vic")).await.unwrap();

    let expectations = [
        ("olga", true, true, true),
        ("ed", false, true, true),
        ("vic", false, false, true),
        ("nobody", false, false, false),
    ];
    for (user, owner, edit, view) in expectations {
        let subject = Subject::user(user);
        assert_eq!(engine.check(&note, "owner", &subject).await.unwrap(), owner, "{} owner", user);
        assert_eq!(
            engine.check(&note, "can_edit", &subject).await.unwrap(),
            edit,
            "{} can_edit",
            user
        );
        assert_eq!(
            engine.check(&note, "can_view", &subject).await.unwrap(),
            view,
            "{} can_view",
            user
        );
    }
}

#[tokio::test]
async fn test_group_indirection() {
    let (_, engine) = create_test_engine();
    let note = ObjectRef::note("N1");
    let bob = Subject::user("bob");

    // Bare group grants reach members through the implicit userset
    engine.write_relation(&tuple("note:N1#editor@group:G1")).await.unwrap();
    engine.write_relation(&tuple("group:G1#member@user:bob")).await.unwrap();
    assert!(engine.check(&note, "can_edit", &bob).await.unwrap());

    // Group owners are not members unless granted through group#owner
    engine.write_relation(&tuple("group:G2#owner@user:carol")).await.unwrap();
    engine.write_relation(&tuple("note:N1#viewer@group:G2#owner")).await.unwrap();
    assert!(engine.check(&note, "can_view", &Subject::user("carol")).await.unwrap());
    assert!(!engine.check(&note, "can_edit", &Subject::user("carol")).await.unwrap());

    engine.delete_relation(&tuple("group:G1#member@user:bob")).await.unwrap();
    assert!(!engine.check(&note, "can_view", &bob).await.unwrap());
}

#[tokio::test]
async fn test_cyclic_membership_denies() {
    let (store, engine) = create_test_engine();

    // Nested groups are not declared by the notes schema, so the cycle is
    // written straight to the store.
    store.write(&tuple("group:G1#member@group:G2#member")).await.unwrap();
    store.write(&tuple("group:G2#member@group:G1#member")).await.unwrap();
    engine.write_relation(&tuple("note:N1#viewer@group:G1#member")).await.unwrap();

    let stranger = Subject::user("stranger");
    assert!(!engine.check(&ObjectRef::note("N1"), "can_view", &stranger).await.unwrap());
    assert!(engine
        .list_accessible_resources("note", "can_view", &stranger)
        .await
        .unwrap()
        .is_empty());

    store.write(&tuple("group:G2#member@user:eve")).await.unwrap();
    assert!(engine
        .check(&ObjectRef::note("N1"), "can_view", &Subject::user("eve"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_unknown_permission_is_an_error() {
    let (_, engine) = create_test_engine();
    let result = engine
        .check(&ObjectRef::note("N1"), "can_delete", &Subject::user("alice"))
        .await;
    assert!(matches!(result, Err(RebacError::UnknownPermission { .. })));

    let result = engine
        .check(&ObjectRef::new("folder", "F1"), "can_view", &Subject::user("alice"))
        .await;
    assert!(matches!(result, Err(RebacError::UnknownPermission { .. })));
}

#[tokio::test]
async fn test_dsl_and_yaml_schemas_agree() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("schemas");
    let from_dsl = Schema::from_path(&root.join("notes.authz")).unwrap();
    let from_yaml = Schema::from_path(&root.join("notes.yaml")).unwrap();
    assert_eq!(from_dsl, from_yaml);

    let store = Arc::new(InMemoryRelationStore::new());
    for raw in [
        "note:N1#owner@user:alice",
        "note:N1#viewer@group:G1",
        "group:G1#member@user:bob",
        "note:N2#editor@group:G1#member",
    ] {
        store.write(&tuple(raw)).await.unwrap();
    }

    let dsl_engine = AuthorizationEngine::new(
        store.clone(),
        Arc::new(from_dsl.compile().unwrap()),
        EngineConfig::default(),
    );
    let yaml_engine = AuthorizationEngine::new(
        store,
        Arc::new(from_yaml.compile().unwrap()),
        EngineConfig::default(),
    );

    for note in ["N1", "N2"] {
        for permission in ["owner", "editor", "viewer", "can_edit", "can_view"] {
            for user in ["alice", "bob", "carol"] {
                let object = ObjectRef::note(note);
                let subject = Subject::user(user);
                assert_eq!(
                    dsl_engine.check(&object, permission, &subject).await.unwrap(),
                    yaml_engine.check(&object, permission, &subject).await.unwrap(),
                    "{}#{}@{}",
                    note,
                    permission,
                    user
                );
            }
        }
    }
}

// =============================================================================
// Reverse lookup equivalence
// =============================================================================

const NOTES: [&str; 4] = ["N0", "N1", "N2", "N3"];
const GROUPS: [&str; 3] = ["G0", "G1", "G2"];
const USERS: [&str; 3] = ["u0", "u1", "u2"];

fn target_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::sample::select(USERS.to_vec()).prop_map(|u| format!("user:{}", u)),
        prop::sample::select(GROUPS.to_vec()).prop_map(|g| format!("group:{}", g)),
        prop::sample::select(GROUPS.to_vec()).prop_map(|g| format!("group:{}#member", g)),
        prop::sample::select(GROUPS.to_vec()).prop_map(|g| format!("group:{}#owner", g)),
    ]
}

fn tuple_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        (
            prop::sample::select(NOTES.to_vec()),
            prop::sample::select(vec!["owner", "editor", "viewer"]),
            target_strategy()
        )
            .prop_map(|(n, r, t)| format!("note:{}#{}@{}", n, r, t)),
        (
            prop::sample::select(GROUPS.to_vec()),
            prop::sample::select(vec!["member", "owner"]),
            target_strategy()
        )
            .prop_map(|(g, r, t)| format!("group:{}#{}@{}", g, r, t)),
    ]
}

async fn lookup_matches_check(tuples: Vec<String>, max_depth: u32) -> std::result::Result<(), TestCaseError> {
    let store = Arc::new(InMemoryRelationStore::new());
    for raw in &tuples {
        store.write(&tuple(raw)).await.unwrap();
    }

    let schema = Arc::new(Schema::notes_schema().compile().unwrap());
    let checker = PermissionChecker::new(store.clone(), schema.clone()).with_max_depth(max_depth);
    let lookup = ResourceLookup::new(store, schema, max_depth);

    for user in USERS {
        let subject = Subject::user(user);
        for permission in ["owner", "can_edit", "can_view"] {
            let listed = lookup
                .list_accessible_resources("note", permission, &subject)
                .await
                .unwrap();

            let mut checked = BTreeSet::new();
            for note in NOTES {
                if checker.check(&ObjectRef::note(note), permission, &subject).await.unwrap() {
                    checked.insert(note.to_string());
                }
            }
            prop_assert_eq!(listed, checked, "{} {} depth {}", user, permission, max_depth);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_list_accessible_resources_matches_check(
        tuples in prop::collection::vec(tuple_strategy(), 0..24),
        max_depth in 1u32..8,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(lookup_matches_check(tuples, max_depth))?;
    }
}
