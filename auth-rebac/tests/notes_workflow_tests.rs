//! Notes application workflows
//!
//! Drives `NotesAuthorization` the way the notes service does: an application
//! directory answers existence questions, and deletions flow through the
//! cascade listener.

use async_trait::async_trait;
use auth_rebac::*;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Application records backing the existence checks
#[derive(Default)]
struct Directory {
    notes: RwLock<HashSet<String>>,
    groups: RwLock<HashSet<String>>,
}

impl Directory {
    fn add_note(&self, id: &str) {
        self.notes.write().insert(id.to_string());
    }

    fn add_group(&self, id: &str) {
        self.groups.write().insert(id.to_string());
    }

    fn remove_note(&self, id: &str) {
        self.notes.write().remove(id);
    }
}

#[async_trait]
impl ResourceDirectory for Directory {
    async fn note_exists(&self, note_id: &str) -> Result<bool> {
        Ok(self.notes.read().contains(note_id))
    }

    async fn group_exists(&self, group_id: &str) -> Result<bool> {
        Ok(self.groups.read().contains(group_id))
    }
}

fn setup() -> (Arc<Directory>, Arc<AuthorizationEngine>, NotesAuthorization) {
    let directory = Arc::new(Directory::default());
    let store = Arc::new(InMemoryRelationStore::new());
    let schema = Arc::new(Schema::notes_schema().compile().unwrap());
    let engine = Arc::new(AuthorizationEngine::new(store, schema, EngineConfig::default()));
    let notes = NotesAuthorization::new(engine.clone(), directory.clone());
    (directory, engine, notes)
}

#[tokio::test]
async fn test_team_sharing_workflow() {
    let (directory, _, notes) = setup();

    directory.add_note("roadmap");
    notes.note_created("roadmap", "alice").await.unwrap();
    directory.add_group("team");
    notes.group_created("team", "alice").await.unwrap();

    notes.add_member("alice", "team", "bob").await.unwrap();
    notes.add_member("alice", "team", "carol").await.unwrap();
    notes
        .share_note("alice", "roadmap", &ShareTarget::Group("team".to_string()), "viewer")
        .await
        .unwrap();
    notes
        .share_note("alice", "roadmap", &ShareTarget::User("dave".to_string()), "editor")
        .await
        .unwrap();

    for user in ["alice", "bob", "carol", "dave"] {
        assert!(notes.can_view_note(user, "roadmap").await.unwrap(), "{} should view", user);
    }
    assert!(notes.can_edit_note("dave", "roadmap").await.unwrap());
    assert!(!notes.can_edit_note("bob", "roadmap").await.unwrap());

    // Editors cannot reshare
    let result = notes
        .share_note("dave", "roadmap", &ShareTarget::User("eve".to_string()), "viewer")
        .await;
    assert!(matches!(result, Err(RebacError::PermissionDenied(_))));

    notes.remove_member("alice", "team", "carol").await.unwrap();
    assert!(!notes.can_view_note("carol", "roadmap").await.unwrap());
    assert!(notes.list_viewable_notes("carol").await.unwrap().is_empty());
    assert!(notes.list_viewable_notes("bob").await.unwrap().contains("roadmap"));
}

#[tokio::test]
async fn test_group_owner_only_shares_own_groups() {
    let (directory, _, notes) = setup();
    directory.add_note("draft");
    directory.add_group("others");
    notes.note_created("draft", "alice").await.unwrap();
    notes.group_created("others", "mallory").await.unwrap();

    let result = notes
        .share_note("alice", "draft", &ShareTarget::Group("others".to_string()), "editor")
        .await;
    assert!(matches!(result, Err(RebacError::PermissionDenied(_))));

    let result = notes
        .share_note("alice", "draft", &ShareTarget::Group("missing".to_string()), "editor")
        .await;
    assert!(matches!(result, Err(RebacError::NotFound(_))));

    let result = notes
        .share_note("alice", "draft", &ShareTarget::User("bob".to_string()), "admin")
        .await;
    assert!(matches!(result, Err(RebacError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_deleted_note_cascades_through_listener() {
    let (directory, engine, notes) = setup();
    let (events, receiver) = mpsc::channel(16);
    let listener = tokio::spawn(engine.clone().run_cascade_listener(receiver));

    directory.add_note("scratch");
    notes.note_created("scratch", "alice").await.unwrap();
    notes
        .share_note("alice", "scratch", &ShareTarget::User("bob".to_string()), "viewer")
        .await
        .unwrap();

    // The application deletes its record and announces it
    directory.remove_note("scratch");
    events
        .send(ResourceEvent::Deleted(ObjectRef::note("scratch")))
        .await
        .unwrap();
    drop(events);
    listener.await.unwrap();

    assert!(!notes.can_view_note("bob", "scratch").await.unwrap());
    assert!(engine
        .list_grantees(&ObjectRef::note("scratch"), "can_view")
        .await
        .unwrap()
        .is_empty());

    // Further sharing of the deleted note is refused
    let result = notes
        .share_note("alice", "scratch", &ShareTarget::User("bob".to_string()), "viewer")
        .await;
    assert!(matches!(result, Err(RebacError::NotFound(_))));
}

#[tokio::test]
async fn test_owner_deletes_note() {
    let (directory, engine, notes) = setup();
    directory.add_note("memo");
    notes.note_created("memo", "alice").await.unwrap();
    notes
        .share_note("alice", "memo", &ShareTarget::User("bob".to_string()), "editor")
        .await
        .unwrap();

    assert!(matches!(
        notes.delete_note("bob", "memo").await,
        Err(RebacError::PermissionDenied(_))
    ));
    assert_eq!(notes.delete_note("alice", "memo").await.unwrap(), 2);
    assert!(engine.lookup_by_resource(&ObjectRef::note("memo")).await.unwrap().is_empty());
}
