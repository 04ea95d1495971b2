//! Authorization workflows of the shared-notes application.
//!
//! Notes are owned by the user who created them and can be shared with
//! users or groups as `editor` or `viewer`. Groups are owned by their creator,
//! who alone manages membership. Every refusal is a typed error so callers
//! can map them onto their own responses (`NotFound`, `PermissionDenied`,
//! `InvalidRequest`).

use crate::{
    engine::AuthorizationEngine,
    error::{RebacError, Result},
    models::*,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Existence checks against the application's own records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn note_exists(&self, note_id: &str) -> Result<bool>;

    async fn group_exists(&self, group_id: &str) -> Result<bool>;
}

/// Who a note is shared with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareTarget {
    User(String),
    /// Every member of the group, through the group's implicit userset
    Group(String),
}

impl ShareTarget {
    fn subject(&self) -> Subject {
        match self {
            ShareTarget::User(user_id) => Subject::user(user_id),
            ShareTarget::Group(group_id) => Subject::group(group_id),
        }
    }

    fn id(&self) -> &str {
        match self {
            ShareTarget::User(id) | ShareTarget::Group(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareRole {
    Editor,
    Viewer,
}

impl ShareRole {
    pub fn relation(&self) -> Relation {
        Relation::new(self.as_str())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShareRole::Editor => "editor",
            ShareRole::Viewer => "viewer",
        }
    }
}

impl fmt::Display for ShareRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShareRole {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "editor" => Ok(ShareRole::Editor),
            "viewer" => Ok(ShareRole::Viewer),
            "" => Err(RebacError::InvalidRequest("role is required".to_string())),
            other => Err(RebacError::InvalidRequest(format!(
                "role must be 'editor' or 'viewer', got '{}'",
                other
            ))),
        }
    }
}

pub struct NotesAuthorization {
    engine: Arc<AuthorizationEngine>,
    directory: Arc<dyn ResourceDirectory>,
}

impl NotesAuthorization {
    pub fn new(engine: Arc<AuthorizationEngine>, directory: Arc<dyn ResourceDirectory>) -> Self {
        Self { engine, directory }
    }

    pub fn engine(&self) -> &Arc<AuthorizationEngine> {
        &self.engine
    }

    // =============================================================================
    // Notes
    // =============================================================================

    /// Record the creator of a new note as its owner
    pub async fn note_created(&self, note_id: &str, user_id: &str) -> Result<()> {
        require_id(note_id, "note id")?;
        require_id(user_id, "user id")?;
        self.engine
            .write_relation(&RelationTuple::new(
                ObjectRef::note(note_id),
                Relation::new("owner"),
                Subject::user(user_id),
            ))
            .await
    }

    pub async fn can_view_note(&self, user_id: &str, note_id: &str) -> Result<bool> {
        self.engine
            .check(&ObjectRef::note(note_id), "can_view", &Subject::user(user_id))
            .await
    }

    pub async fn can_edit_note(&self, user_id: &str, note_id: &str) -> Result<bool> {
        self.engine
            .check(&ObjectRef::note(note_id), "can_edit", &Subject::user(user_id))
            .await
    }

    pub async fn is_note_owner(&self, user_id: &str, note_id: &str) -> Result<bool> {
        self.engine
            .check(&ObjectRef::note(note_id), "owner", &Subject::user(user_id))
            .await
    }

    /// Grant `role` on a note. Only the note's owner may share it, and a
    /// group can only be used by its owner.
    pub async fn share_note(
        &self,
        actor: &str,
        note_id: &str,
        target: &ShareTarget,
        role: &str,
    ) -> Result<()> {
        let role: ShareRole = role.parse()?;
        let tuple = self.sharing_tuple(actor, note_id, target, role).await?;
        self.engine.write_relation(&tuple).await?;
        info!("{} shared note {} with {} as {}", actor, note_id, tuple.target, role);
        Ok(())
    }

    /// Revoke a grant made by [`Self::share_note`]; revoking an absent grant is a no-op
    pub async fn unshare_note(
        &self,
        actor: &str,
        note_id: &str,
        target: &ShareTarget,
        role: &str,
    ) -> Result<()> {
        let role: ShareRole = role.parse()?;
        let tuple = self.sharing_tuple(actor, note_id, target, role).await?;
        self.engine.delete_relation(&tuple).await?;
        info!("{} unshared note {} from {} as {}", actor, note_id, tuple.target, role);
        Ok(())
    }

    /// Owner-only; returns the number of relations removed with the note
    pub async fn delete_note(&self, actor: &str, note_id: &str) -> Result<u64> {
        self.require_note_owner(actor, note_id).await?;
        self.engine.delete_all_for_resource(&ObjectRef::note(note_id)).await
    }

    /// IDs of every note the user can view, directly or through groups
    pub async fn list_viewable_notes(&self, user_id: &str) -> Result<BTreeSet<String>> {
        self.engine
            .list_accessible_resources("note", "can_view", &Subject::user(user_id))
            .await
    }

    // =============================================================================
    // Groups
    // =============================================================================

    pub async fn group_created(&self, group_id: &str, user_id: &str) -> Result<()> {
        require_id(group_id, "group id")?;
        require_id(user_id, "user id")?;
        self.engine
            .write_relation(&RelationTuple::new(
                ObjectRef::group(group_id),
                Relation::new("owner"),
                Subject::user(user_id),
            ))
            .await
    }

    /// Add a user to a group the actor owns. Existing members are left alone.
    pub async fn add_member(&self, actor: &str, group_id: &str, user_id: &str) -> Result<()> {
        require_id(user_id, "user id")?;
        self.require_group_owner(actor, group_id).await?;

        let group = ObjectRef::group(group_id);
        let member = Subject::user(user_id);
        if self.engine.check(&group, "member", &member).await? {
            debug!("{} is already a member of group {}", user_id, group_id);
            return Ok(());
        }

        self.engine
            .write_relation(&RelationTuple::new(group, Relation::new("member"), member))
            .await
    }

    pub async fn remove_member(&self, actor: &str, group_id: &str, user_id: &str) -> Result<()> {
        require_id(user_id, "user id")?;
        self.require_group_owner(actor, group_id).await?;

        let group = ObjectRef::group(group_id);
        let member = Subject::user(user_id);
        if !self.engine.check(&group, "member", &member).await? {
            debug!("{} is not a member of group {}", user_id, group_id);
            return Ok(());
        }

        self.engine
            .delete_relation(&RelationTuple::new(group, Relation::new("member"), member))
            .await
    }

    /// User IDs of the group's members; only the group owner may list them
    pub async fn list_members(&self, actor: &str, group_id: &str) -> Result<BTreeSet<String>> {
        self.require_group_owner(actor, group_id).await?;
        self.engine
            .list_grantee_ids(&ObjectRef::group(group_id), "member", Some("user"))
            .await
    }

    /// Owner-only; removes the group's own relations. Grants naming the group
    /// as target are left in place and resolve to nobody.
    pub async fn delete_group(&self, actor: &str, group_id: &str) -> Result<u64> {
        self.require_group_owner(actor, group_id).await?;
        self.engine.delete_all_for_resource(&ObjectRef::group(group_id)).await
    }

    // =============================================================================
    // Guards
    // =============================================================================

    async fn sharing_tuple(
        &self,
        actor: &str,
        note_id: &str,
        target: &ShareTarget,
        role: ShareRole,
    ) -> Result<RelationTuple> {
        require_id(target.id(), "share target")?;
        self.require_note_owner(actor, note_id).await?;
        if let ShareTarget::Group(group_id) = target {
            self.require_group_owner(actor, group_id).await?;
        }
        Ok(RelationTuple::new(ObjectRef::note(note_id), role.relation(), target.subject()))
    }

    async fn require_note_owner(&self, actor: &str, note_id: &str) -> Result<()> {
        require_id(actor, "actor")?;
        require_id(note_id, "note id")?;
        if !self.directory.note_exists(note_id).await? {
            return Err(RebacError::NotFound(format!("note {}", note_id)));
        }
        if !self.is_note_owner(actor, note_id).await? {
            return Err(RebacError::PermissionDenied(format!(
                "{} is not the owner of note {}",
                actor, note_id
            )));
        }
        Ok(())
    }

    async fn require_group_owner(&self, actor: &str, group_id: &str) -> Result<()> {
        require_id(actor, "actor")?;
        require_id(group_id, "group id")?;
        if !self.directory.group_exists(group_id).await? {
            return Err(RebacError::NotFound(format!("group {}", group_id)));
        }
        let owner = self
            .engine
            .check(&ObjectRef::group(group_id), "owner", &Subject::user(actor))
            .await?;
        if !owner {
            return Err(RebacError::PermissionDenied(format!(
                "{} is not the owner of group {}",
                actor, group_id
            )));
        }
        Ok(())
    }
}

fn require_id(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RebacError::InvalidRequest(format!("{} is required", what)));
    }
    Ok(())
}
