//! Reverse lookup: which resources can a subject reach.
//!
//! Rather than checking every resource of a type, the lookup walks the
//! relation graph backwards from the subject. Each level follows one reverse
//! edge of the evaluator:
//!
//! - a userset or implicit-userset grant naming something the subject holds
//! - a permission on the same object that references a held relation
//! - a target-set edge whose computed relation is held on the target
//!
//! Levels are bounded by the checker's `max_depth`, so the result is exactly
//! the set of resources for which `check` answers true.

use crate::{
    error::Result,
    models::*,
    repository::RelationStore,
    schema::CompiledSchema,
};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// A relation or permission the subject holds on an object
type Holding = (ObjectRef, String);

pub struct ResourceLookup {
    repository: Arc<dyn RelationStore>,
    schema: Arc<CompiledSchema>,
    max_depth: u32,
}

impl ResourceLookup {
    pub fn new(
        repository: Arc<dyn RelationStore>,
        schema: Arc<CompiledSchema>,
        max_depth: u32,
    ) -> Self {
        Self {
            repository,
            schema,
            max_depth,
        }
    }

    /// IDs of every `resource_type` object on which `subject` holds `permission`
    pub async fn list_accessible_resources(
        &self,
        resource_type: &str,
        permission: &str,
        subject: &Subject,
    ) -> Result<BTreeSet<String>> {
        self.schema.root(resource_type, permission)?;

        let mut grants_by_target: AHashMap<ObjectRef, Vec<RelationTuple>> = AHashMap::new();
        let mut seen: AHashSet<Holding> = AHashSet::new();
        let mut frontier: Vec<Holding> = Vec::new();

        let subject_object = subject.object();
        let direct = self.grants_to(&subject_object, &mut grants_by_target).await?;
        for tuple in direct.iter().filter(|t| t.target == *subject) {
            self.admit(
                (tuple.resource.clone(), tuple.relation.name.clone()),
                &mut seen,
                &mut frontier,
            );
        }

        let mut level = 0;
        while !frontier.is_empty() && level < self.max_depth {
            let mut next = Vec::new();

            for (object, name) in &frontier {
                for permission in self.schema.referenced_by(&object.object_type, name) {
                    self.admit((object.clone(), permission.clone()), &mut seen, &mut next);
                }

                let grants = self.grants_to(object, &mut grants_by_target).await?;
                let implicit =
                    self.schema.implicit_userset(&object.object_type) == Some(name.as_str());
                let edges = self.schema.target_set_edges(name);

                for tuple in &grants {
                    match tuple.target.relation.as_deref() {
                        Some(userset) if userset == name => {
                            self.admit(
                                (tuple.resource.clone(), tuple.relation.name.clone()),
                                &mut seen,
                                &mut next,
                            );
                        }
                        Some(_) => {}
                        None => {
                            if implicit {
                                self.admit(
                                    (tuple.resource.clone(), tuple.relation.name.clone()),
                                    &mut seen,
                                    &mut next,
                                );
                            }
                            for edge in edges.iter().filter(|e| {
                                e.resource_type == tuple.resource.object_type
                                    && e.tupleset == tuple.relation.name
                            }) {
                                self.admit(
                                    (tuple.resource.clone(), edge.permission.clone()),
                                    &mut seen,
                                    &mut next,
                                );
                            }
                        }
                    }
                }
            }

            frontier = next;
            level += 1;
        }

        let ids: BTreeSet<String> = seen
            .into_iter()
            .filter(|(object, name)| object.object_type == resource_type && name == permission)
            .map(|(object, _)| object.object_id)
            .collect();

        debug!(
            "{} can reach {} {} objects with {}",
            subject,
            ids.len(),
            resource_type,
            permission
        );
        Ok(ids)
    }

    /// Record a holding the first (shallowest) time it is reached, if the
    /// schema declares that name for the object's kind.
    fn admit(&self, holding: Holding, seen: &mut AHashSet<Holding>, frontier: &mut Vec<Holding>) {
        if self.schema.root(&holding.0.object_type, &holding.1).is_err() {
            return;
        }
        if seen.insert(holding.clone()) {
            frontier.push(holding);
        }
    }

    async fn grants_to(
        &self,
        object: &ObjectRef,
        cache: &mut AHashMap<ObjectRef, Vec<RelationTuple>>,
    ) -> Result<Vec<RelationTuple>> {
        if let Some(grants) = cache.get(object) {
            return Ok(grants.clone());
        }
        let grants = self
            .repository
            .lookup_by_target(&object.object_type, &object.object_id)
            .await?;
        cache.insert(object.clone(), grants.clone());
        Ok(grants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{PermissionChecker, DEFAULT_MAX_DEPTH};
    use crate::repository::InMemoryRelationStore;
    use crate::schema::Schema;

    async fn write(repo: &InMemoryRelationStore, raw: &str) {
        let tuple: RelationTuple = raw.parse().unwrap();
        repo.write(&tuple).await.unwrap();
    }

    #[tokio::test]
    async fn test_lists_direct_group_and_inherited_notes() {
        let repo = Arc::new(InMemoryRelationStore::new());
        let schema = Arc::new(Schema::notes_schema().compile().unwrap());
        let lookup = ResourceLookup::new(repo.clone(), schema, DEFAULT_MAX_DEPTH);

        write(&repo, "note:N1#owner@user:alice").await;
        write(&repo, "note:N2#viewer@group:G1#member").await;
        write(&repo, "note:N3#editor@group:G1").await;
        write(&repo, "note:N4#viewer@user:bob").await;
        write(&repo, "group:G1#member@user:alice").await;

        let alice = Subject::user("alice");
        let viewable = lookup.list_accessible_resources("note", "can_view", &alice).await.unwrap();
        assert_eq!(
            viewable.into_iter().collect::<Vec<_>>(),
            vec!["N1".to_string(), "N2".to_string(), "N3".to_string()]
        );

        let editable = lookup.list_accessible_resources("note", "can_edit", &alice).await.unwrap();
        assert_eq!(
            editable.into_iter().collect::<Vec<_>>(),
            vec!["N1".to_string(), "N3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_matches_check_under_depth_bound() {
        let mut schema = Schema::notes_schema();
        if let Some(group) = schema.types.get_mut("group") {
            if let Some(member) = group.relations.get_mut("member") {
                member.targets.push("group#member".to_string());
            }
        }
        let schema = Arc::new(schema.compile().unwrap());
        let repo = Arc::new(InMemoryRelationStore::new());
        let max_depth = 3;
        let lookup = ResourceLookup::new(repo.clone(), schema.clone(), max_depth);
        let checker = PermissionChecker::new(repo.clone(), schema).with_max_depth(max_depth);

        // chain of nested groups, one note shared at each nesting level
        for i in 0..6 {
            write(&repo, &format!("group:G{}#member@group:G{}#member", i, i + 1)).await;
            write(&repo, &format!("note:N{}#viewer@group:G{}#member", i, i)).await;
        }
        write(&repo, "group:G6#member@user:erin").await;
        // a cycle must not change the answer
        write(&repo, "group:G6#member@group:G0#member").await;

        let erin = Subject::user("erin");
        let listed = lookup.list_accessible_resources("note", "can_view", &erin).await.unwrap();

        let mut checked = BTreeSet::new();
        for i in 0..6 {
            let id = format!("N{}", i);
            if checker.check(&ObjectRef::note(&id), "can_view", &erin).await.unwrap() {
                checked.insert(id);
            }
        }
        assert_eq!(listed, checked);
        assert!(!listed.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_permission() {
        let repo = Arc::new(InMemoryRelationStore::new());
        let schema = Arc::new(Schema::notes_schema().compile().unwrap());
        let lookup = ResourceLookup::new(repo, schema, DEFAULT_MAX_DEPTH);
        assert!(lookup
            .list_accessible_resources("note", "can_share", &Subject::user("alice"))
            .await
            .is_err());
    }
}
