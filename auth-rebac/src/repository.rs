use crate::{error::RebacError, models::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub mod postgres;

pub use postgres::{PostgresRelationStore, RetryPolicy};

/// Schema version recorded by a store at bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersionRecord {
    pub version: String,
    pub recorded_at: DateTime<Utc>,
}

/// Storage interface for relation triples
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Idempotent insert
    async fn write(&self, tuple: &RelationTuple) -> Result<(), RebacError>;

    /// Idempotent removal, absent tuples are not an error
    async fn delete(&self, tuple: &RelationTuple) -> Result<(), RebacError>;

    /// Remove every tuple whose resource is `resource`, returning the count
    async fn delete_all_for_resource(&self, resource: &ObjectRef) -> Result<u64, RebacError>;

    /// All direct grants on a resource
    async fn lookup_by_resource(
        &self,
        resource: &ObjectRef,
    ) -> Result<Vec<RelationTuple>, RebacError>;

    /// All grants whose target is `target_type:target_id`, with or without a target relation
    async fn lookup_by_target(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Result<Vec<RelationTuple>, RebacError>;

    /// Direct grants of a single relation on a resource
    async fn lookup_relation(
        &self,
        resource: &ObjectRef,
        relation: &str,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        Ok(self
            .lookup_by_resource(resource)
            .await?
            .into_iter()
            .filter(|t| t.relation.name == relation)
            .collect())
    }

    async fn exists(&self, tuple: &RelationTuple) -> Result<bool, RebacError> {
        Ok(self
            .lookup_relation(&tuple.resource, &tuple.relation.name)
            .await?
            .iter()
            .any(|t| t.target == tuple.target))
    }

    /// Apply writes then deletes
    async fn batch_write(&self, request: &WriteRequest) -> Result<(), RebacError> {
        for tuple in &request.writes {
            self.write(tuple).await?;
        }
        for tuple in &request.deletes {
            self.delete(tuple).await?;
        }
        Ok(())
    }

    /// Version of the schema this store's relations were written against
    async fn schema_version(&self) -> Result<Option<SchemaVersionRecord>, RebacError>;

    async fn record_schema_version(&self, version: &str) -> Result<(), RebacError>;
}

type TargetKey = (String, String);

/// In-memory relation store for tests, development and single-process deployments.
///
/// Writers are serialized so both indexes change together; readers go
/// straight to the concurrent maps and never block on writers.
pub struct InMemoryRelationStore {
    by_resource: Arc<DashMap<ObjectRef, BTreeSet<RelationTuple>>>,
    by_target: Arc<DashMap<TargetKey, BTreeSet<RelationTuple>>>,
    write_lock: Mutex<()>,
    schema_version: RwLock<Option<SchemaVersionRecord>>,
}

impl InMemoryRelationStore {
    pub fn new() -> Self {
        Self {
            by_resource: Arc::new(DashMap::new()),
            by_target: Arc::new(DashMap::new()),
            write_lock: Mutex::new(()),
            schema_version: RwLock::new(None),
        }
    }

    fn target_key(tuple: &RelationTuple) -> TargetKey {
        (tuple.target.subject_type.clone(), tuple.target.subject_id.clone())
    }

    fn remove_from_target_index(&self, tuple: &RelationTuple) {
        let key = Self::target_key(tuple);
        let now_empty = match self.by_target.get_mut(&key) {
            Some(mut entry) => {
                entry.remove(tuple);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_target.remove_if(&key, |_, set| set.is_empty());
        }
    }

    /// Number of stored tuples
    pub fn len(&self) -> usize {
        self.by_resource.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRelationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationStore for InMemoryRelationStore {
    async fn write(&self, tuple: &RelationTuple) -> Result<(), RebacError> {
        let _guard = self.write_lock.lock();
        self.by_resource
            .entry(tuple.resource.clone())
            .or_default()
            .insert(tuple.clone());
        self.by_target
            .entry(Self::target_key(tuple))
            .or_default()
            .insert(tuple.clone());
        Ok(())
    }

    async fn delete(&self, tuple: &RelationTuple) -> Result<(), RebacError> {
        let _guard = self.write_lock.lock();
        let now_empty = match self.by_resource.get_mut(&tuple.resource) {
            Some(mut entry) => {
                entry.remove(tuple);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_resource.remove_if(&tuple.resource, |_, set| set.is_empty());
        }
        self.remove_from_target_index(tuple);
        Ok(())
    }

    async fn delete_all_for_resource(&self, resource: &ObjectRef) -> Result<u64, RebacError> {
        let _guard = self.write_lock.lock();
        let removed = match self.by_resource.remove(resource) {
            Some((_, tuples)) => tuples,
            None => return Ok(0),
        };
        for tuple in &removed {
            self.remove_from_target_index(tuple);
        }
        debug!("Removed {} tuples for {}", removed.len(), resource);
        Ok(removed.len() as u64)
    }

    async fn lookup_by_resource(
        &self,
        resource: &ObjectRef,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        Ok(self
            .by_resource
            .get(resource)
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lookup_by_target(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        let key = (target_type.to_string(), target_id.to_string());
        Ok(self
            .by_target
            .get(&key)
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lookup_relation(
        &self,
        resource: &ObjectRef,
        relation: &str,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        Ok(self
            .by_resource
            .get(resource)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|t| t.relation.name == relation)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn exists(&self, tuple: &RelationTuple) -> Result<bool, RebacError> {
        Ok(self
            .by_resource
            .get(&tuple.resource)
            .map_or(false, |entry| entry.value().contains(tuple)))
    }

    async fn schema_version(&self) -> Result<Option<SchemaVersionRecord>, RebacError> {
        Ok(self.schema_version.read().clone())
    }

    async fn record_schema_version(&self, version: &str) -> Result<(), RebacError> {
        *self.schema_version.write() = Some(SchemaVersionRecord {
            version: version.to_string(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn viewer(note: &str, user: &str) -> RelationTuple {
        RelationTuple::new(ObjectRef::note(note), Relation::new("viewer"), Subject::user(user))
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryRelationStore::new();
        let tuple = viewer("N1", "alice");

        store.write(&tuple).await.unwrap();
        assert!(store.exists(&tuple).await.unwrap());

        let by_target = store.lookup_by_target("user", "alice").await.unwrap();
        assert_eq!(by_target, vec![tuple.clone()]);

        let by_resource = store.lookup_by_resource(&ObjectRef::note("N1")).await.unwrap();
        assert_eq!(by_resource.len(), 1);

        store.delete(&tuple).await.unwrap();
        assert!(!store.exists(&tuple).await.unwrap());
        assert!(store.lookup_by_target("user", "alice").await.unwrap().is_empty());
        assert!(store.is_empty());

        // deleting again is a no-op
        store.delete(&tuple).await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_by_target_includes_usersets() {
        let store = InMemoryRelationStore::new();
        let bare = RelationTuple::new(
            ObjectRef::note("N1"),
            Relation::new("viewer"),
            Subject::group("G1"),
        );
        let members = RelationTuple::new(
            ObjectRef::note("N2"),
            Relation::new("editor"),
            Subject::group_members("G1"),
        );
        store.write(&bare).await.unwrap();
        store.write(&members).await.unwrap();

        let found = store.lookup_by_target("group", "G1").await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_all_for_resource() {
        let store = InMemoryRelationStore::new();
        store.write(&viewer("N1", "alice")).await.unwrap();
        store.write(&viewer("N1", "bob")).await.unwrap();
        store.write(&viewer("N2", "alice")).await.unwrap();

        let removed = store.delete_all_for_resource(&ObjectRef::note("N1")).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.lookup_by_resource(&ObjectRef::note("N1")).await.unwrap().is_empty());
        assert!(store.lookup_by_target("user", "bob").await.unwrap().is_empty());
        assert_eq!(
            store.lookup_by_target("user", "alice").await.unwrap(),
            vec![viewer("N2", "alice")]
        );

        assert_eq!(store.delete_all_for_resource(&ObjectRef::note("N1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_are_all_recorded() {
        let store = Arc::new(InMemoryRelationStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write(&viewer("N1", &format!("user{}", i))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.lookup_by_resource(&ObjectRef::note("N1")).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_schema_version_record() {
        let store = InMemoryRelationStore::new();
        assert!(store.schema_version().await.unwrap().is_none());
        store.record_schema_version("1.0").await.unwrap();
        assert_eq!(store.schema_version().await.unwrap().unwrap().version, "1.0");
    }

    proptest! {
        #[test]
        fn prop_writes_are_idempotent(notes in prop::collection::vec(("[a-c]", "[u-w]"), 1..20)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let once = InMemoryRelationStore::new();
                let twice = InMemoryRelationStore::new();
                for (note, user) in &notes {
                    once.write(&viewer(note, user)).await.unwrap();
                    twice.write(&viewer(note, user)).await.unwrap();
                    twice.write(&viewer(note, user)).await.unwrap();
                }
                prop_assert_eq!(once.len(), twice.len());
                for (note, _) in &notes {
                    let resource = ObjectRef::note(note);
                    prop_assert_eq!(
                        once.lookup_by_resource(&resource).await.unwrap(),
                        twice.lookup_by_resource(&resource).await.unwrap()
                    );
                }
                Ok(())
            })?;
        }

        #[test]
        fn prop_write_then_delete_leaves_nothing(
            notes in prop::collection::vec(("[a-c]", "[u-w]"), 1..20)
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = InMemoryRelationStore::new();
                for (note, user) in &notes {
                    store.write(&viewer(note, user)).await.unwrap();
                }
                for (note, user) in &notes {
                    store.delete(&viewer(note, user)).await.unwrap();
                    prop_assert!(!store.exists(&viewer(note, user)).await.unwrap());
                }
                prop_assert!(store.is_empty());
                Ok(())
            })?;
        }
    }
}
