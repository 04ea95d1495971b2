use crate::{
    check::PermissionChecker,
    config::EngineConfig,
    error::Result,
    expand::SubjectExpander,
    lookup::ResourceLookup,
    models::*,
    repository::RelationStore,
    schema::CompiledSchema,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Attempts per resource event before the listener gives up on it
pub const CASCADE_MAX_ATTEMPTS: u32 = 3;

const CASCADE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Lifecycle notification from the application owning the resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    /// The resource is gone; every relation naming it as resource is removed
    Deleted(ObjectRef),
}

/// Core ReBAC authorization engine
pub struct AuthorizationEngine {
    /// Storage for relation triples
    repository: Arc<dyn RelationStore>,

    /// Compiled permission schema, immutable once the engine is built
    schema: Arc<CompiledSchema>,

    checker: PermissionChecker,
    expander: SubjectExpander,
    lookup: ResourceLookup,
}

impl AuthorizationEngine {
    /// Create an engine over a store and a schema that finished bootstrapping
    pub fn new(
        repository: Arc<dyn RelationStore>,
        schema: Arc<CompiledSchema>,
        config: EngineConfig,
    ) -> Self {
        let max_depth = config.max_depth;
        let checker =
            PermissionChecker::new(repository.clone(), schema.clone()).with_max_depth(max_depth);
        let expander = SubjectExpander::new(repository.clone(), schema.clone(), max_depth);
        let lookup = ResourceLookup::new(repository.clone(), schema.clone(), max_depth);

        Self {
            repository,
            schema,
            checker,
            expander,
            lookup,
        }
    }

    pub fn schema(&self) -> Arc<CompiledSchema> {
        self.schema.clone()
    }

    pub fn max_depth(&self) -> u32 {
        self.checker.max_depth()
    }

    // =============================================================================
    // Relation Management
    // =============================================================================

    /// Write a relation triple after validating it against the schema
    pub async fn write_relation(&self, tuple: &RelationTuple) -> Result<()> {
        self.schema.validate_tuple(tuple)?;
        self.repository.write(tuple).await?;
        info!("Wrote relation {}", tuple);
        Ok(())
    }

    /// Delete a relation triple; absent triples are not an error
    pub async fn delete_relation(&self, tuple: &RelationTuple) -> Result<()> {
        self.repository.delete(tuple).await?;
        info!("Deleted relation {}", tuple);
        Ok(())
    }

    /// Remove every relation on a resource
    pub async fn delete_all_for_resource(&self, resource: &ObjectRef) -> Result<u64> {
        let removed = self.repository.delete_all_for_resource(resource).await?;
        info!("Removed {} relations on {}", removed, resource);
        Ok(removed)
    }

    pub async fn lookup_by_resource(&self, resource: &ObjectRef) -> Result<Vec<RelationTuple>> {
        self.repository.lookup_by_resource(resource).await
    }

    pub async fn lookup_by_target(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Result<Vec<RelationTuple>> {
        self.repository.lookup_by_target(target_type, target_id).await
    }

    /// Batch write operation; every write is validated before anything is applied
    pub async fn batch_write(&self, request: &WriteRequest) -> Result<()> {
        for tuple in &request.writes {
            self.schema.validate_tuple(tuple)?;
        }

        self.repository.batch_write(request).await?;
        info!(
            "Applied batch of {} writes and {} deletes",
            request.writes.len(),
            request.deletes.len()
        );
        Ok(())
    }

    // =============================================================================
    // Authorization Queries
    // =============================================================================

    /// Check if a subject holds a relation or permission on a resource
    pub async fn check(
        &self,
        resource: &ObjectRef,
        permission: &str,
        subject: &Subject,
    ) -> Result<bool> {
        self.checker.check(resource, permission, subject).await
    }

    /// Batch check multiple permissions; fails on the first store error
    pub async fn batch_check(&self, requests: Vec<CheckRequest>) -> Result<Vec<CheckResponse>> {
        let mut responses = Vec::with_capacity(requests.len());

        for request in requests {
            let allowed = self
                .checker
                .check(&request.resource, &request.permission.name, &request.subject)
                .await?;
            responses.push(CheckResponse { request, allowed });
        }

        Ok(responses)
    }

    /// IDs of every resource of a kind the subject holds a permission on
    pub async fn list_accessible_resources(
        &self,
        resource_type: &str,
        permission: &str,
        subject: &Subject,
    ) -> Result<BTreeSet<String>> {
        self.lookup
            .list_accessible_resources(resource_type, permission, subject)
            .await
    }

    /// Every concrete subject holding a relation or permission on a resource
    pub async fn list_grantees(
        &self,
        resource: &ObjectRef,
        relation: &str,
    ) -> Result<BTreeSet<Subject>> {
        self.expander.list_subjects(resource, relation).await
    }

    /// Target IDs of [`Self::list_grantees`], optionally restricted to one subject kind
    pub async fn list_grantee_ids(
        &self,
        resource: &ObjectRef,
        relation: &str,
        subject_type: Option<&str>,
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .list_grantees(resource, relation)
            .await?
            .into_iter()
            .filter(|s| subject_type.map_or(true, |t| s.subject_type == t))
            .map(|s| s.subject_id)
            .collect())
    }

    // =============================================================================
    // Resource Lifecycle
    // =============================================================================

    pub async fn handle_event(&self, event: ResourceEvent) -> Result<()> {
        match event {
            ResourceEvent::Deleted(resource) => {
                self.delete_all_for_resource(&resource).await?;
            }
        }
        Ok(())
    }

    /// Consume resource events until every sender is dropped.
    ///
    /// A transient store failure is retried up to [`CASCADE_MAX_ATTEMPTS`]
    /// times with a doubling delay. Any other failure, or one that outlasts
    /// the retries, is logged and the listener moves on to the next event.
    pub async fn run_cascade_listener(self: Arc<Self>, mut events: mpsc::Receiver<ResourceEvent>) {
        info!("Cascade listener started");
        while let Some(event) = events.recv().await {
            debug!("Received resource event {:?}", event);
            if let Err(e) = self.handle_event_with_retry(&event).await {
                error!("Failed to handle {:?}: {}", event, e);
            }
        }
        info!("Cascade listener stopped");
    }

    async fn handle_event_with_retry(&self, event: &ResourceEvent) -> Result<()> {
        let mut delay = CASCADE_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match self.handle_event(event.clone()).await {
                Err(e) if e.is_transient() && attempt < CASCADE_MAX_ATTEMPTS => {
                    warn!(
                        "Attempt {}/{} for {:?} failed, retrying in {:?}: {}",
                        attempt, CASCADE_MAX_ATTEMPTS, event, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
