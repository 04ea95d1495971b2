use crate::{
    error::{RebacError, Result},
    models::*,
    repository::RelationStore,
    schema::{CompiledSchema, ExprId, ExprNode},
};
use ahash::AHashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default recursion bound for permission resolution
pub const DEFAULT_MAX_DEPTH: u32 = 10;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// (object type, object id, relation or permission)
type NodeKey = (String, String, String);

/// Permission checker resolves a permission against the relation store:
/// - Direct grants
/// - Usersets (`group:G1#member`) and implicit usersets (bare `group:G1`)
/// - Permissions built from other relations on the same object
/// - Target sets (`parent->can_view`)
///
/// Resolution is depth-bounded and cycle-safe. Running past the bound or
/// into a cycle denies that branch; store failures are returned as errors.
pub struct PermissionChecker {
    repository: Arc<dyn RelationStore>,
    schema: Arc<CompiledSchema>,
    max_depth: u32,
}

impl PermissionChecker {
    pub fn new(repository: Arc<dyn RelationStore>, schema: Arc<CompiledSchema>) -> Self {
        Self {
            repository,
            schema,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Check if subject holds the relation or permission on resource
    pub async fn check(
        &self,
        resource: &ObjectRef,
        permission: &str,
        subject: &Subject,
    ) -> Result<bool> {
        // Unknown names are a caller error, not a deny.
        self.schema.root(&resource.object_type, permission)?;

        let mut path = AHashSet::new();
        let allowed = self.check_node(resource, permission, subject, &mut path, 0).await?;
        debug!("Check {}#{}@{} -> {}", resource, permission, subject, allowed);
        Ok(allowed)
    }

    fn check_node<'a>(
        &'a self,
        object: &'a ObjectRef,
        name: &'a str,
        subject: &'a Subject,
        path: &'a mut AHashSet<NodeKey>,
        depth: u32,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if depth > self.max_depth {
                warn!(
                    "Maximum depth {} exceeded resolving {}#{} for {}, denying",
                    self.max_depth, object, name, subject
                );
                return Ok(false);
            }

            let root = match self.schema.root(&object.object_type, name) {
                Ok(root) => root,
                Err(RebacError::UnknownPermission { .. }) => {
                    debug!("{} has no '{}', branch denied", object.object_type, name);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };

            let key = (object.object_type.clone(), object.object_id.clone(), name.to_string());
            if !path.insert(key.clone()) {
                debug!("Cycle at {}#{}, branch denied", object, name);
                return Ok(false);
            }

            let result = self.evaluate(root, object, subject, path, depth).await;
            path.remove(&key);
            result
        })
    }

    fn evaluate<'a>(
        &'a self,
        expr: ExprId,
        object: &'a ObjectRef,
        subject: &'a Subject,
        path: &'a mut AHashSet<NodeKey>,
        depth: u32,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let node = self.schema.node(expr).ok_or_else(|| {
                RebacError::InternalError(anyhow::anyhow!("dangling expression id {}", expr))
            })?;

            match node {
                ExprNode::Direct { relation } => {
                    let tuples = self.repository.lookup_relation(object, relation).await?;

                    if tuples.iter().any(|t| t.target == *subject) {
                        return Ok(true);
                    }

                    for tuple in &tuples {
                        let target_object = tuple.target.object();
                        let via = match tuple.target.relation.as_deref() {
                            Some(userset) => userset,
                            None => match self.schema.implicit_userset(&tuple.target.subject_type) {
                                Some(userset) => userset,
                                None => continue,
                            },
                        };
                        if self
                            .check_node(&target_object, via, subject, path, depth + 1)
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                ExprNode::Computed { name } => {
                    self.check_node(object, name, subject, path, depth + 1).await
                }
                ExprNode::Union(children) => {
                    for child in children {
                        if self.evaluate(*child, object, subject, path, depth).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                ExprNode::TargetSet { tupleset, computed } => {
                    let tuples = self.repository.lookup_relation(object, tupleset).await?;
                    for tuple in tuples.iter().filter(|t| !t.target.is_userset()) {
                        let target_object = tuple.target.object();
                        if self
                            .check_node(&target_object, computed, subject, path, depth + 1)
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            }
        })
    }
}
