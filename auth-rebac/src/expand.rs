use crate::{
    error::{RebacError, Result},
    models::*,
    repository::RelationStore,
    schema::{CompiledSchema, ExprId, ExprNode},
};
use ahash::AHashSet;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type NodeKey = (String, String, String);

/// Subject expander finds every concrete subject that holds a relation or
/// permission on an object.
///
/// Usersets and implicit usersets are resolved to the subjects behind them;
/// a bare group grant lists the group itself as well as its members. The
/// same depth bound and cycle guard as [`crate::check::PermissionChecker`]
/// apply, so every returned subject passes `check`.
pub struct SubjectExpander {
    repository: Arc<dyn RelationStore>,
    schema: Arc<CompiledSchema>,
    max_depth: u32,
}

impl SubjectExpander {
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

    /// List all subjects (flattened) with the given relation to an object
    pub async fn list_subjects(
        &self,
        resource: &ObjectRef,
        relation: &str,
    ) -> Result<BTreeSet<Subject>> {
        self.schema.root(&resource.object_type, relation)?;

        let mut subjects = BTreeSet::new();
        let mut path = AHashSet::new();
        self.expand_node(resource, relation, &mut path, &mut subjects, 0).await?;

        debug!("Expanded {}#{} to {} subjects", resource, relation, subjects.len());
        Ok(subjects)
    }

    fn expand_node<'a>(
        &'a self,
        object: &'a ObjectRef,
        name: &'a str,
        path: &'a mut AHashSet<NodeKey>,
        out: &'a mut BTreeSet<Subject>,
        depth: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth > self.max_depth {
                warn!("Maximum depth {} exceeded expanding {}#{}", self.max_depth, object, name);
                return Ok(());
            }

            let root = match self.schema.root(&object.object_type, name) {
                Ok(root) => root,
                Err(RebacError::UnknownPermission { .. }) => return Ok(()),
                Err(e) => return Err(e),
            };

            let key = (object.object_type.clone(), object.object_id.clone(), name.to_string());
            if !path.insert(key.clone()) {
                return Ok(());
            }

            let result = self.expand_expr(root, object, path, out, depth).await;
            path.remove(&key);
            result
        })
    }

    fn expand_expr<'a>(
        &'a self,
        expr: ExprId,
        object: &'a ObjectRef,
        path: &'a mut AHashSet<NodeKey>,
        out: &'a mut BTreeSet<Subject>,
        depth: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let node = self.schema.node(expr).ok_or_else(|| {
                RebacError::InternalError(anyhow::anyhow!("dangling expression id {}", expr))
            })?;

            match node {
                ExprNode::Direct { relation } => {
                    let tuples = self.repository.lookup_relation(object, relation).await?;
                    for tuple in &tuples {
                        let target_object = tuple.target.object();
                        match tuple.target.relation.as_deref() {
                            Some(userset) => {
                                self.expand_node(&target_object, userset, path, out, depth + 1)
                                    .await?;
                            }
                            None => {
                                out.insert(tuple.target.clone());
                                let implicit =
                                    self.schema.implicit_userset(&tuple.target.subject_type);
                                if let Some(userset) = implicit {
                                    self.expand_node(&target_object, userset, path, out, depth + 1)
                                        .await?;
                                }
                            }
                        }
                    }
                }
                ExprNode::Computed { name } => {
                    self.expand_node(object, name, path, out, depth + 1).await?;
                }
                ExprNode::Union(children) => {
                    for child in children {
                        self.expand_expr(*child, object, path, out, depth).await?;
                    }
                }
                ExprNode::TargetSet { tupleset, computed } => {
                    let tuples = self.repository.lookup_relation(object, tupleset).await?;
                    for tuple in tuples.iter().filter(|t| !t.target.is_userset()) {
                        let target_object = tuple.target.object();
                        self.expand_node(&target_object, computed, path, out, depth + 1)
                            .await?;
                    }
                }
            }
            Ok(())
        })
    }
}
