use super::{PermissionExpr, Schema, TargetType};
use crate::error::{RebacError, Result};
use crate::models::{RelationTuple, Subject};
use ahash::AHashMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, warn};

/// Index of a node in the expression arena
pub type ExprId = usize;

/// A compiled expression node. Nodes reference each other by [`ExprId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprNode {
    /// Direct grants stored under `relation`
    Direct { relation: String },
    /// Another relation or permission on the same object
    Computed { name: String },
    Union(Vec<ExprId>),
    TargetSet { tupleset: String, computed: String },
}

/// Per-kind lookup tables
#[derive(Debug, Clone)]
pub struct CompiledType {
    pub name: String,
    pub implicit_userset: Option<String>,
    relations: AHashMap<String, Vec<TargetType>>,
    roots: AHashMap<String, ExprId>,
}

impl CompiledType {
    pub fn is_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn root(&self, name: &str) -> Option<ExprId> {
        self.roots.get(name).copied()
    }

    pub fn targets(&self, relation: &str) -> Option<&[TargetType]> {
        self.relations.get(relation).map(Vec::as_slice)
    }
}

/// A target-set edge seen from the computed side: holding `computed` on an
/// object reached through `resource_type#tupleset` grants `permission`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSetEdge {
    pub resource_type: String,
    pub tupleset: String,
    pub permission: String,
}

/// Immutable, validated schema in the form the evaluator walks
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    version: String,
    nodes: Vec<ExprNode>,
    types: AHashMap<String, CompiledType>,
    /// (type, name) -> permissions on the same type that reference `name`
    referenced_by: AHashMap<(String, String), Vec<String>>,
    /// computed name -> target-set edges that compute it
    target_set_edges: AHashMap<String, Vec<TargetSetEdge>>,
    reference_cycles: Vec<Vec<String>>,
    /// `type#relation -> kind` grants whose bare target reaches nobody
    unexpanded_targets: Vec<String>,
}

impl CompiledSchema {
    pub(crate) fn build(schema: &Schema) -> Result<Self> {
        let mut compiled = Self {
            version: schema.name.clone(),
            nodes: Vec::new(),
            types: AHashMap::new(),
            referenced_by: AHashMap::new(),
            target_set_edges: AHashMap::new(),
            reference_cycles: Vec::new(),
            unexpanded_targets: Vec::new(),
        };

        for (type_name, definition) in &schema.types {
            let mut relations = AHashMap::new();
            let mut roots = AHashMap::new();

            for (relation_name, relation) in &definition.relations {
                let targets = relation
                    .targets
                    .iter()
                    .map(|raw| TargetType::parse(raw))
                    .collect::<Result<Vec<_>>>()?;
                relations.insert(relation_name.clone(), targets);
                let id = compiled.push(ExprNode::Direct {
                    relation: relation_name.clone(),
                });
                roots.insert(relation_name.clone(), id);
            }

            for (permission_name, permission) in &definition.permissions {
                let id = compiled.compile_expr(type_name, permission_name, &permission.expression);
                roots.insert(permission_name.clone(), id);
            }

            compiled.types.insert(
                type_name.clone(),
                CompiledType {
                    name: type_name.clone(),
                    implicit_userset: definition.implicit_userset.clone(),
                    relations,
                    roots,
                },
            );
        }

        compiled.reference_cycles = compiled.find_reference_cycles();
        for cycle in &compiled.reference_cycles {
            warn!(
                "Schema {} has a same-object reference cycle, it always evaluates to deny: {}",
                compiled.version,
                cycle.join(" -> ")
            );
        }

        compiled.unexpanded_targets = compiled.find_unexpanded_targets();
        for target in &compiled.unexpanded_targets {
            warn!(
                "Schema {} allows a bare target without an implicit userset, it grants nothing \
                 to that object's members: {}",
                compiled.version, target
            );
        }

        debug!(
            "Compiled schema {}: {} types, {} expression nodes",
            compiled.version,
            compiled.types.len(),
            compiled.nodes.len()
        );
        Ok(compiled)
    }

    fn push(&mut self, node: ExprNode) -> ExprId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn compile_expr(&mut self, type_name: &str, permission: &str, expr: &PermissionExpr) -> ExprId {
        match expr {
            PermissionExpr::Relation(name) => {
                self.referenced_by
                    .entry((type_name.to_string(), name.clone()))
                    .or_default()
                    .push(permission.to_string());
                self.push(ExprNode::Computed { name: name.clone() })
            }
            PermissionExpr::Union(children) => {
                let ids = children
                    .iter()
                    .map(|child| self.compile_expr(type_name, permission, child))
                    .collect();
                self.push(ExprNode::Union(ids))
            }
            PermissionExpr::TargetSet { tupleset, computed } => {
                self.target_set_edges
                    .entry(computed.clone())
                    .or_default()
                    .push(TargetSetEdge {
                        resource_type: type_name.to_string(),
                        tupleset: tupleset.clone(),
                        permission: permission.to_string(),
                    });
                self.push(ExprNode::TargetSet {
                    tupleset: tupleset.clone(),
                    computed: computed.clone(),
                })
            }
        }
    }

    fn find_reference_cycles(&self) -> Vec<Vec<String>> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indices: AHashMap<(String, String), NodeIndex> = AHashMap::new();
        let mut index_of = |graph: &mut DiGraph<String, ()>, key: &(String, String)| {
            *indices
                .entry(key.clone())
                .or_insert_with(|| graph.add_node(format!("{}#{}", key.0, key.1)))
        };

        let mut self_loops = Vec::new();
        for ((type_name, name), permissions) in &self.referenced_by {
            let to = index_of(&mut graph, &(type_name.clone(), name.clone()));
            for permission in permissions {
                if permission == name {
                    self_loops.push(vec![format!("{}#{}", type_name, name)]);
                }
                let from = index_of(&mut graph, &(type_name.clone(), permission.clone()));
                graph.add_edge(from, to, ());
            }
        }

        let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                let mut names: Vec<String> = component
                    .iter()
                    .filter_map(|idx| graph.node_weight(*idx).cloned())
                    .collect();
                names.sort();
                names
            })
            .collect();
        cycles.extend(self_loops);
        cycles.sort();
        cycles.dedup();
        cycles
    }

    /// Bare targets of a kind that has relations of its own but no implicit
    /// userset. Relations used only as a target-set hop are not listed.
    fn find_unexpanded_targets(&self) -> Vec<String> {
        let mut found = Vec::new();
        for (type_name, compiled_type) in &self.types {
            for (relation, targets) in &compiled_type.relations {
                let is_tupleset = self
                    .target_set_edges
                    .values()
                    .flatten()
                    .any(|edge| edge.resource_type == *type_name && edge.tupleset == *relation);
                if is_tupleset {
                    continue;
                }

                for target in targets.iter().filter(|t| t.relation.is_none()) {
                    let Some(target_type) = self.types.get(&target.object_type) else {
                        continue;
                    };
                    if target_type.implicit_userset.is_none() && !target_type.relations.is_empty() {
                        found.push(format!("{}#{} -> {}", type_name, relation, target.object_type));
                    }
                }
            }
        }
        found.sort();
        found
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn node(&self, id: ExprId) -> Option<&ExprNode> {
        self.nodes.get(id)
    }

    pub fn get_type(&self, type_name: &str) -> Option<&CompiledType> {
        self.types.get(type_name)
    }

    /// Root expression of a relation or permission
    pub fn root(&self, type_name: &str, name: &str) -> Result<ExprId> {
        self.types
            .get(type_name)
            .and_then(|t| t.root(name))
            .ok_or_else(|| RebacError::UnknownPermission {
                object_type: type_name.to_string(),
                name: name.to_string(),
            })
    }

    /// Relation a bare target of `type_name` stands for
    pub fn implicit_userset(&self, type_name: &str) -> Option<&str> {
        self.types
            .get(type_name)
            .and_then(|t| t.implicit_userset.as_deref())
    }

    /// Permissions on `type_name` that directly reference `name`
    pub fn referenced_by(&self, type_name: &str, name: &str) -> &[String] {
        self.referenced_by
            .get(&(type_name.to_string(), name.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn target_set_edges(&self, computed: &str) -> &[TargetSetEdge] {
        self.target_set_edges
            .get(computed)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn reference_cycles(&self) -> &[Vec<String>] {
        &self.reference_cycles
    }

    pub fn unexpanded_targets(&self) -> &[String] {
        &self.unexpanded_targets
    }

    /// Validate that a tuple conforms to the schema
    pub fn validate_tuple(&self, tuple: &RelationTuple) -> Result<()> {
        let object_type = self.types.get(&tuple.resource.object_type).ok_or_else(|| {
            RebacError::InvalidTuple(format!("Unknown object type: {}", tuple.resource.object_type))
        })?;

        let targets = object_type.targets(&tuple.relation.name).ok_or_else(|| {
            RebacError::InvalidTuple(format!(
                "Unknown relation '{}' for object type '{}'",
                tuple.relation.name, tuple.resource.object_type
            ))
        })?;

        if !self.types.contains_key(&tuple.target.subject_type) {
            return Err(RebacError::InvalidTuple(format!(
                "Unknown target type: {}",
                tuple.target.subject_type
            )));
        }

        if !targets.is_empty() && !targets.iter().any(|t| target_matches(t, &tuple.target)) {
            return Err(RebacError::InvalidTuple(format!(
                "Target '{}' is not allowed for '{}#{}'",
                tuple.target.type_ref(),
                tuple.resource.object_type,
                tuple.relation.name
            )));
        }

        Ok(())
    }
}

fn target_matches(target: &TargetType, subject: &Subject) -> bool {
    target.object_type == subject.subject_type && target.relation == subject.relation
}
