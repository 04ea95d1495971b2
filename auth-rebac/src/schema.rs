//! Schema documents: object kinds, their relations and permission expressions.
//!
//! A [`Schema`] is the wire contract between deployment tooling and the
//! engine. It can be read from YAML, JSON or the text DSL (see [`dsl`]), is
//! validated as a whole, and is then compiled into an immutable
//! [`CompiledSchema`] that the evaluator walks.

pub mod compiled;
pub mod dsl;

pub use compiled::*;

use crate::error::{RebacError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Permission schema definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema version, e.g. "1.0"
    pub name: String,
    /// Object kinds keyed by name (e.g. "user", "group", "note")
    #[serde(default)]
    pub types: BTreeMap<String, TypeDefinition>,
}

/// Definition of an object kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    #[serde(default)]
    pub relations: BTreeMap<String, RelationDefinition>,
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionDefinition>,
    /// Relation a bare reference to an object of this kind stands for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implicit_userset: Option<String>,
}

/// A directly grantable relation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    /// Allowed target types: `user`, `group`, `group#member`. Empty allows any.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A derived permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub expression: PermissionExpr,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Permission expression tree as written in a schema document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionExpr {
    /// Another relation or permission on the same object
    Relation(String),
    /// Granted if any child grants
    Union(Vec<PermissionExpr>),
    /// Granted to holders of `computed` on any object reached through `tupleset`
    TargetSet { tupleset: String, computed: String },
}

impl PermissionExpr {
    pub fn relation(name: &str) -> Self {
        PermissionExpr::Relation(name.to_string())
    }

    pub fn target_set(tupleset: &str, computed: &str) -> Self {
        PermissionExpr::TargetSet {
            tupleset: tupleset.to_string(),
            computed: computed.to_string(),
        }
    }
}

impl TypeDefinition {
    /// Declared relation or permission
    pub fn declares(&self, name: &str) -> bool {
        self.relations.contains_key(name) || self.permissions.contains_key(name)
    }
}

/// A parsed target constraint like `group#member`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetType {
    pub object_type: String,
    pub relation: Option<String>,
}

impl TargetType {
    pub fn parse(raw: &str) -> Result<Self> {
        let (object_type, relation) = match raw.split_once('#') {
            Some((object_type, relation)) => (object_type.trim(), Some(relation.trim())),
            None => (raw.trim(), None),
        };
        if object_type.is_empty() || relation.map_or(false, str::is_empty) {
            return Err(RebacError::InvalidSchema(format!(
                "malformed target type '{}'",
                raw
            )));
        }
        Ok(Self {
            object_type: object_type.to_string(),
            relation: relation.map(str::to_string),
        })
    }
}

impl Schema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            types: BTreeMap::new(),
        }
    }

    /// The schema of the shared-notes application.
    ///
    /// Owners are editors and editors are viewers; a note shared with a bare
    /// group reaches the group's members.
    pub fn notes_schema() -> Self {
        let note_targets = ["user", "group#member", "group#owner", "group"];
        let share_targets = ["group", "group#member", "group#owner", "user"];
        let to_targets = |targets: &[&str]| RelationDefinition {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            description: String::new(),
        };

        let mut schema = Self::new("1.0");
        schema.types.insert("user".to_string(), TypeDefinition::default());

        let mut group = TypeDefinition::default();
        group.relations.insert("member".to_string(), to_targets(&["user"]));
        group.relations.insert("owner".to_string(), to_targets(&["user"]));
        group.implicit_userset = Some("member".to_string());
        schema.types.insert("group".to_string(), group);

        let mut note = TypeDefinition::default();
        note.relations.insert("owner".to_string(), to_targets(&note_targets));
        note.relations.insert("editor".to_string(), to_targets(&share_targets));
        note.relations.insert("viewer".to_string(), to_targets(&share_targets));
        note.permissions.insert(
            "can_edit".to_string(),
            PermissionDefinition {
                expression: PermissionExpr::Union(vec![
                    PermissionExpr::relation("editor"),
                    PermissionExpr::relation("owner"),
                ]),
                description: String::new(),
            },
        );
        note.permissions.insert(
            "can_view".to_string(),
            PermissionDefinition {
                expression: PermissionExpr::Union(vec![
                    PermissionExpr::relation("viewer"),
                    PermissionExpr::relation("can_edit"),
                ]),
                description: String::new(),
            },
        );
        schema.types.insert("note".to_string(), note);

        schema
    }

    pub fn from_yaml_str(document: &str) -> Result<Self> {
        serde_yaml::from_str(document)
            .map_err(|e| RebacError::InvalidSchema(format!("Failed to parse YAML schema: {}", e)))
    }

    pub fn from_json_str(document: &str) -> Result<Self> {
        serde_json::from_str(document)
            .map_err(|e| RebacError::InvalidSchema(format!("Failed to parse JSON schema: {}", e)))
    }

    pub fn from_dsl_str(document: &str) -> Result<Self> {
        dsl::parse(document)
    }

    /// Read a schema document, choosing the format from the file extension
    /// (`.yaml`/`.yml`, `.json`, anything else is treated as DSL).
    pub fn from_path(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path).map_err(|e| {
            RebacError::InvalidSchema(format!("Failed to read {}: {}", path.display(), e))
        })?;
        debug!("Loaded schema document from {}", path.display());

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&document),
            Some("json") => Self::from_json_str(&document),
            _ => Self::from_dsl_str(&document),
        }
    }

    /// Validate the entire schema is well-formed
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RebacError::InvalidSchema("schema version name is empty".to_string()));
        }

        for (type_name, definition) in &self.types {
            if !is_identifier(type_name) {
                return Err(RebacError::InvalidSchema(format!(
                    "invalid object type name '{}'",
                    type_name
                )));
            }

            for name in definition.relations.keys().chain(definition.permissions.keys()) {
                if !is_identifier(name) {
                    return Err(RebacError::InvalidSchema(format!(
                        "invalid relation name '{}' on '{}'",
                        name, type_name
                    )));
                }
            }

            let shadowed = definition
                .relations
                .keys()
                .find(|r| definition.permissions.contains_key(*r));
            if let Some(name) = shadowed {
                return Err(RebacError::InvalidSchema(format!(
                    "'{}' is declared as both relation and permission on '{}'",
                    name, type_name
                )));
            }

            for (relation_name, relation) in &definition.relations {
                for raw in &relation.targets {
                    self.validate_target(type_name, relation_name, raw)?;
                }
            }

            for (permission_name, permission) in &definition.permissions {
                self.validate_expr(type_name, definition, permission_name, &permission.expression)?;
            }

            if let Some(ref userset) = definition.implicit_userset {
                if !definition.declares(userset) {
                    return Err(RebacError::InvalidSchema(format!(
                        "implicit userset '{}' of '{}' is not declared",
                        userset, type_name
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_target(&self, type_name: &str, relation_name: &str, raw: &str) -> Result<()> {
        let target = TargetType::parse(raw)?;
        let target_def = self.types.get(&target.object_type).ok_or_else(|| {
            RebacError::InvalidSchema(format!(
                "relation '{}#{}' allows unknown target type '{}'",
                type_name, relation_name, target.object_type
            ))
        })?;
        if let Some(ref relation) = target.relation {
            if !target_def.declares(relation) {
                return Err(RebacError::InvalidSchema(format!(
                    "relation '{}#{}' allows '{}', but '{}' declares no '{}'",
                    type_name, relation_name, raw, target.object_type, relation
                )));
            }
        }
        Ok(())
    }

    fn validate_expr(
        &self,
        type_name: &str,
        definition: &TypeDefinition,
        permission_name: &str,
        expr: &PermissionExpr,
    ) -> Result<()> {
        match expr {
            PermissionExpr::Relation(name) => {
                if !definition.declares(name) {
                    return Err(RebacError::InvalidSchema(format!(
                        "permission '{}#{}' references undeclared '{}'",
                        type_name, permission_name, name
                    )));
                }
            }
            PermissionExpr::Union(children) => {
                if children.is_empty() {
                    return Err(RebacError::InvalidSchema(format!(
                        "permission '{}#{}' has an empty union",
                        type_name, permission_name
                    )));
                }
                for child in children {
                    self.validate_expr(type_name, definition, permission_name, child)?;
                }
            }
            PermissionExpr::TargetSet { tupleset, computed } => {
                let relation = definition.relations.get(tupleset).ok_or_else(|| {
                    RebacError::InvalidSchema(format!(
                        "permission '{}#{}' walks '{}', which is not a relation of '{}'",
                        type_name, permission_name, tupleset, type_name
                    ))
                })?;

                let mut bare_targets = BTreeSet::new();
                for raw in &relation.targets {
                    let target = TargetType::parse(raw)?;
                    if target.relation.is_none() {
                        bare_targets.insert(target.object_type);
                    }
                }
                if bare_targets.is_empty() {
                    return Err(RebacError::InvalidSchema(format!(
                        "permission '{}#{}' walks '{}', which allows no object targets",
                        type_name, permission_name, tupleset
                    )));
                }

                let resolvable = bare_targets.iter().any(|target_type| {
                    self.types
                        .get(target_type)
                        .map_or(false, |target_def| target_def.declares(computed))
                });
                if !resolvable {
                    return Err(RebacError::InvalidSchema(format!(
                        "permission '{}#{}' computes '{}', which no target of '{}' declares",
                        type_name, permission_name, computed, tupleset
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and compile into the evaluator's representation
    pub fn compile(&self) -> Result<CompiledSchema> {
        self.validate()?;
        CompiledSchema::build(self)
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
