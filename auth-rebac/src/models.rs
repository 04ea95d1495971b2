use crate::error::RebacError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A protected object, e.g. `note:N1` or `group:G1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: &str, object_id: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
        }
    }

    pub fn note(note_id: &str) -> Self {
        Self::new("note", note_id)
    }

    pub fn group(group_id: &str) -> Self {
        Self::new("group", group_id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

impl FromStr for ObjectRef {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (object_type, object_id) = s
            .split_once(':')
            .ok_or_else(|| RebacError::InvalidTuple(format!("expected 'type:id', got '{}'", s)))?;
        if object_type.is_empty() || object_id.is_empty() || object_id.contains('#') {
            return Err(RebacError::InvalidTuple(format!(
                "expected 'type:id', got '{}'",
                s
            )));
        }
        Ok(Self::new(object_type, object_id))
    }
}

/// The target side of a grant. A subject with a `relation` is a userset:
/// "everyone holding `relation` on `subject_type:subject_id`".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    pub subject_type: String,
    pub subject_id: String,
    pub relation: Option<String>,
}

impl Subject {
    pub fn new(subject_type: &str, subject_id: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            relation: None,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn group(group_id: &str) -> Self {
        Self::new("group", group_id)
    }

    pub fn userset(subject_type: &str, subject_id: &str, relation: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            relation: Some(relation.to_string()),
        }
    }

    /// `group:G1#member`
    pub fn group_members(group_id: &str) -> Self {
        Self::userset("group", group_id, "member")
    }

    /// The object this subject names, ignoring any relation.
    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(&self.subject_type, &self.subject_id)
    }

    pub fn is_userset(&self) -> bool {
        self.relation.is_some()
    }

    /// Whether `self` names exactly the object `object_type:object_id` with no relation.
    pub fn is_object(&self, object_type: &str, object_id: &str) -> bool {
        self.relation.is_none() && self.subject_type == object_type && self.subject_id == object_id
    }

    /// Type reference used for target constraints: `user` or `group#member`.
    pub fn type_ref(&self) -> String {
        match self.relation {
            Some(ref relation) => format!("{}#{}", self.subject_type, relation),
            None => self.subject_type.clone(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref relation) = self.relation {
            write!(f, "{}:{}#{}", self.subject_type, self.subject_id, relation)
        } else {
            write!(f, "{}:{}", self.subject_type, self.subject_id)
        }
    }
}

impl FromStr for Subject {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (object, relation) = match s.split_once('#') {
            Some((object, relation)) if !relation.is_empty() => (object, Some(relation)),
            Some(_) => {
                return Err(RebacError::InvalidTuple(format!(
                    "empty relation in subject '{}'",
                    s
                )))
            }
            None => (s, None),
        };
        let object: ObjectRef = object.parse()?;
        Ok(match relation {
            Some(relation) => Subject::userset(&object.object_type, &object.object_id, relation),
            None => Subject::new(&object.object_type, &object.object_id),
        })
    }
}

/// Represents a relation or permission name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
}

impl Relation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A direct grant: `resource#relation@target`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationTuple {
    pub resource: ObjectRef,
    pub relation: Relation,
    pub target: Subject,
}

impl RelationTuple {
    pub fn new(resource: ObjectRef, relation: Relation, target: Subject) -> Self {
        Self {
            resource,
            relation,
            target,
        }
    }

    /// Stable identity used by stores for set semantics
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.resource, self.relation, self.target)
    }
}

impl FromStr for RelationTuple {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            RebacError::InvalidTuple(format!("expected 'type:id#relation@subject', got '{}'", s))
        };
        let (left, target) = s.split_once('@').ok_or_else(invalid)?;
        let (resource, relation) = left.split_once('#').ok_or_else(invalid)?;
        if relation.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(resource.parse()?, Relation::new(relation), target.parse()?))
    }
}

/// Authorization check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub resource: ObjectRef,
    pub permission: Relation,
    pub subject: Subject,
}

/// Authorization check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub request: CheckRequest,
    pub allowed: bool,
}

/// Batch write request for multiple tuples
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    pub writes: Vec<RelationTuple>,
    pub deletes: Vec<RelationTuple>,
}
