//! Text form of a schema document.
//!
//! ```text
//! model AuthZ 1.0
//!
//! type group
//!   relation member: user
//!   implicit member
//!
//! type note
//!   relation parent: folder
//!   relation viewer: user | group#member
//!   permission can_view: viewer | parent->can_view
//! ```
//!
//! `//` starts a comment. Indentation is not significant.
//!
//! `implicit member` makes a bare `group:G1` target stand for `group:G1#member`.
//! Without it a grant to a bare group reaches none of the group's members;
//! compiling such a schema logs a warning naming each affected relation.

use super::{PermissionDefinition, PermissionExpr, RelationDefinition, Schema, TypeDefinition};
use crate::error::{RebacError, Result};

pub fn parse(document: &str) -> Result<Schema> {
    let mut version: Option<String> = None;
    let mut schema = Schema::new("");
    let mut current: Option<String> = None;

    for (index, raw_line) in document.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.split("//").next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        match keyword {
            "model" => {
                if version.is_some() {
                    return Err(syntax(line_no, "duplicate 'model' line"));
                }
                let mut parts = rest.split_whitespace();
                let model_version = match (parts.next(), parts.next(), parts.next()) {
                    (Some(_name), Some(model_version), None) => model_version,
                    _ => return Err(syntax(line_no, "expected 'model <name> <version>'")),
                };
                version = Some(model_version.to_string());
            }
            "type" => {
                if rest.is_empty() || rest.contains(char::is_whitespace) {
                    return Err(syntax(line_no, "expected 'type <name>'"));
                }
                if schema.types.contains_key(rest) {
                    return Err(syntax(line_no, &format!("type '{}' declared twice", rest)));
                }
                schema.types.insert(rest.to_string(), TypeDefinition::default());
                current = Some(rest.to_string());
            }
            "relation" | "permission" | "implicit" => {
                let type_name = current
                    .as_ref()
                    .ok_or_else(|| syntax(line_no, &format!("'{}' outside of a type", keyword)))?;
                let definition = schema
                    .types
                    .get_mut(type_name)
                    .ok_or_else(|| syntax(line_no, "type block went missing"))?;

                match keyword {
                    "implicit" => {
                        if rest.is_empty() || definition.implicit_userset.is_some() {
                            return Err(syntax(line_no, "expected a single 'implicit <relation>'"));
                        }
                        definition.implicit_userset = Some(rest.to_string());
                    }
                    "relation" => {
                        let (name, body) = split_definition(line_no, rest)?;
                        let targets = body
                            .split('|')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect();
                        let previous = definition.relations.insert(
                            name.to_string(),
                            RelationDefinition {
                                targets,
                                description: String::new(),
                            },
                        );
                        if previous.is_some() {
                            let message = format!("relation '{}' declared twice", name);
                            return Err(syntax(line_no, &message));
                        }
                    }
                    _ => {
                        let (name, body) = split_definition(line_no, rest)?;
                        let expression = parse_expression(line_no, body)?;
                        let previous = definition.permissions.insert(
                            name.to_string(),
                            PermissionDefinition {
                                expression,
                                description: String::new(),
                            },
                        );
                        if previous.is_some() {
                            let message = format!("permission '{}' declared twice", name);
                            return Err(syntax(line_no, &message));
                        }
                    }
                }
            }
            other => {
                return Err(syntax(line_no, &format!("unexpected keyword '{}'", other)));
            }
        }
    }

    schema.name = version.ok_or_else(|| syntax(1, "missing 'model <name> <version>' line"))?;
    Ok(schema)
}

fn split_definition(line_no: usize, rest: &str) -> Result<(&str, &str)> {
    let (name, body) = rest
        .split_once(':')
        .ok_or_else(|| syntax(line_no, "expected '<name>: <definition>'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(syntax(line_no, "missing name before ':'"));
    }
    Ok((name, body.trim()))
}

fn parse_expression(line_no: usize, body: &str) -> Result<PermissionExpr> {
    let mut terms = Vec::new();
    for term in body.split('|').map(str::trim) {
        if term.is_empty() {
            return Err(syntax(line_no, "empty term in permission expression"));
        }
        let expr = match term.split_once("->") {
            Some((tupleset, computed)) => {
                let (tupleset, computed) = (tupleset.trim(), computed.trim());
                if tupleset.is_empty() || computed.is_empty() {
                    return Err(syntax(line_no, &format!("malformed target set '{}'", term)));
                }
                PermissionExpr::target_set(tupleset, computed)
            }
            None => PermissionExpr::relation(term),
        };
        terms.push(expr);
    }

    if terms.len() == 1 {
        if let Some(single) = terms.pop() {
            return Ok(single);
        }
    }
    Ok(PermissionExpr::Union(terms))
}

fn syntax(line_no: usize, message: &str) -> RebacError {
    RebacError::InvalidSchema(format!("line {}: {}", line_no, message))
}
