//! Relationship-based authorization engine for the shared-notes application
//!
//! This crate decides whether a subject may act on a resource by evaluating
//! stored relation triples against a permission schema:
//! - Relation triples (`note:N1#viewer@group:G1#member`) in a pluggable store
//! - Permission expressions compiled from a YAML/JSON document or the text DSL
//! - Depth-bounded, cycle-safe permission checks
//! - Reverse lookups (which notes can a user view) and grantee expansion
//! - Note sharing and group membership workflows
//!
//! # Core Concepts
//!
//! - **Resource**: an object that is protected (`note:N1`, `group:G1`)
//! - **Subject**: who a relation is granted to; a bare object (`user:alice`)
//!   or a userset (`group:G1#member`)
//! - **Relation**: a stored link between resource and subject (owner, editor, viewer)
//! - **Permission**: a named expression over relations (`can_view: viewer | can_edit`)
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{
//!     AuthorizationEngine, EngineConfig, InMemoryRelationStore, ObjectRef, Relation,
//!     RelationTuple, Schema, Subject,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryRelationStore::new());
//!     let schema = Arc::new(Schema::notes_schema().compile()?);
//!     let engine = AuthorizationEngine::new(store, schema, EngineConfig::default());
//!
//!     engine
//!         .write_relation(&RelationTuple::new(
//!             ObjectRef::note("N1"),
//!             Relation::new("owner"),
//!             Subject::user("alice"),
//!         ))
//!         .await?;
//!
//!     assert!(engine.check(&ObjectRef::note("N1"), "can_view", &Subject::user("alice")).await?);
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod expand;
pub mod lookup;
pub mod models;
pub mod repository;
pub mod schema;
pub mod sharing;

pub use bootstrap::{SchemaBootstrap, SchemaSource, SchemaState};
pub use crate::config::*;
pub use engine::*;
pub use error::*;
pub use models::*;
pub use repository::{InMemoryRelationStore, PostgresRelationStore, RelationStore, RetryPolicy};
pub use schema::*;
pub use sharing::*;
