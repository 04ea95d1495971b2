//! Schema bootstrap: `Uninitialized -> Loading -> Ready | Failed`.
//!
//! Loading parses, validates and compiles the schema document, then pins its
//! version in the relation store. A store already pinned to another version
//! fails the bootstrap; relations written under one model are not reinterpreted
//! under another without an explicit [`SchemaBootstrap::accept_version`].

use crate::{
    error::{RebacError, Result},
    repository::RelationStore,
    schema::{CompiledSchema, Schema},
};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Where the schema document comes from
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// [`Schema::notes_schema`]
    Bundled,
    /// A `.yaml`, `.json` or `.authz` file
    Path(PathBuf),
    /// An already parsed document
    Document(Schema),
}

impl SchemaSource {
    pub fn from_option(path: Option<PathBuf>) -> Self {
        path.map_or(SchemaSource::Bundled, SchemaSource::Path)
    }

    /// Read and parse the document without validating it
    pub fn load(&self) -> Result<Schema> {
        match self {
            SchemaSource::Bundled => Ok(Schema::notes_schema()),
            SchemaSource::Path(path) => Schema::from_path(path),
            SchemaSource::Document(schema) => Ok(schema.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SchemaState {
    Uninitialized,
    Loading,
    Ready(Arc<CompiledSchema>),
    Failed(String),
}

impl SchemaState {
    pub fn name(&self) -> &'static str {
        match self {
            SchemaState::Uninitialized => "uninitialized",
            SchemaState::Loading => "loading",
            SchemaState::Ready(_) => "ready",
            SchemaState::Failed(_) => "failed",
        }
    }
}

pub struct SchemaBootstrap {
    state: RwLock<SchemaState>,
}

impl Default for SchemaBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaBootstrap {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SchemaState::Uninitialized),
        }
    }

    pub fn state(&self) -> SchemaState {
        self.state.read().clone()
    }

    /// The compiled schema, only once the bootstrap is `Ready`
    pub fn schema(&self) -> Result<Arc<CompiledSchema>> {
        match &*self.state.read() {
            SchemaState::Ready(schema) => Ok(schema.clone()),
            SchemaState::Failed(reason) => Err(RebacError::InvalidSchema(reason.clone())),
            other => Err(RebacError::InvalidRequest(format!(
                "schema is not ready (state: {})",
                other.name()
            ))),
        }
    }

    /// Run the bootstrap once. Both terminal states are final; a second call
    /// is rejected.
    pub async fn load(
        &self,
        source: &SchemaSource,
        expected_version: Option<&str>,
        store: &dyn RelationStore,
    ) -> Result<Arc<CompiledSchema>> {
        {
            let mut state = self.state.write();
            if !matches!(*state, SchemaState::Uninitialized) {
                return Err(RebacError::InvalidRequest(format!(
                    "schema bootstrap already ran (state: {})",
                    state.name()
                )));
            }
            *state = SchemaState::Loading;
        }
        info!("Loading authorization schema");

        match Self::compile_and_pin(source, expected_version, store).await {
            Ok(schema) => {
                info!("Authorization schema {} ready", schema.version());
                *self.state.write() = SchemaState::Ready(schema.clone());
                Ok(schema)
            }
            Err(e) => {
                error!("Authorization schema bootstrap failed: {}", e);
                *self.state.write() = SchemaState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Re-pin the store to the document's version. This is the explicit
    /// migration step after a `SchemaVersionMismatch`.
    pub async fn accept_version(
        source: &SchemaSource,
        store: &dyn RelationStore,
    ) -> Result<String> {
        let compiled = source.load()?.compile()?;
        let previous = store.schema_version().await?;
        store.record_schema_version(compiled.version()).await?;

        match previous {
            Some(record) if record.version != compiled.version() => info!(
                "Schema version moved from {} to {}",
                record.version,
                compiled.version()
            ),
            _ => info!("Schema version {} recorded", compiled.version()),
        }
        Ok(compiled.version().to_string())
    }

    async fn compile_and_pin(
        source: &SchemaSource,
        expected_version: Option<&str>,
        store: &dyn RelationStore,
    ) -> Result<Arc<CompiledSchema>> {
        let compiled = source.load()?.compile()?;

        if let Some(expected) = expected_version {
            if expected != compiled.version() {
                return Err(RebacError::SchemaVersionMismatch {
                    expected: expected.to_string(),
                    found: compiled.version().to_string(),
                });
            }
        }

        match store.schema_version().await? {
            None => {
                store.record_schema_version(compiled.version()).await?;
                info!("Recorded schema version {} in relation store", compiled.version());
            }
            Some(record) if record.version == compiled.version() => {}
            Some(record) => {
                return Err(RebacError::SchemaVersionMismatch {
                    expected: compiled.version().to_string(),
                    found: record.version,
                });
            }
        }

        Ok(Arc::new(compiled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRelationStore;

    #[tokio::test]
    async fn test_bootstrap_records_version() {
        let store = InMemoryRelationStore::new();
        let bootstrap = SchemaBootstrap::new();
        assert!(matches!(bootstrap.state(), SchemaState::Uninitialized));
        assert!(bootstrap.schema().is_err());

        let schema = bootstrap.load(&SchemaSource::Bundled, Some("1.0"), &store).await.unwrap();
        assert_eq!(schema.version(), "1.0");
        assert!(matches!(bootstrap.state(), SchemaState::Ready(_)));
        assert_eq!(store.schema_version().await.unwrap().unwrap().version, "1.0");

        // Ready is terminal
        assert!(bootstrap.load(&SchemaSource::Bundled, None, &store).await.is_err());
        assert!(bootstrap.schema().is_ok());
    }

    #[tokio::test]
    async fn test_version_mismatch_fails() {
        let store = InMemoryRelationStore::new();
        store.record_schema_version("0.9").await.unwrap();

        let bootstrap = SchemaBootstrap::new();
        let result = bootstrap.load(&SchemaSource::Bundled, None, &store).await;
        assert!(matches!(
            result,
            Err(RebacError::SchemaVersionMismatch { ref expected, ref found })
                if expected == "1.0" && found == "0.9"
        ));
        assert!(matches!(bootstrap.state(), SchemaState::Failed(_)));
        assert!(matches!(bootstrap.schema(), Err(RebacError::InvalidSchema(_))));

        SchemaBootstrap::accept_version(&SchemaSource::Bundled, &store).await.unwrap();
        let retry = SchemaBootstrap::new();
        assert!(retry.load(&SchemaSource::Bundled, None, &store).await.is_ok());
    }

    #[tokio::test]
    async fn test_expected_version_must_match_document() {
        let store = InMemoryRelationStore::new();
        let bootstrap = SchemaBootstrap::new();
        let result = bootstrap.load(&SchemaSource::Bundled, Some("2.0"), &store).await;
        assert!(matches!(result, Err(RebacError::SchemaVersionMismatch { .. })));
        assert!(store.schema_version().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_document_fails() {
        let mut schema = Schema::notes_schema();
        if let Some(note) = schema.types.get_mut("note") {
            if let Some(can_view) = note.permissions.get_mut("can_view") {
                can_view.expression = crate::schema::PermissionExpr::relation("reader");
            }
        }

        let store = InMemoryRelationStore::new();
        let bootstrap = SchemaBootstrap::new();
        let result = bootstrap.load(&SchemaSource::Document(schema), None, &store).await;
        assert!(matches!(result, Err(RebacError::InvalidSchema(_))));
        assert!(matches!(bootstrap.state(), SchemaState::Failed(_)));
    }
}
