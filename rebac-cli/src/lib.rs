//! Operator CLI for the authorization engine
//!
//! ```bash
//! # Schema management
//! rebac validate-schema --schema schemas/notes.authz
//! rebac migrate
//! rebac migrate --accept-schema-version
//!
//! # Relations
//! rebac grant note:N1 viewer group:G1#member
//! rebac revoke note:N1 viewer group:G1#member
//! rebac purge note:N1
//!
//! # Queries (check exits 0 when allowed, 1 when denied)
//! rebac check note:N1 can_view user:alice
//! rebac list-resources note can_view user:alice
//! rebac list-grantees note:N1 can_view --subject-type user
//! ```

use anyhow::{Context, Result};
use auth_rebac::{
    AuthorizationEngine, InMemoryRelationStore, ObjectRef, PostgresRelationStore, RebacConfig,
    Relation, RelationStore, RelationTuple, RetryPolicy, SchemaBootstrap, SchemaSource,
    StoreBackend, Subject,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rebac")]
#[command(version, about = "Manage relations and query the authorization engine")]
pub struct Cli {
    /// Configuration file path (defaults to ./rebac.yaml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Schema document, overriding `schema.path` from the configuration
    #[arg(long, global = true)]
    pub schema: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Parse, validate and compile the schema document
    ValidateSchema,

    /// Create the relation tables and pin the schema version
    Migrate {
        /// Re-pin the store to this schema's version after a mismatch
        #[arg(long)]
        accept_schema_version: bool,
    },

    /// Write a relation, e.g. `grant note:N1 viewer group:G1#member`
    Grant {
        resource: String,
        relation: String,
        subject: String,
    },

    /// Delete a relation
    Revoke {
        resource: String,
        relation: String,
        subject: String,
    },

    /// Check a permission; exit status 1 when denied
    Check {
        resource: String,
        permission: String,
        subject: String,
    },

    /// IDs of resources of a kind the subject holds a permission on
    ListResources {
        resource_type: String,
        permission: String,
        subject: String,
    },

    /// Subjects holding a relation or permission on a resource
    ListGrantees {
        resource: String,
        relation: String,

        /// Only list subjects of this kind (e.g. `user`)
        #[arg(long)]
        subject_type: Option<String>,
    },

    /// Remove every relation on a resource
    Purge { resource: String },
}

/// How a command finished, mapped onto the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Denied,
}

impl Cli {
    pub fn load_config(&self) -> Result<RebacConfig> {
        let mut config = RebacConfig::load(self.config.as_deref())?;
        if let Some(ref schema) = self.schema {
            config.schema.path = Some(schema.clone());
        }
        Ok(config)
    }
}

/// Install the fmt subscriber on stderr; `RUST_LOG` overrides the configured level
pub fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

pub async fn run(cli: &Cli, config: RebacConfig) -> Result<Outcome> {
    let source = SchemaSource::from_option(config.schema.path.clone());

    match &cli.command {
        Command::ValidateSchema => validate_schema(&source, cli.json),
        Command::Migrate { accept_schema_version } => {
            migrate(&config, &source, *accept_schema_version).await
        }
        command => {
            let engine = open_engine(&config, &source).await?;
            execute(&engine, command, cli.json).await
        }
    }
}

fn validate_schema(source: &SchemaSource, json: bool) -> Result<Outcome> {
    let schema = source.load().context("Failed to read schema document")?;
    let compiled = schema.compile().context("Schema is invalid")?;

    if json {
        let types: serde_json::Map<String, serde_json::Value> = schema
            .types
            .iter()
            .map(|(name, definition)| {
                (
                    name.clone(),
                    json!({
                        "relations": definition.relations.keys().collect::<Vec<_>>(),
                        "permissions": definition.permissions.keys().collect::<Vec<_>>(),
                        "implicit_userset": definition.implicit_userset,
                    }),
                )
            })
            .collect();
        println!(
            "{}",
            json!({
                "version": compiled.version(),
                "types": types,
                "reference_cycles": compiled.reference_cycles(),
            })
        );
    } else {
        println!("Schema {} is valid", compiled.version());
        for (name, definition) in &schema.types {
            println!(
                "  {}: {} relations, {} permissions",
                name,
                definition.relations.len(),
                definition.permissions.len()
            );
        }
        for cycle in compiled.reference_cycles() {
            println!("  warning: reference cycle {}", cycle.join(" -> "));
        }
    }
    Ok(Outcome::Success)
}

async fn migrate(
    config: &RebacConfig,
    source: &SchemaSource,
    accept_schema_version: bool,
) -> Result<Outcome> {
    let store: Arc<dyn RelationStore> = match config.store.backend {
        StoreBackend::Postgres => {
            let store = connect_postgres(config).await?;
            store.migrate().await.context("Failed to create relation tables")?;
            Arc::new(store)
        }
        StoreBackend::Memory => open_store(config).await?,
    };

    if accept_schema_version {
        let version = SchemaBootstrap::accept_version(source, store.as_ref()).await?;
        println!("Relation store pinned to schema version {}", version);
        return Ok(Outcome::Success);
    }

    let schema = SchemaBootstrap::new()
        .load(source, config.schema.expected_version.as_deref(), store.as_ref())
        .await
        .context(
            "Schema bootstrap failed; review the change and rerun with --accept-schema-version",
        )?;
    println!("Relation store ready for schema version {}", schema.version());
    Ok(Outcome::Success)
}

async fn connect_postgres(config: &RebacConfig) -> Result<PostgresRelationStore> {
    let url = config
        .store
        .database_url
        .as_deref()
        .context("store.database_url (or DATABASE_URL) is not set")?;

    let store = PostgresRelationStore::connect(url, config.store.max_connections)
        .await?
        .with_retry_policy(RetryPolicy {
            max_retries: config.store.max_retries,
            base_delay: config.store.retry_base_delay(),
        });
    info!("Connected to PostgreSQL relation store");
    Ok(store)
}

async fn open_store(config: &RebacConfig) -> Result<Arc<dyn RelationStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; relations are not kept between invocations");
            Ok(Arc::new(InMemoryRelationStore::new()))
        }
        StoreBackend::Postgres => Ok(Arc::new(connect_postgres(config).await?)),
    }
}

async fn open_engine(config: &RebacConfig, source: &SchemaSource) -> Result<AuthorizationEngine> {
    let store = open_store(config).await?;
    let schema = SchemaBootstrap::new()
        .load(source, config.schema.expected_version.as_deref(), store.as_ref())
        .await
        .context("Schema bootstrap failed")?;
    Ok(AuthorizationEngine::new(store, schema, config.engine.clone()))
}

fn parse_tuple(resource: &str, relation: &str, subject: &str) -> Result<RelationTuple> {
    let resource: ObjectRef = resource.parse()?;
    let subject: Subject = subject.parse()?;
    Ok(RelationTuple::new(resource, Relation::new(relation), subject))
}

async fn execute(engine: &AuthorizationEngine, command: &Command, json: bool) -> Result<Outcome> {
    match command {
        Command::Grant {
            resource,
            relation,
            subject,
        } => {
            let tuple = parse_tuple(resource, relation, subject)?;
            engine.write_relation(&tuple).await?;
            println!("Granted {}", tuple);
        }
        Command::Revoke {
            resource,
            relation,
            subject,
        } => {
            let tuple = parse_tuple(resource, relation, subject)?;
            engine.delete_relation(&tuple).await?;
            println!("Revoked {}", tuple);
        }
        Command::Check {
            resource,
            permission,
            subject,
        } => {
            let resource: ObjectRef = resource.parse()?;
            let subject: Subject = subject.parse()?;
            let allowed = engine.check(&resource, permission, &subject).await?;
            if json {
                println!("{}", json!({ "allowed": allowed }));
            } else {
                println!("{}", if allowed { "allowed" } else { "denied" });
            }
            if !allowed {
                return Ok(Outcome::Denied);
            }
        }
        Command::ListResources {
            resource_type,
            permission,
            subject,
        } => {
            let subject: Subject = subject.parse()?;
            let ids = engine
                .list_accessible_resources(resource_type, permission, &subject)
                .await?;
            if json {
                println!("{}", json!(ids));
            } else {
                ids.iter().for_each(|id| println!("{}", id));
            }
        }
        Command::ListGrantees {
            resource,
            relation,
            subject_type,
        } => {
            let resource: ObjectRef = resource.parse()?;
            let grantees: Vec<String> = engine
                .list_grantees(&resource, relation)
                .await?
                .into_iter()
                .filter(|s| subject_type.as_deref().map_or(true, |t| s.subject_type == t))
                .map(|s| s.to_string())
                .collect();
            if json {
                println!("{}", json!(grantees));
            } else {
                grantees.iter().for_each(|s| println!("{}", s));
            }
        }
        Command::Purge { resource } => {
            let resource: ObjectRef = resource.parse()?;
            let removed = engine.delete_all_for_resource(&resource).await?;
            println!("Removed {} relations on {}", removed, resource);
        }
        Command::ValidateSchema | Command::Migrate { .. } => {
            anyhow::bail!("{:?} does not run against an engine", command)
        }
    }
    Ok(Outcome::Success)
}
