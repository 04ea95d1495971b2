//! PostgreSQL-backed relation store
//!
//! Tuples live in `rebac_relations` with a primary key over all six triple
//! columns, so writes are naturally idempotent (`ON CONFLICT DO NOTHING`).
//! A missing target relation is stored as the empty string to keep the key
//! total. Transient connection failures are retried with bounded exponential
//! backoff and then surfaced as [`RebacError::StoreUnavailable`].

use crate::{
    error::RebacError,
    models::*,
    repository::{RelationStore, SchemaVersionRecord},
};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MIGRATION: &str = include_str!("../../migrations/0001_rebac_relations.sql");

const SELECT_COLUMNS: &str = "SELECT resource_type, resource_id, relation, \
                                     target_type, target_id, target_relation \
                              FROM rebac_relations";

/// Bounded exponential backoff for transient store failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// PostgreSQL-backed relation store
pub struct PostgresRelationStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresRelationStore {
    /// Create a new PostgreSQL store
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create with connection string
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RebacError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| RebacError::StoreUnavailable(format!("Failed to connect: {}", e)))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the relation and schema-version tables if they do not exist
    pub async fn migrate(&self) -> Result<(), RebacError> {
        for statement in MIGRATION.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| RebacError::StoreUnavailable(format!("Migration failed: {}", e)))?;
        }
        info!("Relation store schema initialized");
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, RebacError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, sqlx::Error>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Transient failure during {} (attempt {}), retrying in {:?}: {}",
                        operation,
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Store operation {} failed: {}", operation, e);
                    return Err(RebacError::StoreUnavailable(format!(
                        "Failed to {}: {}",
                        operation, e
                    )));
                }
            }
        }
    }

    async fn apply_batch(&self, request: &WriteRequest) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for tuple in &request.writes {
            insert_query(tuple).execute(&mut *tx).await?;
        }
        for tuple in &request.deletes {
            delete_query(tuple).execute(&mut *tx).await?;
        }

        tx.commit().await
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => true,
        // connection exceptions, serialization failures, admin shutdown
        sqlx::Error::Database(db) => db
            .code()
            .map_or(false, |code| code.starts_with("08") || code == "40001" || code == "57P01"),
        _ => false,
    }
}

fn target_relation(tuple: &RelationTuple) -> &str {
    tuple.target.relation.as_deref().unwrap_or("")
}

fn insert_query(
    tuple: &RelationTuple,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO rebac_relations (
            resource_type, resource_id, relation,
            target_type, target_id, target_relation
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&tuple.resource.object_type)
    .bind(&tuple.resource.object_id)
    .bind(&tuple.relation.name)
    .bind(&tuple.target.subject_type)
    .bind(&tuple.target.subject_id)
    .bind(target_relation(tuple))
}

fn delete_query(
    tuple: &RelationTuple,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        DELETE FROM rebac_relations
        WHERE resource_type = $1
          AND resource_id = $2
          AND relation = $3
          AND target_type = $4
          AND target_id = $5
          AND target_relation = $6
        "#,
    )
    .bind(&tuple.resource.object_type)
    .bind(&tuple.resource.object_id)
    .bind(&tuple.relation.name)
    .bind(&tuple.target.subject_type)
    .bind(&tuple.target.subject_id)
    .bind(target_relation(tuple))
}

fn row_to_tuple(row: &PgRow) -> Result<RelationTuple, sqlx::Error> {
    let target_relation: String = row.try_get("target_relation")?;
    Ok(RelationTuple {
        resource: ObjectRef {
            object_type: row.try_get("resource_type")?,
            object_id: row.try_get("resource_id")?,
        },
        relation: Relation {
            name: row.try_get("relation")?,
        },
        target: Subject {
            subject_type: row.try_get("target_type")?,
            subject_id: row.try_get("target_id")?,
            relation: if target_relation.is_empty() {
                None
            } else {
                Some(target_relation)
            },
        },
    })
}

fn rows_to_tuples(rows: Vec<PgRow>) -> Result<Vec<RelationTuple>, sqlx::Error> {
    rows.iter().map(row_to_tuple).collect()
}

#[async_trait]
impl RelationStore for PostgresRelationStore {
    async fn write(&self, tuple: &RelationTuple) -> Result<(), RebacError> {
        debug!("Writing tuple to PostgreSQL: {}", tuple);
        self.with_retry("write tuple", || insert_query(tuple).execute(&self.pool))
            .await?;
        Ok(())
    }

    async fn delete(&self, tuple: &RelationTuple) -> Result<(), RebacError> {
        debug!("Deleting tuple from PostgreSQL: {}", tuple);
        self.with_retry("delete tuple", || delete_query(tuple).execute(&self.pool))
            .await?;
        Ok(())
    }

    async fn delete_all_for_resource(&self, resource: &ObjectRef) -> Result<u64, RebacError> {
        let result = self
            .with_retry("delete resource tuples", || {
                sqlx::query("DELETE FROM rebac_relations WHERE resource_type = $1 AND resource_id = $2")
                    .bind(&resource.object_type)
                    .bind(&resource.object_id)
                    .execute(&self.pool)
            })
            .await?;

        info!("Removed {} tuples for {}", result.rows_affected(), resource);
        Ok(result.rows_affected())
    }

    async fn lookup_by_resource(
        &self,
        resource: &ObjectRef,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        let query = format!("{} WHERE resource_type = $1 AND resource_id = $2", SELECT_COLUMNS);
        let rows = self
            .with_retry("read resource tuples", || {
                sqlx::query(&query)
                    .bind(&resource.object_type)
                    .bind(&resource.object_id)
                    .fetch_all(&self.pool)
            })
            .await?;

        rows_to_tuples(rows)
            .map_err(|e| RebacError::StoreUnavailable(format!("Malformed row: {}", e)))
    }

    async fn lookup_by_target(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        let query = format!("{} WHERE target_type = $1 AND target_id = $2", SELECT_COLUMNS);
        let rows = self
            .with_retry("read target tuples", || {
                sqlx::query(&query)
                    .bind(target_type)
                    .bind(target_id)
                    .fetch_all(&self.pool)
            })
            .await?;

        rows_to_tuples(rows)
            .map_err(|e| RebacError::StoreUnavailable(format!("Malformed row: {}", e)))
    }

    async fn lookup_relation(
        &self,
        resource: &ObjectRef,
        relation: &str,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        let query = format!(
            "{} WHERE resource_type = $1 AND resource_id = $2 AND relation = $3",
            SELECT_COLUMNS
        );
        let rows = self
            .with_retry("read relation tuples", || {
                sqlx::query(&query)
                    .bind(&resource.object_type)
                    .bind(&resource.object_id)
                    .bind(relation)
                    .fetch_all(&self.pool)
            })
            .await?;

        rows_to_tuples(rows)
            .map_err(|e| RebacError::StoreUnavailable(format!("Malformed row: {}", e)))
    }

    async fn exists(&self, tuple: &RelationTuple) -> Result<bool, RebacError> {
        self.with_retry("check tuple existence", || {
            sqlx::query_scalar::<_, bool>(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM rebac_relations
                    WHERE resource_type = $1
                      AND resource_id = $2
                      AND relation = $3
                      AND target_type = $4
                      AND target_id = $5
                      AND target_relation = $6
                )
                "#,
            )
            .bind(&tuple.resource.object_type)
            .bind(&tuple.resource.object_id)
            .bind(&tuple.relation.name)
            .bind(&tuple.target.subject_type)
            .bind(&tuple.target.subject_id)
            .bind(target_relation(tuple))
            .fetch_one(&self.pool)
        })
        .await
    }

    async fn batch_write(&self, request: &WriteRequest) -> Result<(), RebacError> {
        debug!(
            "Batch write: {} writes, {} deletes",
            request.writes.len(),
            request.deletes.len()
        );
        self.with_retry("apply batch", || self.apply_batch(request)).await?;
        info!("Batch write completed successfully");
        Ok(())
    }

    async fn schema_version(&self) -> Result<Option<SchemaVersionRecord>, RebacError> {
        let row = self
            .with_retry("read schema version", || {
                sqlx::query(
                    "SELECT version, recorded_at FROM rebac_schema_versions \
                     ORDER BY recorded_at DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
            })
            .await?;

        row.map(|row| -> Result<SchemaVersionRecord, sqlx::Error> {
            Ok(SchemaVersionRecord {
                version: row.try_get("version")?,
                recorded_at: row.try_get("recorded_at")?,
            })
        })
        .transpose()
        .map_err(|e| RebacError::StoreUnavailable(format!("Malformed row: {}", e)))
    }

    async fn record_schema_version(&self, version: &str) -> Result<(), RebacError> {
        self.with_retry("record schema version", || {
            sqlx::query("INSERT INTO rebac_schema_versions (version) VALUES ($1)")
                .bind(version)
                .execute(&self.pool)
        })
        .await?;
        info!("Recorded schema version {}", version);
        Ok(())
    }
}
