//! `PostgreSQL` document and checkpoint stores.
//!
//! # Overview
//!
//! - [`PostgresDocumentStore`]: one table per collection, one JSONB document
//!   per row, keyed by the document id.
//! - [`PostgresCheckpointStore`]: the `conveyor_checkpoints` table, one row
//!   per subscription.
//!
//! Read models usually live in their own database, apart from whatever
//! produced the events:
//!
//! ```text
//! Event log (Redpanda, ...)          Read side (PostgreSQL)
//! ┌─────────────────────┐          ┌──────────────────────────┐
//! │  orders topic       │   →→→    │  order_summaries (JSONB) │
//! │  payments topic     │ Subscr.  │  conveyor_checkpoints    │
//! └─────────────────────┘          └──────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use conveyor_projections::postgres::{PostgresCheckpointStore, PostgresDocumentStore};
//!
//! let pool = connect("postgres://localhost/read_models").await?;
//! PostgresCheckpointStore::migrate(&pool).await?;
//!
//! let summaries = PostgresDocumentStore::new(pool.clone(), "order_summaries")?;
//! summaries.ensure_collection().await?;
//!
//! let checkpoints = PostgresCheckpointStore::new(pool);
//! ```

use chrono::{DateTime, Utc};
use conveyor_core::checkpoint::{
    self, Checkpoint, CheckpointError, CheckpointStore, validate_subscription_id,
};
use conveyor_core::projection::{
    DocumentFilter, DocumentStore, DocumentUpdate, ID_FIELD, ProjectionError, Result,
};
use conveyor_core::stream::Position;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::future::Future;
use std::pin::Pin;

/// Open a connection pool to the read model database.
///
/// # Errors
///
/// Returns [`ProjectionError::Storage`] if connection fails.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))
}

/// PostgreSQL-backed document collection.
///
/// # Schema
///
/// Created by [`ensure_collection`](Self::ensure_collection):
///
/// ```sql
/// CREATE TABLE order_summaries (
///     id TEXT PRIMARY KEY,
///     document JSONB NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// CREATE INDEX order_summaries_document_idx ON order_summaries USING GIN (document jsonb_path_ops);
/// ```
///
/// # Filters
///
/// `DocumentFilter::Id` compiles to `id = $n`, `DocumentFilter::Eq` to JSONB
/// containment `document @> {"field": value}`. For scalar values containment
/// is equality; an object or array value matches any document whose field
/// contains it.
///
/// # Upserts
///
/// The matching row is locked with `SELECT ... FOR UPDATE`, the update is
/// applied to the document and written back in the same transaction. When no
/// row matches, a new document is built from the filter and inserted; if a
/// concurrent writer inserted the same id first, the insert fails and the
/// subscription retries the event, which then finds the row.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    collection: String,
}

impl PostgresDocumentStore {
    /// Create a store for `collection` on an existing pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Other`] if `collection` is not a plain SQL
    /// identifier (letters, digits and underscores, not starting with a digit).
    pub fn new(pool: PgPool, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        let mut chars = collection.chars();
        let valid = chars
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ProjectionError::Other(format!(
                "Invalid collection name: {collection:?}"
            )));
        }
        Ok(Self { pool, collection })
    }

    /// Create the collection table and its index if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the DDL fails.
    pub async fn ensure_collection(&self) -> Result<()> {
        let table = &self.collection;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 id TEXT PRIMARY KEY,
                 document JSONB NOT NULL,
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
             )"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to create {table}: {e}")))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_document_idx ON {table} USING GIN (document jsonb_path_ops)"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to index {table}: {e}")))?;

        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_in_transaction(
        &self,
        filter: &DocumentFilter,
        update: &DocumentUpdate,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to begin transaction: {e}")))?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT id, document FROM {} WHERE ",
            self.collection
        ));
        push_filter(&mut select, filter);
        select.push(" ORDER BY id LIMIT 1 FOR UPDATE");

        let existing: Option<(String, Json<Value>)> = select
            .build_query_as()
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to load document: {e}")))?;

        match existing {
            Some((id, Json(mut document))) => {
                update.apply(&mut document)?;
                ensure_same_id(&document, &id)?;
                sqlx::query(&format!(
                    "UPDATE {} SET document = $1, updated_at = now() WHERE id = $2",
                    self.collection
                ))
                .bind(Json(document))
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to update document: {e}")))?;
            }
            None => {
                let id = filter
                    .document_id()
                    .ok_or_else(|| ProjectionError::MissingDocumentId(filter.to_string()))?
                    .to_string();
                let mut document = Value::Object(filter.seed());
                update.apply(&mut document)?;
                ensure_same_id(&document, &id)?;
                sqlx::query(&format!(
                    "INSERT INTO {} (id, document, updated_at) VALUES ($1, $2, now())",
                    self.collection
                ))
                .bind(id)
                .bind(Json(document))
                .execute(&mut *tx)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to insert document: {e}")))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to commit: {e}")))
    }
}

fn ensure_same_id(document: &Value, id: &str) -> Result<()> {
    if document.get(ID_FIELD).and_then(Value::as_str) == Some(id) {
        Ok(())
    } else {
        Err(ProjectionError::InvalidUpdate {
            field: ID_FIELD.to_string(),
            reason: "the document id cannot change".to_string(),
        })
    }
}

/// Append the SQL predicate for `filter` to `query`.
fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &DocumentFilter) {
    match filter {
        DocumentFilter::Id(id) => {
            query.push("id = ").push_bind(id.clone());
        }
        DocumentFilter::Eq { field, value } => {
            let mut probe = Map::new();
            probe.insert(field.clone(), value.clone());
            query.push("document @> ").push_bind(Json(Value::Object(probe)));
        }
        DocumentFilter::And(filters) if filters.is_empty() => {
            query.push("TRUE");
        }
        DocumentFilter::And(filters) => {
            query.push("(");
            for (i, inner) in filters.iter().enumerate() {
                if i > 0 {
                    query.push(" AND ");
                }
                push_filter(query, inner);
            }
            query.push(")");
        }
    }
}

impl DocumentStore for PostgresDocumentStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn upsert(
        &self,
        filter: DocumentFilter,
        update: DocumentUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.upsert_in_transaction(&filter, &update).await })
    }

    fn find_one(
        &self,
        filter: DocumentFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send + '_>> {
        Box::pin(async move {
            let mut query =
                QueryBuilder::<Postgres>::new(format!("SELECT document FROM {} WHERE ", self.collection));
            push_filter(&mut query, &filter);
            query.push(" ORDER BY id LIMIT 1");

            let found: Option<(Json<Value>,)> = query
                .build_query_as()
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to find document: {e}")))?;

            Ok(found.map(|(Json(document),)| document))
        })
    }

    fn delete_many(
        &self,
        filter: DocumentFilter,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let mut query = QueryBuilder::<Postgres>::new(format!("DELETE FROM {} WHERE ", self.collection));
            push_filter(&mut query, &filter);

            let result = query
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to delete documents: {e}")))?;

            Ok(result.rows_affected())
        })
    }
}

/// PostgreSQL-backed checkpoint store.
///
/// # Schema
///
/// Created by [`migrate`](Self::migrate):
///
/// ```sql
/// CREATE TABLE conveyor_checkpoints (
///     subscription_id TEXT PRIMARY KEY,
///     position BIGINT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
/// ```
///
/// `NULL` is the start of the stream. Writes are a single conditional
/// upsert, so the stored position never moves back no matter how many
/// writers race. Every write is durable when it returns; `force` changes
/// nothing here.
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Create a new checkpoint store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the checkpoint table migrations.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if migration fails.
    pub async fn migrate(pool: &PgPool) -> checkpoint::Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Migration failed: {e}")))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current(&self, subscription_id: &str) -> checkpoint::Result<Option<Checkpoint>> {
        let row: Option<(Option<i64>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT position, updated_at FROM conveyor_checkpoints WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(checkpoint_error)?;

        row.map(|(position, updated_at)| {
            Ok(Checkpoint::new(subscription_id, from_column(position)?, updated_at))
        })
        .transpose()
    }
}

fn checkpoint_error(error: sqlx::Error) -> CheckpointError {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            CheckpointError::Connection(error.to_string())
        }
        other => CheckpointError::Storage(other.to_string()),
    }
}

fn to_column(position: Option<Position>) -> checkpoint::Result<Option<i64>> {
    position
        .map(|p| {
            i64::try_from(p.value())
                .map_err(|_| CheckpointError::Storage(format!("Position {p} does not fit BIGINT")))
        })
        .transpose()
}

fn from_column(position: Option<i64>) -> checkpoint::Result<Option<Position>> {
    position
        .map(|p| {
            u64::try_from(p)
                .map(Position::new)
                .map_err(|_| CheckpointError::Storage(format!("Negative stored position {p}")))
        })
        .transpose()
}

impl CheckpointStore for PostgresCheckpointStore {
    fn get_last(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = checkpoint::Result<Checkpoint>> + Send + '_>> {
        let subscription_id = subscription_id.to_string();
        Box::pin(async move {
            validate_subscription_id(&subscription_id)?;
            let stored = self.current(&subscription_id).await?;
            Ok(stored.unwrap_or_else(|| Checkpoint::start(subscription_id, DateTime::UNIX_EPOCH)))
        })
    }

    fn store_checkpoint(
        &self,
        checkpoint: Checkpoint,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = checkpoint::Result<Checkpoint>> + Send + '_>> {
        Box::pin(async move {
            validate_subscription_id(&checkpoint.subscription_id)?;

            let written: Option<(Option<i64>, DateTime<Utc>)> = sqlx::query_as(
                "INSERT INTO conveyor_checkpoints (subscription_id, position, updated_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (subscription_id) DO UPDATE
                 SET position = EXCLUDED.position, updated_at = EXCLUDED.updated_at
                 WHERE conveyor_checkpoints.position IS NULL
                    OR conveyor_checkpoints.position <= EXCLUDED.position
                 RETURNING position, updated_at",
            )
            .bind(&checkpoint.subscription_id)
            .bind(to_column(checkpoint.position)?)
            .bind(checkpoint.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(checkpoint_error)?;

            if let Some((position, updated_at)) = written {
                tracing::debug!(checkpoint = %checkpoint, force, "Checkpoint stored");
                return Ok(Checkpoint::new(
                    checkpoint.subscription_id,
                    from_column(position)?,
                    updated_at,
                ));
            }

            // The stored position is ahead of ours; report what is there.
            let stored = self.current(&checkpoint.subscription_id).await?;
            tracing::debug!(
                checkpoint = %checkpoint,
                stored = ?stored.as_ref().map(ToString::to_string),
                "Checkpoint write ignored, stored position is ahead"
            );
            Ok(stored.unwrap_or(checkpoint))
        })
    }

    fn reset(&self, subscription_id: &str) -> Pin<Box<dyn Future<Output = checkpoint::Result<()>> + Send + '_>> {
        let subscription_id = subscription_id.to_string();
        Box::pin(async move {
            validate_subscription_id(&subscription_id)?;
            sqlx::query(
                "INSERT INTO conveyor_checkpoints (subscription_id, position, updated_at)
                 VALUES ($1, NULL, now())
                 ON CONFLICT (subscription_id) DO UPDATE
                 SET position = NULL, updated_at = now()",
            )
            .bind(&subscription_id)
            .execute(&self.pool)
            .await
            .map_err(checkpoint_error)?;

            tracing::info!(subscription = %subscription_id, "Checkpoint reset to start");
            Ok(())
        })
    }
}
