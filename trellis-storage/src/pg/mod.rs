//! PostgreSQL storage backend
//!
//! One [`PgStore`] implements every storage trait. All statements are
//! parameterized and scoped by `tenant_id`; mutations run in a transaction
//! that also appends the mutation's events, so the row change and its audit
//! trail commit or roll back together.

mod entity;
mod event;
mod relationship;
mod schema;

use dashmap::DashMap;
use deadpool_postgres::{Object, Pool};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::future::Future;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use trellis_core::{
    ActorId, Entity, EntityId, EventRecord, Property, RecordIdType, RelationshipSchema,
    RequestScope, StorageError, TenantId, TrellisError, TrellisResult, TypePath, TypeSchema,
};

/// Attempts made to check a connection out of the pool before giving up.
const POOL_RETRIES: usize = 3;

/// PostgreSQL-backed storage.
pub struct PgStore {
    pool: Pool,
    max_query_limit: i64,
    relationship_schemas: DashMap<String, RelationshipSchema>,
    type_schemas: DashMap<String, TypeSchema>,
}

impl PgStore {
    pub fn new(pool: Pool, max_query_limit: i64) -> Self {
        Self {
            pool,
            max_query_limit,
            relationship_schemas: DashMap::new(),
            type_schemas: DashMap::new(),
        }
    }

    /// Load persisted schemas into the in-memory cache. Called once at
    /// startup, before the product loader registers anything new.
    pub async fn warm_schema_cache(&self) -> TrellisResult<()> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT type, from_types, to_types, cardinality, bidirectional, inverse_type \
                 FROM relationship_schemas",
                &[],
            )
            .await
            .map_err(internal)?;
        for row in rows {
            let schema = schema::relationship_schema_from_row(&row)?;
            self.relationship_schemas
                .insert(schema.relationship_type.clone(), schema);
        }

        let rows = conn
            .query("SELECT type_path, definition FROM type_schemas", &[])
            .await
            .map_err(internal)?;
        for row in rows {
            let type_path: String = row.get("type_path");
            let definition: JsonValue = row.get("definition");
            self.type_schemas.insert(
                type_path.clone(),
                TypeSchema {
                    type_path: TypePath::new_unchecked(type_path),
                    definition,
                },
            );
        }
        Ok(())
    }

    /// Check a connection out of the pool, retrying transient failures a
    /// bounded number of times.
    pub(crate) async fn conn(&self) -> TrellisResult<Object> {
        let mut last_error = None;
        for _ in 0..POOL_RETRIES {
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_error = Some(e),
            }
        }
        Err(StorageError::Internal {
            reason: format!(
                "connection pool exhausted: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        }
        .into())
    }

    pub(crate) fn max_query_limit(&self) -> i64 {
        self.max_query_limit
    }

    pub(crate) fn relationship_schema_cache(&self) -> &DashMap<String, RelationshipSchema> {
        &self.relationship_schemas
    }

    pub(crate) fn type_schema_cache(&self) -> &DashMap<String, TypeSchema> {
        &self.type_schemas
    }
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// Wrap a storage future with the request's deadline; expiry cancels the
/// in-flight work and surfaces as `DEADLINE_EXCEEDED`.
pub(crate) async fn with_deadline<T, F>(scope: &RequestScope, fut: F) -> TrellisResult<T>
where
    F: Future<Output = TrellisResult<T>>,
{
    match scope.remaining().map_err(TrellisError::from)? {
        None => fut.await,
        Some(remaining) => tokio::time::timeout(remaining, fut)
            .await
            .map_err(|_| TrellisError::from(StorageError::DeadlineExceeded))?,
    }
}

pub(crate) fn internal(e: impl std::fmt::Display) -> TrellisError {
    StorageError::Internal {
        reason: e.to_string(),
    }
    .into()
}

/// Map a unique-constraint violation to `ALREADY_EXISTS`, anything else to
/// an internal error.
pub(crate) fn insert_error(
    e: tokio_postgres::Error,
    kind: &'static str,
    id: impl ToString,
) -> TrellisError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        StorageError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
        .into()
    } else {
        internal(e)
    }
}

pub(crate) fn entity_from_row(row: &Row) -> TrellisResult<Entity> {
    let properties: JsonValue = row.get("properties");
    let properties: BTreeMap<String, Property> =
        serde_json::from_value(properties).map_err(internal)?;
    let type_path: String = row.get("type_path");
    Ok(Entity {
        id: EntityId::new(row.get("id")),
        tenant_id: TenantId::new(row.get("tenant_id")),
        entity_type: TypePath::new_unchecked(type_path),
        properties,
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        created_by: ActorId::new(row.get("created_by")),
        deleted_at: row.get("deleted_at"),
    })
}

/// Append an event batch inside the caller's transaction.
pub(crate) async fn insert_events(
    tx: &tokio_postgres::Transaction<'_>,
    events: &[EventRecord],
) -> TrellisResult<()> {
    if events.is_empty() {
        return Ok(());
    }
    let statement = tx
        .prepare(
            "INSERT INTO events (id, tenant_id, event_type, entity_id, actor_id, occurred_at, payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .await
        .map_err(internal)?;
    for event in events {
        tx.execute(
            &statement,
            &[
                &event.id.as_uuid(),
                &event.tenant_id.as_uuid(),
                &event.event_type.as_str(),
                &event.entity_id.map(|id| id.as_uuid()),
                &event.actor_id.as_uuid(),
                &event.occurred_at,
                &event.payload,
            ],
        )
        .await
        .map_err(internal)?;
    }
    Ok(())
}
