//! Entity persistence over PostgreSQL

use super::{entity_from_row, insert_error, insert_events, internal, with_deadline, PgStore};
use crate::query::{build_entity_query, cursor_for_entity, encode_cursor};
use crate::traits::EntityStore;
use async_trait::async_trait;
use tracing::debug;
use trellis_core::{
    Entity, EntityId, EventRecord, PageInfo, QueryPage, QueryRequest, RecordIdType, RequestScope,
    StorageError, Timestamp, TrellisResult,
};

#[async_trait]
impl EntityStore for PgStore {
    async fn insert_entity(
        &self,
        scope: &RequestScope,
        entity: &Entity,
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        with_deadline(scope, async {
            let mut conn = self.conn().await?;
            let tx = conn.transaction().await.map_err(internal)?;

            let properties = serde_json::to_value(&entity.properties).map_err(internal)?;
            tx.execute(
                "INSERT INTO entities \
                 (id, tenant_id, type_path, properties, version, created_at, updated_at, created_by, deleted_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &entity.id.as_uuid(),
                    &scope.tenant_id.as_uuid(),
                    &entity.entity_type.as_str(),
                    &properties,
                    &entity.version,
                    &entity.created_at,
                    &entity.updated_at,
                    &entity.created_by.as_uuid(),
                    &entity.deleted_at,
                ],
            )
            .await
            .map_err(|e| insert_error(e, "entity", entity.id))?;

            insert_events(&tx, events).await?;
            tx.commit().await.map_err(internal)?;
            debug!(tenant_id = %scope.tenant_id, entity_id = %entity.id, "entity inserted");
            Ok(())
        })
        .await
    }

    async fn fetch_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
    ) -> TrellisResult<Option<Entity>> {
        with_deadline(scope, async {
            let conn = self.conn().await?;
            let row = conn
                .query_opt(
                    "SELECT id, tenant_id, type_path, properties, version, created_at, updated_at, created_by, deleted_at \
                     FROM entities WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
                    &[&id.as_uuid(), &scope.tenant_id.as_uuid()],
                )
                .await
                .map_err(internal)?;
            row.as_ref().map(entity_from_row).transpose()
        })
        .await
    }

    async fn fetch_entities(
        &self,
        scope: &RequestScope,
        ids: &[EntityId],
    ) -> TrellisResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        with_deadline(scope, async {
            let conn = self.conn().await?;
            let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
            let rows = conn
                .query(
                    "SELECT id, tenant_id, type_path, properties, version, created_at, updated_at, created_by, deleted_at \
                     FROM entities WHERE tenant_id = $1 AND id = ANY($2) AND deleted_at IS NULL",
                    &[&scope.tenant_id.as_uuid(), &uuids],
                )
                .await
                .map_err(internal)?;
            rows.iter().map(entity_from_row).collect()
        })
        .await
    }

    async fn update_entity(
        &self,
        scope: &RequestScope,
        entity: &Entity,
        expected_version: i64,
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        with_deadline(scope, async {
            let mut conn = self.conn().await?;
            let tx = conn.transaction().await.map_err(internal)?;

            let properties = serde_json::to_value(&entity.properties).map_err(internal)?;
            let updated = tx
                .execute(
                    "UPDATE entities SET properties = $1, version = $2, updated_at = $3 \
                     WHERE id = $4 AND tenant_id = $5 AND version = $6 AND deleted_at IS NULL",
                    &[
                        &properties,
                        &entity.version,
                        &entity.updated_at,
                        &entity.id.as_uuid(),
                        &scope.tenant_id.as_uuid(),
                        &expected_version,
                    ],
                )
                .await
                .map_err(internal)?;

            if updated == 0 {
                // The optimistic lock lost; report the version the row
                // actually carries now.
                drop(tx);
                let current = conn
                    .query_opt(
                        "SELECT version FROM entities \
                         WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
                        &[&entity.id.as_uuid(), &scope.tenant_id.as_uuid()],
                    )
                    .await
                    .map_err(internal)?;
                return Err(match current {
                    Some(row) => StorageError::VersionConflict {
                        expected: expected_version,
                        actual: row.get("version"),
                    }
                    .into(),
                    None => StorageError::NotFound {
                        kind: "entity",
                        id: entity.id.to_string(),
                    }
                    .into(),
                });
            }

            insert_events(&tx, events).await?;
            tx.commit().await.map_err(internal)?;
            debug!(
                tenant_id = %scope.tenant_id,
                entity_id = %entity.id,
                version = entity.version,
                "entity updated"
            );
            Ok(())
        })
        .await
    }

    async fn soft_delete_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
        deleted_at: Timestamp,
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        with_deadline(scope, async {
            let mut conn = self.conn().await?;
            let tx = conn.transaction().await.map_err(internal)?;

            let updated = tx
                .execute(
                    "UPDATE entities SET deleted_at = $1, updated_at = $1, version = version + 1 \
                     WHERE id = $2 AND tenant_id = $3 AND deleted_at IS NULL",
                    &[&deleted_at, &id.as_uuid(), &scope.tenant_id.as_uuid()],
                )
                .await
                .map_err(internal)?;
            if updated == 0 {
                return Err(StorageError::NotFound {
                    kind: "entity",
                    id: id.to_string(),
                }
                .into());
            }

            insert_events(&tx, events).await?;
            tx.commit().await.map_err(internal)?;
            Ok(())
        })
        .await
    }

    async fn hard_delete_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        with_deadline(scope, async {
            let mut conn = self.conn().await?;
            let tx = conn.transaction().await.map_err(internal)?;

            // Relationships only live while both endpoint rows do.
            tx.execute(
                "DELETE FROM relationships \
                 WHERE tenant_id = $1 AND (from_entity = $2 OR to_entity = $2)",
                &[&scope.tenant_id.as_uuid(), &id.as_uuid()],
            )
            .await
            .map_err(internal)?;

            let deleted = tx
                .execute(
                    "DELETE FROM entities WHERE id = $1 AND tenant_id = $2",
                    &[&id.as_uuid(), &scope.tenant_id.as_uuid()],
                )
                .await
                .map_err(internal)?;
            if deleted == 0 {
                return Err(StorageError::NotFound {
                    kind: "entity",
                    id: id.to_string(),
                }
                .into());
            }

            insert_events(&tx, events).await?;
            tx.commit().await.map_err(internal)?;
            Ok(())
        })
        .await
    }

    async fn mark_property_stale(
        &self,
        scope: &RequestScope,
        id: EntityId,
        property: &str,
    ) -> TrellisResult<bool> {
        with_deadline(scope, async {
            let conn = self.conn().await?;
            // Status-only write: no version bump, no event. Only derived
            // property kinds have a status to downgrade.
            let updated = conn
                .execute(
                    "UPDATE entities \
                     SET properties = jsonb_set(properties, ARRAY[$3, 'status'], '\"stale\"'::jsonb) \
                     WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL \
                       AND properties #>> ARRAY[$3, 'kind'] IN ('computed', 'inherited') \
                       AND properties #>> ARRAY[$3, 'status'] <> 'stale'",
                    &[&id.as_uuid(), &scope.tenant_id.as_uuid(), &property],
                )
                .await
                .map_err(internal)?;
            Ok(updated > 0)
        })
        .await
    }

    async fn query_entities(
        &self,
        scope: &RequestScope,
        request: &QueryRequest,
    ) -> TrellisResult<QueryPage> {
        let built = build_entity_query(scope.tenant_id, request, self.max_query_limit())?;
        with_deadline(scope, async {
            let conn = self.conn().await?;

            let rows = conn
                .query(built.select.sql.as_str(), &built.select.sql_params())
                .await
                .map_err(internal)?;
            let mut data: Vec<Entity> = rows
                .iter()
                .map(entity_from_row)
                .collect::<TrellisResult<_>>()?;

            let has_more = data.len() as i64 > built.limit;
            data.truncate(built.limit as usize);

            let cursor = if has_more {
                data.last()
                    .map(|last| encode_cursor(&cursor_for_entity(last, &built.sort)))
            } else {
                None
            };

            let total_count = match &built.count {
                Some(count) => {
                    let row = conn
                        .query_one(count.sql.as_str(), &count.sql_params())
                        .await
                        .map_err(internal)?;
                    let total: i64 = row.get(0);
                    Some(total)
                }
                None => None,
            };

            Ok(QueryPage {
                data,
                pagination: PageInfo {
                    offset: request.cursor.is_none().then_some(built.offset),
                    limit: built.limit,
                    has_more,
                    cursor,
                },
                total_count,
            })
        })
        .await
    }
}
