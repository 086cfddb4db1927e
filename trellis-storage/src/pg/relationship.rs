//! Relationship persistence over PostgreSQL

use super::{insert_error, insert_events, internal, with_deadline, PgStore};
use crate::traits::RelationshipStore;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use tokio_postgres::Row;
use trellis_core::{
    ActorId, Direction, EntityId, EventRecord, RecordIdType, Relationship, RelationshipId,
    RequestScope, StorageError, TenantId, TrellisResult, Value,
};
use uuid::Uuid;

const RELATIONSHIP_COLUMNS: &str =
    "id, tenant_id, type, from_entity, to_entity, metadata, created_at, created_by";

fn relationship_from_row(row: &Row) -> TrellisResult<Relationship> {
    let metadata: JsonValue = row.get("metadata");
    let metadata: BTreeMap<String, Value> = serde_json::from_value(metadata).map_err(internal)?;
    Ok(Relationship {
        id: RelationshipId::new(row.get("id")),
        tenant_id: TenantId::new(row.get("tenant_id")),
        relationship_type: row.get("type"),
        from_entity: EntityId::new(row.get("from_entity")),
        to_entity: EntityId::new(row.get("to_entity")),
        metadata,
        created_at: row.get("created_at"),
        created_by: ActorId::new(row.get("created_by")),
    })
}

#[async_trait]
impl RelationshipStore for PgStore {
    async fn insert_relationships(
        &self,
        scope: &RequestScope,
        relationships: &[Relationship],
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        with_deadline(scope, async {
            let mut conn = self.conn().await?;
            let tx = conn.transaction().await.map_err(internal)?;

            let statement = tx
                .prepare(
                    "INSERT INTO relationships \
                     (id, tenant_id, type, from_entity, to_entity, metadata, created_at, created_by) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .await
                .map_err(internal)?;
            for relationship in relationships {
                let metadata = serde_json::to_value(&relationship.metadata).map_err(internal)?;
                tx.execute(
                    &statement,
                    &[
                        &relationship.id.as_uuid(),
                        &scope.tenant_id.as_uuid(),
                        &relationship.relationship_type,
                        &relationship.from_entity.as_uuid(),
                        &relationship.to_entity.as_uuid(),
                        &metadata,
                        &relationship.created_at,
                        &relationship.created_by.as_uuid(),
                    ],
                )
                .await
                .map_err(|e| insert_error(e, "relationship", relationship.id))?;
            }

            insert_events(&tx, events).await?;
            tx.commit().await.map_err(internal)?;
            Ok(())
        })
        .await
    }

    async fn fetch_relationship(
        &self,
        scope: &RequestScope,
        id: RelationshipId,
    ) -> TrellisResult<Option<Relationship>> {
        with_deadline(scope, async {
            let conn = self.conn().await?;
            let sql = format!(
                "SELECT {} FROM relationships WHERE id = $1 AND tenant_id = $2",
                RELATIONSHIP_COLUMNS
            );
            let row = conn
                .query_opt(sql.as_str(), &[&id.as_uuid(), &scope.tenant_id.as_uuid()])
                .await
                .map_err(internal)?;
            row.as_ref().map(relationship_from_row).transpose()
        })
        .await
    }

    async fn delete_relationships(
        &self,
        scope: &RequestScope,
        ids: &[RelationshipId],
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        with_deadline(scope, async {
            let mut conn = self.conn().await?;
            let tx = conn.transaction().await.map_err(internal)?;

            let uuids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
            let deleted = tx
                .execute(
                    "DELETE FROM relationships WHERE tenant_id = $1 AND id = ANY($2)",
                    &[&scope.tenant_id.as_uuid(), &uuids],
                )
                .await
                .map_err(internal)?;
            if deleted == 0 {
                return Err(StorageError::NotFound {
                    kind: "relationship",
                    id: ids
                        .first()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                }
                .into());
            }

            insert_events(&tx, events).await?;
            tx.commit().await.map_err(internal)?;
            Ok(())
        })
        .await
    }

    async fn list_relationships(
        &self,
        scope: &RequestScope,
        entity_id: EntityId,
        relationship_type: Option<&str>,
        direction: Direction,
    ) -> TrellisResult<Vec<Relationship>> {
        with_deadline(scope, async {
            let conn = self.conn().await?;
            let endpoint = match direction {
                Direction::Outgoing => "from_entity = $2",
                Direction::Incoming => "to_entity = $2",
                Direction::Both => "(from_entity = $2 OR to_entity = $2)",
            };
            let rows = match relationship_type {
                Some(rtype) => {
                    let sql = format!(
                        "SELECT {} FROM relationships \
                         WHERE tenant_id = $1 AND {} AND type = $3 ORDER BY created_at, id",
                        RELATIONSHIP_COLUMNS, endpoint
                    );
                    conn.query(
                        sql.as_str(),
                        &[
                            &scope.tenant_id.as_uuid(),
                            &entity_id.as_uuid(),
                            &rtype,
                        ],
                    )
                    .await
                }
                None => {
                    let sql = format!(
                        "SELECT {} FROM relationships \
                         WHERE tenant_id = $1 AND {} ORDER BY created_at, id",
                        RELATIONSHIP_COLUMNS, endpoint
                    );
                    conn.query(sql.as_str(), &[&scope.tenant_id.as_uuid(), &entity_id.as_uuid()])
                        .await
                }
            }
            .map_err(internal)?;
            rows.iter().map(relationship_from_row).collect()
        })
        .await
    }

    async fn find_relationship(
        &self,
        scope: &RequestScope,
        relationship_type: &str,
        from_entity: EntityId,
        to_entity: EntityId,
    ) -> TrellisResult<Option<Relationship>> {
        with_deadline(scope, async {
            let conn = self.conn().await?;
            let sql = format!(
                "SELECT {} FROM relationships \
                 WHERE tenant_id = $1 AND type = $2 AND from_entity = $3 AND to_entity = $4",
                RELATIONSHIP_COLUMNS
            );
            let row = conn
                .query_opt(
                    sql.as_str(),
                    &[
                        &scope.tenant_id.as_uuid(),
                        &relationship_type,
                        &from_entity.as_uuid(),
                        &to_entity.as_uuid(),
                    ],
                )
                .await
                .map_err(internal)?;
            row.as_ref().map(relationship_from_row).transpose()
        })
        .await
    }

    async fn count_relationships(
        &self,
        scope: &RequestScope,
        relationship_type: &str,
        entity_id: EntityId,
        direction: Direction,
    ) -> TrellisResult<i64> {
        with_deadline(scope, async {
            let conn = self.conn().await?;
            let endpoint = match direction {
                Direction::Outgoing => "from_entity = $3",
                Direction::Incoming => "to_entity = $3",
                Direction::Both => "(from_entity = $3 OR to_entity = $3)",
            };
            let sql = format!(
                "SELECT COUNT(*) FROM relationships \
                 WHERE tenant_id = $1 AND type = $2 AND {}",
                endpoint
            );
            let row = conn
                .query_one(
                    sql.as_str(),
                    &[
                        &scope.tenant_id.as_uuid(),
                        &relationship_type,
                        &entity_id.as_uuid(),
                    ],
                )
                .await
                .map_err(internal)?;
            Ok(row.get(0))
        })
        .await
    }

    async fn related_map(
        &self,
        scope: &RequestScope,
        ids: &[EntityId],
    ) -> TrellisResult<HashMap<EntityId, HashMap<String, Vec<EntityId>>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        with_deadline(scope, async {
            let conn = self.conn().await?;
            let uuids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
            let rows = conn
                .query(
                    "SELECT from_entity, type, to_entity FROM relationships \
                     WHERE tenant_id = $1 AND from_entity = ANY($2) \
                     ORDER BY created_at, id",
                    &[&scope.tenant_id.as_uuid(), &uuids],
                )
                .await
                .map_err(internal)?;

            let mut map: HashMap<EntityId, HashMap<String, Vec<EntityId>>> = HashMap::new();
            for row in rows {
                let from = EntityId::new(row.get("from_entity"));
                let rtype: String = row.get("type");
                let to = EntityId::new(row.get("to_entity"));
                map.entry(from).or_default().entry(rtype).or_default().push(to);
            }
            Ok(map)
        })
        .await
    }
}
