//! Event log persistence over PostgreSQL
//!
//! `events` is append-only: inserts only, no UPDATE or DELETE statements
//! exist anywhere in this backend.

use super::{insert_events, internal, PgStore};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use trellis_core::{
    ActorId, EntityId, EventId, EventRecord, EventType, RecordIdType, StorageError, TenantId,
    TrellisResult,
};
use trellis_events::{EventQuery, EventStore};

fn event_from_row(row: &Row) -> TrellisResult<EventRecord> {
    let event_type: String = row.get("event_type");
    let event_type = EventType::parse(&event_type).ok_or_else(|| StorageError::Internal {
        reason: format!("unknown event type in log: {}", event_type),
    })?;
    let entity_id: Option<uuid::Uuid> = row.get("entity_id");
    let payload: JsonValue = row.get("payload");
    Ok(EventRecord {
        id: EventId::new(row.get("id")),
        tenant_id: TenantId::new(row.get("tenant_id")),
        event_type,
        entity_id: entity_id.map(EntityId::new),
        actor_id: ActorId::new(row.get("actor_id")),
        occurred_at: row.get("occurred_at"),
        payload,
    })
}

#[async_trait]
impl EventStore for PgStore {
    async fn save(&self, event: &EventRecord) -> TrellisResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO events (id, tenant_id, event_type, entity_id, actor_id, occurred_at, payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
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
        Ok(())
    }

    async fn save_many(&self, events: &[EventRecord]) -> TrellisResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(internal)?;
        insert_events(&tx, events).await?;
        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn query(
        &self,
        tenant_id: TenantId,
        options: &EventQuery,
    ) -> TrellisResult<Vec<EventRecord>> {
        let conn = self.conn().await?;

        let tenant_uuid = tenant_id.as_uuid();
        let mut clauses = vec!["tenant_id = $1".to_string()];
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![Box::new(tenant_uuid)];

        if let Some(types) = &options.event_types {
            let names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
            params.push(Box::new(names));
            clauses.push(format!("event_type = ANY(${})", params.len()));
        }
        if let Some(entity_id) = options.entity_id {
            params.push(Box::new(entity_id.as_uuid()));
            clauses.push(format!("entity_id = ${}", params.len()));
        }
        if let Some(actor_id) = options.actor_id {
            params.push(Box::new(actor_id.as_uuid()));
            clauses.push(format!("actor_id = ${}", params.len()));
        }
        if let Some(since) = options.since {
            params.push(Box::new(since));
            clauses.push(format!("occurred_at >= ${}", params.len()));
        }
        if let Some(until) = options.until {
            params.push(Box::new(until));
            clauses.push(format!("occurred_at <= ${}", params.len()));
        }

        let limit = options.limit.unwrap_or(1000).clamp(1, 10_000);
        let offset = options.offset.unwrap_or(0).max(0);
        let sql = format!(
            "SELECT id, tenant_id, event_type, entity_id, actor_id, occurred_at, payload \
             FROM events WHERE {} ORDER BY occurred_at ASC, id ASC LIMIT {} OFFSET {}",
            clauses.join(" AND "),
            limit,
            offset
        );

        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let rows = conn.query(sql.as_str(), &param_refs).await.map_err(internal)?;
        rows.iter().map(event_from_row).collect()
    }
}
