//! In-memory event store
//!
//! Backs the engine and API tests; production uses the PostgreSQL store in
//! `trellis-storage`.

use crate::store::{EventQuery, EventStore};
use async_trait::async_trait;
use tokio::sync::RwLock;
use trellis_core::{EventRecord, TenantId, TrellisResult};

/// Append-only in-memory event log.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<EventRecord>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events, across all tenants.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save(&self, event: &EventRecord) -> TrellisResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn save_many(&self, events: &[EventRecord]) -> TrellisResult<()> {
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn query(
        &self,
        tenant_id: TenantId,
        options: &EventQuery,
    ) -> TrellisResult<Vec<EventRecord>> {
        let events = self.events.read().await;
        let mut matched: Vec<EventRecord> = events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && options.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let offset = options.offset.unwrap_or(0).max(0) as usize;
        let matched = matched.into_iter().skip(offset);
        let matched = match options.limit {
            Some(limit) => matched.take(limit.max(0) as usize).collect(),
            None => matched.collect(),
        };
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use trellis_core::{ActorId, EventType, RecordIdType};

    fn make_event(tenant: TenantId, event_type: EventType) -> EventRecord {
        EventRecord::new(
            tenant,
            event_type,
            None,
            ActorId::now_v7(),
            Utc::now(),
            json!({}),
        )
    }

    #[tokio::test]
    async fn test_save_and_query_by_tenant() {
        let store = InMemoryEventStore::new();
        let tenant_a = TenantId::now_v7();
        let tenant_b = TenantId::now_v7();

        store
            .save(&make_event(tenant_a, EventType::EntityCreated))
            .await
            .expect("save");
        store
            .save(&make_event(tenant_b, EventType::EntityCreated))
            .await
            .expect("save");

        let events = store
            .query(tenant_a, &EventQuery::default())
            .await
            .expect("query");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tenant_id, tenant_a);
    }

    #[tokio::test]
    async fn test_query_filters_by_type() {
        let store = InMemoryEventStore::new();
        let tenant = TenantId::now_v7();

        store
            .save_many(&[
                make_event(tenant, EventType::EntityCreated),
                make_event(tenant, EventType::EntityUpdated),
                make_event(tenant, EventType::PropertyChanged),
            ])
            .await
            .expect("save_many");

        let events = store
            .query(
                tenant,
                &EventQuery {
                    event_types: Some(vec![EventType::EntityUpdated]),
                    ..Default::default()
                },
            )
            .await
            .expect("query");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::EntityUpdated);
    }

    #[tokio::test]
    async fn test_query_orders_by_time_then_id() {
        let store = InMemoryEventStore::new();
        let tenant = TenantId::now_v7();

        let events: Vec<EventRecord> = (0..5)
            .map(|_| make_event(tenant, EventType::EntityCreated))
            .collect();
        // Insert out of order
        store.save(&events[3]).await.expect("save");
        store.save(&events[0]).await.expect("save");
        store.save(&events[4]).await.expect("save");
        store.save(&events[1]).await.expect("save");
        store.save(&events[2]).await.expect("save");

        let read = store
            .query(tenant, &EventQuery::default())
            .await
            .expect("query");
        let ids: Vec<_> = read.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_pagination() {
        let store = InMemoryEventStore::new();
        let tenant = TenantId::now_v7();
        for _ in 0..10 {
            store
                .save(&make_event(tenant, EventType::EntityCreated))
                .await
                .expect("save");
        }

        let page = store
            .query(
                tenant,
                &EventQuery {
                    limit: Some(3),
                    offset: Some(8),
                    ..Default::default()
                },
            )
            .await
            .expect("query");
        assert_eq!(page.len(), 2);
    }
}
