//! Event store contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_core::{
    ActorId, EntityId, EventRecord, EventType, TenantId, Timestamp, TrellisResult,
};

/// Query options for reading the event log. All filters are conjunctive;
/// results are ordered by `(occurred_at, id)` ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<EventType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl EventQuery {
    /// Whether an event passes every set filter. Tenant scoping happens
    /// before this check; the query never crosses tenants.
    pub fn matches(&self, event: &EventRecord) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(entity_id) = self.entity_id {
            if event.entity_id != Some(entity_id) {
                return false;
            }
        }
        if let Some(actor_id) = self.actor_id {
            if event.actor_id != actor_id {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.occurred_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.occurred_at > until {
                return false;
            }
        }
        true
    }
}

/// Contract for persisting and reading the append-only event log.
///
/// Implementations never update or delete persisted events; `save_many` is
/// transactional (all events land or none do).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a single event.
    async fn save(&self, event: &EventRecord) -> TrellisResult<()>;

    /// Append a batch of events atomically, preserving order.
    async fn save_many(&self, events: &[EventRecord]) -> TrellisResult<()>;

    /// Read events for one tenant, filtered and paginated, ordered by
    /// `(occurred_at, id)` ascending.
    async fn query(
        &self,
        tenant_id: TenantId,
        options: &EventQuery,
    ) -> TrellisResult<Vec<EventRecord>>;
}
