//! Append-only event log records
//!
//! Events are immutable once persisted. Within a tenant they are totally
//! ordered by `(occurred_at, id)`; the id is a time-ordered UUIDv7 so the
//! tiebreaker preserves emission order for same-millisecond events.

use crate::{
    ActorId, EntityId, EventId, Property, RecordIdType, RelationshipId, TenantId, Timestamp,
    TypePath, Value,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use uuid::timestamp::context::ContextV7;
use uuid::timestamp::ClockSequence;
use uuid::Uuid;

/// Thread-safe wrapper around `ContextV7`, which is not `Sync` on its own.
struct SharedEventIdContext(Mutex<ContextV7>);

impl ClockSequence for SharedEventIdContext {
    type Output = u64;

    fn generate_sequence(&self, seconds: u64, subsec_nanos: u32) -> Self::Output {
        self.0.lock().unwrap().generate_sequence(seconds, subsec_nanos)
    }

    fn generate_timestamp_sequence(
        &self,
        seconds: u64,
        subsec_nanos: u32,
    ) -> (Self::Output, u64, u32) {
        self.0
            .lock()
            .unwrap()
            .generate_timestamp_sequence(seconds, subsec_nanos)
    }

    fn usable_bits(&self) -> usize
    where
        Self::Output: Sized,
    {
        self.0.lock().unwrap().usable_bits()
    }
}

/// Shared v7 context: ids minted in the same millisecond stay monotonic,
/// which keeps `(occurred_at, id)` ordering equal to emission ordering for
/// events produced inside one transaction.
static EVENT_ID_CONTEXT: Lazy<SharedEventIdContext> =
    Lazy::new(|| SharedEventIdContext(Mutex::new(ContextV7::new())));

fn next_event_id() -> EventId {
    EventId::new(Uuid::new_v7(uuid::Timestamp::now(&*EVENT_ID_CONTEXT)))
}

// ============================================================================
// EVENT TYPE
// ============================================================================

/// Discriminator for the six event types the kernel produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    PropertyChanged,
    RelationshipCreated,
    RelationshipDeleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EntityCreated => "entity_created",
            EventType::EntityUpdated => "entity_updated",
            EventType::EntityDeleted => "entity_deleted",
            EventType::PropertyChanged => "property_changed",
            EventType::RelationshipCreated => "relationship_created",
            EventType::RelationshipDeleted => "relationship_deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entity_created" => Some(EventType::EntityCreated),
            "entity_updated" => Some(EventType::EntityUpdated),
            "entity_deleted" => Some(EventType::EntityDeleted),
            "property_changed" => Some(EventType::PropertyChanged),
            "relationship_created" => Some(EventType::RelationshipCreated),
            "relationship_deleted" => Some(EventType::RelationshipDeleted),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EVENT RECORD
// ============================================================================

/// One record of the append-only, per-tenant audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    pub actor_id: ActorId,
    pub occurred_at: Timestamp,
    pub payload: JsonValue,
}

impl EventRecord {
    pub fn new(
        tenant_id: TenantId,
        event_type: EventType,
        entity_id: Option<EntityId>,
        actor_id: ActorId,
        occurred_at: Timestamp,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: next_event_id(),
            tenant_id,
            event_type,
            entity_id,
            actor_id,
            occurred_at,
            payload,
        }
    }

    /// The entity type path carried in the payload, when present. Used by
    /// the subscription fabric for type-prefix filtering.
    pub fn entity_type(&self) -> Option<TypePath> {
        self.payload
            .get("type")
            .or_else(|| self.payload.get("entity_type"))
            .and_then(JsonValue::as_str)
            .map(TypePath::new_unchecked)
    }
}

// ============================================================================
// PAYLOAD SHAPES
// ============================================================================

/// Kind of change carried by a `property_changed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Payload of `entity_created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreatedPayload {
    #[serde(rename = "type")]
    pub entity_type: TypePath,
    pub properties: BTreeMap<String, Property>,
    pub version: i64,
}

/// Payload of `entity_updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdatedPayload {
    pub entity_type: TypePath,
    pub previous_version: i64,
    pub new_version: i64,
    pub changed_properties: Vec<String>,
    pub removed_properties: Vec<String>,
}

/// Payload of `entity_deleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDeletedPayload {
    #[serde(rename = "type")]
    pub entity_type: TypePath,
    pub final_version: i64,
    pub hard_delete: bool,
    pub final_properties: BTreeMap<String, Property>,
}

/// Payload of `property_changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChangedPayload {
    pub entity_type: TypePath,
    pub property_name: String,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Value>,
}

/// Payload of `relationship_created` and `relationship_deleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    pub relationship_id: RelationshipId,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for et in [
            EventType::EntityCreated,
            EventType::EntityUpdated,
            EventType::EntityDeleted,
            EventType::PropertyChanged,
            EventType::RelationshipCreated,
            EventType::RelationshipDeleted,
        ] {
            assert_eq!(EventType::parse(et.as_str()), Some(et));
        }
        assert_eq!(EventType::parse("unknown"), None);
    }

    #[test]
    fn test_event_ids_are_strictly_monotonic() {
        let mut previous = next_event_id();
        for _ in 0..1000 {
            let next = next_event_id();
            assert!(next.as_uuid() > previous.as_uuid());
            previous = next;
        }
    }

    #[test]
    fn test_payload_entity_type_extraction() {
        let payload = serde_json::to_value(PropertyChangedPayload {
            entity_type: TypePath::new_unchecked("product.variant"),
            property_name: "price".to_string(),
            change_type: ChangeType::Modified,
            previous: Some(Value::number(10.0)),
            current: Some(Value::number(12.0)),
        })
        .expect("serialize");

        let event = EventRecord::new(
            TenantId::now_v7(),
            EventType::PropertyChanged,
            Some(EntityId::now_v7()),
            ActorId::now_v7(),
            chrono::Utc::now(),
            payload,
        );
        assert_eq!(
            event.entity_type(),
            Some(TypePath::new_unchecked("product.variant"))
        );
    }
}
