//! In-memory storage backend

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;
use trellis_core::{
    Direction, Entity, EntityId, EventRecord, Filter, FilterCondition, FilterOp, GroupLogic,
    PageInfo, Property, PropertyStatus, QueryPage, QueryRequest, Relationship, RelationshipId,
    RelationshipSchema, RequestScope, SortDirection, SortSpec, StorageError, TenantId, Timestamp,
    TrellisResult, TypePath, TypeSchema, ValidationError, Value,
};
use trellis_events::{EventQuery, EventStore};
use trellis_storage::{
    cursor_for_entity, decode_cursor, encode_cursor, EntityStore, RelationshipStore,
    SchemaRegistry,
};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// In-memory backend implementing the full storage surface.
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<(TenantId, EntityId), Entity>>,
    relationships: RwLock<HashMap<(TenantId, RelationshipId), Relationship>>,
    events: RwLock<Vec<EventRecord>>,
    relationship_schemas: DashMap<String, RelationshipSchema>,
    type_schemas: DashMap<String, TypeSchema>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw read of an entity, ignoring soft-delete visibility. For test
    /// assertions about deleted rows.
    pub async fn raw_entity(&self, tenant_id: TenantId, id: EntityId) -> Option<Entity> {
        self.entities.read().await.get(&(tenant_id, id)).cloned()
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    fn check_deadline(scope: &RequestScope) -> TrellisResult<()> {
        scope.remaining()?;
        Ok(())
    }
}

// ============================================================================
// ENTITY STORE
// ============================================================================

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_entity(
        &self,
        scope: &RequestScope,
        entity: &Entity,
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        Self::check_deadline(scope)?;
        let mut entities = self.entities.write().await;
        let key = (scope.tenant_id, entity.id);
        if entities.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                kind: "entity",
                id: entity.id.to_string(),
            }
            .into());
        }
        entities.insert(key, entity.clone());
        drop(entities);
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn fetch_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
    ) -> TrellisResult<Option<Entity>> {
        Self::check_deadline(scope)?;
        let entities = self.entities.read().await;
        Ok(entities
            .get(&(scope.tenant_id, id))
            .filter(|e| !e.is_deleted())
            .cloned())
    }

    async fn fetch_entities(
        &self,
        scope: &RequestScope,
        ids: &[EntityId],
    ) -> TrellisResult<Vec<Entity>> {
        Self::check_deadline(scope)?;
        let entities = self.entities.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| entities.get(&(scope.tenant_id, *id)))
            .filter(|e| !e.is_deleted())
            .cloned()
            .collect())
    }

    async fn update_entity(
        &self,
        scope: &RequestScope,
        entity: &Entity,
        expected_version: i64,
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        Self::check_deadline(scope)?;
        let mut entities = self.entities.write().await;
        let key = (scope.tenant_id, entity.id);
        let stored = entities
            .get_mut(&key)
            .filter(|e| !e.is_deleted())
            .ok_or_else(|| StorageError::NotFound {
                kind: "entity",
                id: entity.id.to_string(),
            })?;
        if stored.version != expected_version {
            return Err(StorageError::VersionConflict {
                expected: expected_version,
                actual: stored.version,
            }
            .into());
        }
        *stored = entity.clone();
        drop(entities);
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn soft_delete_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
        deleted_at: Timestamp,
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        Self::check_deadline(scope)?;
        let mut entities = self.entities.write().await;
        let stored = entities
            .get_mut(&(scope.tenant_id, id))
            .filter(|e| !e.is_deleted())
            .ok_or_else(|| StorageError::NotFound {
                kind: "entity",
                id: id.to_string(),
            })?;
        stored.deleted_at = Some(deleted_at);
        stored.updated_at = deleted_at;
        stored.version += 1;
        drop(entities);
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn hard_delete_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        Self::check_deadline(scope)?;
        let mut entities = self.entities.write().await;
        if entities.remove(&(scope.tenant_id, id)).is_none() {
            return Err(StorageError::NotFound {
                kind: "entity",
                id: id.to_string(),
            }
            .into());
        }
        drop(entities);
        // Relationships only live while both endpoint rows do.
        let mut relationships = self.relationships.write().await;
        relationships
            .retain(|_, r| !(r.tenant_id == scope.tenant_id && (r.from_entity == id || r.to_entity == id)));
        drop(relationships);
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn mark_property_stale(
        &self,
        scope: &RequestScope,
        id: EntityId,
        property: &str,
    ) -> TrellisResult<bool> {
        Self::check_deadline(scope)?;
        let mut entities = self.entities.write().await;
        let Some(entity) = entities
            .get_mut(&(scope.tenant_id, id))
            .filter(|e| !e.is_deleted())
        else {
            return Ok(false);
        };
        match entity.properties.get_mut(property) {
            Some(Property::Computed { status, .. }) | Some(Property::Inherited { status, .. })
                if *status != PropertyStatus::Stale =>
            {
                *status = PropertyStatus::Stale;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query_entities(
        &self,
        scope: &RequestScope,
        request: &QueryRequest,
    ) -> TrellisResult<QueryPage> {
        Self::check_deadline(scope)?;
        let entities = self.entities.read().await;
        let mut matched: Vec<Entity> = entities
            .values()
            .filter(|e| e.tenant_id == scope.tenant_id && !e.is_deleted())
            .filter(|e| {
                request
                    .entity_type
                    .as_deref()
                    .map(|t| e.entity_type.matches_filter(t))
                    .unwrap_or(true)
            })
            .filter(|e| {
                request
                    .filter
                    .as_ref()
                    .map(|f| filter_matches(e, f))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        drop(entities);

        let sort = request.sort.clone().unwrap_or_default();
        matched.sort_by(|a, b| compare_entities(a, b, &sort));

        let total = matched.len() as i64;
        let limit = request
            .limit
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT);

        let mut offset = request.offset.unwrap_or(0).max(0);
        if let Some(encoded) = &request.cursor {
            let cursor = decode_cursor(encoded)?;
            if cursor.sort_values.len() != sort.len() {
                return Err(ValidationError::InvalidValue {
                    field: "cursor".to_string(),
                    reason: "cursor does not match the sort keys".to_string(),
                }
                .into());
            }
            matched.retain(|e| after_cursor(e, &sort, &cursor));
            offset = 0;
        }

        let mut page: Vec<Entity> = matched
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize + 1)
            .collect();
        let has_more = page.len() as i64 > limit;
        page.truncate(limit as usize);

        let cursor = if has_more {
            page.last()
                .map(|last| encode_cursor(&cursor_for_entity(last, &sort)))
        } else {
            None
        };

        Ok(QueryPage {
            data: page,
            pagination: PageInfo {
                offset: request.cursor.is_none().then_some(offset),
                limit,
                has_more,
                cursor,
            },
            total_count: request.include_total.then_some(total),
        })
    }
}

// ============================================================================
// FILTER EVALUATION
// ============================================================================

fn filter_matches(entity: &Entity, filter: &Filter) -> bool {
    match filter {
        Filter::Group(group) => {
            let mut results = group.conditions.iter().map(|f| filter_matches(entity, f));
            match group.logic {
                GroupLogic::And => results.all(|r| r),
                GroupLogic::Or => results.any(|r| r),
            }
        }
        Filter::Condition(condition) => condition_matches(entity, condition),
    }
}

fn condition_matches(entity: &Entity, condition: &FilterCondition) -> bool {
    let actual = lookup_raw(entity, &condition.property);
    let expected = condition.value.as_ref();
    match condition.op {
        FilterOp::Eq => json_equal(actual.as_ref(), expected),
        FilterOp::Neq => !json_equal(actual.as_ref(), expected),
        FilterOp::Lt | FilterOp::Gt | FilterOp::Lte | FilterOp::Gte => {
            let (Some(actual), Some(expected)) = (actual, expected) else {
                return false;
            };
            let Some(ordering) = compare_json(&actual, expected) else {
                return false;
            };
            match condition.op {
                FilterOp::Lt => ordering == Ordering::Less,
                FilterOp::Gt => ordering == Ordering::Greater,
                FilterOp::Lte => ordering != Ordering::Greater,
                FilterOp::Gte => ordering != Ordering::Less,
                _ => false,
            }
        }
        FilterOp::In => match (actual, expected.and_then(|v| v.as_array())) {
            (Some(actual), Some(candidates)) => candidates.contains(&actual),
            _ => false,
        },
        FilterOp::Contains => match (actual, expected.and_then(|v| v.as_str())) {
            (Some(JsonValue::String(text)), Some(needle)) => text.contains(needle),
            _ => false,
        },
        FilterOp::StartsWith => match (actual, expected.and_then(|v| v.as_str())) {
            (Some(JsonValue::String(text)), Some(prefix)) => text.starts_with(prefix),
            _ => false,
        },
        FilterOp::IsNull => {
            let wants_null = expected.and_then(|v| v.as_bool()).unwrap_or(true);
            actual.is_none() == wants_null
        }
    }
}

/// The raw JSON scalar a condition compares against; mirrors what the SQL
/// builder's JSON path expressions extract.
fn lookup_raw(entity: &Entity, property: &str) -> Option<JsonValue> {
    match property {
        "id" => Some(JsonValue::String(entity.id.to_string())),
        "version" => Some(JsonValue::from(entity.version)),
        "created_at" => Some(JsonValue::String(entity.created_at.to_rfc3339())),
        "updated_at" => Some(JsonValue::String(entity.updated_at.to_rfc3339())),
        "created_by" => Some(JsonValue::String(entity.created_by.to_string())),
        "type" => Some(JsonValue::String(entity.entity_type.as_str().to_string())),
        name => entity
            .property(name)
            .and_then(|p| p.effective_value())
            .map(raw_json),
    }
}

fn raw_json(value: &Value) -> JsonValue {
    match value {
        Value::Number { value } => serde_json::Number::from_f64(*value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Text { value } => JsonValue::String(value.clone()),
        Value::Boolean { value } => JsonValue::Bool(*value),
        Value::Datetime { value } | Value::Duration { value } => JsonValue::String(value.clone()),
        Value::Reference { value } => JsonValue::String(value.to_string()),
        Value::List { .. } | Value::Record { .. } => JsonValue::Null,
    }
}

/// JSON equality with numeric normalization (`12` equals `12.0`, as it
/// does under jsonb comparison in the database).
fn json_equal(a: Option<&JsonValue>, b: Option<&JsonValue>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => match compare_json(a, b) {
            Some(ordering) => ordering == Ordering::Equal,
            None => a == b,
        },
        (None, None) => true,
        _ => false,
    }
}

fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            a.as_f64().and_then(|a| b.as_f64().and_then(|b| a.partial_cmp(&b)))
        }
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare_entities(a: &Entity, b: &Entity, sort: &[SortSpec]) -> Ordering {
    for key in sort {
        let va = lookup_raw(a, &key.property);
        let vb = lookup_raw(b, &key.property);
        let ordering = match (va, vb) {
            (None, None) => Ordering::Equal,
            // Nulls sort last under ascending order, like the database.
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(va), Some(vb)) => compare_json(&va, &vb).unwrap_or(Ordering::Equal),
        };
        let ordering = match key.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.id.cmp(&b.id)
}

fn after_cursor(entity: &Entity, sort: &[SortSpec], cursor: &trellis_storage::Cursor) -> bool {
    for (key, cursor_value) in sort.iter().zip(cursor.sort_values.iter()) {
        let actual = lookup_raw(entity, &key.property).unwrap_or(JsonValue::Null);
        if actual == *cursor_value {
            continue;
        }
        let ordering = compare_json(&actual, cursor_value).unwrap_or(Ordering::Equal);
        return match key.direction {
            SortDirection::Asc => ordering == Ordering::Greater,
            SortDirection::Desc => ordering == Ordering::Less,
        };
    }
    entity.id > cursor.id
}

// ============================================================================
// RELATIONSHIP STORE
// ============================================================================

#[async_trait]
impl RelationshipStore for MemoryStore {
    async fn insert_relationships(
        &self,
        scope: &RequestScope,
        new: &[Relationship],
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        Self::check_deadline(scope)?;
        let mut relationships = self.relationships.write().await;
        for relationship in new {
            let duplicate = relationships.values().any(|r| {
                r.tenant_id == scope.tenant_id
                    && r.relationship_type == relationship.relationship_type
                    && r.from_entity == relationship.from_entity
                    && r.to_entity == relationship.to_entity
            });
            if duplicate {
                return Err(StorageError::AlreadyExists {
                    kind: "relationship",
                    id: relationship.id.to_string(),
                }
                .into());
            }
        }
        for relationship in new {
            relationships.insert((scope.tenant_id, relationship.id), relationship.clone());
        }
        drop(relationships);
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn fetch_relationship(
        &self,
        scope: &RequestScope,
        id: RelationshipId,
    ) -> TrellisResult<Option<Relationship>> {
        Self::check_deadline(scope)?;
        Ok(self
            .relationships
            .read()
            .await
            .get(&(scope.tenant_id, id))
            .cloned())
    }

    async fn delete_relationships(
        &self,
        scope: &RequestScope,
        ids: &[RelationshipId],
        events: &[EventRecord],
    ) -> TrellisResult<()> {
        Self::check_deadline(scope)?;
        let mut relationships = self.relationships.write().await;
        let mut removed = 0;
        for id in ids {
            if relationships.remove(&(scope.tenant_id, *id)).is_some() {
                removed += 1;
            }
        }
        if removed == 0 {
            return Err(StorageError::NotFound {
                kind: "relationship",
                id: ids.first().map(|id| id.to_string()).unwrap_or_default(),
            }
            .into());
        }
        drop(relationships);
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn list_relationships(
        &self,
        scope: &RequestScope,
        entity_id: EntityId,
        relationship_type: Option<&str>,
        direction: Direction,
    ) -> TrellisResult<Vec<Relationship>> {
        Self::check_deadline(scope)?;
        let relationships = self.relationships.read().await;
        let mut matched: Vec<Relationship> = relationships
            .values()
            .filter(|r| r.tenant_id == scope.tenant_id)
            .filter(|r| match direction {
                Direction::Outgoing => r.from_entity == entity_id,
                Direction::Incoming => r.to_entity == entity_id,
                Direction::Both => r.from_entity == entity_id || r.to_entity == entity_id,
            })
            .filter(|r| {
                relationship_type
                    .map(|t| r.relationship_type == t)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matched)
    }

    async fn find_relationship(
        &self,
        scope: &RequestScope,
        relationship_type: &str,
        from_entity: EntityId,
        to_entity: EntityId,
    ) -> TrellisResult<Option<Relationship>> {
        Self::check_deadline(scope)?;
        let relationships = self.relationships.read().await;
        Ok(relationships
            .values()
            .find(|r| {
                r.tenant_id == scope.tenant_id
                    && r.relationship_type == relationship_type
                    && r.from_entity == from_entity
                    && r.to_entity == to_entity
            })
            .cloned())
    }

    async fn count_relationships(
        &self,
        scope: &RequestScope,
        relationship_type: &str,
        entity_id: EntityId,
        direction: Direction,
    ) -> TrellisResult<i64> {
        Self::check_deadline(scope)?;
        let relationships = self.relationships.read().await;
        Ok(relationships
            .values()
            .filter(|r| r.tenant_id == scope.tenant_id && r.relationship_type == relationship_type)
            .filter(|r| match direction {
                Direction::Outgoing => r.from_entity == entity_id,
                Direction::Incoming => r.to_entity == entity_id,
                Direction::Both => r.from_entity == entity_id || r.to_entity == entity_id,
            })
            .count() as i64)
    }

    async fn related_map(
        &self,
        scope: &RequestScope,
        ids: &[EntityId],
    ) -> TrellisResult<HashMap<EntityId, HashMap<String, Vec<EntityId>>>> {
        Self::check_deadline(scope)?;
        let relationships = self.relationships.read().await;
        let mut edges: Vec<&Relationship> = relationships
            .values()
            .filter(|r| r.tenant_id == scope.tenant_id && ids.contains(&r.from_entity))
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut map: HashMap<EntityId, HashMap<String, Vec<EntityId>>> = HashMap::new();
        for edge in edges {
            map.entry(edge.from_entity)
                .or_default()
                .entry(edge.relationship_type.clone())
                .or_default()
                .push(edge.to_entity);
        }
        Ok(map)
    }
}

// ============================================================================
// EVENT STORE
// ============================================================================

#[async_trait]
impl EventStore for MemoryStore {
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
        matched.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));

        let offset = options.offset.unwrap_or(0).max(0) as usize;
        let matched = matched.into_iter().skip(offset);
        Ok(match options.limit {
            Some(limit) => matched.take(limit.max(0) as usize).collect(),
            None => matched.collect(),
        })
    }
}

// ============================================================================
// SCHEMA REGISTRY
// ============================================================================

#[async_trait]
impl SchemaRegistry for MemoryStore {
    async fn register_type_schema(&self, schema: &TypeSchema) -> TrellisResult<()> {
        self.type_schemas
            .insert(schema.type_path.as_str().to_string(), schema.clone());
        Ok(())
    }

    async fn register_relationship_schema(
        &self,
        schema: &RelationshipSchema,
    ) -> TrellisResult<()> {
        self.relationship_schemas
            .insert(schema.relationship_type.clone(), schema.clone());
        Ok(())
    }

    fn relationship_schema(&self, relationship_type: &str) -> Option<RelationshipSchema> {
        self.relationship_schemas
            .get(relationship_type)
            .map(|entry| entry.value().clone())
    }

    fn type_schema(&self, path: &TypePath) -> Option<TypeSchema> {
        self.type_schemas
            .get(path.as_str())
            .map(|entry| entry.value().clone())
    }
}
