//! Entity and relationship services
//!
//! The validated mutation paths: expand property inputs, diff properties,
//! enforce relationship schemas, produce the event batch, commit it with
//! the row change, keep the dependent index current, and emit. Everything
//! the HTTP layer does is a thin mapping over these.

use crate::compute::{ComputationService, RefreshOptions};
use crate::dependents::DependentIndex;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use trellis_core::{
    is_valid_name, ChangeType, Direction, Entity, EntityCreatedPayload, EntityDeletedPayload,
    EntityId, EntityUpdatedPayload, EventRecord, EventType, KernelConfig, Property,
    PropertyChangedPayload, PropertyInput, QueryPage, QueryRequest, RecordIdType, Relationship,
    RelationshipId, RelationshipPayload, RelationshipSchema, RequestScope, StorageError,
    Timestamp, TrellisError, TrellisResult, TypePath, ValidationError, Value,
};
use trellis_events::{EmitOptions, EventEmitter};
use trellis_expr::{extract_dependencies, parse};
use trellis_storage::{Backend, EntityStore, RelationshipStore, SchemaRegistry};

// ============================================================================
// REQUEST SHAPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEntityRequest {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntityRequest {
    /// The version the client read; the optimistic lock predicate.
    pub version: i64,
    #[serde(default)]
    pub set_properties: Option<BTreeMap<String, PropertyInput>>,
    #[serde(default)]
    pub remove_properties: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub resolve_inherited: bool,
    pub evaluate_computed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRelationshipRequest {
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, Value>>,
}

// ============================================================================
// ENTITY SERVICE
// ============================================================================

pub struct EntityService {
    backend: Arc<dyn Backend>,
    emitter: Arc<EventEmitter>,
    index: Arc<DependentIndex>,
    compute: Arc<ComputationService>,
    config: KernelConfig,
}

impl EntityService {
    pub fn new(
        backend: Arc<dyn Backend>,
        emitter: Arc<EventEmitter>,
        index: Arc<DependentIndex>,
        compute: Arc<ComputationService>,
        config: KernelConfig,
    ) -> Self {
        Self {
            backend,
            emitter,
            index,
            compute,
            config,
        }
    }

    pub async fn create(
        &self,
        scope: &RequestScope,
        request: CreateEntityRequest,
    ) -> TrellisResult<Entity> {
        let entity_type = TypePath::parse(&request.entity_type).map_err(|reason| {
            ValidationError::InvalidValue {
                field: "type".to_string(),
                reason,
            }
        })?;

        let now = Utc::now();
        let mut properties = BTreeMap::new();
        for (name, input) in request.properties {
            properties.insert(name.clone(), expand_input(&name, input, now)?);
        }

        let entity = Entity {
            id: EntityId::now_v7(),
            tenant_id: scope.tenant_id,
            entity_type: entity_type.clone(),
            properties,
            version: 1,
            created_at: now,
            updated_at: now,
            created_by: scope.actor_id,
            deleted_at: None,
        };

        let mut events = vec![event(
            scope,
            EventType::EntityCreated,
            Some(entity.id),
            now,
            &EntityCreatedPayload {
                entity_type: entity_type.clone(),
                properties: entity.properties.clone(),
                version: 1,
            },
        )?];
        for (name, property) in &entity.properties {
            events.push(event(
                scope,
                EventType::PropertyChanged,
                Some(entity.id),
                now,
                &PropertyChangedPayload {
                    entity_type: entity_type.clone(),
                    property_name: name.clone(),
                    change_type: ChangeType::Added,
                    previous: None,
                    current: property.effective_value().cloned(),
                },
            )?);
        }

        self.backend.insert_entity(scope, &entity, &events).await?;
        self.index.index_entity(&entity);
        self.emitter
            .emit_all(
                &events,
                EmitOptions {
                    skip_persist: true,
                    skip_handlers: false,
                },
            )
            .await?;
        info!(
            tenant_id = %scope.tenant_id,
            entity_id = %entity.id,
            entity_type = %entity.entity_type,
            "entity created"
        );

        if self.config.evaluate_on_write {
            return self
                .compute
                .refresh_entity(scope, entity, RefreshOptions::default())
                .await;
        }
        Ok(entity)
    }

    pub async fn get(
        &self,
        scope: &RequestScope,
        id: EntityId,
        options: GetOptions,
    ) -> TrellisResult<Entity> {
        let entity = self
            .backend
            .fetch_entity(scope, id)
            .await?
            .ok_or_else(|| TrellisError::not_found("entity", id))?;

        if options.resolve_inherited || options.evaluate_computed {
            return self
                .compute
                .refresh_entity(
                    scope,
                    entity,
                    RefreshOptions {
                        computed: options.evaluate_computed,
                        inherited: options.resolve_inherited,
                        only_invalid: true,
                    },
                )
                .await;
        }
        Ok(entity)
    }

    pub async fn update(
        &self,
        scope: &RequestScope,
        id: EntityId,
        request: UpdateEntityRequest,
    ) -> TrellisResult<Entity> {
        let current = self
            .backend
            .fetch_entity(scope, id)
            .await?
            .ok_or_else(|| TrellisError::not_found("entity", id))?;
        if current.version != request.version {
            return Err(StorageError::VersionConflict {
                expected: request.version,
                actual: current.version,
            }
            .into());
        }

        let now = Utc::now();
        let mut properties = current.properties.clone();
        let mut property_events: Vec<EventRecord> = Vec::new();
        let mut changed_names: Vec<String> = Vec::new();
        let mut removed_names: Vec<String> = Vec::new();

        for name in request.remove_properties.unwrap_or_default() {
            if let Some(previous) = properties.remove(&name) {
                property_events.push(event(
                    scope,
                    EventType::PropertyChanged,
                    Some(id),
                    now,
                    &PropertyChangedPayload {
                        entity_type: current.entity_type.clone(),
                        property_name: name.clone(),
                        change_type: ChangeType::Removed,
                        previous: previous.effective_value().cloned(),
                        current: None,
                    },
                )?);
                removed_names.push(name);
            }
        }

        for (name, input) in request.set_properties.unwrap_or_default() {
            let property = expand_input(&name, input, now)?;
            let previous = properties.insert(name.clone(), property.clone());
            property_events.push(event(
                scope,
                EventType::PropertyChanged,
                Some(id),
                now,
                &PropertyChangedPayload {
                    entity_type: current.entity_type.clone(),
                    property_name: name.clone(),
                    change_type: if previous.is_some() {
                        ChangeType::Modified
                    } else {
                        ChangeType::Added
                    },
                    previous: previous.as_ref().and_then(|p| p.effective_value()).cloned(),
                    current: property.effective_value().cloned(),
                },
            )?);
            changed_names.push(name);
        }

        let updated = Entity {
            properties,
            version: current.version + 1,
            updated_at: now,
            ..current.clone()
        };

        let mut events = vec![event(
            scope,
            EventType::EntityUpdated,
            Some(id),
            now,
            &EntityUpdatedPayload {
                entity_type: current.entity_type.clone(),
                previous_version: current.version,
                new_version: updated.version,
                changed_properties: changed_names,
                removed_properties: removed_names,
            },
        )?];
        events.extend(property_events);

        self.backend
            .update_entity(scope, &updated, request.version, &events)
            .await?;
        self.index.index_entity(&updated);
        self.emitter
            .emit_all(
                &events,
                EmitOptions {
                    skip_persist: true,
                    skip_handlers: false,
                },
            )
            .await?;
        info!(
            tenant_id = %scope.tenant_id,
            entity_id = %id,
            version = updated.version,
            "entity updated"
        );

        if self.config.evaluate_on_write {
            // The staleness handler ran synchronously during emit; pick up
            // the marks it wrote before re-evaluating.
            let fresh = self
                .backend
                .fetch_entity(scope, id)
                .await?
                .unwrap_or(updated);
            return self
                .compute
                .refresh_entity(scope, fresh, RefreshOptions::default())
                .await;
        }
        Ok(updated)
    }

    pub async fn delete(
        &self,
        scope: &RequestScope,
        id: EntityId,
        hard_delete: bool,
    ) -> TrellisResult<()> {
        let current = self
            .backend
            .fetch_entity(scope, id)
            .await?
            .ok_or_else(|| TrellisError::not_found("entity", id))?;
        let now = Utc::now();

        let final_version = if hard_delete {
            current.version
        } else {
            current.version + 1
        };
        let mut events = vec![event(
            scope,
            EventType::EntityDeleted,
            Some(id),
            now,
            &EntityDeletedPayload {
                entity_type: current.entity_type.clone(),
                final_version,
                hard_delete,
                final_properties: current.properties.clone(),
            },
        )?];

        if hard_delete {
            // Removing the row cascades to its relationships; record each.
            let relationships = self
                .backend
                .list_relationships(scope, id, None, Direction::Both)
                .await?;
            for relationship in &relationships {
                events.push(relationship_event(
                    scope,
                    EventType::RelationshipDeleted,
                    relationship,
                    now,
                )?);
            }
            self.backend.hard_delete_entity(scope, id, &events).await?;
        } else {
            self.backend
                .soft_delete_entity(scope, id, now, &events)
                .await?;
        }

        self.index.remove_entity(scope.tenant_id, id);
        self.emitter
            .emit_all(
                &events,
                EmitOptions {
                    skip_persist: true,
                    skip_handlers: false,
                },
            )
            .await?;
        info!(
            tenant_id = %scope.tenant_id,
            entity_id = %id,
            hard_delete,
            "entity deleted"
        );
        Ok(())
    }

    pub async fn query(
        &self,
        scope: &RequestScope,
        request: &QueryRequest,
    ) -> TrellisResult<QueryPage> {
        self.backend.query_entities(scope, request).await
    }
}

/// Expand an API property input into a stored property, extracting
/// dependencies for computed expressions.
fn expand_input(
    name: &str,
    input: PropertyInput,
    now: Timestamp,
) -> TrellisResult<Property> {
    if !is_valid_name(name) {
        return Err(ValidationError::InvalidValue {
            field: "properties".to_string(),
            reason: format!("'{}' is not a valid property name", name),
        }
        .into());
    }
    let dependencies = match input.expression() {
        Some(expression) => {
            let expr = parse(expression)?;
            extract_dependencies(&expr)
        }
        None => Vec::new(),
    };
    Ok(input.expand(now, dependencies))
}

fn event<P: Serialize>(
    scope: &RequestScope,
    event_type: EventType,
    entity_id: Option<EntityId>,
    occurred_at: Timestamp,
    payload: &P,
) -> TrellisResult<EventRecord> {
    let payload = serde_json::to_value(payload).map_err(|e| StorageError::Internal {
        reason: format!("event payload serialization failed: {}", e),
    })?;
    Ok(EventRecord::new(
        scope.tenant_id,
        event_type,
        entity_id,
        scope.actor_id,
        occurred_at,
        payload,
    ))
}

fn relationship_event(
    scope: &RequestScope,
    event_type: EventType,
    relationship: &Relationship,
    occurred_at: Timestamp,
) -> TrellisResult<EventRecord> {
    event(
        scope,
        event_type,
        Some(relationship.from_entity),
        occurred_at,
        &RelationshipPayload {
            relationship_id: relationship.id,
            relationship_type: relationship.relationship_type.clone(),
            from_entity: relationship.from_entity,
            to_entity: relationship.to_entity,
            metadata: (!relationship.metadata.is_empty())
                .then(|| relationship.metadata.clone()),
        },
    )
}

// ============================================================================
// RELATIONSHIP SERVICE
// ============================================================================

pub struct RelationshipService {
    backend: Arc<dyn Backend>,
    emitter: Arc<EventEmitter>,
}

impl RelationshipService {
    pub fn new(backend: Arc<dyn Backend>, emitter: Arc<EventEmitter>) -> Self {
        Self { backend, emitter }
    }

    pub async fn create(
        &self,
        scope: &RequestScope,
        request: CreateRelationshipRequest,
    ) -> TrellisResult<Relationship> {
        let schema = self
            .backend
            .relationship_schema(&request.relationship_type)
            .ok_or_else(|| ValidationError::SchemaNotRegistered {
                relationship_type: request.relationship_type.clone(),
            })?;

        if request.from_entity == request.to_entity {
            return Err(ValidationError::SelfReference {
                entity_id: request.from_entity,
            }
            .into());
        }

        // Both endpoints must exist, live, in this tenant; the error names
        // the offending field.
        let from = self
            .backend
            .fetch_entity(scope, request.from_entity)
            .await?
            .ok_or_else(|| TrellisError::not_found("from_entity", request.from_entity))?;
        let to = self
            .backend
            .fetch_entity(scope, request.to_entity)
            .await?
            .ok_or_else(|| TrellisError::not_found("to_entity", request.to_entity))?;

        if !schema.allows_from(&from.entity_type) {
            return Err(endpoint_type_error("from_entity", &from.entity_type, &schema));
        }
        if !schema.allows_to(&to.entity_type) {
            return Err(endpoint_type_error("to_entity", &to.entity_type, &schema));
        }

        if self
            .backend
            .find_relationship(
                scope,
                &request.relationship_type,
                request.from_entity,
                request.to_entity,
            )
            .await?
            .is_some()
        {
            return Err(StorageError::AlreadyExists {
                kind: "relationship",
                id: format!(
                    "{} {} -> {}",
                    request.relationship_type, request.from_entity, request.to_entity
                ),
            }
            .into());
        }

        self.enforce_cardinality(scope, &schema, request.from_entity, request.to_entity)
            .await?;

        let now = Utc::now();
        let mut primary = Relationship {
            id: RelationshipId::now_v7(),
            tenant_id: scope.tenant_id,
            relationship_type: request.relationship_type.clone(),
            from_entity: request.from_entity,
            to_entity: request.to_entity,
            metadata: request.metadata.unwrap_or_default(),
            created_at: now,
            created_by: scope.actor_id,
        };

        let mut rows = Vec::with_capacity(2);
        if schema.bidirectional {
            let inverse_type = schema.inverse_type.clone().ok_or_else(|| {
                ValidationError::InvalidValue {
                    field: "inverse_type".to_string(),
                    reason: format!(
                        "bidirectional schema '{}' has no inverse type",
                        schema.relationship_type
                    ),
                }
            })?;
            let mut inverse = Relationship {
                id: RelationshipId::now_v7(),
                tenant_id: scope.tenant_id,
                relationship_type: inverse_type,
                from_entity: request.to_entity,
                to_entity: request.from_entity,
                metadata: BTreeMap::new(),
                created_at: now,
                created_by: scope.actor_id,
            };
            // Pair the rows so that deleting either side finds the other.
            primary
                .metadata
                .insert("paired_with".to_string(), Value::text(inverse.id.to_string()));
            inverse
                .metadata
                .insert("paired_with".to_string(), Value::text(primary.id.to_string()));
            rows.push(primary.clone());
            rows.push(inverse);
        } else {
            rows.push(primary.clone());
        }

        let events: Vec<EventRecord> = rows
            .iter()
            .map(|r| relationship_event(scope, EventType::RelationshipCreated, r, now))
            .collect::<TrellisResult<_>>()?;

        self.backend
            .insert_relationships(scope, &rows, &events)
            .await?;
        self.emitter
            .emit_all(
                &events,
                EmitOptions {
                    skip_persist: true,
                    skip_handlers: false,
                },
            )
            .await?;
        info!(
            tenant_id = %scope.tenant_id,
            relationship_id = %primary.id,
            relationship_type = %primary.relationship_type,
            "relationship created"
        );
        Ok(primary)
    }

    async fn enforce_cardinality(
        &self,
        scope: &RequestScope,
        schema: &RelationshipSchema,
        from_entity: EntityId,
        to_entity: EntityId,
    ) -> TrellisResult<()> {
        if schema.cardinality.limits_from() {
            let existing = self
                .backend
                .count_relationships(
                    scope,
                    &schema.relationship_type,
                    from_entity,
                    Direction::Outgoing,
                )
                .await?;
            if existing > 0 {
                return Err(cardinality_error(schema));
            }
        }
        if schema.cardinality.limits_to() {
            let existing = self
                .backend
                .count_relationships(
                    scope,
                    &schema.relationship_type,
                    to_entity,
                    Direction::Incoming,
                )
                .await?;
            if existing > 0 {
                return Err(cardinality_error(schema));
            }
        }
        Ok(())
    }

    pub async fn delete(&self, scope: &RequestScope, id: RelationshipId) -> TrellisResult<()> {
        let relationship = self
            .backend
            .fetch_relationship(scope, id)
            .await?
            .ok_or_else(|| TrellisError::not_found("relationship", id))?;

        let now = Utc::now();
        let mut ids = vec![relationship.id];
        let mut events = vec![relationship_event(
            scope,
            EventType::RelationshipDeleted,
            &relationship,
            now,
        )?];

        // A bidirectional pair dies together, whichever side was deleted.
        if let Some(paired) = relationship
            .metadata
            .get("paired_with")
            .and_then(Value::as_text)
            .and_then(|s| s.parse::<RelationshipId>().ok())
        {
            if let Some(inverse) = self.backend.fetch_relationship(scope, paired).await? {
                ids.push(inverse.id);
                events.push(relationship_event(
                    scope,
                    EventType::RelationshipDeleted,
                    &inverse,
                    now,
                )?);
            }
        }

        self.backend
            .delete_relationships(scope, &ids, &events)
            .await?;
        self.emitter
            .emit_all(
                &events,
                EmitOptions {
                    skip_persist: true,
                    skip_handlers: false,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list(
        &self,
        scope: &RequestScope,
        entity_id: EntityId,
        relationship_type: Option<&str>,
        direction: Direction,
    ) -> TrellisResult<Vec<Relationship>> {
        self.backend
            .list_relationships(scope, entity_id, relationship_type, direction)
            .await
    }
}

fn endpoint_type_error(
    field: &str,
    actual: &TypePath,
    schema: &RelationshipSchema,
) -> TrellisError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        reason: format!(
            "entity type '{}' is not allowed by relationship schema '{}'",
            actual, schema.relationship_type
        ),
    }
    .into()
}

fn cardinality_error(schema: &RelationshipSchema) -> TrellisError {
    ValidationError::CardinalityViolation {
        relationship_type: schema.relationship_type.clone(),
        cardinality: schema.cardinality,
    }
    .into()
}
