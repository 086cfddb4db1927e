//! Storage traits
//!
//! The engine and API are written against these; implementations are the
//! PostgreSQL backend here and the in-memory backend in
//! `trellis-test-utils`.

use async_trait::async_trait;
use std::collections::HashMap;
use trellis_core::{
    Direction, Entity, EntityId, EventRecord, QueryPage, QueryRequest, Relationship,
    RelationshipId, RelationshipSchema, RequestScope, Timestamp, TrellisResult, TypePath,
    TypeSchema,
};
use trellis_events::EventStore;

/// Entity persistence.
///
/// Mutating operations take the event batch produced by the mutation and
/// commit it in the same transaction: either both land or neither does.
/// Reads exclude soft-deleted rows and anything outside the scope's tenant.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert a new entity (version 1) together with its events.
    async fn insert_entity(
        &self,
        scope: &RequestScope,
        entity: &Entity,
        events: &[EventRecord],
    ) -> TrellisResult<()>;

    /// Fetch a live entity by id. Cross-tenant and soft-deleted lookups
    /// return `None`.
    async fn fetch_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
    ) -> TrellisResult<Option<Entity>>;

    /// Batch fetch of live entities; silently omits anything unreachable.
    async fn fetch_entities(
        &self,
        scope: &RequestScope,
        ids: &[EntityId],
    ) -> TrellisResult<Vec<Entity>>;

    /// Persist a new snapshot of an entity under the optimistic lock:
    /// `entity.version` must be `expected_version + 1`, and the row is only
    /// written if its stored version still equals `expected_version`.
    /// Fails with `VERSION_CONFLICT { expected, actual }` otherwise.
    async fn update_entity(
        &self,
        scope: &RequestScope,
        entity: &Entity,
        expected_version: i64,
        events: &[EventRecord],
    ) -> TrellisResult<()>;

    /// Soft delete: set `deleted_at`, keep the row and the event trail.
    async fn soft_delete_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
        deleted_at: Timestamp,
        events: &[EventRecord],
    ) -> TrellisResult<()>;

    /// Hard delete: remove the row and cascade its relationships; events
    /// (including the final `entity_deleted`) are retained.
    async fn hard_delete_entity(
        &self,
        scope: &RequestScope,
        id: EntityId,
        events: &[EventRecord],
    ) -> TrellisResult<()>;

    /// Low-level staleness mark: set a derived property's status to
    /// `stale` without bumping the version or producing an event (staleness
    /// cascades would otherwise amplify the log combinatorially). Returns
    /// whether a property was actually downgraded.
    async fn mark_property_stale(
        &self,
        scope: &RequestScope,
        id: EntityId,
        property: &str,
    ) -> TrellisResult<bool>;

    /// Filter/sort/paginate over live entities.
    async fn query_entities(
        &self,
        scope: &RequestScope,
        request: &QueryRequest,
    ) -> TrellisResult<QueryPage>;
}

/// Relationship persistence.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Insert one relationship - or two, when a bidirectional schema
    /// creates the inverse in the same transaction - plus their events.
    async fn insert_relationships(
        &self,
        scope: &RequestScope,
        relationships: &[Relationship],
        events: &[EventRecord],
    ) -> TrellisResult<()>;

    async fn fetch_relationship(
        &self,
        scope: &RequestScope,
        id: RelationshipId,
    ) -> TrellisResult<Option<Relationship>>;

    /// Delete a set of relationships (a bidirectional pair dies together)
    /// with their events.
    async fn delete_relationships(
        &self,
        scope: &RequestScope,
        ids: &[RelationshipId],
        events: &[EventRecord],
    ) -> TrellisResult<()>;

    /// List relationships touching an entity.
    async fn list_relationships(
        &self,
        scope: &RequestScope,
        entity_id: EntityId,
        relationship_type: Option<&str>,
        direction: Direction,
    ) -> TrellisResult<Vec<Relationship>>;

    /// Look up the unique `(type, from, to)` edge.
    async fn find_relationship(
        &self,
        scope: &RequestScope,
        relationship_type: &str,
        from_entity: EntityId,
        to_entity: EntityId,
    ) -> TrellisResult<Option<Relationship>>;

    /// Count edges of a type at one endpoint (cardinality enforcement).
    /// `Outgoing` counts edges leaving the entity, `Incoming` edges
    /// arriving at it.
    async fn count_relationships(
        &self,
        scope: &RequestScope,
        relationship_type: &str,
        entity_id: EntityId,
        direction: Direction,
    ) -> TrellisResult<i64>;

    /// Outgoing adjacency for a set of entities, grouped by relationship
    /// type, in creation order. This is the shape the evaluator's
    /// relationship cache wants.
    async fn related_map(
        &self,
        scope: &RequestScope,
        ids: &[EntityId],
    ) -> TrellisResult<HashMap<EntityId, HashMap<String, Vec<EntityId>>>>;
}

/// Registry of entity type and relationship schemas, populated by the
/// product loader at startup. Registration persists; lookups are served
/// from an in-memory cache (schemas are product-level, not tenant-scoped).
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn register_type_schema(&self, schema: &TypeSchema) -> TrellisResult<()>;

    async fn register_relationship_schema(
        &self,
        schema: &RelationshipSchema,
    ) -> TrellisResult<()>;

    fn relationship_schema(&self, relationship_type: &str) -> Option<RelationshipSchema>;

    fn type_schema(&self, path: &TypePath) -> Option<TypeSchema>;
}

/// The full storage surface the engine needs.
pub trait Backend: EntityStore + RelationshipStore + SchemaRegistry + EventStore {}

impl<T: EntityStore + RelationshipStore + SchemaRegistry + EventStore> Backend for T {}
