//! Fixture builders shared by the engine and API test suites

use chrono::Utc;
use std::collections::BTreeMap;
use trellis_core::{
    ActorId, Cardinality, Entity, EntityId, Property, PropertyInput, RecordIdType,
    RelationshipSchema, RequestScope, TenantId, TypePath, Value,
};

/// A fresh scope under a fresh tenant.
pub fn scope() -> RequestScope {
    RequestScope::new(TenantId::now_v7(), ActorId::now_v7())
}

/// A literal property input.
pub fn literal(value: Value) -> PropertyInput {
    PropertyInput::Literal { value }
}

/// A computed property input.
pub fn computed(expression: &str) -> PropertyInput {
    PropertyInput::Computed {
        expression: expression.to_string(),
    }
}

/// An entity snapshot with literal number properties, version 1.
pub fn entity(scope: &RequestScope, type_path: &str, props: &[(&str, f64)]) -> Entity {
    let mut properties = BTreeMap::new();
    for (name, n) in props {
        properties.insert(name.to_string(), Property::literal(Value::number(*n)));
    }
    let now = Utc::now();
    Entity {
        id: EntityId::now_v7(),
        tenant_id: scope.tenant_id,
        entity_type: TypePath::new_unchecked(type_path),
        properties,
        version: 1,
        created_at: now,
        updated_at: now,
        created_by: scope.actor_id,
        deleted_at: None,
    }
}

/// A plain many-to-many relationship schema with no endpoint restrictions.
pub fn open_schema(relationship_type: &str) -> RelationshipSchema {
    RelationshipSchema {
        relationship_type: relationship_type.to_string(),
        from_types: vec![],
        to_types: vec![],
        cardinality: Cardinality::ManyToMany,
        bidirectional: false,
        inverse_type: None,
    }
}

/// A many-to-one schema (each `from` entity gets at most one edge).
pub fn many_to_one_schema(relationship_type: &str) -> RelationshipSchema {
    RelationshipSchema {
        cardinality: Cardinality::ManyToOne,
        ..open_schema(relationship_type)
    }
}

/// A bidirectional one-to-many schema pair (`parent_of` / `child_of`
/// shaped).
pub fn bidirectional_schema(
    relationship_type: &str,
    inverse_type: &str,
) -> RelationshipSchema {
    RelationshipSchema {
        bidirectional: true,
        inverse_type: Some(inverse_type.to_string()),
        ..open_schema(relationship_type)
    }
}
