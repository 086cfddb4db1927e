//! Relationship structures and schemas

use crate::{ActorId, EntityId, RelationshipId, TenantId, Timestamp, TypePath, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// RELATIONSHIP
// ============================================================================

/// A directed, typed, tenant-scoped edge between two entities.
///
/// `(tenant_id, type, from_entity, to_entity)` is unique; self-loops are
/// rejected at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: Timestamp,
    pub created_by: ActorId,
}

/// Direction selector for relationship listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

// ============================================================================
// RELATIONSHIP SCHEMA
// ============================================================================

/// Cardinality constraint on a relationship type, read `from_to`: a
/// `many_to_one` relationship allows each `from` entity at most one edge of
/// this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "one_to_one",
            Cardinality::OneToMany => "one_to_many",
            Cardinality::ManyToOne => "many_to_one",
            Cardinality::ManyToMany => "many_to_many",
        }
    }

    /// Whether each `from` entity is limited to a single edge.
    pub fn limits_from(&self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }

    /// Whether each `to` entity is limited to a single edge.
    pub fn limits_to(&self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::OneToMany)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registered shape of a relationship type. Creation of a relationship is
/// validated against the schema for its type: endpoint type paths,
/// cardinality, and (for bidirectional schemas) the inverse type that gets
/// created and deleted in lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSchema {
    #[serde(rename = "type")]
    pub relationship_type: String,
    /// Allowed type paths for the `from` endpoint; empty means any.
    #[serde(default)]
    pub from_types: Vec<TypePath>,
    /// Allowed type paths for the `to` endpoint; empty means any.
    #[serde(default)]
    pub to_types: Vec<TypePath>,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_type: Option<String>,
}

impl RelationshipSchema {
    /// Whether `path` is acceptable for the `from` endpoint.
    pub fn allows_from(&self, path: &TypePath) -> bool {
        self.from_types.is_empty() || self.from_types.iter().any(|t| path.starts_with_path(t.as_str()))
    }

    /// Whether `path` is acceptable for the `to` endpoint.
    pub fn allows_to(&self, path: &TypePath) -> bool {
        self.to_types.is_empty() || self.to_types.iter().any(|t| path.starts_with_path(t.as_str()))
    }
}

/// Opaque entity type registration, supplied by the product loader at
/// startup. The kernel stores the definition verbatim; validating and
/// interpreting it is the product layer's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    pub type_path: TypePath,
    pub definition: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardinality_limits() {
        assert!(Cardinality::ManyToOne.limits_from());
        assert!(!Cardinality::ManyToOne.limits_to());
        assert!(Cardinality::OneToMany.limits_to());
        assert!(Cardinality::OneToOne.limits_from());
        assert!(Cardinality::OneToOne.limits_to());
        assert!(!Cardinality::ManyToMany.limits_from());
        assert!(!Cardinality::ManyToMany.limits_to());
    }

    #[test]
    fn test_schema_endpoint_matching() {
        let schema = RelationshipSchema {
            relationship_type: "belongs_to".to_string(),
            from_types: vec![TypePath::parse("product").expect("valid")],
            to_types: vec![TypePath::parse("category").expect("valid")],
            cardinality: Cardinality::ManyToOne,
            bidirectional: false,
            inverse_type: None,
        };

        assert!(schema.allows_from(&TypePath::parse("product").expect("valid")));
        assert!(schema.allows_from(&TypePath::parse("product.variant").expect("valid")));
        assert!(!schema.allows_from(&TypePath::parse("category").expect("valid")));
        assert!(schema.allows_to(&TypePath::parse("category").expect("valid")));
    }

    #[test]
    fn test_empty_endpoint_lists_allow_any() {
        let schema = RelationshipSchema {
            relationship_type: "related_to".to_string(),
            from_types: vec![],
            to_types: vec![],
            cardinality: Cardinality::ManyToMany,
            bidirectional: false,
            inverse_type: None,
        };
        assert!(schema.allows_from(&TypePath::parse("anything").expect("valid")));
    }
}
