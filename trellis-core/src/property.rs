//! Property variants and computed-property dependency paths

use crate::{EntityId, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// PROPERTY STATUS
// ============================================================================

/// Cache status of a derived (inherited or computed) property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    /// The cached value reflects current inputs.
    Valid,
    /// An input changed since the cache was written.
    Stale,
    /// Never computed.
    Pending,
    /// The last evaluation failed; the error text is retained.
    Error,
}

// ============================================================================
// DEPENDENCY PATHS
// ============================================================================

/// The base entity of a dependency: the owning entity itself, or a specific
/// entity referenced by id.
///
/// Serialized as the string `"self"` or the UUID string, matching the wire
/// shape of property references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyRef {
    Current,
    Entity(EntityId),
}

impl Serialize for DependencyRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            DependencyRef::Current => serializer.serialize_str("self"),
            DependencyRef::Entity(id) => serializer.serialize_str(&id.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for DependencyRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "self" {
            Ok(DependencyRef::Current)
        } else {
            s.parse::<EntityId>()
                .map(DependencyRef::Entity)
                .map_err(serde::de::Error::custom)
        }
    }
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyRef::Current => write!(f, "self"),
            DependencyRef::Entity(id) => write!(f, "{}", id),
        }
    }
}

/// One unit of dependency for a computed property: which property, on which
/// entity, reached through which relationship chain.
///
/// Both the structured fields and the collapsed `path` string are kept; the
/// structured form drives the dependent index and batch loading, the string
/// shows up in logs and error details.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyPath {
    pub entity_ref: DependencyRef,
    pub relationships: Vec<String>,
    pub property: String,
    pub is_collection: bool,
    pub path: String,
}

impl DependencyPath {
    pub fn new(
        entity_ref: DependencyRef,
        relationships: Vec<String>,
        property: impl Into<String>,
        is_collection: bool,
    ) -> Self {
        let property = property.into();
        let path = Self::collapse(&entity_ref, &relationships, &property, is_collection);
        Self {
            entity_ref,
            relationships,
            property,
            is_collection,
            path,
        }
    }

    /// Dependency on a property of the owning entity itself.
    pub fn own(property: impl Into<String>) -> Self {
        Self::new(DependencyRef::Current, Vec::new(), property, false)
    }

    fn collapse(
        entity_ref: &DependencyRef,
        relationships: &[String],
        property: &str,
        is_collection: bool,
    ) -> String {
        let mut out = entity_ref.to_string();
        for rel in relationships {
            out.push('.');
            out.push_str(rel);
        }
        if is_collection {
            out.push_str("[*]");
        }
        out.push('.');
        out.push_str(property);
        out
    }

    /// True when the dependency traverses at least one relationship.
    pub fn traverses_relationships(&self) -> bool {
        !self.relationships.is_empty()
    }
}

// ============================================================================
// PROPERTY
// ============================================================================

/// A named, tagged value attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Property {
    /// User-supplied data.
    Literal { value: Value },

    /// An observation, optionally with uncertainty.
    Measured {
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uncertainty: Option<f64>,
        measured_at: Timestamp,
    },

    /// A value resolved from another entity's property, optionally
    /// overridden locally. The effective value is the override if present,
    /// else the cached resolution.
    Inherited {
        from_entity: EntityId,
        from_property: String,
        #[serde(
            rename = "override",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        override_value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolved_value: Option<Value>,
        status: PropertyStatus,
    },

    /// A value derived from an expression over other properties.
    Computed {
        expression: String,
        dependencies: Vec<DependencyPath>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cached_value: Option<Value>,
        status: PropertyStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
}

impl Property {
    pub fn literal(value: Value) -> Self {
        Property::Literal { value }
    }

    /// The cache status, for the derived variants.
    pub fn status(&self) -> Option<PropertyStatus> {
        match self {
            Property::Literal { .. } | Property::Measured { .. } => None,
            Property::Inherited { status, .. } | Property::Computed { status, .. } => Some(*status),
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, Property::Computed { .. })
    }

    pub fn is_inherited(&self) -> bool {
        matches!(self, Property::Inherited { .. })
    }

    /// The effective value as seen by the expression evaluator.
    ///
    /// Literal and measured properties yield their value. Inherited
    /// properties yield the override if present, else the cached resolution.
    /// Computed properties yield the cached value regardless of staleness
    /// (best effort; recomputation is the computation service's job).
    pub fn effective_value(&self) -> Option<&Value> {
        match self {
            Property::Literal { value } => Some(value),
            Property::Measured { value, .. } => Some(value),
            Property::Inherited {
                override_value,
                resolved_value,
                ..
            } => override_value.as_ref().or(resolved_value.as_ref()),
            Property::Computed { cached_value, .. } => cached_value.as_ref(),
        }
    }
}

// ============================================================================
// PROPERTY INPUT
// ============================================================================

/// The property shape accepted at the API boundary: no cache fields, no
/// status. The entity service expands inputs into full `Property` values
/// (derived variants start out `pending`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyInput {
    Literal {
        value: Value,
    },
    Measured {
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uncertainty: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measured_at: Option<Timestamp>,
    },
    Inherited {
        from_entity: EntityId,
        from_property: String,
        #[serde(
            rename = "override",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        override_value: Option<Value>,
    },
    Computed {
        expression: String,
    },
}

impl PropertyInput {
    /// Expand into a full `Property`.
    ///
    /// `dependencies` is only meaningful for the computed variant (the
    /// caller extracts it from the parsed expression) and is ignored for the
    /// others.
    pub fn expand(self, now: Timestamp, dependencies: Vec<DependencyPath>) -> Property {
        match self {
            PropertyInput::Literal { value } => Property::Literal { value },
            PropertyInput::Measured {
                value,
                uncertainty,
                measured_at,
            } => Property::Measured {
                value,
                uncertainty,
                measured_at: measured_at.unwrap_or(now),
            },
            PropertyInput::Inherited {
                from_entity,
                from_property,
                override_value,
            } => Property::Inherited {
                from_entity,
                from_property,
                override_value,
                resolved_value: None,
                status: PropertyStatus::Pending,
            },
            PropertyInput::Computed { expression } => Property::Computed {
                expression,
                dependencies,
                cached_value: None,
                status: PropertyStatus::Pending,
                last_error: None,
            },
        }
    }

    pub fn expression(&self) -> Option<&str> {
        match self {
            PropertyInput::Computed { expression } => Some(expression),
            _ => None,
        }
    }
}
