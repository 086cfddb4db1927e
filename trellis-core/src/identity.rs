//! Identity types for Trellis records

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID TYPE SYSTEM
// ============================================================================

/// Trait for type-safe record IDs.
///
/// Each kind of record has its own strongly-typed ID so that, for example, a
/// `TenantId` can never be passed where an `EntityId` is expected.
pub trait RecordIdType:
    Copy
    + Clone
    + Eq
    + PartialEq
    + Hash
    + fmt::Debug
    + fmt::Display
    + FromStr
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The name of the record kind (e.g., "tenant", "entity").
    const RECORD_NAME: &'static str;

    /// Create a new ID from a UUID.
    fn new(uuid: Uuid) -> Self;

    /// Get the underlying UUID.
    fn as_uuid(&self) -> Uuid;

    /// Create a nil (all zeros) ID.
    fn nil() -> Self {
        Self::new(Uuid::nil())
    }

    /// Create a new timestamp-sortable UUIDv7 ID.
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Error type for parsing record IDs from strings.
#[derive(Debug, Clone)]
pub struct RecordIdParseError {
    pub record_name: &'static str,
    pub input: String,
    pub source: uuid::Error,
}

impl fmt::Display for RecordIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to parse {} ID from '{}': {}",
            self.record_name, self.input, self.source
        )
    }
}

impl std::error::Error for RecordIdParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Macro to define a type-safe record ID newtype.
macro_rules! define_record_id {
    ($name:ident, $record:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl RecordIdType for $name {
            const RECORD_NAME: &'static str = $record;

            fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = RecordIdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s)
                    .map(Self::new)
                    .map_err(|e| RecordIdParseError {
                        record_name: Self::RECORD_NAME,
                        input: s.to_string(),
                        source: e,
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self::new(uuid)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                // Serialize transparently as UUID string
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                // Deserialize transparently from UUID
                Uuid::deserialize(deserializer).map(Self::new)
            }
        }
    };
}

// ============================================================================
// ID TYPES
// ============================================================================

define_record_id!(TenantId, "tenant", "Type-safe ID for tenants.");
define_record_id!(ActorId, "actor", "Type-safe ID for acting principals.");
define_record_id!(EntityId, "entity", "Type-safe ID for entities.");
define_record_id!(
    RelationshipId,
    "relationship",
    "Type-safe ID for relationships."
);
define_record_id!(EventId, "event", "Type-safe ID for event log records.");
define_record_id!(
    SubscriptionId,
    "subscription",
    "Type-safe ID for realtime subscriptions."
);

// ============================================================================
// OTHER IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

static TYPE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("valid pattern"));

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid pattern"));

/// A dotted entity type path, e.g. `product.variant`.
///
/// Paths form a hierarchy by prefix: `product` is an ancestor of
/// `product.variant`. Matching by prefix is how both the query engine and
/// the subscription fabric interpret type filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypePath(String);

impl TypePath {
    /// Parse and validate a type path.
    pub fn parse(s: &str) -> Result<Self, String> {
        if TYPE_PATH_RE.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("invalid type path: '{}'", s))
        }
    }

    /// Construct without validation. For trusted inputs (storage rows).
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when this path equals `prefix` or sits below it in the
    /// hierarchy (`product` covers `product.variant`).
    pub fn starts_with_path(&self, prefix: &str) -> bool {
        self.0 == prefix
            || (self.0.len() > prefix.len()
                && self.0.starts_with(prefix)
                && self.0.as_bytes()[prefix.len()] == b'.')
    }

    /// Match against a query type filter: either an exact path or a
    /// hierarchy pattern ending in `.*` (which also matches the bare prefix).
    pub fn matches_filter(&self, filter: &str) -> bool {
        match filter.strip_suffix(".*") {
            Some(prefix) => self.starts_with_path(prefix),
            None => self.0 == filter,
        }
    }
}

impl fmt::Display for TypePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check that a property or relationship name is a bare identifier.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_type_safety() {
        let tenant_id = TenantId::now_v7();
        let entity_id = EntityId::now_v7();

        // This would not compile if uncommented:
        // let _: TenantId = entity_id;

        assert_ne!(tenant_id.as_uuid(), entity_id.as_uuid());
    }

    #[test]
    fn test_record_id_display() {
        let id = EntityId::new(Uuid::nil());
        assert_eq!(
            format!("{:?}", id),
            "EntityId(00000000-0000-0000-0000-000000000000)"
        );
        assert_eq!(format!("{}", id), "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn test_record_id_from_str() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id: EntityId = uuid_str.parse().expect("valid UUID should parse");
        assert_eq!(id.to_string(), uuid_str);
    }

    #[test]
    fn test_record_id_parse_error() {
        let result: Result<TenantId, _> = "invalid".parse();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.record_name, "tenant");
        assert_eq!(err.input, "invalid");
    }

    #[test]
    fn test_record_id_serde() {
        let id = EntityId::now_v7();
        let json = serde_json::to_string(&id).expect("serialization should succeed");
        // Serializes as a bare UUID string, not an object
        assert!(json.starts_with('"'));
        assert!(json.ends_with('"'));

        let deserialized: EntityId =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_type_path_validation() {
        assert!(TypePath::parse("product").is_ok());
        assert!(TypePath::parse("product.variant").is_ok());
        assert!(TypePath::parse("product.variant.sku_v2").is_ok());
        assert!(TypePath::parse("Product").is_err());
        assert!(TypePath::parse("product.").is_err());
        assert!(TypePath::parse(".product").is_err());
        assert!(TypePath::parse("").is_err());
    }

    #[test]
    fn test_type_path_prefix_matching() {
        let path = TypePath::parse("product.variant").expect("valid");
        assert!(path.starts_with_path("product"));
        assert!(path.starts_with_path("product.variant"));
        assert!(!path.starts_with_path("prod"));
        assert!(!path.starts_with_path("product.variant.sku"));
    }

    #[test]
    fn test_type_path_filter_matching() {
        let parent = TypePath::parse("product").expect("valid");
        let child = TypePath::parse("product.variant").expect("valid");

        assert!(parent.matches_filter("product"));
        assert!(!child.matches_filter("product"));
        assert!(parent.matches_filter("product.*"));
        assert!(child.matches_filter("product.*"));
        assert!(!child.matches_filter("prod.*"));
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("price"));
        assert!(is_valid_name("_internal"));
        assert!(is_valid_name("unit_cost2"));
        assert!(!is_valid_name("unit-cost"));
        assert!(!is_valid_name("2cost"));
        assert!(!is_valid_name(""));
    }
}
