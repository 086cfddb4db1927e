//! Tagged value model
//!
//! Every value carried by a property or produced by the expression engine is
//! tagged with its kind. The absence of a value ("null") is not a `Value`
//! variant; it is represented as `Option::<Value>::None` everywhere, which
//! keeps the "null is distinct from every tagged value" rule enforced by the
//! type system rather than by convention.

use crate::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// VALUE KIND
// ============================================================================

/// Discriminator for the value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Number,
    Text,
    Boolean,
    Datetime,
    Duration,
    Reference,
    List,
    Record,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Number => "number",
            ValueKind::Text => "text",
            ValueKind::Boolean => "boolean",
            ValueKind::Datetime => "datetime",
            ValueKind::Duration => "duration",
            ValueKind::Reference => "reference",
            ValueKind::List => "list",
            ValueKind::Record => "record",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// VALUE
// ============================================================================

/// A tagged value.
///
/// `datetime` carries an ISO-8601 / RFC-3339 string and `duration` an
/// ISO-8601 duration string; both are kept as text so that round-tripping
/// through JSON storage is lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Value {
    Number {
        value: f64,
    },
    Text {
        value: String,
    },
    Boolean {
        value: bool,
    },
    Datetime {
        value: String,
    },
    Duration {
        value: String,
    },
    Reference {
        value: EntityId,
    },
    List {
        /// Kind of the elements; `None` for the empty list.
        element: Option<ValueKind>,
        items: Vec<Value>,
    },
    Record {
        value: BTreeMap<String, Value>,
    },
}

impl Value {
    // ========================================================================
    // Constructors
    // ========================================================================

    pub fn number(value: f64) -> Self {
        Value::Number { value }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value::Text {
            value: value.into(),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Value::Boolean { value }
    }

    pub fn datetime(value: impl Into<String>) -> Self {
        Value::Datetime {
            value: value.into(),
        }
    }

    pub fn duration(value: impl Into<String>) -> Self {
        Value::Duration {
            value: value.into(),
        }
    }

    pub fn reference(value: EntityId) -> Self {
        Value::Reference { value }
    }

    /// Build a list, inferring the element kind from the first item.
    pub fn list(items: Vec<Value>) -> Self {
        let element = items.first().map(Value::kind);
        Value::List { element, items }
    }

    pub fn record(value: BTreeMap<String, Value>) -> Self {
        Value::Record { value }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Number { .. } => ValueKind::Number,
            Value::Text { .. } => ValueKind::Text,
            Value::Boolean { .. } => ValueKind::Boolean,
            Value::Datetime { .. } => ValueKind::Datetime,
            Value::Duration { .. } => ValueKind::Duration,
            Value::Reference { .. } => ValueKind::Reference,
            Value::List { .. } => ValueKind::List,
            Value::Record { .. } => ValueKind::Record,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number { value } => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text { value } => Some(value),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean { value } => Some(*value),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&str> {
        match self {
            Value::Datetime { value } => Some(value),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<EntityId> {
        match self {
            Value::Reference { value } => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List { items, .. } => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Record { value } => Some(value),
            _ => None,
        }
    }

    /// Render the value as text, for `CONCAT`-style coercion.
    pub fn display_text(&self) -> String {
        match self {
            Value::Number { value } => {
                if value.fract() == 0.0 && value.is_finite() && value.abs() < 1e15 {
                    format!("{}", *value as i64)
                } else {
                    format!("{}", value)
                }
            }
            Value::Text { value } => value.clone(),
            Value::Boolean { value } => value.to_string(),
            Value::Datetime { value } | Value::Duration { value } => value.clone(),
            Value::Reference { value } => value.to_string(),
            Value::List { items, .. } => {
                let parts: Vec<String> = items.iter().map(Value::display_text).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Record { value } => {
                let parts: Vec<String> = value
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.display_text()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
    }
}

/// Deep, kind-aware equality over optional values.
///
/// Two absent values are equal; an absent value never equals a tagged one.
/// Lists compare element-wise (element tags are ignored so an empty list
/// equals an empty list regardless of provenance); records compare by key
/// set and element-wise values; references compare by entity id only.
pub fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(a), Some(b)) => tagged_equal(a, b),
    }
}

fn tagged_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number { value: x }, Value::Number { value: y }) => x == y,
        (Value::Text { value: x }, Value::Text { value: y }) => x == y,
        (Value::Boolean { value: x }, Value::Boolean { value: y }) => x == y,
        (Value::Datetime { value: x }, Value::Datetime { value: y }) => x == y,
        (Value::Duration { value: x }, Value::Duration { value: y }) => x == y,
        (Value::Reference { value: x }, Value::Reference { value: y }) => x == y,
        (Value::List { items: x, .. }, Value::List { items: y, .. }) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| tagged_equal(a, b))
        }
        (Value::Record { value: x }, Value::Record { value: y }) => {
            x.len() == y.len()
                && x.iter().all(|(k, va)| {
                    y.get(k).map(|vb| tagged_equal(va, vb)).unwrap_or(false)
                })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordIdType;

    #[test]
    fn test_kind_tags() {
        assert_eq!(Value::number(1.0).kind(), ValueKind::Number);
        assert_eq!(Value::text("x").kind(), ValueKind::Text);
        assert_eq!(Value::boolean(true).kind(), ValueKind::Boolean);
        assert_eq!(Value::list(vec![]).kind(), ValueKind::List);
    }

    #[test]
    fn test_null_equality() {
        assert!(values_equal(None, None));
        let v = Value::number(1.0);
        assert!(!values_equal(None, Some(&v)));
        assert!(!values_equal(Some(&v), None));
    }

    #[test]
    fn test_cross_kind_inequality() {
        let n = Value::number(1.0);
        let t = Value::text("1");
        assert!(!values_equal(Some(&n), Some(&t)));
    }

    #[test]
    fn test_list_equality_elementwise() {
        let a = Value::list(vec![Value::number(1.0), Value::number(2.0)]);
        let b = Value::list(vec![Value::number(1.0), Value::number(2.0)]);
        let c = Value::list(vec![Value::number(2.0), Value::number(1.0)]);
        assert!(values_equal(Some(&a), Some(&b)));
        assert!(!values_equal(Some(&a), Some(&c)));
    }

    #[test]
    fn test_empty_list_equality_ignores_element_tag() {
        let a = Value::List {
            element: Some(ValueKind::Number),
            items: vec![],
        };
        let b = Value::List {
            element: None,
            items: vec![],
        };
        assert!(values_equal(Some(&a), Some(&b)));
    }

    #[test]
    fn test_record_equality_by_key_set() {
        let mut m1 = BTreeMap::new();
        m1.insert("a".to_string(), Value::number(1.0));
        let mut m2 = BTreeMap::new();
        m2.insert("a".to_string(), Value::number(1.0));
        let mut m3 = BTreeMap::new();
        m3.insert("b".to_string(), Value::number(1.0));

        assert!(values_equal(
            Some(&Value::record(m1.clone())),
            Some(&Value::record(m2))
        ));
        assert!(!values_equal(
            Some(&Value::record(m1)),
            Some(&Value::record(m3))
        ));
    }

    #[test]
    fn test_reference_equality_by_id() {
        let id = EntityId::now_v7();
        assert!(values_equal(
            Some(&Value::reference(id)),
            Some(&Value::reference(id))
        ));
        assert!(!values_equal(
            Some(&Value::reference(id)),
            Some(&Value::reference(EntityId::now_v7()))
        ));
    }

    #[test]
    fn test_serde_tagged_shape() {
        let v = Value::number(10.0);
        let json = serde_json::to_value(&v).expect("serialize");
        assert_eq!(json["kind"], "number");
        assert_eq!(json["value"], 10.0);

        let back: Value = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, v);
    }

    #[test]
    fn test_display_text() {
        assert_eq!(Value::number(10.0).display_text(), "10");
        assert_eq!(Value::number(10.5).display_text(), "10.5");
        assert_eq!(Value::text("hi").display_text(), "hi");
        assert_eq!(Value::boolean(false).display_text(), "false");
    }
}
