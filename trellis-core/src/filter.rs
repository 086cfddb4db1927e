//! Query filter, sort, and pagination shapes

use crate::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ============================================================================
// FILTERS
// ============================================================================

/// Comparison operator of a filter atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    In,
    Contains,
    StartsWith,
    IsNull,
}

/// One atomic comparison: `property op value`.
///
/// `value` is plain JSON (the raw scalar, array for `in`, boolean for
/// `is_null`); the query builder compares it against the raw JSON stored
/// under the property's value paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub property: String,
    pub op: FilterOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

/// Connective of a filter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupLogic {
    And,
    Or,
}

/// A nested boolean combination of filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub logic: GroupLogic,
    pub conditions: Vec<Filter>,
}

/// A filter tree node: either a bare condition or a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Group(FilterGroup),
    Condition(FilterCondition),
}

// ============================================================================
// SORTING & PAGINATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub property: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// A query over entity storage: type filter, filter tree, sort order, and
/// either offset or cursor pagination (cursor wins when both are present).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QueryRequest {
    /// Exact type path, or a hierarchy pattern like `product.*`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default)]
    pub include_total: bool,
}

/// Pagination block of a query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub limit: i64,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// A page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    pub data: Vec<Entity>,
    pub pagination: PageInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_condition_deserializes() {
        let filter: Filter =
            serde_json::from_value(json!({"property": "price", "op": "gt", "value": 11}))
                .expect("deserialize");
        match filter {
            Filter::Condition(c) => {
                assert_eq!(c.property, "price");
                assert_eq!(c.op, FilterOp::Gt);
                assert_eq!(c.value, Some(json!(11)));
            }
            Filter::Group(_) => panic!("expected a bare condition"),
        }
    }

    #[test]
    fn test_nested_group_deserializes() {
        let filter: Filter = serde_json::from_value(json!({
            "logic": "or",
            "conditions": [
                {"property": "status", "op": "eq", "value": "active"},
                {
                    "logic": "and",
                    "conditions": [
                        {"property": "price", "op": "gte", "value": 10},
                        {"property": "price", "op": "lt", "value": 100}
                    ]
                }
            ]
        }))
        .expect("deserialize");
        match filter {
            Filter::Group(g) => {
                assert_eq!(g.logic, GroupLogic::Or);
                assert_eq!(g.conditions.len(), 2);
                assert!(matches!(g.conditions[1], Filter::Group(_)));
            }
            Filter::Condition(_) => panic!("expected a group"),
        }
    }

    #[test]
    fn test_query_request_defaults() {
        let req: QueryRequest = serde_json::from_value(json!({})).expect("deserialize");
        assert!(req.entity_type.is_none());
        assert!(!req.include_total);
    }
}
