//! SQL query builder
//!
//! Pure compilation of a [`QueryRequest`] into parameterized SQL over the
//! `entities` table, plus an optional count query sharing the filter.
//!
//! Atoms against reserved columns compile to direct column comparisons;
//! atoms against arbitrary properties compile to a `COALESCE` over the JSON
//! paths a property's effective value can live at (`value`, `override`,
//! `cached_value`, `resolved_value`). Property names are validated as bare
//! identifiers before they are interpolated into JSON path literals, so no
//! user-controlled text ever reaches the SQL outside a parameter.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_postgres::types::ToSql;
use trellis_core::{
    is_valid_name, Entity, EntityId, Filter, FilterCondition, FilterOp, GroupLogic, QueryRequest,
    RecordIdType, SortDirection, SortSpec, TenantId, Timestamp, TrellisError, TrellisResult,
    ValidationError, Value,
};
use uuid::Uuid;

/// Default page size when the request does not specify one.
pub const DEFAULT_LIMIT: i64 = 50;

const SELECT_COLUMNS: &str =
    "id, tenant_id, type_path, properties, version, created_at, updated_at, created_by, deleted_at";

// ============================================================================
// PARAMETERS
// ============================================================================

/// A typed SQL parameter. The builder is pure; execution borrows these as
/// `&dyn ToSql` at call time.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Uuid(Uuid),
    Timestamp(Timestamp),
    Json(JsonValue),
}

impl SqlValue {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlValue::Text(v) => v,
            SqlValue::Int(v) => v,
            SqlValue::Float(v) => v,
            SqlValue::Bool(v) => v,
            SqlValue::Uuid(v) => v,
            SqlValue::Timestamp(v) => v,
            SqlValue::Json(v) => v,
        }
    }
}

/// One parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlQuery {
    /// Borrow the parameters in the slice shape tokio-postgres expects.
    pub fn sql_params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(SqlValue::as_sql).collect()
    }
}

/// A compiled entity query.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    /// The page select. Fetches `limit + 1` rows so the executor can detect
    /// `has_more` without a second round trip.
    pub select: SqlQuery,
    /// Count query sharing the filter but not sort/limit/cursor; present
    /// when `include_total` was requested.
    pub count: Option<SqlQuery>,
    /// Clamped page size.
    pub limit: i64,
    /// Effective row offset (zero under cursor pagination).
    pub offset: i64,
    /// The request's sort keys (without the implicit `id` tiebreaker);
    /// needed to encode the next cursor.
    pub sort: Vec<SortSpec>,
}

// ============================================================================
// CURSORS
// ============================================================================

/// Decoded cursor: the sort key values of the last row of the previous
/// page, plus its id as the total-order tiebreaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "s")]
    pub sort_values: Vec<JsonValue>,
    pub id: EntityId,
}

/// Encode a cursor as opaque base64 JSON.
pub fn encode_cursor(cursor: &Cursor) -> String {
    // Cursor serialization cannot fail: it is plain JSON values and a UUID.
    let bytes = serde_json::to_vec(cursor).unwrap_or_default();
    BASE64.encode(bytes)
}

/// Decode a cursor; garbage fails with `VALIDATION_ERROR`.
pub fn decode_cursor(encoded: &str) -> TrellisResult<Cursor> {
    let bytes = BASE64.decode(encoded).map_err(|e| bad_cursor(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| bad_cursor(e.to_string()))
}

fn bad_cursor(reason: String) -> TrellisError {
    ValidationError::InvalidValue {
        field: "cursor".to_string(),
        reason,
    }
    .into()
}

/// Build the cursor that resumes after `entity` under the given sort order.
pub fn cursor_for_entity(entity: &Entity, sort: &[SortSpec]) -> Cursor {
    let sort_values = sort
        .iter()
        .map(|key| match key.property.as_str() {
            "id" => JsonValue::String(entity.id.to_string()),
            "version" => JsonValue::from(entity.version),
            "created_at" => JsonValue::String(entity.created_at.to_rfc3339()),
            "updated_at" => JsonValue::String(entity.updated_at.to_rfc3339()),
            "created_by" => JsonValue::String(entity.created_by.to_string()),
            "type" => JsonValue::String(entity.entity_type.as_str().to_string()),
            name => entity
                .property(name)
                .and_then(|p| p.effective_value())
                .map(value_raw_json)
                .unwrap_or(JsonValue::Null),
        })
        .collect();
    Cursor {
        sort_values,
        id: entity.id,
    }
}

/// The raw JSON scalar stored under a value's `value` path; mirrors what
/// the SQL sort expressions see.
fn value_raw_json(value: &Value) -> JsonValue {
    match value {
        Value::Number { value } => serde_json::Number::from_f64(*value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Text { value } => JsonValue::String(value.clone()),
        Value::Boolean { value } => JsonValue::Bool(*value),
        Value::Datetime { value } | Value::Duration { value } => JsonValue::String(value.clone()),
        Value::Reference { value } => JsonValue::String(value.to_string()),
        // Collections are not meaningful sort keys.
        Value::List { .. } | Value::Record { .. } => JsonValue::Null,
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Compile a query request into SQL. `max_limit` caps the page size.
pub fn build_entity_query(
    tenant_id: TenantId,
    request: &QueryRequest,
    max_limit: i64,
) -> TrellisResult<BuiltQuery> {
    let mut params: Vec<SqlValue> = vec![SqlValue::Uuid(tenant_id.as_uuid())];
    let mut clauses: Vec<String> = vec!["tenant_id = $1".to_string(), "deleted_at IS NULL".to_string()];

    if let Some(type_filter) = &request.entity_type {
        render_type_filter(type_filter, &mut clauses, &mut params)?;
    }

    if let Some(filter) = &request.filter {
        let rendered = render_filter(filter, &mut params)?;
        clauses.push(rendered);
    }

    // Snapshot the filter-only state for the count query before pagination
    // predicates get appended.
    let count = if request.include_total {
        Some(SqlQuery {
            sql: format!(
                "SELECT COUNT(*) FROM entities WHERE {}",
                clauses.join(" AND ")
            ),
            params: params.clone(),
        })
    } else {
        None
    };

    let sort = request.sort.clone().unwrap_or_default();
    for key in &sort {
        // Validate every sort key up front so ORDER BY never sees an
        // unvetted name.
        sort_key_expr(&key.property)?;
    }

    // Cursor pagination wins over offset when both are present.
    let mut offset = request.offset.unwrap_or(0).max(0);
    if let Some(encoded) = &request.cursor {
        let cursor = decode_cursor(encoded)?;
        if cursor.sort_values.len() != sort.len() {
            return Err(bad_cursor(format!(
                "cursor carries {} sort values, query has {} sort keys",
                cursor.sort_values.len(),
                sort.len()
            )));
        }
        let predicate = render_cursor_predicate(&sort, &cursor, &mut params)?;
        clauses.push(predicate);
        offset = 0;
    }

    let limit = request
        .limit
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, max_limit.max(1));

    let mut order_terms: Vec<String> = Vec::with_capacity(sort.len() + 1);
    for key in &sort {
        let (expr, _) = sort_key_expr(&key.property)?;
        let dir = match key.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        order_terms.push(format!("{} {}", expr, dir));
    }
    // The id tiebreaker makes every sort a total order, which is what keeps
    // cursor pagination stable.
    if !sort.iter().any(|k| k.property == "id") {
        order_terms.push("id ASC".to_string());
    }

    let sql = format!(
        "SELECT {} FROM entities WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
        SELECT_COLUMNS,
        clauses.join(" AND "),
        order_terms.join(", "),
        limit + 1,
        offset
    );

    Ok(BuiltQuery {
        select: SqlQuery { sql, params },
        count,
        limit,
        offset,
        sort,
    })
}

fn render_type_filter(
    type_filter: &str,
    clauses: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
) -> TrellisResult<()> {
    match type_filter.strip_suffix(".*") {
        Some(prefix) => {
            validate_type_text(prefix)?;
            let exact = push(params, SqlValue::Text(prefix.to_string()));
            let pattern = push(params, SqlValue::Text(format!("{}.%", prefix)));
            clauses.push(format!(
                "(type_path = ${} OR type_path LIKE ${})",
                exact, pattern
            ));
        }
        None => {
            validate_type_text(type_filter)?;
            let n = push(params, SqlValue::Text(type_filter.to_string()));
            clauses.push(format!("type_path = ${}", n));
        }
    }
    Ok(())
}

fn validate_type_text(text: &str) -> TrellisResult<()> {
    trellis_core::TypePath::parse(text)
        .map(|_| ())
        .map_err(|reason| {
            ValidationError::InvalidValue {
                field: "type".to_string(),
                reason,
            }
            .into()
        })
}

// ============================================================================
// FILTER RENDERING
// ============================================================================

fn render_filter(filter: &Filter, params: &mut Vec<SqlValue>) -> TrellisResult<String> {
    match filter {
        Filter::Condition(condition) => render_condition(condition, params),
        Filter::Group(group) => {
            if group.conditions.is_empty() {
                return Ok("TRUE".to_string());
            }
            let connective = match group.logic {
                GroupLogic::And => " AND ",
                GroupLogic::Or => " OR ",
            };
            let parts: Vec<String> = group
                .conditions
                .iter()
                .map(|f| render_filter(f, params))
                .collect::<TrellisResult<_>>()?;
            Ok(format!("({})", parts.join(connective)))
        }
    }
}

fn render_condition(
    condition: &FilterCondition,
    params: &mut Vec<SqlValue>,
) -> TrellisResult<String> {
    match condition.property.as_str() {
        "id" | "created_by" => render_uuid_column(condition, params),
        "version" => render_version_column(condition, params),
        "created_at" | "updated_at" => render_timestamp_column(condition, params),
        "type" => render_type_column(condition, params),
        _ => render_property_condition(condition, params),
    }
}

fn render_uuid_column(
    condition: &FilterCondition,
    params: &mut Vec<SqlValue>,
) -> TrellisResult<String> {
    let column = column_name(&condition.property);
    let uuid = condition
        .value
        .as_ref()
        .and_then(JsonValue::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| bad_condition(&condition.property, "expected a UUID string"))?;
    let n = push(params, SqlValue::Uuid(uuid));
    match condition.op {
        FilterOp::Eq => Ok(format!("{} = ${}", column, n)),
        FilterOp::Neq => Ok(format!("{} <> ${}", column, n)),
        _ => Err(bad_condition(
            &condition.property,
            "only eq/neq are supported on id columns",
        )),
    }
}

fn render_version_column(
    condition: &FilterCondition,
    params: &mut Vec<SqlValue>,
) -> TrellisResult<String> {
    let op = comparison_sql(condition.op)
        .ok_or_else(|| bad_condition("version", "unsupported operator"))?;
    let value = condition
        .value
        .as_ref()
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| bad_condition("version", "expected an integer"))?;
    let n = push(params, SqlValue::Int(value));
    Ok(format!("version {} ${}", op, n))
}

fn render_timestamp_column(
    condition: &FilterCondition,
    params: &mut Vec<SqlValue>,
) -> TrellisResult<String> {
    let op = comparison_sql(condition.op)
        .ok_or_else(|| bad_condition(&condition.property, "unsupported operator"))?;
    let text = condition
        .value
        .as_ref()
        .and_then(JsonValue::as_str)
        .ok_or_else(|| bad_condition(&condition.property, "expected an RFC-3339 datetime"))?;
    let parsed = DateTime::parse_from_rfc3339(text)
        .map_err(|e| bad_condition(&condition.property, &e.to_string()))?;
    let n = push(
        params,
        SqlValue::Timestamp(parsed.with_timezone(&chrono::Utc)),
    );
    Ok(format!("{} {} ${}", column_name(&condition.property), op, n))
}

fn render_type_column(
    condition: &FilterCondition,
    params: &mut Vec<SqlValue>,
) -> TrellisResult<String> {
    let text = condition
        .value
        .as_ref()
        .and_then(JsonValue::as_str)
        .ok_or_else(|| bad_condition("type", "expected a type path string"))?;
    match condition.op {
        FilterOp::Eq => {
            let n = push(params, SqlValue::Text(text.to_string()));
            Ok(format!("type_path = ${}", n))
        }
        FilterOp::Neq => {
            let n = push(params, SqlValue::Text(text.to_string()));
            Ok(format!("type_path <> ${}", n))
        }
        FilterOp::StartsWith => {
            let n = push(params, SqlValue::Text(format!("{}%", like_escape(text))));
            Ok(format!("type_path LIKE ${}", n))
        }
        _ => Err(bad_condition("type", "unsupported operator")),
    }
}

fn render_property_condition(
    condition: &FilterCondition,
    params: &mut Vec<SqlValue>,
) -> TrellisResult<String> {
    let expr = property_expr(&condition.property)?;
    match condition.op {
        FilterOp::Eq => {
            let value = required_value(condition)?;
            let n = push(params, SqlValue::Json(value.clone()));
            Ok(format!("{} = ${}", expr, n))
        }
        FilterOp::Neq => {
            let value = required_value(condition)?;
            let n = push(params, SqlValue::Json(value.clone()));
            Ok(format!("{} IS DISTINCT FROM ${}", expr, n))
        }
        FilterOp::Lt | FilterOp::Gt | FilterOp::Lte | FilterOp::Gte => {
            let op = comparison_sql(condition.op).unwrap_or("=");
            match required_value(condition)? {
                JsonValue::Number(number) => {
                    let value = number
                        .as_f64()
                        .ok_or_else(|| bad_condition(&condition.property, "non-finite number"))?;
                    let n = push(params, SqlValue::Float(value));
                    Ok(format!("(({}) #>> '{{}}')::float8 {} ${}", expr, op, n))
                }
                JsonValue::String(text) => {
                    let n = push(params, SqlValue::Text(text.clone()));
                    Ok(format!("({} #>> '{{}}') {} ${}", expr, op, n))
                }
                _ => Err(bad_condition(
                    &condition.property,
                    "range operators need a number or string",
                )),
            }
        }
        FilterOp::In => {
            let value = required_value(condition)?;
            if !value.is_array() {
                return Err(bad_condition(&condition.property, "'in' needs an array"));
            }
            let n = push(params, SqlValue::Json(value.clone()));
            Ok(format!("{} IN (SELECT jsonb_array_elements(${}))", expr, n))
        }
        FilterOp::Contains => {
            let text = required_text(condition)?;
            let n = push(
                params,
                SqlValue::Text(format!("%{}%", like_escape(&text))),
            );
            Ok(format!("({} #>> '{{}}') LIKE ${}", expr, n))
        }
        FilterOp::StartsWith => {
            let text = required_text(condition)?;
            let n = push(params, SqlValue::Text(format!("{}%", like_escape(&text))));
            Ok(format!("({} #>> '{{}}') LIKE ${}", expr, n))
        }
        FilterOp::IsNull => {
            let wants_null = condition
                .value
                .as_ref()
                .and_then(JsonValue::as_bool)
                .unwrap_or(true);
            if wants_null {
                Ok(format!("{} IS NULL", expr))
            } else {
                Ok(format!("{} IS NOT NULL", expr))
            }
        }
    }
}

/// The effective-value expression for an arbitrary property: the first JSON
/// path that holds a value, across the property variants.
fn property_expr(name: &str) -> TrellisResult<String> {
    if !is_valid_name(name) {
        return Err(bad_condition(name, "not a valid property name"));
    }
    Ok(format!(
        "COALESCE(properties #> '{{{p},value,value}}', properties #> '{{{p},override,value}}', \
         properties #> '{{{p},cached_value,value}}', properties #> '{{{p},resolved_value,value}}')",
        p = name
    ))
}

/// Sort/cursor key: reserved column or property expression. The bool is
/// "compares as jsonb".
fn sort_key_expr(name: &str) -> TrellisResult<(String, bool)> {
    match name {
        "id" => Ok(("id".to_string(), false)),
        "version" => Ok(("version".to_string(), false)),
        "created_at" | "updated_at" => Ok((name.to_string(), false)),
        "created_by" => Ok(("created_by".to_string(), false)),
        "type" => Ok(("type_path".to_string(), false)),
        _ => Ok((property_expr(name)?, true)),
    }
}

/// Compile the "strictly after the cursor row" predicate: a lexicographic
/// OR-chain over the sort keys, directions honored per key, with the id
/// tiebreaker last.
fn render_cursor_predicate(
    sort: &[SortSpec],
    cursor: &Cursor,
    params: &mut Vec<SqlValue>,
) -> TrellisResult<String> {
    struct Key {
        expr: String,
        strict_op: &'static str,
        value: SqlValue,
    }

    let mut keys = Vec::with_capacity(sort.len() + 1);
    for (spec, raw) in sort.iter().zip(cursor.sort_values.iter()) {
        let (expr, as_json) = sort_key_expr(&spec.property)?;
        let value = if as_json {
            SqlValue::Json(raw.clone())
        } else {
            typed_cursor_value(&spec.property, raw)?
        };
        let strict_op = match spec.direction {
            SortDirection::Asc => ">",
            SortDirection::Desc => "<",
        };
        keys.push(Key {
            expr,
            strict_op,
            value,
        });
    }
    keys.push(Key {
        expr: "id".to_string(),
        strict_op: ">",
        value: SqlValue::Uuid(cursor.id.as_uuid()),
    });

    let mut alternatives = Vec::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        let mut conjuncts = Vec::with_capacity(i + 1);
        for prefix in &keys[..i] {
            let n = push(params, prefix.value.clone());
            conjuncts.push(format!("{} IS NOT DISTINCT FROM ${}", prefix.expr, n));
        }
        let n = push(params, key.value.clone());
        conjuncts.push(format!("{} {} ${}", key.expr, key.strict_op, n));
        alternatives.push(format!("({})", conjuncts.join(" AND ")));
    }

    Ok(format!("({})", alternatives.join(" OR ")))
}

/// Convert a cursor's JSON value back into the typed parameter a reserved
/// column compares against.
fn typed_cursor_value(property: &str, raw: &JsonValue) -> TrellisResult<SqlValue> {
    let result = match property {
        "version" => raw.as_i64().map(SqlValue::Int),
        "created_at" | "updated_at" => raw
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| SqlValue::Timestamp(t.with_timezone(&chrono::Utc))),
        "id" | "created_by" => raw
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(SqlValue::Uuid),
        "type" => raw.as_str().map(|s| SqlValue::Text(s.to_string())),
        _ => Some(SqlValue::Json(raw.clone())),
    };
    result.ok_or_else(|| bad_cursor(format!("cursor value for '{}' has the wrong type", property)))
}

// ============================================================================
// SMALL HELPERS
// ============================================================================

fn push(params: &mut Vec<SqlValue>, value: SqlValue) -> usize {
    params.push(value);
    params.len()
}

fn column_name(property: &str) -> &str {
    match property {
        "type" => "type_path",
        other => other,
    }
}

fn comparison_sql(op: FilterOp) -> Option<&'static str> {
    match op {
        FilterOp::Eq => Some("="),
        FilterOp::Neq => Some("<>"),
        FilterOp::Lt => Some("<"),
        FilterOp::Gt => Some(">"),
        FilterOp::Lte => Some("<="),
        FilterOp::Gte => Some(">="),
        _ => None,
    }
}

fn like_escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn required_value(condition: &FilterCondition) -> TrellisResult<&JsonValue> {
    condition
        .value
        .as_ref()
        .ok_or_else(|| bad_condition(&condition.property, "missing comparison value"))
}

fn required_text(condition: &FilterCondition) -> TrellisResult<String> {
    required_value(condition)?
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| bad_condition(&condition.property, "expected a string"))
}

fn bad_condition(property: &str, reason: &str) -> TrellisError {
    ValidationError::InvalidValue {
        field: format!("filter.{}", property),
        reason: reason.to_string(),
    }
    .into()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::{FilterGroup, RecordIdType};

    fn request(json: JsonValue) -> QueryRequest {
        serde_json::from_value(json).expect("valid request")
    }

    #[test]
    fn test_minimal_query_scopes_tenant_and_liveness() {
        let tenant = TenantId::now_v7();
        let built = build_entity_query(tenant, &QueryRequest::default(), 500).expect("build");
        assert!(built.select.sql.contains("tenant_id = $1"));
        assert!(built.select.sql.contains("deleted_at IS NULL"));
        assert!(built.select.sql.contains("ORDER BY id ASC"));
        assert!(built.select.sql.ends_with(&format!(
            "LIMIT {} OFFSET 0",
            DEFAULT_LIMIT + 1
        )));
        assert_eq!(built.select.params.len(), 1);
        assert!(built.count.is_none());
    }

    #[test]
    fn test_exact_type_filter() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"type": "product"})),
            500,
        )
        .expect("build");
        assert!(built.select.sql.contains("type_path = $2"));
    }

    #[test]
    fn test_hierarchy_type_filter() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"type": "product.*"})),
            500,
        )
        .expect("build");
        assert!(built
            .select
            .sql
            .contains("(type_path = $2 OR type_path LIKE $3)"));
        assert_eq!(
            built.select.params[2],
            SqlValue::Text("product.%".to_string())
        );
    }

    #[test]
    fn test_invalid_type_filter_rejected() {
        let err = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"type": "Product; DROP TABLE"})),
            500,
        )
        .expect_err("should fail");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_property_gt_filter_uses_coalesced_paths() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"filter": {"property": "price", "op": "gt", "value": 11}})),
            500,
        )
        .expect("build");
        let sql = &built.select.sql;
        assert!(sql.contains("properties #> '{price,value,value}'"));
        assert!(sql.contains("properties #> '{price,override,value}'"));
        assert!(sql.contains("properties #> '{price,cached_value,value}'"));
        assert!(sql.contains("properties #> '{price,resolved_value,value}'"));
        assert!(sql.contains("::float8 > $2"));
        assert_eq!(built.select.params[1], SqlValue::Float(11.0));
    }

    #[test]
    fn test_property_eq_compares_jsonb() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"filter": {"property": "name", "op": "eq", "value": "Widget"}})),
            500,
        )
        .expect("build");
        assert!(built.select.sql.contains("= $2"));
        assert_eq!(built.select.params[1], SqlValue::Json(json!("Widget")));
    }

    #[test]
    fn test_malicious_property_name_rejected() {
        let err = build_entity_query(
            TenantId::now_v7(),
            &request(
                json!({"filter": {"property": "price}')::int; --", "op": "eq", "value": 1}}),
            ),
            500,
        )
        .expect_err("should fail");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_nested_group_renders_connectives() {
        let filter = Filter::Group(FilterGroup {
            logic: GroupLogic::Or,
            conditions: vec![
                Filter::Condition(FilterCondition {
                    property: "status".to_string(),
                    op: FilterOp::Eq,
                    value: Some(json!("active")),
                }),
                Filter::Group(FilterGroup {
                    logic: GroupLogic::And,
                    conditions: vec![
                        Filter::Condition(FilterCondition {
                            property: "price".to_string(),
                            op: FilterOp::Gte,
                            value: Some(json!(10)),
                        }),
                        Filter::Condition(FilterCondition {
                            property: "price".to_string(),
                            op: FilterOp::Lt,
                            value: Some(json!(100)),
                        }),
                    ],
                }),
            ],
        });
        let built = build_entity_query(
            TenantId::now_v7(),
            &QueryRequest {
                filter: Some(filter),
                ..Default::default()
            },
            500,
        )
        .expect("build");
        let sql = &built.select.sql;
        assert!(sql.contains(" OR "));
        assert!(sql.contains(" AND "));
        assert!(sql.contains(">= $3"));
        assert!(sql.contains("< $4"));
    }

    #[test]
    fn test_reserved_column_conditions() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"filter": {
                "logic": "and",
                "conditions": [
                    {"property": "version", "op": "gte", "value": 3},
                    {"property": "created_at", "op": "lt", "value": "2026-01-01T00:00:00Z"}
                ]
            }})),
            500,
        )
        .expect("build");
        assert!(built.select.sql.contains("version >= $2"));
        assert!(built.select.sql.contains("created_at < $3"));
        assert_eq!(built.select.params[1], SqlValue::Int(3));
    }

    #[test]
    fn test_is_null_operator() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"filter": {"property": "discount", "op": "is_null", "value": true}})),
            500,
        )
        .expect("build");
        assert!(built.select.sql.contains("IS NULL"));

        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"filter": {"property": "discount", "op": "is_null", "value": false}})),
            500,
        )
        .expect("build");
        assert!(built.select.sql.contains("IS NOT NULL"));
    }

    #[test]
    fn test_contains_escapes_like_metacharacters() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"filter": {"property": "name", "op": "contains", "value": "100%_a"}})),
            500,
        )
        .expect("build");
        assert_eq!(
            built.select.params[1],
            SqlValue::Text("%100\\%\\_a%".to_string())
        );
    }

    #[test]
    fn test_limit_clamped_to_maximum() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"limit": 100000})),
            500,
        )
        .expect("build");
        assert_eq!(built.limit, 500);
        assert!(built.select.sql.contains("LIMIT 501"));
    }

    #[test]
    fn test_sort_appends_id_tiebreaker() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({"sort": [{"property": "price", "direction": "desc"}]})),
            500,
        )
        .expect("build");
        let order = built
            .select
            .sql
            .split("ORDER BY")
            .nth(1)
            .expect("order clause");
        assert!(order.contains("DESC"));
        assert!(order.contains("id ASC"));
    }

    #[test]
    fn test_count_query_shares_filter_not_pagination() {
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({
                "filter": {"property": "price", "op": "gt", "value": 1},
                "include_total": true,
                "limit": 10
            })),
            500,
        )
        .expect("build");
        let count = built.count.expect("count query");
        assert!(count.sql.starts_with("SELECT COUNT(*)"));
        assert!(!count.sql.contains("ORDER BY"));
        assert!(!count.sql.contains("LIMIT"));
        assert_eq!(count.params.len(), built.select.params.len());
    }

    #[test]
    fn test_cursor_round_trip() {
        let cursor = Cursor {
            sort_values: vec![json!(12.5), json!("Widget")],
            id: EntityId::now_v7(),
        };
        let encoded = encode_cursor(&cursor);
        let decoded = decode_cursor(&encoded).expect("decode");
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_garbage_cursor_rejected() {
        assert!(decode_cursor("not base64 !!!").is_err());
        let bytes = BASE64.encode(b"{\"nope\": 1}");
        assert!(decode_cursor(&bytes).is_err());
    }

    #[test]
    fn test_cursor_overrides_offset_and_emits_predicate() {
        let cursor = encode_cursor(&Cursor {
            sort_values: vec![json!(10)],
            id: EntityId::now_v7(),
        });
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({
                "sort": [{"property": "price", "direction": "asc"}],
                "cursor": cursor,
                "offset": 40
            })),
            500,
        )
        .expect("build");
        assert_eq!(built.offset, 0);
        assert!(built.select.sql.contains("OFFSET 0"));
        assert!(built.select.sql.contains("IS NOT DISTINCT FROM"));
        assert!(built.select.sql.contains("id > $"));
    }

    #[test]
    fn test_cursor_descending_key_flips_comparison() {
        let cursor = encode_cursor(&Cursor {
            sort_values: vec![json!(10)],
            id: EntityId::now_v7(),
        });
        let built = build_entity_query(
            TenantId::now_v7(),
            &request(json!({
                "sort": [{"property": "price", "direction": "desc"}],
                "cursor": cursor
            })),
            500,
        )
        .expect("build");
        assert!(built.select.sql.contains("< $"));
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            /// Cursors survive an encode/decode round trip for arbitrary
            /// scalar sort values.
            #[test]
            fn prop_cursor_round_trip(n in any::<f64>().prop_filter("finite", |n| n.is_finite()), s in "[a-zA-Z0-9 ]{0,24}") {
                let cursor = Cursor {
                    sort_values: vec![json!(n), json!(s)],
                    id: EntityId::now_v7(),
                };
                let decoded = decode_cursor(&encode_cursor(&cursor)).expect("decode");
                prop_assert_eq!(decoded, cursor);
            }

            /// LIKE escaping leaves no unescaped metacharacters behind.
            #[test]
            fn prop_like_escape_neutralizes_metacharacters(s in ".{0,40}") {
                let escaped = like_escape(&s);
                let mut chars = escaped.chars().peekable();
                while let Some(c) = chars.next() {
                    if c == '\\' {
                        // Every backslash introduces an escape pair.
                        prop_assert!(matches!(chars.next(), Some('\\') | Some('%') | Some('_')));
                    } else {
                        prop_assert!(c != '%' && c != '_');
                    }
                }
            }

            /// Whatever limit the client asks for, the builder never
            /// exceeds the configured maximum.
            #[test]
            fn prop_limit_always_clamped(limit in any::<i64>(), max in 1i64..1000) {
                let built = build_entity_query(
                    TenantId::now_v7(),
                    &QueryRequest { limit: Some(limit), ..Default::default() },
                    max,
                )
                .expect("build");
                prop_assert!(built.limit >= 1 && built.limit <= max);
            }
        }
    }

    #[test]
    fn test_cursor_sort_arity_mismatch_rejected() {
        let cursor = encode_cursor(&Cursor {
            sort_values: vec![json!(10), json!("x")],
            id: EntityId::now_v7(),
        });
        let err = build_entity_query(
            TenantId::now_v7(),
            &request(json!({
                "sort": [{"property": "price"}],
                "cursor": cursor
            })),
            500,
        )
        .expect_err("should fail");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
