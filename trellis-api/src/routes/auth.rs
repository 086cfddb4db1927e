//! Auth routes: login and refresh
//!
//! These are public (no auth context required); everything else behind the
//! API authenticates via [`crate::auth::AuthContext`].

use crate::auth::{decode_token, issue_token_pair, TokenPair, TOKEN_TYPE_REFRESH};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use trellis_core::{ActorId, TenantId};

/// POST /auth/login
///
/// Fields are pulled by hand so a missing or malformed field comes back as
/// a 400 `VALIDATION_ERROR` rather than a framework rejection.
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<JsonValue>,
) -> ApiResult<Json<TokenPair>> {
    let tenant_id: TenantId = required_id(&body, "tenant_id")?;
    let actor_id: ActorId = required_id(&body, "actor_id")?;
    let roles = string_list(&body, "roles")?;
    let permissions = string_list(&body, "permissions")?;

    let pair = issue_token_pair(&state.auth, tenant_id, actor_id, roles, permissions)?;
    Ok(Json(pair))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// POST /auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    let claims = decode_token(&state.auth, &body.refresh_token)?;
    if claims.typ != TOKEN_TYPE_REFRESH {
        return Err(ApiError::invalid_token(
            "access tokens cannot be used to refresh",
        ));
    }
    let tenant_id: TenantId = claims
        .tid
        .parse()
        .map_err(|_| ApiError::invalid_token("token carries an invalid tenant id"))?;
    let actor_id: ActorId = claims
        .sub
        .parse()
        .map_err(|_| ApiError::invalid_token("token carries an invalid actor id"))?;

    let pair = issue_token_pair(&state.auth, tenant_id, actor_id, claims.roles, claims.perms)?;
    Ok(Json(pair))
}

fn required_id<T: std::str::FromStr>(body: &JsonValue, field: &str) -> ApiResult<T> {
    body.get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            ApiError::validation(format!("required field '{}' is missing", field))
                .with_details(serde_json::json!({ "field": field }))
        })?
        .parse()
        .map_err(|_| {
            ApiError::validation(format!("field '{}' is not a valid id", field))
                .with_details(serde_json::json!({ "field": field }))
        })
}

fn string_list(body: &JsonValue, field: &str) -> ApiResult<Vec<String>> {
    match body.get(field) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ApiError::validation(format!("field '{}' must be a list of strings", field))
                })
            })
            .collect(),
        Some(_) => Err(ApiError::validation(format!(
            "field '{}' must be a list of strings",
            field
        ))),
    }
}
