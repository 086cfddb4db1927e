//! Entity REST routes

use crate::auth::AuthContext;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use trellis_core::{Entity, EntityId, RequestScope};
use trellis_engine::{CreateEntityRequest, GetOptions, UpdateEntityRequest};

#[derive(Debug, Serialize)]
pub struct EntityResponse {
    pub entity: Entity,
}

fn scope(state: &AppState, auth: &AuthContext) -> RequestScope {
    RequestScope::new(auth.tenant_id, auth.actor_id).with_timeout(state.config.request_timeout)
}

/// POST /entities
pub async fn create_entity(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<CreateEntityRequest>,
) -> ApiResult<(StatusCode, Json<EntityResponse>)> {
    let scope = scope(&state, &auth);
    let entity = state.engine.entities.create(&scope, request).await?;
    Ok((StatusCode::CREATED, Json(EntityResponse { entity })))
}

/// Flag-style query parameters: present (with no value or anything but
/// "false") means on.
#[derive(Debug, Default, Deserialize)]
pub struct GetEntityParams {
    #[serde(default)]
    pub resolve_inherited: Option<String>,
    #[serde(default)]
    pub evaluate_computed: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    match value {
        None => false,
        Some(v) => !v.eq_ignore_ascii_case("false"),
    }
}

/// GET /entities/:id?resolve_inherited&evaluate_computed
pub async fn get_entity(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<EntityId>,
    Query(params): Query<GetEntityParams>,
) -> ApiResult<Json<EntityResponse>> {
    let scope = scope(&state, &auth);
    let entity = state
        .engine
        .entities
        .get(
            &scope,
            id,
            GetOptions {
                resolve_inherited: flag(&params.resolve_inherited),
                evaluate_computed: flag(&params.evaluate_computed),
            },
        )
        .await?;
    Ok(Json(EntityResponse { entity }))
}

/// PUT /entities/:id
pub async fn update_entity(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<EntityId>,
    Json(request): Json<UpdateEntityRequest>,
) -> ApiResult<Json<EntityResponse>> {
    let scope = scope(&state, &auth);
    let entity = state.engine.entities.update(&scope, id, request).await?;
    Ok(Json(EntityResponse { entity }))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteEntityParams {
    #[serde(default)]
    pub hard_delete: Option<String>,
}

/// DELETE /entities/:id?hard_delete
pub async fn delete_entity(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<EntityId>,
    Query(params): Query<DeleteEntityParams>,
) -> ApiResult<StatusCode> {
    let scope = scope(&state, &auth);
    state
        .engine
        .entities
        .delete(&scope, id, flag(&params.hard_delete))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
