//! Relationship REST routes

use crate::auth::AuthContext;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use trellis_core::{Direction, EntityId, Relationship, RelationshipId, RequestScope};
use trellis_engine::CreateRelationshipRequest;

#[derive(Debug, Serialize)]
pub struct RelationshipResponse {
    pub relationship: Relationship,
}

#[derive(Debug, Serialize)]
pub struct RelationshipListResponse {
    pub relationships: Vec<Relationship>,
}

fn scope(state: &AppState, auth: &AuthContext) -> RequestScope {
    RequestScope::new(auth.tenant_id, auth.actor_id).with_timeout(state.config.request_timeout)
}

/// POST /relationships
pub async fn create_relationship(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<CreateRelationshipRequest>,
) -> ApiResult<(StatusCode, Json<RelationshipResponse>)> {
    let scope = scope(&state, &auth);
    let relationship = state.engine.relationships.create(&scope, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(RelationshipResponse { relationship }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListRelationshipsParams {
    pub entity_id: EntityId,
    #[serde(rename = "type", default)]
    pub relationship_type: Option<String>,
    #[serde(default)]
    pub direction: Option<Direction>,
}

/// GET /relationships?entity_id&type?&direction?
pub async fn list_relationships(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<ListRelationshipsParams>,
) -> ApiResult<Json<RelationshipListResponse>> {
    let scope = scope(&state, &auth);
    let relationships = state
        .engine
        .relationships
        .list(
            &scope,
            params.entity_id,
            params.relationship_type.as_deref(),
            params.direction.unwrap_or_default(),
        )
        .await?;
    Ok(Json(RelationshipListResponse { relationships }))
}

/// DELETE /relationships/:id
pub async fn delete_relationship(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<RelationshipId>,
) -> ApiResult<StatusCode> {
    let scope = scope(&state, &auth);
    state.engine.relationships.delete(&scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
