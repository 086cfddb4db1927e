//! Query route

use crate::auth::AuthContext;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use trellis_core::{QueryPage, QueryRequest, RequestScope};

/// POST /query
pub async fn query_entities(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<QueryPage>> {
    let scope =
        RequestScope::new(auth.tenant_id, auth.actor_id).with_timeout(state.config.request_timeout);
    let page = state.engine.entities.query(&scope, &request).await?;
    Ok(Json(page))
}
