//! Health, readiness, and metrics routes (public)

use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use trellis_core::{HealthCheck, HealthStatus};
use trellis_storage::SchemaRegistry;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// GET /health - liveness.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Healthy,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready - readiness: the schema cache answering is the probe.
pub async fn ready(State(state): State<AppState>) -> Json<HealthCheck> {
    let _ = state
        .engine
        .backend
        .relationship_schema("__readiness_probe__");
    Json(HealthCheck::healthy("storage"))
}

/// GET /metrics - process counters, text exposition.
pub async fn metrics(State(state): State<AppState>) -> String {
    let uptime = state.start_time.elapsed().as_secs();
    let connections = state.registry.connection_count();
    format!(
        "# TYPE trellis_uptime_seconds counter\n\
         trellis_uptime_seconds {}\n\
         # TYPE trellis_subscription_connections gauge\n\
         trellis_subscription_connections {}\n",
        uptime, connections
    )
}
