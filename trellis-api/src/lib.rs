//! Trellis API - HTTP and WebSocket surface
//!
//! A thin, uniform mapping from the REST contract onto the engine
//! services, plus the realtime subscription fabric. Auth is enforced by the
//! [`auth::AuthContext`] extractor on every tenant-scoped route; the public
//! routes (`/health`, `/ready`, `/metrics`, `/auth/login`, `/auth/refresh`)
//! simply never ask for one. The WebSocket endpoint authenticates in-band
//! with its first protocol frame.

pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use state::AppState;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Assemble the full router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Public
        .route("/health", get(routes::health::health))
        .route("/ready", get(routes::health::ready))
        .route("/metrics", get(routes::health::metrics))
        .route("/auth/login", post(routes::auth::login))
        .route("/auth/refresh", post(routes::auth::refresh))
        // Entities
        .route("/entities", post(routes::entity::create_entity))
        .route("/entities/:id", get(routes::entity::get_entity))
        .route("/entities/:id", put(routes::entity::update_entity))
        .route("/entities/:id", delete(routes::entity::delete_entity))
        // Query
        .route("/query", post(routes::query::query_entities))
        // Relationships
        .route(
            "/relationships",
            post(routes::relationship::create_relationship),
        )
        .route(
            "/relationships",
            get(routes::relationship::list_relationships),
        )
        .route(
            "/relationships/:id",
            delete(routes::relationship::delete_relationship),
        )
        // Realtime
        .route("/ws", get(ws::ws_handler))
        // Middleware
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
