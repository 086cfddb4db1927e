//! Shared application state for Axum routers.

use crate::auth::AuthConfig;
use crate::config::ApiConfig;
use crate::ws::SubscriptionRegistry;
use std::sync::Arc;
use std::time::Instant;
use trellis_engine::Engine;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub registry: Arc<SubscriptionRegistry>,
    pub auth: Arc<AuthConfig>,
    pub config: Arc<ApiConfig>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, auth: AuthConfig, config: ApiConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        // Every successful emission fans out to matching sockets.
        registry.attach(&engine.emitter);
        Self {
            engine,
            registry,
            auth: Arc::new(auth),
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}
