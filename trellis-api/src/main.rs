//! Trellis server binary

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trellis_api::auth::AuthConfig;
use trellis_api::{build_router, ApiConfig, AppState};
use trellis_core::KernelConfig;
use trellis_engine::Engine;
use trellis_storage::{DbConfig, PgStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let kernel_config = KernelConfig::from_env();
    let api_config = ApiConfig::from_env();
    let auth_config = AuthConfig::from_env();

    let pool = DbConfig::from_env().create_pool()?;
    let store = Arc::new(PgStore::new(pool, kernel_config.max_query_limit));
    store.warm_schema_cache().await?;

    let engine = Arc::new(Engine::new(store, kernel_config));
    let state = AppState::new(engine, auth_config, api_config.clone());
    let router = build_router(state);

    info!(addr = %api_config.bind_addr, "trellis server listening");
    let listener = tokio::net::TcpListener::bind(api_config.bind_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
