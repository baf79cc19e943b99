mod config;
mod dto;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use hv_infra::registry::ProviderRegistry;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env()?;

    let registry = Arc::new(ProviderRegistry::load(config.config_file.clone()).await?);
    let connected = registry.connect_all().await;
    tracing::info!(?connected, config = %config.config_file.display(), "providers ready");

    let state = AppState {
        registry: registry.clone(),
    };
    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "starting hypervisor control API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    registry.disconnect_all().await;
    Ok(())
}
