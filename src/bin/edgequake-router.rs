//! `edgequake-router` binary: detect models and serve the REST facade.
//!
//! Configuration comes from `EDGEQUAKE_ROUTER_CONFIG` (or the default
//! locations, see [`ConfigManager::load`]). The listen address comes from
//! `EDGEQUAKE_ROUTER_ADDR`. Log filtering follows `RUST_LOG`.

use std::net::SocketAddr;
use std::sync::Arc;

use edgequake_router::{server, ConfigManager, ServiceFactory};
use tracing_subscriber::EnvFilter;

const ADDR_ENV: &str = "EDGEQUAKE_ROUTER_ADDR";
const DEFAULT_ADDR: &str = "127.0.0.1:8787";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ConfigManager::load()?;
    config.validate()?;
    match config.path() {
        Some(path) => tracing::info!(path = %path.display(), "Loaded router configuration"),
        None => tracing::info!("Using built-in router configuration"),
    }

    let factory = Arc::new(ServiceFactory::new(config));
    factory.initialize().await;
    for (provider, error) in factory.registry().detection_errors() {
        tracing::warn!(%provider, %error, "Provider unavailable");
    }

    let addr: SocketAddr = std::env::var(ADDR_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
        .parse()?;

    server::serve(addr, factory).await?;
    Ok(())
}
