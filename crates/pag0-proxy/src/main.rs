//! pag0 proxy server binary.

use anyhow::Context;
use pag0_proxy::config::load_config;
use pag0_proxy::{build_router, shutdown_signal, AppState, ShutdownCoordinator};
use pag0_storage::StorageProfile;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).context("failed to load configuration")?;

    init_tracing(&config.logging.level, &config.logging.format);

    let profile = StorageProfile::from_config(&config.storage)
        .context("invalid storage configuration")?;
    info!(?profile, "Building storage");
    let storage = profile.build().await.context("failed to build storage")?;

    let shutdown = ShutdownCoordinator::new(config.shutdown.timeout_seconds);
    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(
        AppState::new(config, storage, shutdown.clone())
            .context("failed to initialize proxy state")?,
    );
    state.spawn_workers();

    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = %listen_addr, "pag0 proxy listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    info!("Server stopped, draining background tasks");
    shutdown.wait_for_tasks().await;
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
