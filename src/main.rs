//! Minimal bootstrap binary for local development and integration testing.
//!
//! Wires configuration, logging, and `CoreServices` together and serves the
//! router's proxy handler until a shutdown signal arrives. The
//! operator-facing CLI/HTTP wrapper this scaffolding feeds into is out of
//! scope for this crate (see `lib.rs`).

use std::sync::Arc;

use gg_ctrl::collaborators::{MockConfigStore, StoreMetricsSink};
use gg_ctrl::gpu::MockGpuProbe;
use gg_ctrl::router::{proxy_handler, RouterState};
use gg_ctrl::shutdown::ShutdownCoordinator;
use gg_ctrl::telemetry::{init_logging, LogConfig};
use gg_ctrl::CoreServices;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = gg_ctrl::config::load();
    init_logging(&LogConfig::default())?;

    // No vendor telemetry shim is wired in yet (see `gpu::probe` doc
    // comment); a real deployment supplies its own `GpuProbe` here.
    let gpu_probe = MockGpuProbe::new(vec![]);
    // No durable config backend is wired in yet; a real deployment supplies
    // its own `ConfigStore` here (database, file, etc).
    let config_store = Arc::new(MockConfigStore::new());
    let metrics = StoreMetricsSink::new();

    let services = CoreServices::new(&env, gpu_probe, config_store, metrics);
    services.restore_from_store().await?;
    let recovery = services.start_recovery();

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let router_state = RouterState { router: services.router.clone(), shutdown: shutdown.clone() };
    let middleware = tower::ServiceBuilder::new().layer(tower_http::trace::TraceLayer::new_for_http());
    let app = axum::Router::new()
        .route("/v1/models/{model_id}/{*rest}", axum::routing::any(proxy_handler))
        .layer(middleware)
        .with_state(router_state);
    let listener = tokio::net::TcpListener::bind(&env.listen_addr).await?;

    tracing::info!(addr = %env.listen_addr, "listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, draining");
        }
    }

    shutdown.initiate(env.shutdown_timeout).await;
    recovery.shutdown().await;
    services.shutdown().await;

    Ok(())
}
