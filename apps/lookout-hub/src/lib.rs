//! Block-stream hub for the Lookout baker dashboard.
//!
//! The hub keeps at most one streaming connection to the chain node's
//! `/monitor/heads/main` endpoint open, and only while at least one dashboard is connected.
//! Every new head is stamped with the hub's wall clock and pushed to all websocket
//! subscribers.

pub mod config;
pub mod connection;
pub mod feed;
pub mod hub;
pub mod routes;
pub mod settings;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

pub use config::{Cli, HubConfig};
pub use feed::{BlockFeed, HttpBlockFeed};
pub use hub::{FanoutHub, HubHandle, HubPhase, HubStats};
pub use routes::{build_router, AppState};
pub use settings::{HubSettings, SettingsSource, SharedSettings};

pub async fn run(config: HubConfig, metrics: PrometheusHandle) -> Result<()> {
    let settings = SharedSettings::new(HubSettings::new(config.node_url.clone()));
    let feed = HttpBlockFeed::new(reqwest::Client::new());
    let (hub, hub_task) = FanoutHub::spawn(feed, settings.clone(), config.restart_delay);

    let state = Arc::new(AppState {
        hub: hub.clone(),
        settings,
        metrics,
        subscriber_buffer: config.subscriber_buffer,
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("lookout hub listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_ms = config.shutdown_grace.as_millis() as u64,
        "shutdown signal received; stopping hub"
    );
    hub.shutdown();
    if tokio::time::timeout(config.shutdown_grace, hub_task)
        .await
        .is_err()
    {
        info!("hub task did not stop within the grace period");
    }
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
