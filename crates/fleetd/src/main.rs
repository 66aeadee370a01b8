//! fleetd - fleet telemetry daemon
//!
//! Keeps a reconciled view of the machine fleet from the live telemetry
//! link, falling back to simulation while the link is down, and serves it
//! over HTTP together with health and metrics endpoints.

use anyhow::{Context, Result};
use fleet_lib::{
    alerting::HttpDiagnosticClient,
    health::HealthRegistry,
    observability::StructuredLogger,
    pipeline::{TelemetryPipeline, WebSocketTransport},
    store::{PersistenceWorker, TelemetryStore},
};
use fleetd::{api, config::FleetdConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleetd");

    let config = FleetdConfig::load();
    info!(
        node_name = %config.node_name,
        transport = %config.transport_url,
        database = %config.database_path,
        "Daemon configured"
    );

    let health_registry = HealthRegistry::new();
    let logger = StructuredLogger::new(&config.node_name);

    let store = TelemetryStore::open(config.store_config())
        .await
        .context("failed to open local store")?
        .with_logger(logger);

    let pipeline_config = config.pipeline_config();
    let (persistence, worker) = PersistenceWorker::new(store.clone());
    let worker = worker
        .with_health(health_registry.clone())
        .with_quota_sampling(pipeline_config.features.quota_monitoring)
        .spawn();

    let transport = Arc::new(WebSocketTransport::new(config.transport_config()));
    let mut builder = TelemetryPipeline::builder(store, persistence, transport)
        .config(pipeline_config)
        .health(health_registry.clone());

    if let Some(diagnostics) = config.diagnostics_config() {
        match HttpDiagnosticClient::new(diagnostics) {
            Ok(client) => builder = builder.diagnostics(Arc::new(client)),
            Err(e) => warn!(error = %e, "Diagnostic client unavailable, enrichment disabled"),
        }
    }

    let pipeline = builder.build();
    pipeline.start().await.context("failed to start pipeline")?;

    let app_state = Arc::new(api::AppState::new(health_registry, pipeline.clone()));
    let (stop_api, api_stopped) = oneshot::channel::<()>();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async {
        let _ = api_stopped.await;
    }));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    pipeline.stop().await;
    let _ = stop_api.send(());
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    // the worker drains the queue once the last pipeline handle is gone
    drop(pipeline);
    if tokio::time::timeout(DRAIN_TIMEOUT, worker).await.is_err() {
        warn!("Persistence queue not drained before timeout");
    }

    Ok(())
}
