//! HTTP API: health checks, Prometheus metrics and fleet endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fleet_lib::{
    health::{HealthRegistry, HealthStatus},
    models::{Alert, Machine, PersistedReading},
    pipeline::{ConnectionState, PipelineError, TelemetryPipeline},
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 10_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub pipeline: TelemetryPipeline,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, pipeline: TelemetryPipeline) -> Self {
        Self {
            health_registry,
            pipeline,
        }
    }
}

/// Error body returned by the fleet endpoints
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Handler error mapped onto an HTTP status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::InvalidMachine => StatusCode::BAD_REQUEST,
            PipelineError::DuplicateMachine(_) => StatusCode::CONFLICT,
            PipelineError::NotRunning | PipelineError::AlreadyRunning => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Health check response - 200 unless a component is unhealthy; fallback mode
/// reports degraded with `source: fallback`
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health_registry.report().await;

    let status_code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(report))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Current fleet view
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinesResponse {
    pub connected: bool,
    pub connection_state: ConnectionState,
    pub updated_at: i64,
    pub machines: Vec<Arc<Machine>>,
}

async fn list_machines(State(state): State<Arc<AppState>>) -> Json<MachinesResponse> {
    let snapshot = state.pipeline.snapshot();
    Json(MachinesResponse {
        connected: snapshot.connected,
        connection_state: snapshot.connection_state,
        updated_at: snapshot.updated_at,
        machines: snapshot.machines.clone(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    pub machine: Option<String>,
}

/// Alerts, newest first
async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Json<Vec<Alert>> {
    let snapshot = state.pipeline.snapshot();
    let alerts = snapshot
        .alerts
        .iter()
        .filter(|a| query.machine.as_deref().map_or(true, |m| a.machine_id == m))
        .cloned()
        .collect();
    Json(alerts)
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub full: bool,
}

/// Stored readings for one machine, oldest first
async fn machine_readings(
    State(state): State<Arc<AppState>>,
    Path(machine_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<PersistedReading>>, ApiError> {
    if !state.pipeline.has_machine(&machine_id).await? {
        return Err(ApiError::not_found(format!("machine {} not found", machine_id)));
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let readings = state
        .pipeline
        .history(&machine_id, limit, query.full)
        .await?;
    Ok(Json(readings))
}

/// Register a machine from operator input
async fn register_machine(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<Machine>), ApiError> {
    let machine = state.pipeline.register_machine(body).await?;
    Ok((StatusCode::CREATED, Json(machine)))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/machines", get(list_machines).post(register_machine))
        .route("/api/v1/machines/:id/readings", get(machine_readings))
        .route("/api/v1/alerts", get(list_alerts))
        .with_state(state)
}

/// Start the API server; returns once `shutdown` resolves
pub async fn serve<F>(port: u16, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
