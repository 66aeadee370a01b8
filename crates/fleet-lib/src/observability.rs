//! Observability infrastructure for the fleet pipeline
//!
//! Provides:
//! - Prometheus metrics (ingestion, alerting, connection, store reclamation)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FleetMetricsInner> = OnceLock::new();

struct FleetMetricsInner {
    readings_ingested: IntCounterVec,
    readings_rejected: IntCounter,
    alerts_raised: IntCounterVec,
    alerts_suppressed: IntCounter,
    status_transitions: IntCounterVec,
    connection_state: IntGauge,
    reconnect_attempts: IntCounter,
    store_bytes: IntGauge,
    rollups_performed: IntCounterVec,
    rows_rolled_up: IntCounter,
    rows_pruned: IntCounter,
    persistence_errors: IntCounter,
    tick_latency_seconds: Histogram,
}

impl FleetMetricsInner {
    fn new() -> Self {
        Self {
            readings_ingested: register_int_counter_vec!(
                "fleet_readings_ingested_total",
                "Sensor readings applied to canonical state",
                &["source"]
            )
            .expect("Failed to register readings_ingested"),

            readings_rejected: register_int_counter!(
                "fleet_readings_rejected_total",
                "Inbound records dropped by validation"
            )
            .expect("Failed to register readings_rejected"),

            alerts_raised: register_int_counter_vec!(
                "fleet_alerts_raised_total",
                "Alerts stored, by origin",
                &["origin"]
            )
            .expect("Failed to register alerts_raised"),

            alerts_suppressed: register_int_counter!(
                "fleet_alerts_suppressed_total",
                "Alerts rejected by deduplication"
            )
            .expect("Failed to register alerts_suppressed"),

            status_transitions: register_int_counter_vec!(
                "fleet_status_transitions_total",
                "Committed machine status transitions",
                &["to"]
            )
            .expect("Failed to register status_transitions"),

            connection_state: register_int_gauge!(
                "fleet_connection_state",
                "Live link state: 0 disconnected, 1 connecting, 2 connected"
            )
            .expect("Failed to register connection_state"),

            reconnect_attempts: register_int_counter!(
                "fleet_reconnect_attempts_total",
                "Attempts to re-establish the live link"
            )
            .expect("Failed to register reconnect_attempts"),

            store_bytes: register_int_gauge!(
                "fleet_store_bytes",
                "Bytes in use by the local store at the last quota check"
            )
            .expect("Failed to register store_bytes"),

            rollups_performed: register_int_counter_vec!(
                "fleet_rollups_performed_total",
                "Rollup runs, by mode",
                &["mode"]
            )
            .expect("Failed to register rollups_performed"),

            rows_rolled_up: register_int_counter!(
                "fleet_rows_rolled_up_total",
                "Raw rows folded into aggregates"
            )
            .expect("Failed to register rows_rolled_up"),

            rows_pruned: register_int_counter!(
                "fleet_rows_pruned_total",
                "Rows deleted past the cold cutoff"
            )
            .expect("Failed to register rows_pruned"),

            persistence_errors: register_int_counter!(
                "fleet_persistence_errors_total",
                "Failed writes to the local store"
            )
            .expect("Failed to register persistence_errors"),

            tick_latency_seconds: register_histogram!(
                "fleet_tick_latency_seconds",
                "Time spent applying one tick of readings",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),
        }
    }
}

/// Fleet metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct FleetMetrics {
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FleetMetricsInner {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new)
    }

    pub fn inc_readings_ingested(&self, source: &str, count: u64) {
        self.inner()
            .readings_ingested
            .with_label_values(&[source])
            .inc_by(count);
    }

    pub fn inc_readings_rejected(&self) {
        self.inner().readings_rejected.inc();
    }

    pub fn inc_alerts_raised(&self, origin: &str) {
        self.inner().alerts_raised.with_label_values(&[origin]).inc();
    }

    pub fn inc_alerts_suppressed(&self) {
        self.inner().alerts_suppressed.inc();
    }

    pub fn inc_status_transitions(&self, to: &str) {
        self.inner().status_transitions.with_label_values(&[to]).inc();
    }

    pub fn set_connection_state(&self, value: i64) {
        self.inner().connection_state.set(value);
    }

    pub fn inc_reconnect_attempts(&self) {
        self.inner().reconnect_attempts.inc();
    }

    pub fn set_store_bytes(&self, bytes: u64) {
        self.inner().store_bytes.set(bytes as i64);
    }

    pub fn record_rollup(&self, mode: &str, rows: usize) {
        self.inner().rollups_performed.with_label_values(&[mode]).inc();
        self.inner().rows_rolled_up.inc_by(rows as u64);
    }

    pub fn inc_rows_pruned(&self, rows: usize) {
        self.inner().rows_pruned.inc_by(rows as u64);
    }

    pub fn inc_persistence_errors(&self) {
        self.inner().persistence_errors.inc();
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for pipeline events
///
/// Consistent event names and fields for the state changes operators care
/// about; everything else goes through plain tracing macros.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, machines: usize) {
        info!(
            event = "pipeline_started",
            node = %self.node_name,
            version = %version,
            machines = machines,
            "Telemetry pipeline started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "pipeline_stopped",
            node = %self.node_name,
            reason = %reason,
            "Telemetry pipeline stopped"
        );
    }

    pub fn log_connection_state(&self, from: &str, to: &str) {
        if to == "DISCONNECTED" {
            warn!(
                event = "connection_state_changed",
                node = %self.node_name,
                from = %from,
                to = %to,
                "Live link lost, running on fallback simulator"
            );
        } else {
            info!(
                event = "connection_state_changed",
                node = %self.node_name,
                from = %from,
                to = %to,
                "Live link state changed"
            );
        }
    }

    pub fn log_status_transition(&self, machine_id: &str, from: &str, to: &str) {
        info!(
            event = "status_transition",
            node = %self.node_name,
            machine_id = %machine_id,
            from = %from,
            to = %to,
            "Machine status committed"
        );
    }

    pub fn log_alert(&self, alert_id: &str, machine_id: &str, severity: &str, origin: &str) {
        warn!(
            event = "alert_raised",
            node = %self.node_name,
            alert_id = %alert_id,
            machine_id = %machine_id,
            severity = %severity,
            origin = %origin,
            "Alert raised"
        );
    }

    pub fn log_alert_suppressed(&self, machine_id: &str, reason: &str) {
        info!(
            event = "alert_suppressed",
            node = %self.node_name,
            machine_id = %machine_id,
            reason = %reason,
            "Duplicate alert suppressed"
        );
    }

    pub fn log_rollup(&self, mode: &str, cutoff: i64, aggregates: usize, raw_rows: usize) {
        info!(
            event = "rollup_performed",
            node = %self.node_name,
            mode = %mode,
            cutoff = cutoff,
            aggregates_written = aggregates,
            raw_rows_removed = raw_rows,
            "Rolled up raw readings"
        );
    }

    pub fn log_prune(&self, mode: &str, cutoff: i64, readings: usize, alerts: usize) {
        info!(
            event = "prune_performed",
            node = %self.node_name,
            mode = %mode,
            cutoff = cutoff,
            readings_removed = readings,
            alerts_removed = alerts,
            "Pruned expired rows"
        );
    }

    pub fn log_registration_queued(&self, machine_id: &str) {
        info!(
            event = "registration_queued",
            node = %self.node_name,
            machine_id = %machine_id,
            "Offline, registration queued until the next INIT"
        );
    }
}
