//! Daemon configuration

use fleet_lib::alerting::DiagnosticsConfig;
use fleet_lib::pipeline::{PipelineConfig, PipelineFeatures, TransportConfig};
use fleet_lib::store::StoreConfig;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FleetdConfig {
    /// Name carried on structured log events
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/fleet endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Live telemetry endpoint (`ws://` or `wss://`)
    #[serde(default = "default_transport_url")]
    pub transport_url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Hard size limit of the local store in MiB
    #[serde(default = "default_quota_mb")]
    pub quota_mb: u64,

    /// Usage in MiB that triggers a rollup regardless of percentage
    #[serde(default = "default_max_store_mb")]
    pub max_store_mb: u64,

    #[serde(default = "default_high_watermark")]
    pub high_watermark_percent: f64,

    #[serde(default = "default_hot_window")]
    pub hot_window_secs: u64,

    #[serde(default = "default_cold_window")]
    pub cold_window_secs: u64,

    #[serde(default = "default_quota_sample_rate")]
    pub quota_sample_rate: f64,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Fallback simulator tick period
    #[serde(default = "default_tick_period")]
    pub tick_period_ms: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// In-memory readings kept per machine
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Diagnostic service endpoint; enrichment is off without one
    #[serde(default)]
    pub diagnostics_endpoint: Option<String>,

    #[serde(default)]
    pub diagnostics_api_key: Option<String>,

    #[serde(default = "default_true")]
    pub feature_enrichment: bool,

    #[serde(default = "default_true")]
    pub feature_offline_registration_queue: bool,

    #[serde(default = "default_true")]
    pub feature_quota_monitoring: bool,

    #[serde(default = "default_true")]
    pub feature_heartbeat: bool,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "fleetd".to_string())
}

fn default_api_port() -> u16 {
    9100
}

fn default_transport_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_database_path() -> String {
    "fleet.db".to_string()
}

fn default_quota_mb() -> u64 {
    100
}

fn default_max_store_mb() -> u64 {
    50
}

fn default_high_watermark() -> f64 {
    60.0
}

fn default_hot_window() -> u64 {
    60 * 60
}

fn default_cold_window() -> u64 {
    7 * 24 * 60 * 60
}

fn default_quota_sample_rate() -> f64 {
    0.1
}

fn default_maintenance_interval() -> u64 {
    10 * 60
}

fn default_tick_period() -> u64 {
    2000
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_history_cap() -> usize {
    50
}

fn default_true() -> bool {
    true
}

const MIB: u64 = 1024 * 1024;

impl Default for FleetdConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            transport_url: default_transport_url(),
            connect_timeout_secs: default_connect_timeout(),
            database_path: default_database_path(),
            quota_mb: default_quota_mb(),
            max_store_mb: default_max_store_mb(),
            high_watermark_percent: default_high_watermark(),
            hot_window_secs: default_hot_window(),
            cold_window_secs: default_cold_window(),
            quota_sample_rate: default_quota_sample_rate(),
            maintenance_interval_secs: default_maintenance_interval(),
            tick_period_ms: default_tick_period(),
            reconnect_interval_secs: default_reconnect_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            history_cap: default_history_cap(),
            diagnostics_endpoint: None,
            diagnostics_api_key: None,
            feature_enrichment: true,
            feature_offline_registration_queue: true,
            feature_quota_monitoring: true,
            feature_heartbeat: true,
        }
    }
}

impl FleetdConfig {
    /// Load from an optional `fleetd.toml` (or `$FLEETD_CONFIG`) and
    /// `FLEETD_*` environment variables
    pub fn load() -> Self {
        let file = std::env::var("FLEETD_CONFIG").unwrap_or_else(|_| "fleetd".to_string());

        let loaded = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(config::Environment::with_prefix("FLEETD"))
            .build()
            .and_then(|c| c.try_deserialize::<FleetdConfig>());

        match loaded {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Invalid configuration, using defaults");
                Self::default()
            }
        }
    }

    pub fn features(&self) -> PipelineFeatures {
        PipelineFeatures {
            enrichment: self.feature_enrichment,
            offline_registration_queue: self.feature_offline_registration_queue,
            quota_monitoring: self.feature_quota_monitoring,
            heartbeat: self.feature_heartbeat,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            high_watermark_percent: self.high_watermark_percent,
            max_bytes: self.max_store_mb * MIB,
            quota_sample_rate: self.quota_sample_rate,
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            ..StoreConfig::default()
        }
        .with_path(&self.database_path)
        .with_hot_window(Duration::from_secs(self.hot_window_secs))
        .with_cold_window(Duration::from_secs(self.cold_window_secs))
        .with_quota_bytes(self.quota_mb * MIB)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            history_cap: self.history_cap,
            ..PipelineConfig::default()
        }
        .with_node_name(self.node_name.clone())
        .with_tick_period(Duration::from_millis(self.tick_period_ms))
        .with_reconnect_interval(Duration::from_secs(self.reconnect_interval_secs))
        .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs))
        .with_features(self.features())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.transport_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..TransportConfig::default()
        }
    }

    /// `None` when no diagnostic endpoint is configured
    pub fn diagnostics_config(&self) -> Option<DiagnosticsConfig> {
        let endpoint = self
            .diagnostics_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())?;

        Some(DiagnosticsConfig {
            endpoint: endpoint.to_string(),
            api_key: self.diagnostics_api_key.clone(),
            ..DiagnosticsConfig::default()
        })
    }
}
