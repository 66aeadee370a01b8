//! Fleet telemetry library
//!
//! This crate provides the core functionality for:
//! - Reconciling live and simulated machine telemetry into one fleet view
//! - Hysteresis-based status classification and de-duplicated alerting
//! - Local time-series persistence with quota-aware rollup
//! - Health checks and observability

pub mod alerting;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod simulator;
pub mod store;
pub mod validation;

pub use health::{
    Component, ComponentHealth, HealthRegistry, HealthReport, HealthStatus, Readiness,
    TelemetrySource,
};
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
pub use pipeline::{
    ConnectionState, FleetSnapshot, PipelineConfig, PipelineError, PipelineFeatures,
    Subscription, TelemetryPipeline,
};
pub use store::{StoreConfig, StoreError, TelemetryStore};
