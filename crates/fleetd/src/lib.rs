//! Fleet telemetry daemon
//!
//! Hosts the reconciliation pipeline and exposes it over HTTP.

pub mod api;
pub mod config;
