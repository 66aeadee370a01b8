//! Status classification and alerting
//!
//! This module provides:
//! - Hysteresis-based machine status classification
//! - The canonical alert list with deduplication
//! - Best-effort alert enrichment through an external diagnostic service

mod classifier;
mod diagnostics;
mod manager;

pub use classifier::{
    Classification, ClassifierConfig, HysteresisState, StatusClassifier, Thresholds, Transition,
};
pub use diagnostics::{
    DiagnosticError, DiagnosticRequest, DiagnosticService, DiagnosticsConfig, Diagnosis,
    HttpDiagnosticClient, Urgency,
};
pub use manager::{severity_for, AlertConfig, AlertManager, Suppression};
