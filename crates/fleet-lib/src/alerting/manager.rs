//! Canonical alert list with deduplication and enrichment
//!
//! Two admission paths share one capped list:
//! - locally detected alerts are suppressed if any alert for the same machine
//!   exists within the local window
//! - relayed alerts are suppressed on a duplicate id, or on the same machine
//!   and identical message within the (shorter) relay window

use std::collections::VecDeque;
use std::time::Duration;

use uuid::Uuid;

use super::diagnostics::{Diagnosis, Urgency};
use crate::models::{Alert, AlertSeverity, Machine, SensorReading};

/// Default window for locally detected anomalies (10 seconds)
const DEFAULT_LOCAL_DEDUP_WINDOW: Duration = Duration::from_secs(10);

/// Default window for alerts relayed by the live source (5 seconds)
const DEFAULT_RELAY_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Default number of alerts kept in memory
const DEFAULT_CAPACITY: usize = 50;

/// Alert manager configuration
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub local_dedup_window: Duration,
    pub relay_dedup_window: Duration,
    pub capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            local_dedup_window: DEFAULT_LOCAL_DEDUP_WINDOW,
            relay_dedup_window: DEFAULT_RELAY_DEDUP_WINDOW,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Why an alert was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    DuplicateId,
    RecentForMachine,
    RepeatedMessage,
}

impl std::fmt::Display for Suppression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suppression::DuplicateId => write!(f, "duplicate_id"),
            Suppression::RecentForMachine => write!(f, "recent_for_machine"),
            Suppression::RepeatedMessage => write!(f, "repeated_message"),
        }
    }
}

/// Owner of the canonical alert list, most recent first
#[derive(Debug, Clone)]
pub struct AlertManager {
    config: AlertConfig,
    alerts: VecDeque<Alert>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            alerts: VecDeque::with_capacity(config.capacity),
            config,
        }
    }

    /// Seed from persisted alerts, newest first, without dedup
    pub fn hydrate(&mut self, mut alerts: Vec<Alert>) {
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts.truncate(self.config.capacity);
        self.alerts = alerts.into();
    }

    /// Alerts newest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Alert> {
        self.alerts.iter().find(|a| a.id == id)
    }

    /// Build the alert for a freshly committed CRITICAL transition
    pub fn critical_alert(
        machine: &Machine,
        reading: &SensorReading,
        breach: Option<(&'static str, f64)>,
    ) -> Alert {
        let message = format!(
            "Critical condition detected: temperature {:.1}°C, vibration {:.2} mm/s",
            reading.temperature, reading.vibration
        );

        Alert {
            id: format!("alert-{}", Uuid::new_v4()),
            machine_id: machine.id.clone(),
            machine_name: machine.name.clone(),
            timestamp: reading.timestamp,
            severity: AlertSeverity::High,
            message,
            sensor_type: breach.map(|(sensor, _)| sensor.to_string()),
            value: breach.map(|(_, value)| value),
        }
    }

    /// Admit a locally detected alert
    pub fn raise_local(&mut self, alert: Alert) -> Result<Alert, Suppression> {
        let window = self.config.local_dedup_window.as_millis() as i64;
        if self.alerts.iter().any(|a| {
            a.machine_id == alert.machine_id && (alert.timestamp - a.timestamp).abs() < window
        }) {
            return Err(Suppression::RecentForMachine);
        }

        self.push(alert.clone());
        Ok(alert)
    }

    /// Admit an alert relayed from the live source
    pub fn ingest_relayed(&mut self, alert: Alert) -> Result<Alert, Suppression> {
        if self.alerts.iter().any(|a| a.id == alert.id) {
            return Err(Suppression::DuplicateId);
        }

        let window = self.config.relay_dedup_window.as_millis() as i64;
        if self.alerts.iter().any(|a| {
            a.machine_id == alert.machine_id
                && a.message == alert.message
                && (alert.timestamp - a.timestamp).abs() < window
        }) {
            return Err(Suppression::RepeatedMessage);
        }

        self.push(alert.clone());
        Ok(alert)
    }

    /// Fold a diagnosis into an existing alert
    ///
    /// Returns the replacement alert, or `None` when the alert is gone or the
    /// diagnosis is a fallback. The original is never removed.
    pub fn apply_diagnosis(&mut self, alert_id: &str, diagnosis: &Diagnosis) -> Option<Alert> {
        if diagnosis.is_fallback {
            return None;
        }

        let slot = self.alerts.iter_mut().find(|a| a.id == alert_id)?;
        let enriched = Alert {
            severity: severity_for(diagnosis.urgency),
            message: format!("{} | Diagnosis: {}", slot.message, diagnosis.diagnosis.trim()),
            ..slot.clone()
        };
        *slot = enriched.clone();
        Some(enriched)
    }

    fn push(&mut self, alert: Alert) {
        // Keep the list ordered by recency even for late relayed alerts
        let pos = self
            .alerts
            .iter()
            .position(|a| a.timestamp <= alert.timestamp)
            .unwrap_or(self.alerts.len());
        self.alerts.insert(pos, alert);

        while self.alerts.len() > self.config.capacity {
            self.alerts.pop_back();
        }
    }
}

/// Severity an urgency maps to
pub fn severity_for(urgency: Urgency) -> AlertSeverity {
    match urgency {
        Urgency::Immediate | Urgency::High => AlertSeverity::High,
        Urgency::Medium => AlertSeverity::Medium,
        Urgency::Low => AlertSeverity::Low,
    }
}
