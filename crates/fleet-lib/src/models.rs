//! Core data models for the fleet telemetry pipeline

use serde::{Deserialize, Serialize};

/// Health status of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MachineStatus {
    #[default]
    Normal,
    Warning,
    Critical,
    Offline,
}

impl MachineStatus {
    /// Parse a status label, case-insensitive
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Some(Self::Normal),
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            "OFFLINE" => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Offline => "OFFLINE",
        }
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample of machine sensors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    /// Wall clock, milliseconds since the Unix epoch
    pub timestamp: i64,
    /// mm/s
    pub vibration: f64,
    /// °C
    pub temperature: f64,
    /// dB
    pub noise: f64,
    pub rpm: f64,
    /// kW
    pub power_usage: f64,
}

/// A machine in the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub location: String,
    #[serde(default)]
    pub status: MachineStatus,
    /// Most recent readings, oldest first
    #[serde(default)]
    pub history: Vec<SensorReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_maintenance: Option<i64>,
}

impl Machine {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        machine_type: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            machine_type: machine_type.into(),
            location: location.into(),
            status: MachineStatus::Normal,
            history: Vec::new(),
            image_url: None,
            serial_number: None,
            last_maintenance: None,
        }
    }

    /// Latest reading, if any
    pub fn latest(&self) -> Option<&SensorReading> {
        self.history.last()
    }

    /// Copy of this machine with `reading` appended and history trimmed to `cap`
    pub fn with_reading(&self, reading: SensorReading, cap: usize) -> Self {
        let keep = cap.saturating_sub(1).min(self.history.len());
        let mut history = Vec::with_capacity(keep + 1);
        history.extend_from_slice(&self.history[self.history.len() - keep..]);
        if cap > 0 {
            history.push(reading);
        }

        Self {
            history,
            ..self.clone()
        }
    }
}

/// Reading row as stored locally. Raw and aggregated rows share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedReading {
    pub machine_id: String,
    #[serde(flatten)]
    pub reading: SensorReading,
    pub is_aggregated: bool,
}

impl PersistedReading {
    pub fn raw(machine_id: impl Into<String>, reading: SensorReading) -> Self {
        Self {
            machine_id: machine_id.into(),
            reading,
            is_aggregated: false,
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl AlertSeverity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert raised for a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub machine_id: String,
    pub machine_name: String,
    pub timestamp: i64,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
