//! Trust-boundary validation for inbound records
//!
//! Everything that enters canonical state from the wire or from an operator
//! passes through here first:
//! - readings are coerced to finite numbers and get a timestamp if missing
//! - machines need a non-empty id, free text is truncated and HTML-escaped
//! - image URLs are only kept when their origin is whitelisted
//! - relayed alerts need an id and a machine id

use crate::models::{Alert, AlertSeverity, Machine, MachineStatus, SensorReading};
use serde_json::{Map, Value};
use url::Url;

/// Maximum length of free-text machine fields
const DEFAULT_MAX_TEXT_LEN: usize = 100;

/// Configuration for record validation
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Free-text fields longer than this are truncated (in characters)
    pub max_text_len: usize,
    /// Origins (`scheme://host[:port]`) allowed for machine images
    pub allowed_image_origins: Vec<String>,
    /// In-memory history cap applied to machines carrying history
    pub history_cap: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_text_len: DEFAULT_MAX_TEXT_LEN,
            allowed_image_origins: vec![
                "https://images.unsplash.com".to_string(),
                "https://picsum.photos".to_string(),
            ],
            history_cap: 50,
        }
    }
}

/// Validator applied to every inbound reading and machine
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate a raw reading; `None` if it is not an object
    pub fn validate_sensor_reading(&self, raw: &Value, now: i64) -> Option<SensorReading> {
        let obj = raw.as_object()?;

        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_f64)
            .filter(|t| t.is_finite())
            .map(|t| t as i64)
            .unwrap_or(now);

        Some(SensorReading {
            timestamp,
            vibration: number_field(obj, "vibration"),
            temperature: number_field(obj, "temperature"),
            noise: number_field(obj, "noise"),
            rpm: number_field(obj, "rpm"),
            power_usage: number_field(obj, "powerUsage"),
        })
    }

    /// Validate a raw machine; `None` if the id is missing or empty
    pub fn validate_machine(&self, raw: &Value, now: i64) -> Option<Machine> {
        let obj = raw.as_object()?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?;

        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .and_then(MachineStatus::parse)
            .unwrap_or_default();

        let mut history: Vec<SensorReading> = obj
            .get("history")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|r| self.validate_sensor_reading(r, now))
                    .collect()
            })
            .unwrap_or_default();
        if history.len() > self.config.history_cap {
            history.drain(..history.len() - self.config.history_cap);
        }

        Some(Machine {
            id: self.clean_text(id),
            name: self.text_field(obj, "name"),
            machine_type: self.text_field(obj, "type"),
            location: self.text_field(obj, "location"),
            status,
            history,
            image_url: obj
                .get("imageUrl")
                .and_then(Value::as_str)
                .and_then(|u| self.allowed_image_url(u)),
            serial_number: obj
                .get("serialNumber")
                .and_then(Value::as_str)
                .map(|s| self.clean_text(s))
                .filter(|s| !s.is_empty()),
            last_maintenance: obj
                .get("lastMaintenance")
                .and_then(Value::as_f64)
                .filter(|t| t.is_finite())
                .map(|t| t as i64),
        })
    }

    /// Validate a relayed alert; `None` without an id or machine id
    pub fn validate_alert(&self, raw: &Value, now: i64) -> Option<Alert> {
        let obj = raw.as_object()?;

        let required = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        let id = required("id")?;
        let machine_id = required("machineId")?;

        Some(Alert {
            id: self.clean_text(id),
            machine_id: self.clean_text(machine_id),
            machine_name: self.text_field(obj, "machineName"),
            timestamp: obj
                .get("timestamp")
                .and_then(Value::as_f64)
                .filter(|t| t.is_finite())
                .map(|t| t as i64)
                .unwrap_or(now),
            severity: obj
                .get("severity")
                .and_then(Value::as_str)
                .and_then(AlertSeverity::parse)
                .unwrap_or(AlertSeverity::Medium),
            // messages are longer than names; escape but do not truncate
            message: obj
                .get("message")
                .and_then(Value::as_str)
                .map(sanitize_string)
                .unwrap_or_default(),
            sensor_type: obj
                .get("sensorType")
                .and_then(Value::as_str)
                .map(|s| self.clean_text(s)),
            value: obj
                .get("value")
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite()),
        })
    }

    /// Keep an image URL only if its origin is whitelisted
    pub fn allowed_image_url(&self, raw: &str) -> Option<String> {
        let url = Url::parse(raw.trim()).ok()?;
        let origin = url.origin().ascii_serialization();

        if self
            .config
            .allowed_image_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/') == origin)
        {
            Some(url.to_string())
        } else {
            None
        }
    }

    fn text_field(&self, obj: &Map<String, Value>, key: &str) -> String {
        obj.get(key)
            .and_then(Value::as_str)
            .map(|s| self.clean_text(s))
            .unwrap_or_default()
    }

    fn clean_text(&self, raw: &str) -> String {
        let truncated: String = raw.trim().chars().take(self.config.max_text_len).collect();
        sanitize_string(&truncated)
    }
}

fn number_field(obj: &Map<String, Value>, key: &str) -> f64 {
    obj.get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Escape HTML-significant characters
pub fn sanitize_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}
