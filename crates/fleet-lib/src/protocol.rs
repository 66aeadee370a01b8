//! Wire protocol spoken over the live transport
//!
//! Messages are JSON objects tagged by `type`. Heartbeats are the bare text
//! frames `ping` and `pong`, never JSON.
//!
//! Inbound payloads are parsed loosely into `serde_json::Value` so that each
//! record can be validated on its own: one malformed machine in an `INIT`
//! must not discard the rest of the snapshot.

use crate::models::Machine;
use serde::Serialize;
use serde_json::Value;

/// Heartbeat request text
pub const PING: &str = "ping";
/// Heartbeat response text
pub const PONG: &str = "pong";

/// A decoded inbound frame, records still unvalidated
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Init {
        machines: Vec<Value>,
        recent_alerts: Vec<Value>,
    },
    Telemetry {
        machine_id: String,
        reading: Value,
        status: Option<String>,
    },
    Alert(Value),
    Pong,
    Ping,
}

/// Frame decoding failures
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no message type")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("{0} message is missing field `{1}`")]
    MissingField(&'static str, &'static str),
}

impl InboundMessage {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        match text.trim() {
            PONG => return Ok(Self::Pong),
            PING => return Ok(Self::Ping),
            _ => {}
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        match kind {
            "INIT" => {
                let payload = value.get("payload").unwrap_or(&value);
                Ok(Self::Init {
                    machines: array_field(payload, "machines"),
                    recent_alerts: array_field(payload, "recentAlerts"),
                })
            }
            "TELEMETRY" => {
                let payload = value.get("payload").unwrap_or(&value);
                let machine_id = payload
                    .get("machineId")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField("TELEMETRY", "machineId"))?
                    .to_string();
                let reading = payload
                    .get("reading")
                    .cloned()
                    .ok_or(ProtocolError::MissingField("TELEMETRY", "reading"))?;
                let status = payload
                    .get("status")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Self::Telemetry {
                    machine_id,
                    reading,
                    status,
                })
            }
            "ALERT" => {
                let payload = value.get("payload").cloned().unwrap_or(value);
                Ok(Self::Alert(payload))
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn array_field(value: &Value, key: &str) -> Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Outbound messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundMessage {
    #[serde(rename = "REGISTER_MACHINE")]
    RegisterMachine(Machine),
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
