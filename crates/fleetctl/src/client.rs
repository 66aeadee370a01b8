//! API client for communicating with the fleet daemon

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// Errors returned by [`ApiClient`]
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Status { status: StatusCode, message: String },
}

/// API client for the fleet daemon
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        // relative joins replace the last path segment otherwise
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.client.get(url).query(query).send().await?;
        decode(response).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.client.post(url).json(body).send().await?;
        decode(response).await
    }

    pub async fn machines(&self) -> Result<FleetView, ApiError> {
        self.get("api/v1/machines", &[]).await
    }

    pub async fn alerts(&self, machine: Option<&str>) -> Result<Vec<Alert>, ApiError> {
        let query: Vec<(&str, String)> = machine
            .map(|m| vec![("machine", m.to_string())])
            .unwrap_or_default();
        self.get("api/v1/alerts", &query).await
    }

    pub async fn history(
        &self,
        machine_id: &str,
        limit: usize,
        full: bool,
    ) -> Result<Vec<StoredReading>, ApiError> {
        let mut url = self.base_url.join("api/v1/machines/")?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(machine_id)
            .push("readings");

        let response = self
            .client
            .get(url)
            .query(&[("limit", limit.to_string()), ("full", full.to_string())])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<Machine, ApiError> {
        self.post("api/v1/machines", request).await
    }

    /// Liveness and readiness; a 503 still carries a readable body
    pub async fn health(&self) -> Result<DaemonHealth, ApiError> {
        let health = self.get_status_body::<HealthReport>("healthz").await?;
        let readiness = self.get_status_body::<Readiness>("readyz").await?;
        Ok(DaemonHealth { health, readiness })
    }

    async fn get_status_body<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(response.json().await?);
        }
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        return Err(ApiError::Status { status, message });
    }

    Ok(response.json().await?)
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetView {
    pub connected: bool,
    pub connection_state: String,
    pub updated_at: i64,
    pub machines: Vec<Machine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub location: String,
    pub status: String,
    #[serde(default)]
    pub history: Vec<Reading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub timestamp: i64,
    pub vibration: f64,
    pub temperature: f64,
    pub noise: f64,
    pub rpm: f64,
    pub power_usage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    pub machine_id: String,
    #[serde(flatten)]
    pub reading: Reading,
    pub is_aggregated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub machine_id: String,
    pub machine_name: String,
    pub timestamp: i64,
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Epoch milliseconds
    pub since: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    /// live, fallback, connecting or stopped
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_since: Option<i64>,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub health: HealthReport,
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
