//! External diagnostic service client
//!
//! Alerts for newly critical machines can be enriched with a diagnosis from
//! an HTTP service. Rate-limit class failures (429, 503) are retried with
//! exponential backoff; anything else, or running out of retries, yields a
//! generic fallback diagnosis flagged `is_fallback`.

use crate::models::{Machine, SensorReading};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Urgency reported by the diagnostic service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Immediate,
}

/// Structured diagnosis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub diagnosis: String,
    pub urgency: Urgency,
    #[serde(default)]
    pub probable_causes: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    /// Set on the generic answer returned when the service is unavailable
    #[serde(default, skip_serializing)]
    pub is_fallback: bool,
}

impl Diagnosis {
    pub fn fallback() -> Self {
        Self {
            diagnosis: "Automated diagnosis unavailable; inspect the machine manually.".to_string(),
            urgency: Urgency::Medium,
            probable_causes: Vec::new(),
            recommended_actions: vec!["Schedule a manual inspection".to_string()],
            is_fallback: true,
        }
    }
}

/// Machine context sent along with an alert message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticRequest {
    pub message: String,
    pub machine_id: String,
    pub machine_name: String,
    pub machine_type: String,
    pub location: String,
    pub recent_readings: Vec<SensorReading>,
}

impl DiagnosticRequest {
    pub fn new(message: impl Into<String>, machine: &Machine, recent: usize) -> Self {
        let skip = machine.history.len().saturating_sub(recent);
        Self {
            message: message.into(),
            machine_id: machine.id.clone(),
            machine_name: machine.name.clone(),
            machine_type: machine.machine_type.clone(),
            location: machine.location.clone(),
            recent_readings: machine.history[skip..].to_vec(),
        }
    }
}

/// Diagnostic client failures, before the fallback is applied
#[derive(Debug, thiserror::Error)]
pub enum DiagnosticError {
    #[error("diagnostic service rate limited the request ({0})")]
    RateLimited(StatusCode),
    #[error("diagnostic service returned {0}: {1}")]
    Status(StatusCode, String),
    #[error("diagnostic request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid diagnostic endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

impl DiagnosticError {
    fn is_retryable(&self) -> bool {
        matches!(self, DiagnosticError::RateLimited(_))
    }
}

/// Something that can diagnose an alert
#[async_trait]
pub trait DiagnosticService: Send + Sync {
    /// Never fails; degraded answers carry `is_fallback = true`
    async fn diagnose(&self, request: DiagnosticRequest) -> Diagnosis;
}

/// Configuration for the HTTP diagnostic client
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Base URL of the service
    pub endpoint: String,
    /// Optional bearer token
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    /// Retries after the first attempt on rate-limit failures
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8090".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
        }
    }
}

/// reqwest-backed diagnostic client
pub struct HttpDiagnosticClient {
    client: Client,
    url: Url,
    config: DiagnosticsConfig,
}

impl HttpDiagnosticClient {
    pub fn new(config: DiagnosticsConfig) -> Result<Self, DiagnosticError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        let url = Url::parse(&config.endpoint)?.join("v1/diagnose")?;

        Ok(Self {
            client,
            url,
            config,
        })
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    async fn request_once(&self, request: &DiagnosticRequest) -> Result<Diagnosis, DiagnosticError> {
        let mut builder = self.client.post(self.url.clone()).json(request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(DiagnosticError::RateLimited(status));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiagnosticError::Status(status, body));
        }

        Ok(response.json::<Diagnosis>().await?)
    }

    /// Run the request with retries, surfacing the last error
    pub async fn try_diagnose(&self, request: &DiagnosticRequest) -> Result<Diagnosis, DiagnosticError> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            match self.request_once(request).await {
                Ok(diagnosis) => return Ok(diagnosis),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Diagnostic service busy, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.config.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl DiagnosticService for HttpDiagnosticClient {
    async fn diagnose(&self, request: DiagnosticRequest) -> Diagnosis {
        match self.try_diagnose(&request).await {
            Ok(diagnosis) => diagnosis,
            Err(e) => {
                warn!(
                    machine_id = %request.machine_id,
                    error = %e,
                    "Diagnostic service unavailable, using fallback"
                );
                Diagnosis::fallback()
            }
        }
    }
}
