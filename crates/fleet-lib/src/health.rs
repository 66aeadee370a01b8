//! Daemon health as seen from the telemetry path
//!
//! Losing the live link never takes the daemon down: the fleet keeps running
//! on simulated readings. That fallback mode shows up in `/healthz` as a
//! degraded transport plus `source: fallback`, while `/readyz` stays ready.
//! Only a stopped pipeline or an unhealthy component makes the daemon unready.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Still serving, on a fallback path
    Degraded,
    Unhealthy,
}

/// Where the readings currently flowing through the pipeline come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySource {
    /// Pipeline not running
    Stopped,
    /// Started, first connection attempt still open
    Connecting,
    /// Live link up
    Live,
    /// Live link down, simulator generating readings
    Fallback,
}

/// Parts of the daemon that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Pipeline,
    Transport,
    Store,
    Simulator,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Pipeline,
        Component::Transport,
        Component::Store,
        Component::Simulator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Pipeline => "pipeline",
            Component::Transport => "transport",
            Component::Store => "store",
            Component::Simulator => "simulator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the component entered its current status, epoch milliseconds
    pub since: i64,
}

impl ComponentHealth {
    fn new(status: HealthStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: now_millis(),
        }
    }
}

/// `/healthz` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub source: TelemetrySource,
    /// Set while running on the simulator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_since: Option<i64>,
    pub components: BTreeMap<Component, ComponentHealth>,
}

/// `/readyz` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub source: TelemetrySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct HealthState {
    source: TelemetrySource,
    fallback_since: Option<i64>,
    components: BTreeMap<Component, ComponentHealth>,
}

impl HealthState {
    /// Replace a component's health; `since` only moves when the status does
    fn set(&mut self, component: Component, status: HealthStatus, message: Option<String>) {
        match self.components.get_mut(&component) {
            Some(current) if current.status == status => current.message = message,
            _ => {
                self.components
                    .insert(component, ComponentHealth::new(status, message));
            }
        }
    }

    fn overall(&self) -> HealthStatus {
        self.components
            .values()
            .map(|c| c.status)
            .max_by_key(|s| match s {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            })
            .unwrap_or(HealthStatus::Healthy)
    }
}

/// Shared health state; the pipeline and the store writer report into it,
/// the HTTP endpoints read from it
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        let mut components: BTreeMap<Component, ComponentHealth> = Component::ALL
            .iter()
            .map(|c| (*c, ComponentHealth::new(HealthStatus::Healthy, None)))
            .collect();
        components.insert(
            Component::Pipeline,
            ComponentHealth::new(HealthStatus::Degraded, Some("not started".to_string())),
        );

        Self {
            state: Arc::new(RwLock::new(HealthState {
                source: TelemetrySource::Stopped,
                fallback_since: None,
                components,
            })),
        }
    }

    /// Pipeline loop is about to run; must precede any link report
    pub async fn pipeline_started(&self) {
        let mut state = self.state.write().await;
        state.source = TelemetrySource::Connecting;
        state.fallback_since = None;
        state.set(Component::Pipeline, HealthStatus::Healthy, None);
    }

    pub async fn pipeline_stopped(&self) {
        let mut state = self.state.write().await;
        state.source = TelemetrySource::Stopped;
        state.fallback_since = None;
        state.set(
            Component::Pipeline,
            HealthStatus::Degraded,
            Some("stopped".to_string()),
        );
    }

    /// Live link established; the simulator goes idle
    pub async fn link_up(&self) {
        let mut state = self.state.write().await;
        if state.source == TelemetrySource::Stopped {
            return;
        }
        state.source = TelemetrySource::Live;
        state.fallback_since = None;
        state.set(Component::Transport, HealthStatus::Healthy, None);
        state.set(Component::Simulator, HealthStatus::Healthy, None);
    }

    /// Live link unavailable, simulator took over
    pub async fn fallback_engaged(&self, reason: impl Into<String>) {
        let mut state = self.state.write().await;
        if state.source == TelemetrySource::Stopped {
            return;
        }
        if state.source != TelemetrySource::Fallback {
            state.fallback_since = Some(now_millis());
        }
        state.source = TelemetrySource::Fallback;
        state.set(
            Component::Transport,
            HealthStatus::Degraded,
            Some(format!("live link unavailable ({})", reason.into())),
        );
        state.set(
            Component::Simulator,
            HealthStatus::Healthy,
            Some("generating readings".to_string()),
        );
    }

    /// Writes are failing; readings still reach clients from memory
    pub async fn store_failed(&self, message: impl Into<String>) {
        self.state
            .write()
            .await
            .set(Component::Store, HealthStatus::Degraded, Some(message.into()));
    }

    pub async fn store_recovered(&self) {
        self.state
            .write()
            .await
            .set(Component::Store, HealthStatus::Healthy, None);
    }

    /// Direct override for a single component
    pub async fn set(&self, component: Component, status: HealthStatus, message: Option<String>) {
        self.state.write().await.set(component, status, message);
    }

    pub async fn source(&self) -> TelemetrySource {
        self.state.read().await.source
    }

    pub async fn component(&self, component: Component) -> Option<ComponentHealth> {
        self.state.read().await.components.get(&component).cloned()
    }

    pub async fn report(&self) -> HealthReport {
        let state = self.state.read().await;
        HealthReport {
            status: state.overall(),
            source: state.source,
            fallback_since: state.fallback_since,
            components: state.components.clone(),
        }
    }

    pub async fn readiness(&self) -> Readiness {
        let state = self.state.read().await;
        let reason = if state.source == TelemetrySource::Stopped {
            Some("pipeline not running".to_string())
        } else {
            state
                .components
                .iter()
                .find(|(_, c)| c.status == HealthStatus::Unhealthy)
                .map(|(name, c)| match &c.message {
                    Some(m) => format!("{} unhealthy: {}", name.as_str(), m),
                    None => format!("{} unhealthy", name.as_str()),
                })
        };

        Readiness {
            ready: reason.is_none(),
            source: state.source,
            reason,
        }
    }
}
