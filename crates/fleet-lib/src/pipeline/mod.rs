//! Telemetry reconciliation pipeline
//!
//! Single owner of canonical fleet state. A live transport and the fallback
//! simulator feed the same reducers; exactly one of them is active at a
//! time. State changes are published as immutable snapshots.
//!
//! Everything runs on one event-loop task consuming an ordered mailbox, so
//! mutations are applied in the order their triggering events arrived.

mod runtime;
mod state;
mod subscribers;
mod transport;

#[cfg(test)]
mod tests;

pub use state::{FleetState, InitOutcome, ReadingOutcome};
pub use subscribers::{FleetSnapshot, Listener, Subscription};
pub use transport::{
    ConnectionState, OutboundFrame, Transport, TransportConfig, TransportError, TransportEvent,
    TransportLink, WebSocketTransport,
};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{info, warn};

use crate::alerting::{AlertConfig, ClassifierConfig, DiagnosticService};
use crate::health::HealthRegistry;
use crate::models::{Machine, PersistedReading};
use crate::observability::StructuredLogger;
use crate::simulator::SimulatorConfig;
use crate::store::{PersistenceHandle, StoreError, TelemetryStore};
use crate::validation::ValidationConfig;

use runtime::{Collaborators, Event, Runtime};
use subscribers::Publisher;

/// Behavior switches that used to be separate pipeline variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineFeatures {
    /// Ask the diagnostic service about new critical alerts
    pub enrichment: bool,
    /// Queue offline registrations and reconcile them on the next INIT
    pub offline_registration_queue: bool,
    /// Sample storage quota after writes; applied by the persistence worker
    pub quota_monitoring: bool,
    /// Send heartbeat pings while connected
    pub heartbeat: bool,
}

impl Default for PipelineFeatures {
    fn default() -> Self {
        Self {
            enrichment: true,
            offline_registration_queue: true,
            quota_monitoring: true,
            heartbeat: true,
        }
    }
}

/// Configuration for the pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name carried on structured log events
    pub node_name: String,
    /// In-memory readings kept per machine
    pub history_cap: usize,
    /// Delay between reconnection attempts while disconnected
    pub reconnect_interval: Duration,
    /// Heartbeat period while connected
    pub heartbeat_interval: Duration,
    /// Event-loop mailbox capacity
    pub mailbox_size: usize,
    /// Recent readings sent along with a diagnosis request
    pub diagnostic_context_readings: usize,
    pub simulator: SimulatorConfig,
    pub classifier: ClassifierConfig,
    pub alerts: AlertConfig,
    pub validation: ValidationConfig,
    pub features: PipelineFeatures,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            node_name: "fleet".to_string(),
            history_cap: 50,
            reconnect_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            mailbox_size: 1024,
            diagnostic_context_readings: 10,
            simulator: SimulatorConfig::default(),
            classifier: ClassifierConfig::default(),
            alerts: AlertConfig::default(),
            validation: ValidationConfig::default(),
            features: PipelineFeatures::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.simulator.tick_period = period;
        self
    }

    pub fn with_features(mut self, features: PipelineFeatures) -> Self {
        self.features = features;
        self
    }
}

/// Errors surfaced to pipeline callers
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is not running")]
    NotRunning,

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("machine record failed validation")]
    InvalidMachine,

    #[error("machine {0} already exists")]
    DuplicateMachine(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct Running {
    mailbox: mpsc::Sender<Event>,
    task: JoinHandle<()>,
}

struct PipelineInner {
    config: Arc<PipelineConfig>,
    store: TelemetryStore,
    persistence: PersistenceHandle,
    transport: Arc<dyn Transport>,
    diagnostics: Option<Arc<dyn DiagnosticService>>,
    health: HealthRegistry,
    publisher: Publisher,
    running: tokio::sync::Mutex<Option<Running>>,
    // mirror of `running` for synchronous callers
    mailbox: Mutex<Option<mpsc::Sender<Event>>>,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        // last handle gone without stop(): nothing can reach the loop anymore
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}

/// Handle to the pipeline; clones share one pipeline
#[derive(Clone)]
pub struct TelemetryPipeline {
    inner: Arc<PipelineInner>,
}

/// Builder wiring the pipeline's collaborators
pub struct PipelineBuilder {
    config: PipelineConfig,
    store: TelemetryStore,
    persistence: PersistenceHandle,
    transport: Arc<dyn Transport>,
    diagnostics: Option<Arc<dyn DiagnosticService>>,
    health: HealthRegistry,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticService>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn build(self) -> TelemetryPipeline {
        TelemetryPipeline {
            inner: Arc::new(PipelineInner {
                config: Arc::new(self.config),
                store: self.store,
                persistence: self.persistence,
                transport: self.transport,
                diagnostics: self.diagnostics,
                health: self.health,
                publisher: Publisher::new(),
                running: tokio::sync::Mutex::new(None),
                mailbox: Mutex::new(None),
            }),
        }
    }
}

impl TelemetryPipeline {
    /// Start wiring a pipeline. The store is read at startup; writes go
    /// through the persistence queue.
    pub fn builder(
        store: TelemetryStore,
        persistence: PersistenceHandle,
        transport: Arc<dyn Transport>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            config: PipelineConfig::default(),
            store,
            persistence,
            transport,
            diagnostics: None,
            health: HealthRegistry::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    /// Hydrate from the store, then bring up the live link
    ///
    /// Storage faults during hydration are logged and the pipeline starts
    /// empty.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let config = Arc::clone(&self.inner.config);
        let logger = StructuredLogger::new(config.node_name.clone());
        let mut state = state::FleetState::new(
            config.classifier.clone(),
            config.alerts.clone(),
            config.history_cap,
        );

        match self.load_persisted().await {
            Ok((machines, alerts)) => state.hydrate(machines, alerts),
            Err(e) => warn!(error = %e, "Failed to hydrate from local store, starting empty"),
        }

        // before the loop exists, so its first link report cannot be overwritten
        self.inner.health.pipeline_started().await;

        // cached state is visible before the first connect attempt
        self.inner
            .publisher
            .publish(state.snapshot(ConnectionState::Disconnected));

        let (tx, rx) = mpsc::channel(config.mailbox_size.max(1));
        let collaborators = Collaborators {
            transport: Arc::clone(&self.inner.transport),
            persistence: self.inner.persistence.clone(),
            diagnostics: self.inner.diagnostics.clone(),
            health: self.inner.health.clone(),
            publisher: self.inner.publisher.clone(),
        };
        let runtime = Runtime::new(config, state, collaborators, logger, tx.clone());
        let task = tokio::spawn(runtime.run(rx));

        if let Ok(mut mailbox) = self.inner.mailbox.lock() {
            *mailbox = Some(tx.clone());
        }
        *running = Some(Running { mailbox: tx, task });
        Ok(())
    }

    /// Cancel every timer, close the transport and wait for the loop to end
    pub async fn stop(&self) {
        let running = self.inner.running.lock().await.take();
        if let Ok(mut mailbox) = self.inner.mailbox.lock() {
            *mailbox = None;
        }

        let Some(Running { mailbox, task }) = running else {
            return;
        };

        let (reply, done) = oneshot::channel();
        if mailbox.send(Event::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        drop(mailbox);
        if let Err(e) = task.await {
            warn!(error = %e, "Pipeline task ended abnormally");
        }
        self.inner.health.pipeline_stopped().await;
        info!("Pipeline stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Call `listener` with the current snapshot now and after every change
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Arc<FleetSnapshot>) + Send + Sync + 'static,
    {
        self.inner.publisher.subscribe(Arc::new(listener))
    }

    /// Latest snapshot as a watch receiver
    pub fn watch(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.inner.publisher.watch()
    }

    /// Latest snapshot and every later one, as a stream
    pub fn updates(&self) -> WatchStream<Arc<FleetSnapshot>> {
        WatchStream::new(self.watch())
    }

    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.inner.publisher.current()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot().connection_state
    }

    /// Validate and add a machine from operator input
    ///
    /// An id is generated when the input has none. Connected: forwarded to
    /// the live source. Offline: persisted and reconciled on the next INIT.
    pub async fn register_machine(&self, raw: Value) -> Result<Machine, PipelineError> {
        let mailbox = self
            .inner
            .mailbox
            .lock()
            .ok()
            .and_then(|m| m.clone())
            .ok_or(PipelineError::NotRunning)?;

        let (reply, response) = oneshot::channel();
        mailbox
            .send(Event::Register { raw, reply })
            .await
            .map_err(|_| PipelineError::NotRunning)?;
        response.await.map_err(|_| PipelineError::NotRunning)?
    }

    /// Whether a machine is in canonical state or was ever persisted
    pub async fn has_machine(&self, machine_id: &str) -> Result<bool, PipelineError> {
        if self.snapshot().machine(machine_id).is_some() {
            return Ok(true);
        }
        Ok(self.inner.store.has_machine(machine_id).await?)
    }

    /// Stored readings for one machine: the latest `limit`, or everything
    pub async fn history(
        &self,
        machine_id: &str,
        limit: usize,
        full: bool,
    ) -> Result<Vec<PersistedReading>, PipelineError> {
        let rows = if full {
            self.inner.store.full_history(machine_id).await?
        } else {
            self.inner.store.latest_readings(machine_id, limit).await?
        };
        Ok(rows)
    }

    async fn load_persisted(
        &self,
    ) -> Result<(Vec<(Machine, bool)>, Vec<crate::models::Alert>), StoreError> {
        let store = &self.inner.store;
        let stored = store.load_machines().await?;
        let mut readings: HashMap<String, Vec<PersistedReading>> =
            store.latest_readings_all(self.inner.config.history_cap).await?;
        let alerts = store.recent_alerts(self.inner.config.alerts.capacity).await?;

        let machines = stored
            .into_iter()
            .map(|s| {
                let mut machine = s.machine;
                machine.history = readings
                    .remove(&machine.id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| r.reading)
                    .collect();
                (machine, s.pending_sync)
            })
            .collect();

        info!(alerts = alerts.len(), "Hydrated canonical state from local store");
        Ok((machines, alerts))
    }
}
