//! Pipeline event loop
//!
//! One task owns `FleetState` and consumes the mailbox in order. Timers,
//! transport readers and diagnostic calls run as small tasks that only post
//! events back; none of them touch state.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::FleetState;
use super::subscribers::Publisher;
use super::transport::{
    ConnectionState, OutboundFrame, Transport, TransportError, TransportEvent, TransportLink,
};
use super::{PipelineConfig, PipelineError};
use crate::alerting::{Diagnosis, DiagnosticRequest, DiagnosticService, Suppression};
use crate::health::HealthRegistry;
use crate::models::{now_millis, Alert, Machine, PersistedReading, SensorReading};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::simulator::{FallbackSimulator, SimulatorTick, SimulatorTicker};
use crate::store::{PersistenceHandle, WriteCommand};
use crate::validation::{ValidationConfig, Validator};

/// Everything the loop reacts to
pub(crate) enum Event {
    ConnectFinished {
        attempt: u64,
        result: Result<TransportLink, TransportError>,
    },
    Transport {
        link: u64,
        event: TransportEvent,
    },
    SimulatorTick(SimulatorTick),
    ReconnectDue {
        generation: u64,
    },
    HeartbeatDue {
        link: u64,
    },
    Register {
        raw: Value,
        reply: oneshot::Sender<Result<Machine, PipelineError>>,
    },
    Enriched {
        alert_id: String,
        diagnosis: Diagnosis,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Collaborators handed to the loop at start
pub(crate) struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub persistence: PersistenceHandle,
    pub diagnostics: Option<Arc<dyn DiagnosticService>>,
    pub health: HealthRegistry,
    pub publisher: Publisher,
}

/// Established link; dropping it closes the transport and its tasks
struct ActiveLink {
    id: u64,
    outbound: mpsc::Sender<OutboundFrame>,
    forwarder: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    awaiting_pong: bool,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.forwarder.abort();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

pub(crate) struct Runtime {
    config: Arc<PipelineConfig>,
    state: FleetState,
    transport: Arc<dyn Transport>,
    persistence: PersistenceHandle,
    diagnostics: Option<Arc<dyn DiagnosticService>>,
    health: HealthRegistry,
    publisher: Publisher,
    mailbox: mpsc::Sender<Event>,
    logger: StructuredLogger,
    metrics: FleetMetrics,
    validator: Validator,
    simulator: FallbackSimulator,

    connection: ConnectionState,
    link: Option<ActiveLink>,
    link_seq: u64,
    connect_attempt: u64,
    connect_task: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    reconnect_generation: u64,
    ticker: Option<SimulatorTicker>,
    simulator_generation: u64,
    enrichments: Vec<JoinHandle<()>>,
    stopping: bool,
}

impl Runtime {
    pub(crate) fn new(
        config: Arc<PipelineConfig>,
        state: FleetState,
        collaborators: Collaborators,
        logger: StructuredLogger,
        mailbox: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            validator: Validator::new(ValidationConfig {
                history_cap: config.history_cap,
                ..config.validation.clone()
            }),
            simulator: FallbackSimulator::new(config.simulator.clone()),
            config,
            state,
            transport: collaborators.transport,
            persistence: collaborators.persistence,
            diagnostics: collaborators.diagnostics,
            health: collaborators.health,
            publisher: collaborators.publisher,
            mailbox,
            logger,
            metrics: FleetMetrics::new(),
            connection: ConnectionState::Disconnected,
            link: None,
            link_seq: 0,
            connect_attempt: 0,
            connect_task: None,
            reconnect: None,
            reconnect_generation: 0,
            ticker: None,
            simulator_generation: 0,
            enrichments: Vec::new(),
            stopping: false,
        }
    }

    /// Consume events until shutdown
    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), self.state.machines().len());
        self.begin_connect().await;

        while let Some(event) = events.recv().await {
            match event {
                Event::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Event::ConnectFinished { attempt, result } => {
                    self.on_connect_finished(attempt, result).await
                }
                Event::Transport { link, event } => self.on_transport(link, event).await,
                Event::SimulatorTick(tick) => self.on_simulator_tick(tick),
                Event::ReconnectDue { generation } => self.on_reconnect_due(generation).await,
                Event::HeartbeatDue { link } => self.on_heartbeat(link),
                Event::Register { raw, reply } => {
                    let result = self.on_register(raw);
                    let _ = reply.send(result);
                }
                Event::Enriched {
                    alert_id,
                    diagnosis,
                } => self.on_enriched(&alert_id, diagnosis),
            }
        }
    }

    // ---- connection lifecycle ----

    async fn begin_connect(&mut self) {
        if self.stopping || self.connect_task.is_some() || self.link.is_some() {
            return;
        }

        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        self.set_connection(ConnectionState::Connecting);
        self.publish();

        debug!(
            endpoint = %self.transport.describe(),
            attempt = attempt,
            "Connecting live transport"
        );
        let transport = Arc::clone(&self.transport);
        let mailbox = self.mailbox.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let result = transport.connect().await;
            let _ = mailbox.send(Event::ConnectFinished { attempt, result }).await;
        }));
    }

    async fn on_connect_finished(
        &mut self,
        attempt: u64,
        result: Result<TransportLink, TransportError>,
    ) {
        if attempt != self.connect_attempt || self.stopping {
            // a link from a superseded attempt closes when dropped here
            return;
        }
        self.connect_task = None;

        match result {
            Ok(link) => self.on_connected(link).await,
            Err(e) => {
                warn!(error = %e, "Live transport unavailable");
                self.on_disconnected(Some(e.to_string())).await;
            }
        }
    }

    async fn on_connected(&mut self, link: TransportLink) {
        self.link_seq += 1;
        let id = self.link_seq;
        let TransportLink { outbound, inbound } = link;

        let forwarder = spawn_forwarder(id, inbound, self.mailbox.clone());
        let heartbeat = self
            .config
            .features
            .heartbeat
            .then(|| spawn_heartbeat(id, self.config.heartbeat_interval, self.mailbox.clone()));

        // one source at a time: the simulator stops before the link goes live
        self.stop_simulator();
        self.cancel_reconnect();

        self.link = Some(ActiveLink {
            id,
            outbound,
            forwarder,
            heartbeat,
            awaiting_pong: false,
        });
        self.set_connection(ConnectionState::Connected);
        self.health.link_up().await;
        self.publish();
    }

    async fn on_disconnected(&mut self, reason: Option<String>) {
        self.link = None;
        self.set_connection(ConnectionState::Disconnected);
        if self.stopping {
            return;
        }

        let reason = reason.unwrap_or_else(|| "link closed".to_string());
        self.health.fallback_engaged(reason).await;

        self.start_simulator();
        self.arm_reconnect();
        self.publish();
    }

    fn arm_reconnect(&mut self) {
        if self.stopping || self.reconnect.is_some() {
            return;
        }

        self.reconnect_generation += 1;
        let generation = self.reconnect_generation;
        let delay = self.config.reconnect_interval;
        let mailbox = self.mailbox.clone();
        self.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(Event::ReconnectDue { generation }).await;
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.abort();
        }
    }

    async fn on_reconnect_due(&mut self, generation: u64) {
        if generation != self.reconnect_generation {
            return;
        }
        self.reconnect = None;
        if self.link.is_some() {
            return;
        }

        self.metrics.inc_reconnect_attempts();
        self.begin_connect().await;
    }

    fn on_heartbeat(&mut self, link: u64) {
        let Some(active) = self.link.as_mut().filter(|l| l.id == link) else {
            return;
        };

        // a missing pong is not fatal; the transport's close event decides
        if active.awaiting_pong {
            debug!(link = link, "No pong since last heartbeat");
        }
        if active.outbound.try_send(OutboundFrame::Ping).is_ok() {
            active.awaiting_pong = true;
        }
    }

    fn set_connection(&mut self, next: ConnectionState) {
        if self.connection == next {
            return;
        }
        self.logger
            .log_connection_state(self.connection.as_str(), next.as_str());
        self.metrics.set_connection_state(next.gauge_value());
        self.connection = next;
    }

    // ---- fallback simulator ----

    fn start_simulator(&mut self) {
        if self.ticker.as_ref().is_some_and(SimulatorTicker::is_running) {
            return;
        }

        if self.state.is_empty() && self.config.simulator.seed_default_fleet {
            for machine in self.state.seed(FallbackSimulator::default_fleet()) {
                self.persist(WriteCommand::Machine {
                    machine: machine.as_ref().clone(),
                    pending_sync: false,
                });
            }
            info!(
                machines = self.state.machines().len(),
                "Seeded default fleet for offline operation"
            );
        }

        self.simulator_generation += 1;
        self.ticker = Some(SimulatorTicker::spawn(
            self.config.simulator.tick_period,
            self.simulator_generation,
            self.mailbox.clone(),
            Event::SimulatorTick,
        ));
    }

    fn stop_simulator(&mut self) {
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
    }

    fn on_simulator_tick(&mut self, tick: SimulatorTick) {
        let current = self.ticker.as_ref().map(SimulatorTicker::generation);
        if current != Some(tick.generation) || self.link.is_some() {
            debug!(generation = tick.generation, "Dropping stale simulator tick");
            return;
        }

        let started = Instant::now();
        let readings = self
            .simulator
            .tick(self.state.machines().iter().map(|m| m.as_ref()), tick.at);

        let mut batch = Vec::with_capacity(readings.len());
        for (machine_id, reading) in readings {
            if self.ingest_reading(&machine_id, reading) {
                batch.push(PersistedReading::raw(machine_id, reading));
            }
        }

        self.metrics
            .inc_readings_ingested("simulator", batch.len() as u64);
        if !batch.is_empty() {
            self.persist(WriteCommand::Readings(batch));
        }
        self.publish();
        self.metrics
            .observe_tick_latency(started.elapsed().as_secs_f64());
    }

    // ---- inbound frames ----

    async fn on_transport(&mut self, link: u64, event: TransportEvent) {
        if self.link.as_ref().map(|l| l.id) != Some(link) {
            return;
        }

        match event {
            TransportEvent::Closed(reason) => {
                info!(reason = reason.as_deref().unwrap_or(""), "Live transport closed");
                self.on_disconnected(reason).await;
            }
            TransportEvent::Text(text) => self.on_frame(&text),
        }
    }

    fn on_frame(&mut self, text: &str) {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        match message {
            InboundMessage::Init {
                machines,
                recent_alerts,
            } => self.on_init(machines, recent_alerts),
            InboundMessage::Telemetry {
                machine_id,
                reading,
                ..
            } => self.on_telemetry(&machine_id, &reading),
            InboundMessage::Alert(raw) => self.on_relayed_alert(&raw),
            InboundMessage::Pong => {
                if let Some(active) = self.link.as_mut() {
                    active.awaiting_pong = false;
                }
            }
            InboundMessage::Ping => debug!("Ignoring server ping"),
        }
    }

    fn on_init(&mut self, raw_machines: Vec<Value>, raw_alerts: Vec<Value>) {
        let now = now_millis();
        let machines: Vec<Machine> = raw_machines
            .iter()
            .filter_map(|m| self.validator.validate_machine(m, now))
            .collect();
        let alerts: Vec<Alert> = raw_alerts
            .iter()
            .filter_map(|a| self.validator.validate_alert(a, now))
            .collect();

        let rejected = raw_machines.len() - machines.len();
        if rejected > 0 {
            warn!(rejected = rejected, "Dropped invalid machines from INIT");
        }

        let outcome = self.state.apply_init(
            machines,
            alerts,
            self.config.features.offline_registration_queue,
        );

        for machine in self.state.machines() {
            let pending_sync = self.state.pending().contains(&machine.id);
            if !pending_sync {
                self.persist(WriteCommand::Machine {
                    machine: machine.as_ref().clone(),
                    pending_sync,
                });
            }
        }
        for id in outcome.acknowledged {
            debug!(machine_id = %id, "Offline registration acknowledged");
            self.persist(WriteCommand::MarkSynced(id));
        }
        for machine in outcome.unsynced {
            info!(machine_id = %machine.id, "Forwarding offline registration");
            self.send(OutboundFrame::Message(OutboundMessage::RegisterMachine(
                machine,
            )));
        }
        for alert in outcome.alerts {
            self.record_alert(alert, "relay");
        }
        for (machine_id, reason) in outcome.suppressed {
            self.record_suppression(&machine_id, reason);
        }

        info!(
            machines = self.state.machines().len(),
            "Merged INIT snapshot"
        );
        self.publish();
    }

    fn on_telemetry(&mut self, machine_id: &str, raw: &Value) {
        let Some(reading) = self.validator.validate_sensor_reading(raw, now_millis()) else {
            self.metrics.inc_readings_rejected();
            warn!(machine_id = %machine_id, "Dropping invalid reading");
            return;
        };

        if !self.ingest_reading(machine_id, reading) {
            return;
        }
        self.metrics.inc_readings_ingested("live", 1);
        self.persist(WriteCommand::Readings(vec![PersistedReading::raw(
            machine_id, reading,
        )]));
        self.publish();
    }

    fn on_relayed_alert(&mut self, raw: &Value) {
        let Some(alert) = self.validator.validate_alert(raw, now_millis()) else {
            warn!("Dropping invalid relayed alert");
            return;
        };

        let machine_id = alert.machine_id.clone();
        match self.state.ingest_alert(alert) {
            Ok(alert) => {
                self.record_alert(alert, "relay");
                self.publish();
            }
            Err(reason) => self.record_suppression(&machine_id, reason),
        }
    }

    // ---- shared reducers ----

    /// Feed one validated reading through classification and alerting.
    /// Returns false when the machine is unknown.
    fn ingest_reading(&mut self, machine_id: &str, reading: SensorReading) -> bool {
        let Some(outcome) = self.state.apply_reading(machine_id, reading) else {
            debug!(machine_id = %machine_id, "Reading for unknown machine ignored");
            return false;
        };

        if let Some(transition) = outcome.transition {
            self.logger.log_status_transition(
                machine_id,
                transition.from.as_str(),
                transition.to.as_str(),
            );
            self.metrics.inc_status_transitions(transition.to.as_str());
            self.persist(WriteCommand::Machine {
                machine: outcome.machine.as_ref().clone(),
                pending_sync: self.state.pending().contains(machine_id),
            });
        }

        match outcome.alert {
            Some(Ok(alert)) => {
                self.request_diagnosis(&alert, &outcome.machine);
                self.record_alert(alert, "local");
            }
            Some(Err(reason)) => self.record_suppression(machine_id, reason),
            None => {}
        }
        true
    }

    fn record_alert(&mut self, alert: Alert, origin: &str) {
        self.logger.log_alert(
            &alert.id,
            &alert.machine_id,
            alert.severity.as_str(),
            origin,
        );
        self.metrics.inc_alerts_raised(origin);
        self.persist(WriteCommand::Alert(alert));
    }

    fn record_suppression(&self, machine_id: &str, reason: Suppression) {
        self.metrics.inc_alerts_suppressed();
        self.logger
            .log_alert_suppressed(machine_id, &reason.to_string());
    }

    fn request_diagnosis(&mut self, alert: &Alert, machine: &Machine) {
        if !self.config.features.enrichment {
            return;
        }
        let Some(service) = self.diagnostics.clone() else {
            return;
        };

        let request = DiagnosticRequest::new(
            alert.message.clone(),
            machine,
            self.config.diagnostic_context_readings,
        );
        let alert_id = alert.id.clone();
        let mailbox = self.mailbox.clone();

        self.enrichments.retain(|task| !task.is_finished());
        self.enrichments.push(tokio::spawn(async move {
            let diagnosis = service.diagnose(request).await;
            let _ = mailbox.send(Event::Enriched { alert_id, diagnosis }).await;
        }));
    }

    fn on_enriched(&mut self, alert_id: &str, diagnosis: Diagnosis) {
        if diagnosis.is_fallback {
            debug!(alert_id = %alert_id, "Diagnosis unavailable, alert left as raised");
            return;
        }

        match self.state.apply_diagnosis(alert_id, &diagnosis) {
            Some(alert) => {
                info!(
                    alert_id = %alert.id,
                    severity = alert.severity.as_str(),
                    "Alert enriched with diagnosis"
                );
                self.persist(WriteCommand::AlertEnriched(alert));
                self.publish();
            }
            None => debug!(alert_id = %alert_id, "Enriched alert already evicted"),
        }
    }

    // ---- registration ----

    fn on_register(&mut self, mut raw: Value) -> Result<Machine, PipelineError> {
        let fields = raw.as_object_mut().ok_or(PipelineError::InvalidMachine)?;
        let has_id = fields
            .get("id")
            .and_then(Value::as_str)
            .is_some_and(|id| !id.trim().is_empty());
        if !has_id {
            fields.insert(
                "id".to_string(),
                Value::String(format!("machine-{}", Uuid::new_v4())),
            );
        }

        let machine = self
            .validator
            .validate_machine(&raw, now_millis())
            .ok_or(PipelineError::InvalidMachine)?;
        if self.state.contains(&machine.id) {
            return Err(PipelineError::DuplicateMachine(machine.id));
        }

        let forwarded = self.connection == ConnectionState::Connected
            && self.send(OutboundFrame::Message(OutboundMessage::RegisterMachine(
                machine.clone(),
            )));
        let pending_sync = !forwarded && self.config.features.offline_registration_queue;

        let id = machine.id.clone();
        let registered = self
            .state
            .register(machine, pending_sync)
            .ok_or(PipelineError::DuplicateMachine(id))?
            .as_ref()
            .clone();

        self.persist(WriteCommand::Machine {
            machine: registered.clone(),
            pending_sync,
        });
        if pending_sync {
            self.logger.log_registration_queued(&registered.id);
        } else {
            info!(machine_id = %registered.id, forwarded = forwarded, "Machine registered");
        }
        self.publish();
        Ok(registered)
    }

    // ---- shutdown ----

    async fn shutdown(&mut self) {
        self.stopping = true;

        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.cancel_reconnect();
        self.stop_simulator();
        self.link = None;
        for task in self.enrichments.drain(..) {
            task.abort();
        }

        self.set_connection(ConnectionState::Disconnected);
        self.health.pipeline_stopped().await;
        self.logger.log_shutdown("stop requested");
        self.publish();
    }

    // ---- helpers ----

    fn send(&self, frame: OutboundFrame) -> bool {
        match &self.link {
            Some(link) => match link.outbound.try_send(frame) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Failed to queue outbound frame");
                    false
                }
            },
            None => false,
        }
    }

    fn persist(&self, command: WriteCommand) {
        self.persistence.try_queue(command);
    }

    fn publish(&self) {
        self.publisher.publish(self.state.snapshot(self.connection));
    }
}

/// Relay one link's inbound events into the mailbox, tagged with the link id
fn spawn_forwarder(
    link: u64,
    mut inbound: mpsc::Receiver<TransportEvent>,
    mailbox: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = inbound
                .recv()
                .await
                .unwrap_or(TransportEvent::Closed(None));
            let closed = matches!(event, TransportEvent::Closed(_));
            if mailbox.send(Event::Transport { link, event }).await.is_err() || closed {
                break;
            }
        }
    })
}

fn spawn_heartbeat(link: u64, period: Duration, mailbox: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if mailbox.send(Event::HeartbeatDue { link }).await.is_err() {
                break;
            }
        }
    })
}
