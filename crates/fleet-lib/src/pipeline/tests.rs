//! Pipeline tests against a channel-backed transport
//!
//! Timers run on the real clock with short periods; every wait is bounded.

use super::*;
use crate::alerting::{DiagnosticRequest, Diagnosis, Urgency};
use crate::health::{Component, HealthStatus, TelemetrySource};
use crate::models::{AlertSeverity, MachineStatus};
use crate::protocol::OutboundMessage;
use crate::store::{PersistenceWorker, StoreConfig};
use async_trait::async_trait;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const WAIT: Duration = Duration::from_secs(5);

/// Server side of one mock link
struct ServerEnd {
    sent: mpsc::Receiver<OutboundFrame>,
    events: mpsc::Sender<TransportEvent>,
}

impl ServerEnd {
    async fn send(&self, frame: serde_json::Value) {
        self.events
            .send(TransportEvent::Text(frame.to_string()))
            .await
            .unwrap();
    }

    /// Next frame that is not a heartbeat
    async fn next_message(&mut self) -> OutboundMessage {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.sent.recv().await {
                    Some(OutboundFrame::Message(message)) => return message,
                    Some(OutboundFrame::Ping) => continue,
                    None => panic!("link closed while waiting for a message"),
                }
            }
        })
        .await
        .expect("no outbound message in time")
    }
}

struct MockTransport {
    refuse: AtomicBool,
    attempts: AtomicUsize,
    links: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (outbound, sent) = mpsc::channel(64);
        let (events, inbound) = mpsc::channel(64);
        let _ = self.links.send(ServerEnd { sent, events });
        Ok(TransportLink { outbound, inbound })
    }
}

struct StaticDiagnosis;

#[async_trait]
impl DiagnosticService for StaticDiagnosis {
    async fn diagnose(&self, _request: DiagnosticRequest) -> Diagnosis {
        Diagnosis {
            diagnosis: "Bearing wear".into(),
            urgency: Urgency::Medium,
            probable_causes: vec!["lubrication".into()],
            recommended_actions: vec![],
            is_fallback: false,
        }
    }
}

struct Harness {
    pipeline: TelemetryPipeline,
    store: TelemetryStore,
    transport: Arc<MockTransport>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Harness {
    fn new(refuse: bool) -> Self {
        Self::build(refuse, None, TelemetryStore::open_in_memory(StoreConfig::default()).unwrap())
    }

    fn build(
        refuse: bool,
        diagnostics: Option<Arc<dyn DiagnosticService>>,
        store: TelemetryStore,
    ) -> Self {
        Self::with_config(refuse, diagnostics, store, test_config())
    }

    fn with_config(
        refuse: bool,
        diagnostics: Option<Arc<dyn DiagnosticService>>,
        store: TelemetryStore,
        config: PipelineConfig,
    ) -> Self {
        let (persistence, worker) = PersistenceWorker::new(store.clone());
        worker.spawn();

        let (links, servers) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            refuse: AtomicBool::new(refuse),
            attempts: AtomicUsize::new(0),
            links,
        });

        let mut builder = TelemetryPipeline::builder(
            store.clone(),
            persistence,
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .config(config);
        if let Some(diagnostics) = diagnostics {
            builder = builder.diagnostics(diagnostics);
        }

        Self {
            pipeline: builder.build(),
            store,
            transport,
            servers,
        }
    }

    fn accept_connections(&self) {
        self.transport.refuse.store(false, Ordering::SeqCst);
    }

    async fn next_link(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("no connection in time")
            .expect("transport dropped")
    }

    async fn wait_for<F>(&self, predicate: F) -> Arc<FleetSnapshot>
    where
        F: Fn(&FleetSnapshot) -> bool,
    {
        let mut rx = self.pipeline.watch();
        tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = Arc::clone(&rx.borrow_and_update());
                if predicate(&snapshot) {
                    return snapshot;
                }
                rx.changed().await.expect("publisher dropped");
            }
        })
        .await
        .expect("snapshot condition not reached in time")
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_tick_period(Duration::from_millis(20))
        .with_reconnect_interval(Duration::from_millis(50))
        .with_heartbeat_interval(Duration::from_secs(60))
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

fn machine_json(id: &str, name: &str) -> serde_json::Value {
    json!({ "id": id, "name": name, "type": "Press", "location": "Bay 1" })
}

fn init_frame(machines: Vec<serde_json::Value>, alerts: Vec<serde_json::Value>) -> serde_json::Value {
    json!({ "type": "INIT", "payload": { "machines": machines, "recentAlerts": alerts } })
}

fn telemetry_frame(machine_id: &str, ts: i64, temperature: f64) -> serde_json::Value {
    json!({
        "type": "TELEMETRY",
        "payload": {
            "machineId": machine_id,
            "status": "NORMAL",
            "reading": {
                "timestamp": ts,
                "vibration": 2.0,
                "temperature": temperature,
                "noise": 70.0,
                "rpm": 1500.0,
                "powerUsage": 40.0
            }
        }
    })
}

fn history_len(snapshot: &FleetSnapshot, id: &str) -> usize {
    snapshot.machine(id).map(|m| m.history.len()).unwrap_or(0)
}

#[tokio::test]
async fn test_refused_connection_falls_back_to_seeded_simulator() {
    let h = Harness::new(true);
    h.pipeline.start().await.unwrap();

    let snapshot = h
        .wait_for(|s| s.machines.len() == 4 && s.machines.iter().all(|m| m.history.len() >= 2))
        .await;
    assert!(!snapshot.connected);
    assert_ne!(snapshot.connection_state, ConnectionState::Connected);
    assert!(h.transport.attempts.load(Ordering::SeqCst) >= 1);

    let transport = h.pipeline.health().component(Component::Transport).await.unwrap();
    assert_eq!(transport.status, HealthStatus::Degraded);
    let report = h.pipeline.health().report().await;
    assert_eq!(report.source, TelemetrySource::Fallback);
    assert!(report.fallback_since.is_some());
    assert!(h.pipeline.health().readiness().await.ready);

    // seeded machines and simulated readings reach the store
    let store = h.store.clone();
    eventually(|| {
        let store = store.clone();
        async move {
            store.load_machines().await.unwrap().len() == 4
                && store.stats().await.unwrap().raw_readings > 0
        }
    })
    .await;

    h.pipeline.stop().await;
    assert_eq!(h.pipeline.health().source().await, TelemetrySource::Stopped);
    assert!(!h.pipeline.health().readiness().await.ready);
}

#[tokio::test]
async fn test_reconnect_keeps_history_and_silences_simulator() {
    let mut h = Harness::new(true);
    h.pipeline.start().await.unwrap();

    let offline = h
        .wait_for(|s| history_len(s, "sim-press-01") >= 3)
        .await;
    let accumulated = history_len(&offline, "sim-press-01");

    h.accept_connections();
    let mut server = h.next_link().await;
    h.wait_for(|s| s.connected).await;
    let live = h.pipeline.health().report().await;
    assert_eq!(live.source, TelemetrySource::Live);
    assert_eq!(live.components[&Component::Transport].status, HealthStatus::Healthy);

    server
        .send(init_frame(
            vec![
                machine_json("sim-press-01", "Press Renamed"),
                machine_json("sim-cnc-02", "CNC Mill 02"),
            ],
            vec![],
        ))
        .await;
    let merged = h
        .wait_for(|s| s.machine("sim-press-01").is_some_and(|m| m.name == "Press Renamed"))
        .await;
    assert!(history_len(&merged, "sim-press-01") >= accumulated);
    assert!(merged.machine("sim-conveyor-03").is_none());

    // connected: no simulated readings land anymore
    tokio::time::sleep(Duration::from_millis(150)).await;
    let quiet = h.pipeline.snapshot();
    assert_eq!(
        history_len(&quiet, "sim-press-01"),
        history_len(&merged, "sim-press-01")
    );

    // the server goes away: fallback resumes on the merged fleet
    let before = history_len(&quiet, "sim-press-01");
    server.sent.close();
    drop(server);
    let resumed = h
        .wait_for(|s| !s.connected && history_len(s, "sim-press-01") > before)
        .await;
    assert_eq!(resumed.machine("sim-press-01").unwrap().name, "Press Renamed");
    assert_eq!(h.pipeline.health().source().await, TelemetrySource::Fallback);

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_live_readings_commit_critical_once_and_alert_once() {
    let mut h = Harness::new(false);
    h.pipeline.start().await.unwrap();
    let server = h.next_link().await;
    h.wait_for(|s| s.connected).await;

    server.send(init_frame(vec![machine_json("m1", "Press")], vec![])).await;
    h.wait_for(|s| s.machine("m1").is_some()).await;

    for (i, t) in [70.0, 90.0, 92.0].iter().enumerate() {
        server.send(telemetry_frame("m1", 1_000 + i as i64 * 2_000, *t)).await;
    }
    let partial = h.wait_for(|s| history_len(s, "m1") == 3).await;
    assert_ne!(partial.machine("m1").unwrap().status, MachineStatus::Critical);
    assert!(partial.alerts.is_empty());

    server.send(telemetry_frame("m1", 7_000, 91.0)).await;
    server.send(telemetry_frame("m1", 9_000, 93.0)).await;
    let snapshot = h.wait_for(|s| history_len(s, "m1") == 5).await;

    assert_eq!(snapshot.machine("m1").unwrap().status, MachineStatus::Critical);
    assert_eq!(snapshot.alerts.len(), 1);
    assert_eq!(snapshot.alerts[0].machine_id, "m1");
    assert_eq!(snapshot.alerts[0].severity, AlertSeverity::High);

    let store = h.store.clone();
    eventually(|| {
        let store = store.clone();
        async move { store.recent_alerts(10).await.unwrap().len() == 1 }
    })
    .await;

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_invalid_and_unknown_frames_are_dropped() {
    let mut h = Harness::new(false);
    h.pipeline.start().await.unwrap();
    let server = h.next_link().await;
    server.send(init_frame(vec![machine_json("m1", "Press")], vec![])).await;
    h.wait_for(|s| s.machine("m1").is_some()).await;

    server.events.send(TransportEvent::Text("{not json".into())).await.unwrap();
    server
        .send(json!({ "type": "TELEMETRY", "payload": { "machineId": "m1", "reading": 42 } }))
        .await;
    server.send(telemetry_frame("ghost", 1_000, 60.0)).await;
    server.send(telemetry_frame("m1", 2_000, 61.0)).await;

    let snapshot = h.wait_for(|s| history_len(s, "m1") == 1).await;
    assert!(snapshot.machine("ghost").is_none());
    assert_eq!(snapshot.machines.len(), 1);

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_relayed_alerts_are_deduplicated() {
    let mut h = Harness::new(false);
    h.pipeline.start().await.unwrap();
    let server = h.next_link().await;

    let alert = json!({
        "id": "srv-1",
        "machineId": "m1",
        "machineName": "Press",
        "timestamp": 10_000,
        "severity": "high",
        "message": "Overheat"
    });
    server
        .send(init_frame(vec![machine_json("m1", "Press")], vec![alert.clone()]))
        .await;

    let mut relayed = alert.clone();
    relayed["type"] = json!("ALERT");
    server.send(relayed.clone()).await;
    relayed["id"] = json!("srv-2");
    relayed["timestamp"] = json!(12_000);
    server.send(relayed.clone()).await;
    relayed["id"] = json!("srv-3");
    relayed["timestamp"] = json!(30_000);
    server.send(relayed).await;

    let snapshot = h.wait_for(|s| s.alerts.iter().any(|a| a.id == "srv-3")).await;
    let ids: Vec<&str> = snapshot.alerts.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["srv-3", "srv-1"]);

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_online_registration_is_forwarded() {
    let mut h = Harness::new(false);
    h.pipeline.start().await.unwrap();
    let mut server = h.next_link().await;
    h.wait_for(|s| s.connected).await;

    let machine = h
        .pipeline
        .register_machine(json!({ "name": "Lathe <b>", "type": "Lathe", "location": "Bay 4" }))
        .await
        .unwrap();
    assert!(machine.id.starts_with("machine-"));
    assert!(!machine.name.contains('<'));

    match server.next_message().await {
        OutboundMessage::RegisterMachine(sent) => assert_eq!(sent.id, machine.id),
    }
    assert!(h.pipeline.snapshot().machine(&machine.id).is_some());

    let store = h.store.clone();
    let id = machine.id.clone();
    eventually(|| {
        let store = store.clone();
        let id = id.clone();
        async move {
            store
                .load_machines()
                .await
                .unwrap()
                .iter()
                .any(|m| m.machine.id == id && !m.pending_sync)
        }
    })
    .await;

    let duplicate = h.pipeline.register_machine(json!({ "id": machine.id })).await;
    assert!(matches!(duplicate, Err(PipelineError::DuplicateMachine(_))));
    let invalid = h.pipeline.register_machine(json!("not a machine")).await;
    assert!(matches!(invalid, Err(PipelineError::InvalidMachine)));

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_offline_registration_reconciles_on_init() {
    let mut h = Harness::new(true);
    h.pipeline.start().await.unwrap();
    h.wait_for(|s| !s.machines.is_empty()).await;

    h.pipeline
        .register_machine(machine_json("local-1", "Drill"))
        .await
        .unwrap();

    let store = h.store.clone();
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .pending_machines()
                .await
                .unwrap()
                .iter()
                .any(|m| m.id == "local-1")
        }
    })
    .await;

    h.accept_connections();
    let mut server = h.next_link().await;

    // the server does not know the machine yet: it is forwarded again
    server.send(init_frame(vec![machine_json("m1", "Press")], vec![])).await;
    match server.next_message().await {
        OutboundMessage::RegisterMachine(sent) => assert_eq!(sent.id, "local-1"),
    }
    assert!(h.wait_for(|s| s.machine("m1").is_some()).await.machine("local-1").is_some());

    // once acknowledged it is no longer pending
    server
        .send(init_frame(
            vec![machine_json("m1", "Press"), machine_json("local-1", "Drill")],
            vec![],
        ))
        .await;
    eventually(|| {
        let store = store.clone();
        async move { store.pending_machines().await.unwrap().is_empty() }
    })
    .await;

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_timers_and_transport() {
    let h = Harness::new(true);
    h.pipeline.start().await.unwrap();
    assert!(matches!(h.pipeline.start().await, Err(PipelineError::AlreadyRunning)));
    h.wait_for(|s| history_len(s, "sim-press-01") >= 1).await;

    h.pipeline.stop().await;
    assert!(!h.pipeline.is_running().await);

    let attempts = h.transport.attempts.load(Ordering::SeqCst);
    let stopped = h.pipeline.snapshot();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), attempts);
    let later = h.pipeline.snapshot();
    assert!(Arc::ptr_eq(&stopped, &later));
    assert_eq!(later.connection_state, ConnectionState::Disconnected);

    let result = h.pipeline.register_machine(machine_json("late", "Late")).await;
    assert!(matches!(result, Err(PipelineError::NotRunning)));
}

#[tokio::test]
async fn test_subscribers_see_new_containers_and_shared_machines() {
    let mut h = Harness::new(false);
    let seen: Arc<std::sync::Mutex<Vec<Arc<FleetSnapshot>>>> = Arc::default();

    let sink = Arc::clone(&seen);
    let subscription = h.pipeline.subscribe(move |snapshot| {
        sink.lock().unwrap().push(snapshot);
    });
    assert_eq!(seen.lock().unwrap().len(), 1);

    h.pipeline.start().await.unwrap();
    let server = h.next_link().await;
    server
        .send(init_frame(
            vec![machine_json("m1", "A"), machine_json("m2", "B")],
            vec![],
        ))
        .await;
    let before = h.wait_for(|s| s.machines.len() == 2).await;

    server.send(telemetry_frame("m1", 1_000, 60.0)).await;
    let after = h.wait_for(|s| history_len(s, "m1") == 1).await;

    assert!(!Arc::ptr_eq(&before, &after));
    assert!(!Arc::ptr_eq(before.machine("m1").unwrap(), after.machine("m1").unwrap()));
    assert!(Arc::ptr_eq(before.machine("m2").unwrap(), after.machine("m2").unwrap()));
    assert!(before.machine("m1").unwrap().history.is_empty());

    let delivered = seen.lock().unwrap().len();
    assert!(delivered >= 3);

    drop(subscription);
    server.send(telemetry_frame("m1", 3_000, 60.0)).await;
    h.wait_for(|s| history_len(s, "m1") == 2).await;
    assert_eq!(seen.lock().unwrap().len(), delivered);

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_start_hydrates_from_store() {
    let store = TelemetryStore::open_in_memory(StoreConfig::default()).unwrap();
    store
        .save_machine(&Machine::new("m1", "Press", "Press", "Bay 1"), false)
        .await
        .unwrap();
    let now = crate::models::now_millis();
    let rows = (0..3)
        .map(|i| {
            PersistedReading::raw(
                "m1",
                crate::models::SensorReading {
                    timestamp: now - 3_000 + i * 1_000,
                    vibration: 2.0,
                    temperature: 60.0,
                    noise: 70.0,
                    rpm: 1500.0,
                    power_usage: 40.0,
                },
            )
        })
        .collect();
    store.append_readings(rows).await.unwrap();

    let h = Harness::build(true, None, store);
    h.pipeline.start().await.unwrap();

    // cached state is published before any connect attempt completes
    let snapshot = h.pipeline.snapshot();
    assert_eq!(snapshot.machines.len(), 1);
    assert_eq!(history_len(&snapshot, "m1"), 3);

    // a hydrated fleet is not replaced by the default one
    let ticking = h.wait_for(|s| history_len(s, "m1") > 3).await;
    assert_eq!(ticking.machines.len(), 1);

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_critical_alert_is_enriched() {
    let store = TelemetryStore::open_in_memory(StoreConfig::default()).unwrap();
    let mut h = Harness::build(false, Some(Arc::new(StaticDiagnosis)), store);
    h.pipeline.start().await.unwrap();
    let server = h.next_link().await;
    server.send(init_frame(vec![machine_json("m1", "Press")], vec![])).await;
    h.wait_for(|s| s.machine("m1").is_some()).await;

    for i in 0..3 {
        server.send(telemetry_frame("m1", 1_000 + i * 2_000, 95.0)).await;
    }

    let snapshot = h
        .wait_for(|s| s.alerts.first().is_some_and(|a| a.message.contains("Bearing wear")))
        .await;
    assert_eq!(snapshot.alerts.len(), 1);
    assert_eq!(snapshot.alerts[0].severity, AlertSeverity::Medium);

    let store = h.store.clone();
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .recent_alerts(1)
                .await
                .unwrap()
                .first()
                .is_some_and(|a| a.severity == AlertSeverity::Medium)
        }
    })
    .await;

    h.pipeline.stop().await;
}

#[tokio::test]
async fn test_unanswered_heartbeat_keeps_link_until_stop() {
    let store = TelemetryStore::open_in_memory(StoreConfig::default()).unwrap();
    let config = test_config().with_heartbeat_interval(Duration::from_millis(30));
    let mut h = Harness::with_config(false, None, store, config);
    h.pipeline.start().await.unwrap();
    let mut server = h.next_link().await;
    h.wait_for(|s| s.connected).await;

    // the server never answers; pings keep coming on the same link
    for _ in 0..3 {
        let frame = tokio::time::timeout(WAIT, server.sent.recv())
            .await
            .expect("no heartbeat in time")
            .expect("link closed");
        assert_eq!(frame, OutboundFrame::Ping);
    }

    // a server-side ping is not a pong and changes nothing
    server.events.send(TransportEvent::Text("ping".into())).await.unwrap();
    server.events.send(TransportEvent::Text("pong".into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = h.pipeline.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    // no fallback: the simulator would have seeded the default fleet
    assert!(snapshot.machines.is_empty());
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 1);

    h.pipeline.stop().await;

    // the link closes: whatever was queued drains, then the channel ends
    tokio::time::timeout(WAIT, async { while server.sent.recv().await.is_some() {} })
        .await
        .expect("link still open after stop");
    assert!(h.pipeline.snapshot().machines.is_empty());
}
