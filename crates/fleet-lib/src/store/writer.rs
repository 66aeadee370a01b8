//! Background persistence worker
//!
//! The pipeline never awaits the store. It hands writes to a bounded queue
//! and moves on; this worker drains the queue, samples the storage quota
//! after a fraction of writes, and runs rollup + prune on a schedule.

use rand::Rng;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{StoreError, TelemetryStore};
use crate::health::HealthRegistry;
use crate::models::{Alert, Machine, PersistedReading};
use crate::observability::FleetMetrics;

/// One queued write
#[derive(Debug, Clone)]
pub enum WriteCommand {
    /// Readings from one tick
    Readings(Vec<PersistedReading>),
    Machine { machine: Machine, pending_sync: bool },
    MarkSynced(String),
    Alert(Alert),
    /// Severity and message of an alert after diagnosis
    AlertEnriched(Alert),
}

impl WriteCommand {
    fn kind(&self) -> &'static str {
        match self {
            WriteCommand::Readings(_) => "readings",
            WriteCommand::Machine { .. } => "machine",
            WriteCommand::MarkSynced(_) => "mark_synced",
            WriteCommand::Alert(_) => "alert",
            WriteCommand::AlertEnriched(_) => "alert_enriched",
        }
    }
}

/// Statistics for persistence operations
#[derive(Debug, Default, Clone)]
pub struct PersistenceStats {
    pub readings_written: u64,
    pub machines_written: u64,
    pub alerts_written: u64,
    pub failures: u64,
    pub dropped: u64,
    pub quota_checks: u64,
    pub maintenance_runs: u64,
    pub last_write: Option<Instant>,
    pub last_error: Option<String>,
}

/// Sending side of the write queue
#[derive(Clone)]
pub struct PersistenceHandle {
    sender: mpsc::Sender<WriteCommand>,
    stats: Arc<RwLock<PersistenceStats>>,
}

impl PersistenceHandle {
    /// Queue without waiting; returns false if the queue is full or closed
    pub fn try_queue(&self, command: WriteCommand) -> bool {
        match self.sender.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(kind = command.kind(), "Persistence queue full, dropping write");
                if let Ok(mut stats) = self.stats.try_write() {
                    stats.dropped += 1;
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                debug!(kind = command.kind(), "Persistence worker gone, dropping write");
                false
            }
        }
    }

    /// Queue, waiting for room
    pub async fn queue(&self, command: WriteCommand) -> bool {
        self.sender.send(command).await.is_ok()
    }

    pub async fn stats(&self) -> PersistenceStats {
        self.stats.read().await.clone()
    }
}

/// Receiving side; owns the store writes
pub struct PersistenceWorker {
    store: TelemetryStore,
    receiver: mpsc::Receiver<WriteCommand>,
    stats: Arc<RwLock<PersistenceStats>>,
    health: Option<HealthRegistry>,
    metrics: FleetMetrics,
    quota_sampling: bool,
    degraded: bool,
}

impl PersistenceWorker {
    pub fn new(store: TelemetryStore) -> (PersistenceHandle, Self) {
        let (sender, receiver) = mpsc::channel(store.config().write_queue_size.max(1));
        let stats = Arc::new(RwLock::new(PersistenceStats::default()));

        let handle = PersistenceHandle {
            sender,
            stats: Arc::clone(&stats),
        };
        let worker = Self {
            store,
            receiver,
            stats,
            health: None,
            metrics: FleetMetrics::new(),
            quota_sampling: true,
            degraded: false,
        };
        (handle, worker)
    }

    /// Shared statistics, readable after the worker is moved into a task
    pub fn stats_handle(&self) -> Arc<RwLock<PersistenceStats>> {
        Arc::clone(&self.stats)
    }

    /// Report store health to the registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Turn post-write quota sampling on or off
    pub fn with_quota_sampling(mut self, enabled: bool) -> Self {
        self.quota_sampling = enabled;
        self
    }

    /// Move the worker onto its own task
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run until every handle is dropped
    pub async fn run(&mut self) {
        info!("Starting persistence worker");

        let mut maintenance = interval(self.store.config().maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        maintenance.tick().await;

        loop {
            tokio::select! {
                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            self.apply(command).await;
                            if self.should_sample_quota() {
                                self.check_quota().await;
                            }
                        }
                        None => break,
                    }
                }

                _ = maintenance.tick() => {
                    self.run_maintenance().await;
                }
            }
        }

        info!("Persistence worker stopped");
    }

    async fn apply(&mut self, command: WriteCommand) {
        let kind = command.kind();
        let result = match command {
            WriteCommand::Readings(readings) => {
                let count = readings.len() as u64;
                self.store
                    .append_readings(readings)
                    .await
                    .map(|_| Counted::Readings(count))
            }
            WriteCommand::Machine {
                machine,
                pending_sync,
            } => self
                .store
                .save_machine(&machine, pending_sync)
                .await
                .map(|_| Counted::Machine),
            WriteCommand::MarkSynced(id) => self
                .store
                .mark_machine_synced(&id)
                .await
                .map(|_| Counted::Machine),
            WriteCommand::Alert(alert) => self.store.save_alert(&alert).await.map(|_| Counted::Alert),
            WriteCommand::AlertEnriched(alert) => self
                .store
                .record_diagnosis(&alert)
                .await
                .map(|_| Counted::Alert),
        };

        match result {
            Ok(counted) => {
                let mut stats = self.stats.write().await;
                match counted {
                    Counted::Readings(n) => stats.readings_written += n,
                    Counted::Machine => stats.machines_written += 1,
                    Counted::Alert => stats.alerts_written += 1,
                }
                stats.last_write = Some(Instant::now());
                stats.last_error = None;
                drop(stats);
                self.mark_healthy().await;
            }
            Err(e) => self.record_failure(kind, e).await,
        }
    }

    fn should_sample_quota(&self) -> bool {
        if !self.quota_sampling {
            return false;
        }
        let rate = self.store.config().quota_sample_rate.clamp(0.0, 1.0);
        rand::thread_rng().gen_bool(rate)
    }

    async fn check_quota(&mut self) {
        self.stats.write().await.quota_checks += 1;
        match self.store.check_quota().await {
            Ok(check) => debug!(
                percent_used = check.status.percent_used,
                rolled_up = check.rollup.is_some(),
                "Quota checked"
            ),
            Err(e) => warn!(error = %e, "Quota check failed"),
        }
    }

    async fn run_maintenance(&mut self) {
        match self.store.run_maintenance().await {
            Ok(report) => {
                self.stats.write().await.maintenance_runs += 1;
                debug!(
                    aggregates = report.rollup.aggregates_written,
                    pruned = report.prune.readings_removed,
                    "Scheduled maintenance finished"
                );
            }
            Err(e) => warn!(error = %e, "Scheduled maintenance failed"),
        }
    }

    async fn record_failure(&mut self, kind: &str, e: StoreError) {
        error!(error = %e, kind = kind, "Failed to persist");
        self.metrics.inc_persistence_errors();

        {
            let mut stats = self.stats.write().await;
            stats.failures += 1;
            stats.last_error = Some(e.to_string());
        }

        if let Some(health) = &self.health {
            health
                .store_failed(format!("{} write failed: {}", kind, e))
                .await;
            self.degraded = true;
        }
    }

    async fn mark_healthy(&mut self) {
        if !self.degraded {
            return;
        }
        if let Some(health) = &self.health {
            health.store_recovered().await;
        }
        self.degraded = false;
    }
}

enum Counted {
    Readings(u64),
    Machine,
    Alert,
}
