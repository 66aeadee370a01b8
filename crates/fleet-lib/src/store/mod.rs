//! Local time-series store
//!
//! SQLite-backed persistence for machines, readings and alerts:
//! - Raw readings appended per tick in one transaction
//! - Quota checks against a `StorageProbe`, rollup past the high watermark
//! - Emergency rollup and prune when a write fails for lack of space
//! - Chronological "latest N" and full-history reads
//!
//! All SQLite work runs on the blocking pool behind a shared connection.

mod quota;
mod rollup;
mod schema;
mod writer;

#[cfg(test)]
mod tests;

pub use quota::{QuotaStatus, SqliteProbe, StorageEstimate, StorageProbe};
pub use rollup::{aligned_cutoff, PruneReport, ReclaimMode, RollupReport};
pub use schema::BUCKET_MS;
pub use writer::{PersistenceHandle, PersistenceStats, PersistenceWorker, WriteCommand};

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{now_millis, Alert, AlertSeverity, Machine, PersistedReading, SensorReading};
use crate::observability::{FleetMetrics, StructuredLogger};

/// Errors raised by the local store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("store connection lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            if err.code == rusqlite::ErrorCode::DiskFull {
                return StoreError::QuotaExceeded;
            }
        }
        StoreError::Sqlite(e)
    }
}

/// Configuration for the local store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file
    pub path: PathBuf,
    /// Raw rows older than this are rolled up
    pub hot_window: Duration,
    /// Hot window after a write failed for lack of space
    pub emergency_hot_window: Duration,
    /// Rows older than this are deleted
    pub cold_window: Duration,
    /// Cold window after a write failed for lack of space
    pub emergency_cold_window: Duration,
    /// Usage percentage that triggers a rollup
    pub high_watermark_percent: f64,
    /// Absolute usage that triggers a rollup
    pub max_bytes: u64,
    /// Hard size limit; writes past it fail with `QuotaExceeded`
    pub quota_bytes: u64,
    /// Fraction of writes followed by a quota check
    pub quota_sample_rate: f64,
    /// Groups folded per rollup transaction
    pub rollup_batch_groups: usize,
    /// Interval between scheduled rollup + prune runs
    pub maintenance_interval: Duration,
    /// Capacity of the persistence worker's queue
    pub write_queue_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fleet.db"),
            hot_window: Duration::from_secs(60 * 60),
            emergency_hot_window: Duration::from_secs(5 * 60),
            cold_window: Duration::from_secs(7 * 24 * 60 * 60),
            emergency_cold_window: Duration::from_secs(24 * 60 * 60),
            high_watermark_percent: 60.0,
            max_bytes: 50 * 1024 * 1024,
            quota_bytes: 100 * 1024 * 1024,
            quota_sample_rate: 0.1,
            rollup_batch_groups: 500,
            maintenance_interval: Duration::from_secs(10 * 60),
            write_queue_size: 1000,
        }
    }
}

impl StoreConfig {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_hot_window(mut self, window: Duration) -> Self {
        self.hot_window = window;
        self
    }

    pub fn with_cold_window(mut self, window: Duration) -> Self {
        self.cold_window = window;
        self
    }

    pub fn with_quota_bytes(mut self, bytes: u64) -> Self {
        self.quota_bytes = bytes;
        self
    }

    fn hot_window_for(&self, mode: ReclaimMode) -> Duration {
        match mode {
            ReclaimMode::Normal => self.hot_window,
            ReclaimMode::Emergency => self.emergency_hot_window,
        }
    }

    fn cold_window_for(&self, mode: ReclaimMode) -> Duration {
        match mode {
            ReclaimMode::Normal => self.cold_window,
            ReclaimMode::Emergency => self.emergency_cold_window,
        }
    }
}

/// Machine row with its sync flag
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMachine {
    pub machine: Machine,
    /// Registered while offline, not yet acknowledged by an INIT
    pub pending_sync: bool,
}

/// Result of a quota check
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCheck {
    pub status: QuotaStatus,
    /// Set when the watermark was crossed and a rollup ran
    pub rollup: Option<RollupReport>,
}

/// Rollup and prune run together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rollup: RollupReport,
    pub prune: PruneReport,
}

/// Row counts and size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub machines: u64,
    pub pending_machines: u64,
    pub raw_readings: u64,
    pub aggregated_readings: u64,
    pub alerts: u64,
    pub usage_bytes: u64,
}

/// Handle to the local store; clones share one connection
#[derive(Clone)]
pub struct TelemetryStore {
    conn: Arc<Mutex<Connection>>,
    config: Arc<StoreConfig>,
    probe: Arc<dyn StorageProbe>,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl TelemetryStore {
    /// Open or create the database at `config.path`
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let path = config.path.clone();
        let quota_bytes = config.quota_bytes;
        let conn = tokio::task::spawn_blocking(move || open_connection(Some(&path), quota_bytes))
            .await??;
        info!(path = %config.path.display(), "Opened local store");
        Ok(Self::from_connection(conn, config))
    }

    /// Private in-memory database
    pub fn open_in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        let conn = open_connection(None, config.quota_bytes)?;
        Ok(Self::from_connection(conn, config))
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> Self {
        let conn = Arc::new(Mutex::new(conn));
        let probe = Arc::new(SqliteProbe::new(conn.clone(), config.quota_bytes));
        Self {
            conn,
            config: Arc::new(config),
            probe,
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new("local"),
        }
    }

    /// Replace the storage probe
    pub fn with_probe(mut self, probe: Arc<dyn StorageProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *guard)
        })
        .await?
    }

    /// Run a write; if it fails for lack of space, reclaim and retry once
    async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let first = {
            let f = f.clone();
            self.run(move |conn| f(conn)).await
        };

        match first {
            Err(StoreError::QuotaExceeded) => {
                warn!("Local store full, running emergency reclamation");
                self.metrics.inc_persistence_errors();
                self.reclaim(ReclaimMode::Emergency).await;
                self.run(move |conn| f(conn)).await
            }
            other => other,
        }
    }

    /// Prune then roll up; failures are logged
    async fn reclaim(&self, mode: ReclaimMode) {
        if let Err(e) = self.prune(mode).await {
            warn!(error = %e, mode = %mode, "Prune failed");
        }
        if let Err(e) = self.perform_rollup(mode).await {
            warn!(error = %e, mode = %mode, "Rollup failed");
        }
    }

    /// Insert or replace a machine. History is stored as readings, not here.
    pub async fn save_machine(&self, machine: &Machine, pending_sync: bool) -> Result<(), StoreError> {
        let id = machine.id.clone();
        let body = serde_json::to_string(&Machine {
            history: Vec::new(),
            ..machine.clone()
        })?;

        self.write(move |conn| {
            conn.execute(
                "INSERT INTO machines (id, body, pending_sync, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    body = excluded.body,
                    pending_sync = excluded.pending_sync,
                    updated_at = excluded.updated_at",
                params![id, body, pending_sync, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_machines(&self) -> Result<Vec<StoredMachine>, StoreError> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT body, pending_sync FROM machines ORDER BY rowid ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
            })?;

            let mut machines = Vec::new();
            for row in rows {
                let (body, pending_sync) = row?;
                match serde_json::from_str::<Machine>(&body) {
                    Ok(machine) => machines.push(StoredMachine {
                        machine,
                        pending_sync,
                    }),
                    Err(e) => warn!(error = %e, "Skipping unreadable machine row"),
                }
            }
            Ok(machines)
        })
        .await
    }

    /// Machines registered offline and not yet acknowledged
    pub async fn pending_machines(&self) -> Result<Vec<Machine>, StoreError> {
        Ok(self
            .load_machines()
            .await?
            .into_iter()
            .filter(|m| m.pending_sync)
            .map(|m| m.machine)
            .collect())
    }

    /// Returns false if the machine is unknown
    pub async fn mark_machine_synced(&self, machine_id: &str) -> Result<bool, StoreError> {
        let id = machine_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE machines SET pending_sync = 0, updated_at = ?2 WHERE id = ?1",
                params![id, now_millis()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    /// Append a batch of readings in one transaction
    pub async fn append_readings(&self, readings: Vec<PersistedReading>) -> Result<usize, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let readings = Arc::new(readings);
        let count = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO readings
                            (machine_id, timestamp, vibration, temperature, noise, rpm, power_usage, is_aggregated)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )?;
                    for r in readings.iter() {
                        stmt.execute(params![
                            r.machine_id,
                            r.reading.timestamp,
                            r.reading.vibration,
                            r.reading.temperature,
                            r.reading.noise,
                            r.reading.rpm,
                            r.reading.power_usage,
                            r.is_aggregated
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(readings.len())
            })
            .await?;

        debug!(count = count, "Persisted readings");
        Ok(count)
    }

    /// Latest `n` readings for one machine, oldest first
    pub async fn latest_readings(
        &self,
        machine_id: &str,
        n: usize,
    ) -> Result<Vec<PersistedReading>, StoreError> {
        let id = machine_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT machine_id, timestamp, vibration, temperature, noise, rpm, power_usage, is_aggregated
                 FROM readings WHERE machine_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;
            let mut rows = stmt
                .query_map(params![id, n as i64], reading_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    /// Latest `n` readings per machine, each oldest first
    pub async fn latest_readings_all(
        &self,
        n: usize,
    ) -> Result<HashMap<String, Vec<PersistedReading>>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT machine_id, timestamp, vibration, temperature, noise, rpm, power_usage, is_aggregated
                 FROM (
                    SELECT *, ROW_NUMBER() OVER (
                        PARTITION BY machine_id ORDER BY timestamp DESC, id DESC
                    ) AS rn
                    FROM readings
                 )
                 WHERE rn <= ?1
                 ORDER BY machine_id, timestamp ASC, id ASC",
            )?;

            let mut out: HashMap<String, Vec<PersistedReading>> = HashMap::new();
            for row in stmt.query_map(params![n as i64], reading_from_row)? {
                let row = row?;
                out.entry(row.machine_id.clone()).or_default().push(row);
            }
            Ok(out)
        })
        .await
    }

    /// Every stored reading for a machine, raw and aggregated, oldest first
    pub async fn full_history(&self, machine_id: &str) -> Result<Vec<PersistedReading>, StoreError> {
        let id = machine_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT machine_id, timestamp, vibration, temperature, noise, rpm, power_usage, is_aggregated
                 FROM readings WHERE machine_id = ?1
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![id], reading_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Alerts are immutable; saving an existing id is a no-op
    pub async fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let alert = alert.clone();
        self.write(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO alerts
                    (id, machine_id, machine_name, timestamp, severity, message, sensor_type, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    alert.id,
                    alert.machine_id,
                    alert.machine_name,
                    alert.timestamp,
                    alert.severity.as_str(),
                    alert.message,
                    alert.sensor_type,
                    alert.value
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Store the enriched severity and message of an alert already saved
    ///
    /// Identity, machine and timestamp never change. Returns false if the
    /// alert is unknown.
    pub async fn record_diagnosis(&self, alert: &Alert) -> Result<bool, StoreError> {
        let id = alert.id.clone();
        let severity = alert.severity.as_str();
        let message = alert.message.clone();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE alerts SET severity = ?2, message = ?3 WHERE id = ?1",
                params![id, severity, message],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    /// Most recent `n` alerts, newest first
    pub async fn recent_alerts(&self, n: usize) -> Result<Vec<Alert>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, machine_id, machine_name, timestamp, severity, message, sensor_type, value
                 FROM alerts ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![n as i64], alert_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Estimate usage; past the watermark, roll up
    pub async fn check_quota(&self) -> Result<QuotaCheck, StoreError> {
        let estimate = self.probe.estimate().await?;
        self.metrics.set_store_bytes(estimate.usage_bytes);

        let status = QuotaStatus::evaluate(
            estimate,
            self.config.high_watermark_percent,
            self.config.max_bytes,
        );

        let rollup = if status.over_watermark {
            info!(
                percent_used = status.percent_used,
                usage_bytes = estimate.usage_bytes,
                "Storage past high watermark"
            );
            Some(self.perform_rollup(ReclaimMode::Normal).await?)
        } else {
            None
        };

        Ok(QuotaCheck { status, rollup })
    }

    /// Fold raw rows older than the mode's hot window into per-minute means
    pub async fn perform_rollup(&self, mode: ReclaimMode) -> Result<RollupReport, StoreError> {
        let cutoff = aligned_cutoff(now_millis(), self.config.hot_window_for(mode));
        let batch = self.config.rollup_batch_groups;

        let report = self
            .run(move |conn| rollup::rollup(conn, cutoff, batch))
            .await?;

        if report.aggregates_written > 0 {
            self.metrics
                .record_rollup(&mode.to_string(), report.raw_rows_removed);
            self.logger.log_rollup(
                &mode.to_string(),
                report.cutoff,
                report.aggregates_written,
                report.raw_rows_removed,
            );
        }
        Ok(report)
    }

    /// Delete rows older than the mode's cold window
    pub async fn prune(&self, mode: ReclaimMode) -> Result<PruneReport, StoreError> {
        let cutoff = now_millis() - self.config.cold_window_for(mode).as_millis() as i64;

        let report = self.run(move |conn| rollup::prune(conn, cutoff)).await?;

        if report.readings_removed + report.alerts_removed > 0 {
            self.metrics
                .inc_rows_pruned(report.readings_removed + report.alerts_removed);
            self.logger.log_prune(
                &mode.to_string(),
                report.cutoff,
                report.readings_removed,
                report.alerts_removed,
            );
        }
        Ok(report)
    }

    /// Scheduled rollup and prune
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, StoreError> {
        let rollup = self.perform_rollup(ReclaimMode::Normal).await?;
        let prune = self.prune(ReclaimMode::Normal).await?;
        Ok(MaintenanceReport { rollup, prune })
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.run(|conn| {
            let count = |sql: &str| -> Result<u64, StoreError> {
                let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
                Ok(n.max(0) as u64)
            };

            Ok(StoreStats {
                machines: count("SELECT COUNT(*) FROM machines")?,
                pending_machines: count("SELECT COUNT(*) FROM machines WHERE pending_sync = 1")?,
                raw_readings: count("SELECT COUNT(*) FROM readings WHERE is_aggregated = 0")?,
                aggregated_readings: count("SELECT COUNT(*) FROM readings WHERE is_aggregated = 1")?,
                alerts: count("SELECT COUNT(*) FROM alerts")?,
                usage_bytes: schema::used_bytes(conn)?,
            })
        })
        .await
    }

    /// Whether a machine row exists
    pub async fn has_machine(&self, machine_id: &str) -> Result<bool, StoreError> {
        let id = machine_id.to_string();
        self.run(move |conn| {
            let found = conn
                .query_row("SELECT 1 FROM machines WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

fn open_connection(path: Option<&Path>, quota_bytes: u64) -> Result<Connection, StoreError> {
    let conn = match path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    schema::initialize(&conn)?;
    schema::set_size_limit(&conn, quota_bytes)?;
    Ok(conn)
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<PersistedReading> {
    Ok(PersistedReading {
        machine_id: row.get(0)?,
        reading: SensorReading {
            timestamp: row.get(1)?,
            vibration: row.get(2)?,
            temperature: row.get(3)?,
            noise: row.get(4)?,
            rpm: row.get(5)?,
            power_usage: row.get(6)?,
        },
        is_aggregated: row.get(7)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let severity: String = row.get(4)?;
    Ok(Alert {
        id: row.get(0)?,
        machine_id: row.get(1)?,
        machine_name: row.get(2)?,
        timestamp: row.get(3)?,
        severity: AlertSeverity::parse(&severity).unwrap_or(AlertSeverity::Medium),
        message: row.get(5)?,
        sensor_type: row.get(6)?,
        value: row.get(7)?,
    })
}
