//! Rollup and pruning of persisted readings
//!
//! Raw rows older than the hot cutoff are folded into one aggregated row per
//! (machine, minute) holding the per-field mean. Groups are pulled from SQLite
//! in bounded batches with `GROUP BY`, so the raw rows never have to fit in
//! memory; each batch writes its aggregates and deletes its source rows in a
//! single transaction.

use rusqlite::{params, Connection};
use std::time::Duration;

use super::schema::BUCKET_MS;
use super::StoreError;

/// How aggressively space is reclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    Normal,
    /// After a write failed for lack of space
    Emergency,
}

impl std::fmt::Display for ReclaimMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimMode::Normal => write!(f, "normal"),
            ReclaimMode::Emergency => write!(f, "emergency"),
        }
    }
}

/// Summary of one rollup run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupReport {
    pub cutoff: i64,
    pub batches: usize,
    pub aggregates_written: usize,
    pub raw_rows_removed: usize,
}

/// Summary of one prune run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub cutoff: i64,
    pub readings_removed: usize,
    pub alerts_removed: usize,
}

/// Minute-aligned cutoff `window` before `now`
pub fn aligned_cutoff(now: i64, window: Duration) -> i64 {
    let cutoff = now - window.as_millis() as i64;
    cutoff.div_euclid(BUCKET_MS) * BUCKET_MS
}

struct Group {
    machine_id: String,
    bucket: i64,
    vibration: f64,
    temperature: f64,
    noise: f64,
    rpm: f64,
    power_usage: f64,
}

/// Fold raw rows older than `cutoff` into per-minute means
pub fn rollup(
    conn: &mut Connection,
    cutoff: i64,
    batch_groups: usize,
) -> Result<RollupReport, StoreError> {
    let mut report = RollupReport {
        cutoff,
        ..Default::default()
    };

    loop {
        let groups = next_groups(conn, cutoff, batch_groups.max(1))?;
        if groups.is_empty() {
            break;
        }

        let tx = conn.transaction()?;
        let mut removed = 0usize;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO readings
                    (machine_id, timestamp, vibration, temperature, noise, rpm, power_usage, is_aggregated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            )?;
            let mut delete = tx.prepare_cached(
                "DELETE FROM readings
                 WHERE machine_id = ?1 AND is_aggregated = 0 AND timestamp < ?2
                   AND ((timestamp - ((timestamp % ?4) + ?4) % ?4) = ?3)",
            )?;

            for g in &groups {
                insert.execute(params![
                    g.machine_id,
                    g.bucket,
                    g.vibration,
                    g.temperature,
                    g.noise,
                    g.rpm,
                    g.power_usage
                ])?;
                removed += delete.execute(params![g.machine_id, cutoff, g.bucket, BUCKET_MS])?;
            }
        }
        tx.commit()?;

        report.batches += 1;
        report.aggregates_written += groups.len();
        report.raw_rows_removed += removed;

        if removed == 0 {
            // nothing left to fold; avoids spinning on a group that cannot be deleted
            break;
        }
    }

    Ok(report)
}

fn next_groups(conn: &Connection, cutoff: i64, limit: usize) -> Result<Vec<Group>, StoreError> {
    // bucket = floor(timestamp / BUCKET_MS) * BUCKET_MS, also for negative timestamps
    let mut stmt = conn.prepare_cached(
        "SELECT machine_id,
                (timestamp - ((timestamp % ?3) + ?3) % ?3) AS bucket,
                AVG(vibration), AVG(temperature), AVG(noise), AVG(rpm), AVG(power_usage)
         FROM readings
         WHERE is_aggregated = 0 AND timestamp < ?1
         GROUP BY machine_id, bucket
         ORDER BY machine_id, bucket
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![cutoff, limit as i64, BUCKET_MS], |row| {
        Ok(Group {
            machine_id: row.get(0)?,
            bucket: row.get(1)?,
            vibration: row.get(2)?,
            temperature: row.get(3)?,
            noise: row.get(4)?,
            rpm: row.get(5)?,
            power_usage: row.get(6)?,
        })
    })?;

    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

/// Delete every reading and alert older than `cutoff`
pub fn prune(conn: &mut Connection, cutoff: i64) -> Result<PruneReport, StoreError> {
    let tx = conn.transaction()?;
    let readings_removed = tx.execute("DELETE FROM readings WHERE timestamp < ?1", params![cutoff])?;
    let alerts_removed = tx.execute("DELETE FROM alerts WHERE timestamp < ?1", params![cutoff])?;
    tx.commit()?;

    Ok(PruneReport {
        cutoff,
        readings_removed,
        alerts_removed,
    })
}
