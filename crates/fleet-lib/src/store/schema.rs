//! SQLite schema for the local time-series store

use rusqlite::Connection;

use super::StoreError;

/// Width of a rollup bucket in milliseconds
pub const BUCKET_MS: i64 = 60_000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS machines (
    id           TEXT PRIMARY KEY,
    body         TEXT NOT NULL,
    pending_sync INTEGER NOT NULL DEFAULT 0,
    updated_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS readings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    machine_id    TEXT NOT NULL,
    timestamp     INTEGER NOT NULL,
    vibration     REAL NOT NULL,
    temperature   REAL NOT NULL,
    noise         REAL NOT NULL,
    rpm           REAL NOT NULL,
    power_usage   REAL NOT NULL,
    is_aggregated INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_readings_machine_ts ON readings (machine_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_readings_aggregated_ts ON readings (is_aggregated, timestamp);

CREATE TABLE IF NOT EXISTS alerts (
    id           TEXT PRIMARY KEY,
    machine_id   TEXT NOT NULL,
    machine_name TEXT NOT NULL,
    timestamp    INTEGER NOT NULL,
    severity     TEXT NOT NULL,
    message      TEXT NOT NULL,
    sensor_type  TEXT,
    value        REAL
);

CREATE INDEX IF NOT EXISTS idx_alerts_machine_ts_severity ON alerts (machine_id, timestamp, severity);
"#;

/// Create tables and indexes, set connection pragmas
pub fn initialize(conn: &Connection) -> Result<(), StoreError> {
    // journal_mode answers with a row, so it cannot go through execute
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Cap the database file size; writes past it fail with SQLITE_FULL
pub fn set_size_limit(conn: &Connection, bytes: u64) -> Result<(), StoreError> {
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
    let pages = (bytes as i64 / page_size.max(1)).max(1);
    conn.query_row(&format!("PRAGMA max_page_count = {}", pages), [], |_| Ok(()))?;
    Ok(())
}

/// Bytes currently used by the database
pub fn used_bytes(conn: &Connection) -> Result<u64, StoreError> {
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
    let free_pages: i64 = conn.query_row("PRAGMA freelist_count", [], |r| r.get(0))?;
    Ok(((page_count - free_pages).max(0) * page_size) as u64)
}
