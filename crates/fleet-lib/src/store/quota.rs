//! Storage quota estimation

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;

use super::{schema, StoreError};

/// Usage against available capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
}

impl StorageEstimate {
    pub fn percent_used(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 0.0;
        }
        self.usage_bytes as f64 / self.quota_bytes as f64 * 100.0
    }
}

/// Capability that reports how much storage is in use
#[async_trait]
pub trait StorageProbe: Send + Sync {
    async fn estimate(&self) -> Result<StorageEstimate, StoreError>;
}

/// Probe reading SQLite page counts against a configured quota
pub struct SqliteProbe {
    conn: Arc<Mutex<Connection>>,
    quota_bytes: u64,
}

impl SqliteProbe {
    pub fn new(conn: Arc<Mutex<Connection>>, quota_bytes: u64) -> Self {
        Self { conn, quota_bytes }
    }
}

#[async_trait]
impl StorageProbe for SqliteProbe {
    async fn estimate(&self) -> Result<StorageEstimate, StoreError> {
        let conn = self.conn.clone();
        let quota_bytes = self.quota_bytes;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            Ok(StorageEstimate {
                usage_bytes: schema::used_bytes(&conn)?,
                quota_bytes,
            })
        })
        .await?
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaStatus {
    pub estimate: StorageEstimate,
    pub percent_used: f64,
    /// Relative watermark or absolute ceiling crossed
    pub over_watermark: bool,
}

impl QuotaStatus {
    pub fn evaluate(estimate: StorageEstimate, high_watermark_percent: f64, max_bytes: u64) -> Self {
        let percent_used = estimate.percent_used();
        Self {
            estimate,
            percent_used,
            over_watermark: percent_used >= high_watermark_percent
                || estimate.usage_bytes >= max_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_used() {
        let e = StorageEstimate {
            usage_bytes: 65,
            quota_bytes: 100,
        };
        assert!((e.percent_used() - 65.0).abs() < f64::EPSILON);

        let zero = StorageEstimate {
            usage_bytes: 10,
            quota_bytes: 0,
        };
        assert_eq!(zero.percent_used(), 0.0);
    }

    #[test]
    fn test_watermark_relative_or_absolute() {
        let e = StorageEstimate {
            usage_bytes: 65,
            quota_bytes: 100,
        };
        assert!(QuotaStatus::evaluate(e, 60.0, u64::MAX).over_watermark);
        assert!(!QuotaStatus::evaluate(e, 70.0, u64::MAX).over_watermark);
        assert!(QuotaStatus::evaluate(e, 70.0, 64).over_watermark);
    }

    #[tokio::test]
    async fn test_sqlite_probe_reports_usage() {
        let conn = Connection::open_in_memory().unwrap();
        schema::initialize(&conn).unwrap();
        let probe = SqliteProbe::new(Arc::new(Mutex::new(conn)), 1024 * 1024);

        let estimate = probe.estimate().await.unwrap();
        assert!(estimate.usage_bytes > 0);
        assert_eq!(estimate.quota_bytes, 1024 * 1024);
    }
}
