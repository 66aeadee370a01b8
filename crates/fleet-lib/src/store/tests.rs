//! Store tests: persistence round trips, rollup, prune, quota handling

use super::*;
use crate::models::MachineStatus;
use async_trait::async_trait;
use tempfile::TempDir;

const MINUTE: i64 = 60_000;

fn reading(ts: i64, temperature: f64) -> SensorReading {
    SensorReading {
        timestamp: ts,
        vibration: 2.0,
        temperature,
        noise: 70.0,
        rpm: 1500.0,
        power_usage: 40.0,
    }
}

fn memory_store() -> TelemetryStore {
    TelemetryStore::open_in_memory(StoreConfig::default()).unwrap()
}

/// Probe reporting a fixed usage
struct FixedProbe {
    usage_bytes: u64,
    quota_bytes: u64,
}

#[async_trait]
impl StorageProbe for FixedProbe {
    async fn estimate(&self) -> Result<StorageEstimate, StoreError> {
        Ok(StorageEstimate {
            usage_bytes: self.usage_bytes,
            quota_bytes: self.quota_bytes,
        })
    }
}

/// Start of a minute bucket comfortably older than the default hot window
fn old_bucket() -> i64 {
    aligned_cutoff(now_millis(), Duration::from_secs(3 * 60 * 60))
}

#[tokio::test]
async fn test_machine_round_trip_strips_history() {
    let store = memory_store();
    let machine = Machine::new("m1", "Press", "Hydraulic Press", "Line 1")
        .with_reading(reading(1, 60.0), 50);

    store.save_machine(&machine, true).await.unwrap();

    let loaded = store.load_machines().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].machine.id, "m1");
    assert!(loaded[0].machine.history.is_empty());
    assert!(loaded[0].pending_sync);
}

#[tokio::test]
async fn test_pending_machines_and_mark_synced() {
    let store = memory_store();
    store
        .save_machine(&Machine::new("m1", "A", "Lathe", "Bay 1"), true)
        .await
        .unwrap();
    store
        .save_machine(&Machine::new("m2", "B", "Lathe", "Bay 2"), false)
        .await
        .unwrap();

    let pending = store.pending_machines().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "m1");

    assert!(store.mark_machine_synced("m1").await.unwrap());
    assert!(!store.mark_machine_synced("ghost").await.unwrap());
    assert!(store.pending_machines().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_save_machine_replaces_metadata() {
    let store = memory_store();
    let mut machine = Machine::new("m1", "Press", "Press", "Bay 1");
    store.save_machine(&machine, false).await.unwrap();

    machine.status = MachineStatus::Critical;
    machine.location = "Bay 9".into();
    store.save_machine(&machine, false).await.unwrap();

    let loaded = store.load_machines().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].machine.location, "Bay 9");
    assert_eq!(loaded[0].machine.status, MachineStatus::Critical);
}

#[tokio::test]
async fn test_latest_readings_are_chronological() {
    let store = memory_store();
    let rows: Vec<_> = (0..10)
        .map(|i| PersistedReading::raw("m1", reading(1_000 + i, 60.0 + i as f64)))
        .collect();
    assert_eq!(store.append_readings(rows).await.unwrap(), 10);

    let latest = store.latest_readings("m1", 3).await.unwrap();
    let ts: Vec<i64> = latest.iter().map(|r| r.reading.timestamp).collect();
    assert_eq!(ts, vec![1_007, 1_008, 1_009]);
}

#[tokio::test]
async fn test_latest_readings_all_caps_each_machine() {
    let store = memory_store();
    let mut rows = Vec::new();
    for i in 0..6 {
        rows.push(PersistedReading::raw("a", reading(i, 60.0)));
    }
    rows.push(PersistedReading::raw("b", reading(100, 60.0)));
    store.append_readings(rows).await.unwrap();

    let all = store.latest_readings_all(4).await.unwrap();
    let a: Vec<i64> = all["a"].iter().map(|r| r.reading.timestamp).collect();
    assert_eq!(a, vec![2, 3, 4, 5]);
    assert_eq!(all["b"].len(), 1);
}

#[tokio::test]
async fn test_rollup_mean_and_row_replacement() {
    let store = memory_store();
    let bucket = old_bucket();
    let temps = [60.0, 70.0, 80.0, 90.0];
    let rows: Vec<_> = temps
        .iter()
        .enumerate()
        .map(|(i, t)| PersistedReading::raw("m1", reading(bucket + i as i64 * 10_000, *t)))
        .collect();
    store.append_readings(rows).await.unwrap();

    let report = store.perform_rollup(ReclaimMode::Normal).await.unwrap();
    assert_eq!(report.aggregates_written, 1);
    assert_eq!(report.raw_rows_removed, 4);

    let history = store.full_history("m1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_aggregated);
    assert_eq!(history[0].reading.timestamp, bucket);
    assert!((history[0].reading.temperature - 75.0).abs() < 1e-9);
    assert!((history[0].reading.vibration - 2.0).abs() < 1e-9);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.raw_readings, 0);
    assert_eq!(stats.aggregated_readings, 1);
}

#[tokio::test]
async fn test_rollup_groups_by_machine_and_minute() {
    let store = memory_store();
    let bucket = old_bucket();
    store
        .append_readings(vec![
            PersistedReading::raw("m1", reading(bucket, 60.0)),
            PersistedReading::raw("m1", reading(bucket + MINUTE, 62.0)),
            PersistedReading::raw("m2", reading(bucket + 5, 64.0)),
        ])
        .await
        .unwrap();

    let report = store.perform_rollup(ReclaimMode::Normal).await.unwrap();
    assert_eq!(report.aggregates_written, 3);
    assert_eq!(store.full_history("m1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rollup_in_small_batches() {
    let store = TelemetryStore::open_in_memory(StoreConfig {
        rollup_batch_groups: 2,
        ..Default::default()
    })
    .unwrap();
    let bucket = old_bucket();
    let rows: Vec<_> = (0..7)
        .map(|i| PersistedReading::raw("m1", reading(bucket + i * MINUTE, 60.0)))
        .collect();
    store.append_readings(rows).await.unwrap();

    let report = store.perform_rollup(ReclaimMode::Normal).await.unwrap();
    assert_eq!(report.batches, 4);
    assert_eq!(report.aggregates_written, 7);
    assert_eq!(store.stats().await.unwrap().raw_readings, 0);
}

#[tokio::test]
async fn test_quota_watermark_triggers_rollup() {
    let store = memory_store().with_probe(Arc::new(FixedProbe {
        usage_bytes: 65,
        quota_bytes: 100,
    }));
    let now = now_millis();
    let bucket = old_bucket();
    store
        .append_readings(vec![
            PersistedReading::raw("m1", reading(bucket, 60.0)),
            PersistedReading::raw("m1", reading(bucket + 1_000, 80.0)),
            PersistedReading::raw("m1", reading(now, 90.0)),
        ])
        .await
        .unwrap();

    let check = store.check_quota().await.unwrap();
    assert!(check.status.over_watermark);
    let rollup = check.rollup.expect("rollup should run past the watermark");
    assert_eq!(rollup.raw_rows_removed, 2);

    let history = store.full_history("m1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_aggregated);
    assert!((history[0].reading.temperature - 70.0).abs() < 1e-9);
    // newer than the hot cutoff: untouched
    assert!(!history[1].is_aggregated);
    assert_eq!(history[1].reading.timestamp, now);
}

#[tokio::test]
async fn test_quota_below_watermark_leaves_rows() {
    let store = memory_store().with_probe(Arc::new(FixedProbe {
        usage_bytes: 10,
        quota_bytes: 100,
    }));
    store
        .append_readings(vec![PersistedReading::raw("m1", reading(old_bucket(), 60.0))])
        .await
        .unwrap();

    let check = store.check_quota().await.unwrap();
    assert!(!check.status.over_watermark);
    assert!(check.rollup.is_none());
    assert_eq!(store.stats().await.unwrap().raw_readings, 1);
}

#[tokio::test]
async fn test_prune_modes() {
    let store = memory_store();
    let now = now_millis();
    let day = 24 * 60 * MINUTE;
    store
        .append_readings(vec![
            PersistedReading::raw("m1", reading(now - 10 * day, 60.0)),
            PersistedReading::raw("m1", reading(now - 2 * day, 60.0)),
            PersistedReading::raw("m1", reading(now, 60.0)),
        ])
        .await
        .unwrap();

    let normal = store.prune(ReclaimMode::Normal).await.unwrap();
    assert_eq!(normal.readings_removed, 1);

    let emergency = store.prune(ReclaimMode::Emergency).await.unwrap();
    assert_eq!(emergency.readings_removed, 1);
    assert_eq!(store.full_history("m1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_alerts_are_immutable_and_newest_first() {
    let store = memory_store();
    let alert = |id: &str, ts: i64, message: &str| Alert {
        id: id.into(),
        machine_id: "m1".into(),
        machine_name: "Press".into(),
        timestamp: ts,
        severity: AlertSeverity::High,
        message: message.into(),
        sensor_type: Some("temperature".into()),
        value: Some(91.0),
    };

    store.save_alert(&alert("a1", 1_000, "first")).await.unwrap();
    store.save_alert(&alert("a2", 2_000, "second")).await.unwrap();
    store.save_alert(&alert("a1", 3_000, "rewritten")).await.unwrap();

    let alerts = store.recent_alerts(10).await.unwrap();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].id, "a2");
    assert_eq!(alerts[1].message, "first");
    assert_eq!(alerts[1].sensor_type.as_deref(), Some("temperature"));
}

#[tokio::test]
async fn test_record_diagnosis_updates_severity_and_message_only() {
    let store = memory_store();
    let mut alert = Alert {
        id: "a1".into(),
        machine_id: "m1".into(),
        machine_name: "Press".into(),
        timestamp: 1_000,
        severity: AlertSeverity::High,
        message: "Critical temperature".into(),
        sensor_type: Some("temperature".into()),
        value: Some(91.0),
    };
    store.save_alert(&alert).await.unwrap();

    alert.severity = AlertSeverity::Medium;
    alert.message = "Bearing wear suspected".into();
    alert.timestamp = 9_999;
    assert!(store.record_diagnosis(&alert).await.unwrap());

    let stored = &store.recent_alerts(1).await.unwrap()[0];
    assert_eq!(stored.severity, AlertSeverity::Medium);
    assert_eq!(stored.message, "Bearing wear suspected");
    assert_eq!(stored.timestamp, 1_000);

    alert.id = "ghost".into();
    assert!(!store.record_diagnosis(&alert).await.unwrap());
}

#[tokio::test]
async fn test_quota_exhaustion_recovers_with_emergency_reclaim() {
    // small enough that a few thousand rows fill it
    let store = TelemetryStore::open_in_memory(StoreConfig {
        quota_bytes: 256 * 1024,
        ..Default::default()
    })
    .unwrap();

    // every row is past the emergency cold window, so reclaim always frees room
    let old = old_bucket() - 2 * 24 * 60 * MINUTE;
    for batch in 0..200 {
        let rows: Vec<_> = (0..100)
            .map(|i| PersistedReading::raw("m1", reading(old + batch * 100 + i, 60.0)))
            .collect();
        store.append_readings(rows).await.unwrap();
    }

    let stats = store.stats().await.unwrap();
    assert!(stats.raw_readings < 20_000);
    assert!(stats.usage_bytes <= 256 * 1024);
}

#[tokio::test]
async fn test_quota_exhaustion_rolls_up_recent_rows() {
    let store = TelemetryStore::open_in_memory(StoreConfig {
        quota_bytes: 256 * 1024,
        ..Default::default()
    })
    .unwrap();

    // one to three hours old: inside the emergency cold window, past the
    // emergency hot window, so only rollup can make room
    let base = old_bucket();
    for batch in 0..200 {
        let rows: Vec<_> = (0..100)
            .map(|i| {
                let n = batch * 100 + i;
                PersistedReading::raw("m1", reading(base + n * 360, 60.0))
            })
            .collect();
        store.append_readings(rows).await.unwrap();
    }

    let stats = store.stats().await.unwrap();
    assert!(stats.aggregated_readings > 0);
    assert!(stats.raw_readings < 20_000);
    assert!(stats.usage_bytes <= 256 * 1024);

    let history = store.full_history("m1").await.unwrap();
    assert!(history.iter().any(|r| r.is_aggregated));
    assert!(history.iter().all(|r| (r.reading.temperature - 60.0).abs() < 1e-9));
    assert!(history.windows(2).all(|w| w[0].reading.timestamp <= w[1].reading.timestamp));
}

#[tokio::test]
async fn test_on_disk_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::default().with_path(dir.path().join("fleet.db"));

    {
        let store = TelemetryStore::open(config.clone()).await.unwrap();
        store
            .save_machine(&Machine::new("m1", "Press", "Press", "Bay 1"), false)
            .await
            .unwrap();
        store
            .append_readings(vec![PersistedReading::raw("m1", reading(now_millis(), 61.0))])
            .await
            .unwrap();
    }

    let store = TelemetryStore::open(config).await.unwrap();
    assert_eq!(store.load_machines().await.unwrap().len(), 1);
    assert_eq!(store.latest_readings("m1", 5).await.unwrap().len(), 1);
}
