// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end pipeline tests over the in-memory bus and store.

use siem_bridge::enrich::NullGeoProvider;
use siem_bridge::{BridgeService, Config, MemoryBus, MemoryStore, MessageBus};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> Config {
    let mut config = Config::default();
    config.ring_capacity = 256;
    config.batch_size = 10;
    config.batch_timeout_ms = 50;
    config.fetch_max_wait_ms = 50;
    config.retry_delay_ms = 5;
    config.max_retry_delay_ms = 20;
    config.max_workers = 2;
    config.metrics_port = 0;
    config.shutdown_grace_ms = 3_000;
    config.shutdown_deadline_ms = 8_000;
    config
}

async fn run_bridge(
    config: Config,
    bus: MemoryBus,
    store: MemoryStore,
) -> (
    Arc<siem_bridge::BridgeStats>,
    tokio::sync::oneshot::Sender<()>,
    tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    let service = BridgeService::new(config, bus, store, Arc::new(NullGeoProvider));
    service.init().await.unwrap();
    let stats = service.stats();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(service.run_with_shutdown(async move {
        let _ = stop_rx.await;
    }));
    (stats, stop_tx, handle)
}

async fn wait_for(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_single_legacy_threat_event() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let (stats, stop, handle) = run_bridge(test_config(), bus.clone(), store.clone()).await;

    bus.publish(
        "ultra_siem.threats",
        br#"{
            "source_ip": "192.168.1.1",
            "threat_type": "sql_injection",
            "severity": 8,
            "confidence": 0.95,
            "timestamp": 1735700000,
            "message": "union select in query string"
        }"#
        .to_vec(),
    )
    .await
    .unwrap();

    assert!(wait_for(|| store.row_count() == 1, Duration::from_secs(5)).await);

    let rows = store.rows();
    let row = &rows[0];
    assert_eq!(row.threat_type, "sql_injection");
    assert_eq!(row.severity, 8);
    assert!((row.confidence - 0.95).abs() < 1e-4);
    assert_eq!(row.src_ip, "192.168.1.1");
    // RFC 1918 source never hits the geo provider.
    assert_eq!(row.geo_country, "PRIVATE");
    assert_eq!(row.geo_reputation, 100.0);
    assert!(row.compliance_tags.contains("NIST"));
    assert!(row.compliance_tags.contains("ISO27001"));
    assert_eq!(row.timestamp, "2025-01-01 02:53:20");
    assert_eq!(row.log_source, "legacy");
    assert!(!row.id.is_empty());

    // The bus message is acked only after the write.
    assert_eq!(bus.ack_count(), 1);
    assert_eq!(stats.events_written.get(), 1);

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_duplicate_suppression() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let (stats, stop, handle) = run_bridge(test_config(), bus.clone(), store.clone()).await;

    let payload = br#"{"source_ip": "203.0.113.5", "threat_type": "brute_force", "severity": 6}"#;
    bus.publish("ultra_siem.threats", payload.to_vec())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bus.publish("ultra_siem.threats", payload.to_vec())
        .await
        .unwrap();

    assert!(wait_for(|| stats.events_in.get() == 2, Duration::from_secs(5)).await);
    assert!(wait_for(|| store.row_count() == 1, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one row; the duplicate was counted and acked.
    assert_eq!(store.row_count(), 1);
    assert_eq!(stats.events_dropped_dedup.get(), 1);
    assert_eq!(bus.ack_count(), 2);

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_all_three_dialects_land() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let (_stats, stop, handle) = run_bridge(test_config(), bus.clone(), store.clone()).await;

    bus.publish(
        "ultra_siem.threats",
        br#"{"source_ip": "198.51.100.1", "threat_type": "xss", "severity": 5}"#.to_vec(),
    )
    .await
    .unwrap();
    bus.publish(
        "ultra_siem.detections",
        br#"{"event_type": "port_scan", "ts": 1735700100, "severity": "4", "src_ip": "198.51.100.2"}"#
            .to_vec(),
    )
    .await
    .unwrap();
    bus.publish(
        "ultra_siem.events.full",
        br#"{"threat_type": "authentication", "severity": 2, "timestamp": 1735700000500,
             "identity": {"user": "bob", "hostname": "db-01"}}"#
            .to_vec(),
    )
    .await
    .unwrap();

    assert!(wait_for(|| store.row_count() == 3, Duration::from_secs(5)).await);

    let rows = store.rows();
    let sources: Vec<&str> = rows.iter().map(|r| r.log_source.as_str()).collect();
    assert!(sources.contains(&"legacy"));
    assert!(sources.contains(&"real"));
    assert!(sources.contains(&"bridge"));

    let auth = rows.iter().find(|r| r.threat_type == "authentication").unwrap();
    assert_eq!(auth.user, "bob");
    assert!(auth.compliance_tags.contains("SOX"));
    assert!(auth.compliance_tags.contains("PCI-DSS"));
    assert!(auth.compliance_tags.contains("GDPR"));

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_messages_dropped_not_retried() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let (stats, stop, handle) = run_bridge(test_config(), bus.clone(), store.clone()).await;

    bus.publish("ultra_siem.threats", b"garbage".to_vec())
        .await
        .unwrap();
    bus.publish(
        "ultra_siem.threats",
        br#"{"source_ip": "198.51.100.9", "threat_type": "xss", "severity": 3}"#.to_vec(),
    )
    .await
    .unwrap();

    assert!(wait_for(|| store.row_count() == 1, Duration::from_secs(5)).await);
    assert_eq!(stats.decode_errors.get(), 1);
    // Malformed message was acked away, not redelivered.
    assert_eq!(bus.pending_count("ultra_siem.threats"), 0);
    assert_eq!(bus.inflight_count("ultra_siem.threats"), 0);

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
