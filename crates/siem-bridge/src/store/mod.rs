// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Columnar store abstraction and the canonical `threats` row.
//!
//! # Implementations
//!
//! - [`ClickHouseStore`] -- ClickHouse over the HTTP interface (production)
//! - [`MemoryStore`] -- in-memory rows with injectable failure modes
//!   (`--mock` mode and tests)

pub mod clickhouse;
pub mod memory;

pub use clickhouse::ClickHouseStore;
pub use memory::{FailureMode, MemoryStore};

use crate::event::Event;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store timeout: {0}")]
    Timeout(String),
    #[error("store connection: {0}")]
    Connection(String),
    #[error("store throttled: {0}")]
    TooManyRequests(String),
    #[error("store error {code}: {message}")]
    Server { code: u16, message: String },
    #[error("invalid store request: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Default transient classification: worth a retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::Connection(_) | StoreError::TooManyRequests(_)
        )
    }
}

/// Idempotent schema DDL executed at startup.
pub const THREATS_DDL: &str = "\
CREATE TABLE IF NOT EXISTS threats (
    id UUID,
    timestamp DateTime,
    threat_type String,
    confidence Float32,
    src_ip String,
    dst_ip String,
    src_port UInt16,
    dst_port UInt16,
    protocol String,
    message String,
    metadata String,
    severity UInt8,
    status String,
    user String,
    hostname String,
    process String,
    process_id UInt32,
    log_source String,
    raw_message String,
    event_id UInt32,
    session_id String,
    user_agent String,
    request_uri String,
    http_method String,
    response_code UInt16,
    bytes_transferred UInt64,
    compliance_tags String,
    data_classification String,
    geo_country String,
    geo_city String,
    geo_region String,
    geo_latitude Float64,
    geo_longitude Float64,
    geo_asn UInt32,
    geo_as_name String,
    geo_is_tor UInt8,
    geo_reputation Float32
) ENGINE = MergeTree()
ORDER BY (timestamp, severity, id)
TTL timestamp + INTERVAL 90 DAY";

/// One row of the `threats` table, serialized as JSONEachRow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRow {
    pub id: String,
    /// `YYYY-MM-DD hh:mm:ss` (ClickHouse DateTime text form).
    pub timestamp: String,
    pub threat_type: String,
    pub confidence: f32,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub message: String,
    /// JSON-encoded metadata map.
    pub metadata: String,
    pub severity: u8,
    pub status: String,
    pub user: String,
    pub hostname: String,
    pub process: String,
    pub process_id: u32,
    pub log_source: String,
    pub raw_message: String,
    pub event_id: u32,
    pub session_id: String,
    pub user_agent: String,
    pub request_uri: String,
    pub http_method: String,
    pub response_code: u16,
    pub bytes_transferred: u64,
    /// JSON-encoded tag list.
    pub compliance_tags: String,
    pub data_classification: String,
    pub geo_country: String,
    pub geo_city: String,
    pub geo_region: String,
    pub geo_latitude: f64,
    pub geo_longitude: f64,
    pub geo_asn: u32,
    pub geo_as_name: String,
    pub geo_is_tor: u8,
    pub geo_reputation: f32,
}

impl From<&Event> for ThreatRow {
    fn from(event: &Event) -> Self {
        let network = event.network.clone().unwrap_or_default();
        let identity = event.identity.clone().unwrap_or_default();
        let http = event.http.clone().unwrap_or_default();
        let geo = event.geo.clone();

        let tags: Vec<&str> = event.compliance_tags.iter().map(String::as_str).collect();

        Self {
            id: event
                .id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            timestamp: format_datetime(event.timestamp_ms.unwrap_or(0)),
            threat_type: event.threat_type.clone(),
            confidence: event.confidence,
            src_ip: network.src_ip,
            dst_ip: network.dst_ip,
            src_port: network.src_port,
            dst_port: network.dst_port,
            protocol: network.protocol,
            message: event.payload.clone(),
            metadata: serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string()),
            severity: event.severity,
            status: event.status.clone(),
            user: identity.user,
            hostname: identity.hostname,
            process: identity.process,
            process_id: identity.process_id,
            log_source: event.source.clone(),
            raw_message: String::from_utf8_lossy(&event.raw).into_owned(),
            event_id: event.event_id,
            session_id: identity.session_id,
            user_agent: http.user_agent,
            request_uri: http.uri,
            http_method: http.method,
            response_code: http.status,
            bytes_transferred: http.bytes,
            compliance_tags: serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string()),
            data_classification: event
                .data_classification
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| "internal".to_string()),
            geo_country: geo.as_ref().map(|g| g.country.clone()).unwrap_or_default(),
            geo_city: geo.as_ref().map(|g| g.city.clone()).unwrap_or_default(),
            geo_region: geo.as_ref().map(|g| g.region.clone()).unwrap_or_default(),
            geo_latitude: geo.as_ref().map(|g| g.lat).unwrap_or(0.0),
            geo_longitude: geo.as_ref().map(|g| g.lon).unwrap_or(0.0),
            geo_asn: geo.as_ref().map(|g| g.asn).unwrap_or(0),
            geo_as_name: geo.as_ref().map(|g| g.as_name.clone()).unwrap_or_default(),
            geo_is_tor: geo.as_ref().map(|g| u8::from(g.is_tor)).unwrap_or(0),
            geo_reputation: geo.as_ref().map(|g| g.reputation).unwrap_or(0.0),
        }
    }
}

/// Epoch milliseconds to ClickHouse DateTime text.
fn format_datetime(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// The bridge's view of the columnar store.
#[async_trait]
pub trait ColumnarStore: Send + Sync + 'static {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Execute DDL (startup schema assertion).
    async fn exec(&self, ddl: &str) -> Result<(), StoreError>;

    /// Insert a batch of rows as a single statement.
    async fn insert_batch(&self, rows: &[ThreatRow]) -> Result<(), StoreError>;

    /// Release connections.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        DataClassification, EventKind, GeoInfo, HttpInfo, IdentityInfo, NetworkInfo,
    };
    use uuid::Uuid;

    #[test]
    fn test_row_from_full_event() {
        let mut event = Event::new("legacy", EventKind::Threat);
        event.id = Some(Uuid::parse_str("6f1c1bdc-93e4-4d7a-9f2a-67037b8c2101").unwrap());
        event.timestamp_ms = Some(1_735_700_000_000);
        event.threat_type = "sql_injection".to_string();
        event.severity = 8;
        event.confidence = 0.95;
        event.payload = "sqli attempt".to_string();
        event.raw = b"{\"x\":1}".to_vec();
        event.event_id = 4625;
        event.network = Some(NetworkInfo {
            src_ip: "192.168.1.1".to_string(),
            dst_ip: "10.0.0.5".to_string(),
            src_port: 51544,
            dst_port: 443,
            protocol: "tcp".to_string(),
        });
        event.identity = Some(IdentityInfo {
            user: "alice".to_string(),
            hostname: "web-01".to_string(),
            process: "nginx".to_string(),
            process_id: 1312,
            session_id: "s-1".to_string(),
        });
        event.http = Some(HttpInfo {
            user_agent: "curl/8".to_string(),
            method: "POST".to_string(),
            uri: "/login".to_string(),
            status: 403,
            bytes: 1024,
        });
        event.geo = Some(GeoInfo::private());
        event.compliance_tags.insert("NIST".to_string());
        event.compliance_tags.insert("ISO27001".to_string());
        event.data_classification = Some(DataClassification::Sensitive);
        event
            .metadata
            .insert("rule".to_string(), "sqli-01".to_string());

        let row = ThreatRow::from(&event);
        assert_eq!(row.id, "6f1c1bdc-93e4-4d7a-9f2a-67037b8c2101");
        assert_eq!(row.timestamp, "2025-01-01 02:53:20");
        assert_eq!(row.threat_type, "sql_injection");
        assert_eq!(row.severity, 8);
        assert_eq!(row.src_ip, "192.168.1.1");
        assert_eq!(row.dst_port, 443);
        assert_eq!(row.user, "alice");
        assert_eq!(row.process_id, 1312);
        assert_eq!(row.log_source, "legacy");
        assert_eq!(row.raw_message, "{\"x\":1}");
        assert_eq!(row.event_id, 4625);
        assert_eq!(row.response_code, 403);
        assert_eq!(row.bytes_transferred, 1024);
        assert_eq!(row.compliance_tags, "[\"ISO27001\",\"NIST\"]");
        assert_eq!(row.data_classification, "sensitive");
        assert_eq!(row.geo_country, "PRIVATE");
        assert_eq!(row.geo_reputation, 100.0);
        assert_eq!(row.geo_is_tor, 0);
        assert_eq!(row.metadata, "{\"rule\":\"sqli-01\"}");
    }

    #[test]
    fn test_row_from_sparse_event() {
        let event = Event::new("real", EventKind::Generic);
        let row = ThreatRow::from(&event);
        assert_eq!(row.id, "");
        assert_eq!(row.src_ip, "");
        assert_eq!(row.src_port, 0);
        assert_eq!(row.geo_country, "");
        assert_eq!(row.data_classification, "internal");
        assert_eq!(row.compliance_tags, "[]");
        assert_eq!(row.metadata, "{}");
    }

    #[test]
    fn test_ddl_covers_every_row_column() {
        let row = ThreatRow::from(&Event::new("x", EventKind::Generic));
        let value = serde_json::to_value(&row).unwrap();
        for column in value.as_object().unwrap().keys() {
            assert!(
                THREATS_DDL.contains(&format!("\n    {column} ")),
                "DDL missing column {column}"
            );
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Timeout("t".into()).is_transient());
        assert!(StoreError::Connection("c".into()).is_transient());
        assert!(StoreError::TooManyRequests("r".into()).is_transient());
        assert!(!StoreError::Server {
            code: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!StoreError::Invalid("i".into()).is_transient());
    }
}
