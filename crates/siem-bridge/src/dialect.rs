// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-subject dialect decoders.
//!
//! Each consumed subject is bound to one JSON dialect; the decoders turn a
//! raw payload into the canonical [`Event`]. All decoders clamp severity to
//! 0-10 and confidence to [0,1], accept severity as a number or a numeric
//! string, and bound the stored raw message by `max_message_size`
//! (truncating with a `truncated` metadata flag).

use crate::event::{Event, EventKind, HttpInfo, IdentityInfo, NetworkInfo};
use crate::stats::BridgeStats;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// On-wire JSON schema variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Legacy threat feed: canonical field names, epoch-second timestamps.
    Legacy,
    /// Real-time detection engine: epoch seconds, integer severity, a
    /// free-form `details` map.
    Real,
    /// Full schema: every optional field group.
    Full,
}

impl FromStr for Dialect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(Dialect::Legacy),
            "real" => Ok(Dialect::Real),
            "full" => Ok(Dialect::Full),
            other => Err(anyhow::anyhow!("unknown dialect: {other}")),
        }
    }
}

/// A message the decoders refuse to turn into an event.
#[derive(Debug, Error)]
#[error("malformed message: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Subject-keyed decoder dispatch.
pub struct Normalizer {
    routes: HashMap<String, Dialect>,
    max_message_size: usize,
    stats: Arc<BridgeStats>,
}

impl Normalizer {
    pub fn new(
        routes: impl IntoIterator<Item = (String, Dialect)>,
        max_message_size: usize,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            routes: routes.into_iter().collect(),
            max_message_size,
            stats,
        }
    }

    /// Decode a payload received on `subject` into a canonical event.
    pub fn decode(&self, subject: &str, payload: &[u8]) -> Result<Event, DecodeError> {
        let dialect = self
            .routes
            .get(subject)
            .copied()
            .ok_or_else(|| DecodeError::new(format!("unknown subject: {subject}")))?;
        self.decode_as(dialect, payload)
    }

    /// Decode with an explicit dialect (tests and replay tools).
    pub fn decode_as(&self, dialect: Dialect, payload: &[u8]) -> Result<Event, DecodeError> {
        let root: Value = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::new(format!("invalid JSON: {e}")))?;
        let obj = root
            .as_object()
            .ok_or_else(|| DecodeError::new("payload is not a JSON object"))?;

        let mut event = match dialect {
            Dialect::Legacy => self.decode_legacy(obj)?,
            Dialect::Real => self.decode_real(obj)?,
            Dialect::Full => self.decode_full(obj)?,
        };

        self.store_raw(&mut event, payload);
        Ok(event)
    }

    fn decode_legacy(
        &self,
        obj: &serde_json::Map<String, Value>,
    ) -> Result<Event, DecodeError> {
        let mut event = Event::new("legacy", EventKind::Threat);

        event.threat_type = str_field(obj, "threat_type")
            .ok_or_else(|| DecodeError::new("legacy message missing threat_type"))?;
        event.severity = self.clamp_severity(parse_severity(obj.get("severity"))?);
        event.confidence = self.clamp_confidence(parse_confidence(obj.get("confidence"))?);
        event.timestamp_ms = obj.get("timestamp").and_then(epoch_seconds_to_ms);
        event.payload = str_field(obj, "message").unwrap_or_default();
        event.event_id = u32_field(obj, "event_id");
        event.network = network_from_flat(obj, "source_ip", "destination_ip");
        event.identity = identity_from_flat(obj);
        if let Some(id) = str_field(obj, "id").and_then(|s| uuid::Uuid::parse_str(&s).ok()) {
            event.id = Some(id);
        }
        Ok(event)
    }

    fn decode_real(&self, obj: &serde_json::Map<String, Value>) -> Result<Event, DecodeError> {
        let event_type = str_field(obj, "event_type")
            .or_else(|| str_field(obj, "threat_type"))
            .ok_or_else(|| DecodeError::new("real message missing event_type"))?;

        let kind = kind_from_category(&event_type);
        let mut event = Event::new("real", kind);
        event.threat_type = event_type;
        event.severity = self.clamp_severity(parse_severity(obj.get("severity"))?);
        event.confidence = self.clamp_confidence(parse_confidence(obj.get("confidence"))?);
        event.timestamp_ms = obj
            .get("timestamp")
            .or_else(|| obj.get("ts"))
            .and_then(epoch_seconds_to_ms);
        event.payload = str_field(obj, "message").unwrap_or_default();
        event.network = network_from_flat(obj, "src_ip", "dst_ip");
        event.identity = identity_from_flat(obj);

        // Fold the free-form details map into metadata.
        if let Some(details) = obj.get("details").and_then(Value::as_object) {
            for (k, v) in details {
                event.metadata.insert(k.clone(), value_to_string(v));
            }
        }
        Ok(event)
    }

    fn decode_full(&self, obj: &serde_json::Map<String, Value>) -> Result<Event, DecodeError> {
        let source = str_field(obj, "source").unwrap_or_else(|| "bridge".to_string());
        let kind = match str_field(obj, "kind") {
            Some(label) => EventKind::from_label(&label),
            None => kind_from_category(&str_field(obj, "threat_type").unwrap_or_default()),
        };

        let mut event = Event::new(source, kind);
        event.threat_type = str_field(obj, "threat_type")
            .ok_or_else(|| DecodeError::new("full message missing threat_type"))?;
        event.severity = self.clamp_severity(parse_severity(obj.get("severity"))?);
        event.confidence = self.clamp_confidence(parse_confidence(obj.get("confidence"))?);
        event.timestamp_ms = parse_full_timestamp(obj.get("timestamp"));
        event.payload = str_field(obj, "message").unwrap_or_default();
        event.status = str_field(obj, "status").unwrap_or_else(|| "new".to_string());
        event.event_id = u32_field(obj, "event_id");
        if let Some(id) = str_field(obj, "id").and_then(|s| uuid::Uuid::parse_str(&s).ok()) {
            event.id = Some(id);
        }

        if let Some(network) = obj.get("network").and_then(Value::as_object) {
            event.network = Some(NetworkInfo {
                src_ip: str_field(network, "src_ip").unwrap_or_default(),
                dst_ip: str_field(network, "dst_ip").unwrap_or_default(),
                src_port: u16_field(network, "src_port"),
                dst_port: u16_field(network, "dst_port"),
                protocol: str_field(network, "protocol").unwrap_or_default(),
            });
        }

        if let Some(identity) = obj.get("identity").and_then(Value::as_object) {
            event.identity = Some(IdentityInfo {
                user: str_field(identity, "user").unwrap_or_default(),
                hostname: str_field(identity, "hostname").unwrap_or_default(),
                process: str_field(identity, "process").unwrap_or_default(),
                process_id: u32_field(identity, "process_id"),
                session_id: str_field(identity, "session_id").unwrap_or_default(),
            });
        }

        if let Some(http) = obj.get("http").and_then(Value::as_object) {
            event.http = Some(HttpInfo {
                user_agent: str_field(http, "user_agent").unwrap_or_default(),
                method: str_field(http, "method").unwrap_or_default(),
                uri: str_field(http, "uri").unwrap_or_default(),
                status: u16_field(http, "status"),
                bytes: http.get("bytes").and_then(Value::as_u64).unwrap_or(0),
            });
        }

        if let Some(metadata) = obj.get("metadata").and_then(Value::as_object) {
            for (k, v) in metadata {
                event.metadata.insert(k.clone(), value_to_string(v));
            }
        }
        Ok(event)
    }

    /// Store the original payload, truncating over-sized messages.
    fn store_raw(&self, event: &mut Event, payload: &[u8]) {
        if payload.len() > self.max_message_size {
            event.raw = payload[..self.max_message_size].to_vec();
            event
                .metadata
                .insert("truncated".to_string(), "true".to_string());
        } else {
            event.raw = payload.to_vec();
        }
    }

    fn clamp_severity(&self, severity: i64) -> u8 {
        if !(0..=10).contains(&severity) {
            self.stats.values_clamped.inc();
        }
        severity.clamp(0, 10) as u8
    }

    fn clamp_confidence(&self, confidence: f64) -> f32 {
        if !(0.0..=1.0).contains(&confidence) {
            self.stats.values_clamped.inc();
        }
        confidence.clamp(0.0, 1.0) as f32
    }
}

/// Severity arrives as a JSON number or a numeric string; absent means 0.
fn parse_severity(value: Option<&Value>) -> Result<i64, DecodeError> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| DecodeError::new("severity out of integer range")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .map_err(|_| DecodeError::new(format!("unparseable severity: {s}"))),
        Some(other) => Err(DecodeError::new(format!(
            "severity has wrong type: {other}"
        ))),
    }
}

fn parse_confidence(value: Option<&Value>) -> Result<f64, DecodeError> {
    match value {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| DecodeError::new("confidence out of range")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| DecodeError::new(format!("unparseable confidence: {s}"))),
        Some(other) => Err(DecodeError::new(format!(
            "confidence has wrong type: {other}"
        ))),
    }
}

/// Epoch seconds (integer or float) to milliseconds.
fn epoch_seconds_to_ms(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_u64() {
                Some(secs.saturating_mul(1_000))
            } else {
                n.as_f64().filter(|f| *f >= 0.0).map(|f| (f * 1_000.0) as u64)
            }
        }
        Value::String(s) => s.trim().parse::<u64>().ok().map(|v| v * 1_000),
        _ => None,
    }
}

/// Full dialect: epoch milliseconds or RFC 3339.
fn parse_full_timestamp(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis().max(0) as u64),
        _ => None,
    }
}

fn kind_from_category(category: &str) -> EventKind {
    let c = category.to_ascii_lowercase();
    if c.contains("system") || c.contains("process") || c.contains("service") {
        EventKind::System
    } else if c.is_empty() {
        EventKind::Generic
    } else {
        EventKind::Threat
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn u16_field(obj: &serde_json::Map<String, Value>, key: &str) -> u16 {
    obj.get(key)
        .and_then(Value::as_u64)
        .map(|v| v.min(u16::MAX as u64) as u16)
        .unwrap_or(0)
}

fn u32_field(obj: &serde_json::Map<String, Value>, key: &str) -> u32 {
    obj.get(key)
        .and_then(Value::as_u64)
        .map(|v| v.min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

fn network_from_flat(
    obj: &serde_json::Map<String, Value>,
    src_key: &str,
    dst_key: &str,
) -> Option<NetworkInfo> {
    let src_ip = str_field(obj, src_key);
    let dst_ip = str_field(obj, dst_key);
    if src_ip.is_none() && dst_ip.is_none() {
        return None;
    }
    Some(NetworkInfo {
        src_ip: src_ip.unwrap_or_default(),
        dst_ip: dst_ip.unwrap_or_default(),
        src_port: u16_field(obj, "source_port").max(u16_field(obj, "src_port")),
        dst_port: u16_field(obj, "destination_port").max(u16_field(obj, "dst_port")),
        protocol: str_field(obj, "protocol").unwrap_or_default(),
    })
}

fn identity_from_flat(obj: &serde_json::Map<String, Value>) -> Option<IdentityInfo> {
    let user = str_field(obj, "user").or_else(|| str_field(obj, "username"));
    let hostname = str_field(obj, "hostname");
    if user.is_none() && hostname.is_none() {
        return None;
    }
    Some(IdentityInfo {
        user: user.unwrap_or_default(),
        hostname: hostname.unwrap_or_default(),
        process: str_field(obj, "process").unwrap_or_default(),
        process_id: u32_field(obj, "process_id"),
        session_id: str_field(obj, "session_id").unwrap_or_default(),
    })
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
