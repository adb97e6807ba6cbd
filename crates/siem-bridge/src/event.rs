// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Canonical security event model.
//!
//! Every inbound message, regardless of dialect, is decoded into an `Event`.
//! Events are immutable after decoding except for the fields the enricher
//! owns (`id`, `timestamp_ms`, `geo`, `compliance_tags`,
//! `data_classification`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Coarse event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Threat,
    System,
    Generic,
}

impl EventKind {
    /// Stable label used in fingerprints and rows.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Threat => "threat",
            EventKind::System => "system",
            EventKind::Generic => "generic",
        }
    }

    /// Parse an explicit kind label; unknown labels map to Generic.
    pub fn from_label(label: &str) -> Self {
        match label {
            "threat" => EventKind::Threat,
            "system" => EventKind::System,
            _ => EventKind::Generic,
        }
    }
}

/// Data sensitivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    Public,
    Internal,
    Sensitive,
    Pii,
    Phi,
}

impl DataClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            DataClassification::Public => "public",
            DataClassification::Internal => "internal",
            DataClassification::Sensitive => "sensitive",
            DataClassification::Pii => "pii",
            DataClassification::Phi => "phi",
        }
    }
}

/// Network 5-tuple fragment. IPs stay textual; ports are 0 when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
}

/// Actor identity fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub user: String,
    pub hostname: String,
    pub process: String,
    pub process_id: u32,
    pub session_id: String,
}

/// HTTP request fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpInfo {
    pub user_agent: String,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub bytes: u64,
}

/// Geo enrichment result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
    pub region: String,
    pub lat: f64,
    pub lon: f64,
    pub asn: u32,
    pub as_name: String,
    pub is_tor: bool,
    pub reputation: f32,
}

impl GeoInfo {
    /// Marker record for non-routable source addresses.
    pub fn private() -> Self {
        Self {
            country: "PRIVATE".to_string(),
            city: String::new(),
            region: String::new(),
            lat: 0.0,
            lon: 0.0,
            asn: 0,
            as_name: String::new(),
            is_tor: false,
            reputation: 100.0,
        }
    }

    /// Fallback record when the provider had no answer.
    pub fn unknown() -> Self {
        Self {
            country: "UNKNOWN".to_string(),
            city: String::new(),
            region: String::new(),
            lat: 0.0,
            lon: 0.0,
            asn: 0,
            as_name: String::new(),
            is_tor: false,
            reputation: 0.0,
        }
    }

    /// True for provider-miss records (cached with a short TTL).
    pub fn is_unknown(&self) -> bool {
        self.country == "UNKNOWN"
    }
}

/// Canonical normalized security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 128-bit unique identifier; assigned by the enricher when absent.
    pub id: Option<Uuid>,
    /// Millisecond-resolution instant; ingestion time when absent.
    pub timestamp_ms: Option<u64>,
    /// Origin tag (`"legacy"`, `"real"`, `"bridge"`, ...).
    pub source: String,
    pub kind: EventKind,
    /// Fine-grained category (e.g. `"sql_injection"`, `"authentication"`).
    /// Drives compliance tagging.
    pub threat_type: String,
    /// Severity 0-10 (decoders clamp).
    pub severity: u8,
    /// Confidence in [0,1] (decoders clamp).
    pub confidence: f32,
    /// Lifecycle status; decoders default to `"new"`.
    pub status: String,
    pub network: Option<NetworkInfo>,
    pub identity: Option<IdentityInfo>,
    pub http: Option<HttpInfo>,
    /// Normalized log line.
    pub payload: String,
    /// Original encoded message, bounded by `max_message_size`.
    pub raw: Vec<u8>,
    pub compliance_tags: BTreeSet<String>,
    pub data_classification: Option<DataClassification>,
    pub geo: Option<GeoInfo>,
    /// Single free-form attribute bag.
    pub metadata: BTreeMap<String, String>,
    /// Dialect-numeric event id (0 when absent).
    pub event_id: u32,
}

impl Event {
    /// Minimal event with decoder defaults; dialects fill in the rest.
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: None,
            timestamp_ms: None,
            source: source.into(),
            kind,
            threat_type: String::new(),
            severity: 0,
            confidence: 0.0,
            status: "new".to_string(),
            network: None,
            identity: None,
            http: None,
            payload: String::new(),
            raw: Vec::new(),
            compliance_tags: BTreeSet::new(),
            data_classification: None,
            geo: None,
            metadata: BTreeMap::new(),
            event_id: 0,
        }
    }

    /// Source IP, if the event carries one.
    pub fn src_ip(&self) -> Option<&str> {
        self.network
            .as_ref()
            .map(|n| n.src_ip.as_str())
            .filter(|ip| !ip.is_empty())
    }

    /// True when an identity with a non-empty user is attached.
    pub fn has_user(&self) -> bool {
        self.identity
            .as_ref()
            .map(|i| !i.user.is_empty())
            .unwrap_or(false)
    }
}
