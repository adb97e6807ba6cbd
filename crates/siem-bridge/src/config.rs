// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! Resolution order: built-in defaults, then an optional YAML file, then
//! environment variables (environment wins). Every knob has an env key; the
//! file is never required.

use crate::dialect::Dialect;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the subscriber reacts when the ring refuses an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullPolicy {
    /// Nak the bus message and let the bus redeliver (default).
    Refuse,
    /// Publish the raw message to the DLQ subject and ack.
    Dlq,
    /// Wait up to `full_block_timeout_ms` for ring space, then nak.
    Block,
    /// Evict the oldest ring entry (nak its bus handle) and insert.
    DropOldest,
}

impl FullPolicy {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "refuse" => Ok(FullPolicy::Refuse),
            "dlq" => Ok(FullPolicy::Dlq),
            "block" => Ok(FullPolicy::Block),
            "drop_oldest" => Ok(FullPolicy::DropOldest),
            other => bail!("unknown full policy: {other}"),
        }
    }
}

/// One bus subject and the dialect its payloads are decoded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectConfig {
    pub subject: String,
    pub dialect: Dialect,
}

/// mTLS material passed through to the bus and store clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enable: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Rolling observation window in milliseconds.
    pub interval_ms: u64,
    /// Minimum requests in the window before the ratio is evaluated.
    pub threshold: u32,
    /// Failure ratio that trips the breaker.
    pub trip_ratio: f64,
    /// Time spent open before probing, in milliseconds.
    pub timeout_ms: u64,
    /// Consecutive half-open successes required to close.
    pub recovery_successes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            threshold: 3,
            trip_ratio: 0.6,
            timeout_ms: 60_000,
            recovery_successes: 3,
        }
    }
}

/// Bridge configuration. All durations are stored in milliseconds; accessor
/// methods hand out `Duration`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Message bus endpoint.
    pub bus_url: String,
    /// Columnar store endpoint (scheme-less values get `http://`).
    pub store_url: String,
    pub store_user: String,
    pub store_pass: String,
    pub store_db: String,
    /// Subjects consumed, with their decode dialects.
    pub subjects: Vec<SubjectConfig>,
    /// Durable consumer group name.
    pub consumer_group: String,
    /// Dead-letter subject.
    pub dlq_subject: String,
    /// Optional post-storage fan-out subject.
    pub fanout_subject: Option<String>,

    /// Events per columnar insert.
    pub batch_size: usize,
    /// Flush deadline from the first event in a batch.
    pub batch_timeout_ms: u64,
    /// Per-batch retry budget.
    pub max_retries: u32,
    /// Initial retry backoff.
    pub retry_delay_ms: u64,
    /// Retry backoff cap.
    pub max_retry_delay_ms: u64,

    /// Ring capacity; must be a power of two.
    pub ring_capacity: usize,
    pub full_policy: FullPolicy,
    /// Bounded wait for `FullPolicy::Block`.
    pub full_block_timeout_ms: u64,

    pub dedup_window_ms: u64,
    pub dedup_capacity: usize,

    /// Cap on the stored raw message, in bytes.
    pub max_message_size: usize,
    /// Store connection pool cap.
    pub max_connections: usize,
    /// Batch writer worker count (0 = min(cpus, 16)).
    pub max_workers: usize,

    pub metrics_port: u16,
    pub log_level: String,
    pub tls: TlsConfig,

    /// Optional HTTP geo provider endpoint.
    pub geo_api_url: Option<String>,
    pub geo_timeout_ms: u64,
    pub geo_cache_size: usize,

    /// Bus pull size.
    pub fetch_batch: usize,
    /// Bus pull wait.
    pub fetch_max_wait_ms: u64,

    pub connect_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub health_threshold_ms: u64,
    pub unhealthy_open_duration_ms: u64,

    pub breaker: BreakerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_url: "nats://localhost:4222".to_string(),
            store_url: "localhost:9000".to_string(),
            store_user: String::new(),
            store_pass: String::new(),
            store_db: "ultra_siem".to_string(),
            subjects: vec![
                SubjectConfig {
                    subject: "ultra_siem.threats".to_string(),
                    dialect: Dialect::Legacy,
                },
                SubjectConfig {
                    subject: "ultra_siem.detections".to_string(),
                    dialect: Dialect::Real,
                },
                SubjectConfig {
                    subject: "ultra_siem.events.full".to_string(),
                    dialect: Dialect::Full,
                },
            ],
            consumer_group: "siem-bridge".to_string(),
            dlq_subject: "ultra_siem.dlq".to_string(),
            fanout_subject: None,
            batch_size: 100,
            batch_timeout_ms: 5_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            ring_capacity: 1_048_576,
            full_policy: FullPolicy::Refuse,
            full_block_timeout_ms: 1_000,
            dedup_window_ms: 60_000,
            dedup_capacity: 100_000,
            max_message_size: 10 * 1024 * 1024,
            max_connections: 10,
            max_workers: 0,
            metrics_port: 8080,
            log_level: "info".to_string(),
            tls: TlsConfig::default(),
            geo_api_url: None,
            geo_timeout_ms: 500,
            geo_cache_size: 10_000,
            fetch_batch: 100,
            fetch_max_wait_ms: 5_000,
            connect_timeout_ms: 10_000,
            query_timeout_ms: 60_000,
            shutdown_grace_ms: 10_000,
            shutdown_deadline_ms: 30_000,
            health_threshold_ms: 60_000,
            unhealthy_open_duration_ms: 120_000,
            breaker: BreakerSettings::default(),
        }
    }
}

impl Config {
    /// Defaults, then optional YAML file, then environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file over the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Apply environment overrides through a lookup function (injectable for
    /// tests).
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn set_string(dst: &mut String, value: Option<String>) {
            if let Some(v) = value {
                *dst = v;
            }
        }

        fn set_parsed<T: std::str::FromStr>(
            dst: &mut T,
            key: &str,
            value: Option<String>,
        ) -> Result<()>
        where
            T::Err: std::fmt::Display,
        {
            if let Some(v) = value {
                *dst = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid {key}={v}: {e}"))?;
            }
            Ok(())
        }

        fn set_duration(dst: &mut u64, key: &str, value: Option<String>) -> Result<()> {
            if let Some(v) = value {
                *dst = parse_duration_ms(&v)
                    .with_context(|| format!("invalid {key}={v}"))?;
            }
            Ok(())
        }

        set_string(&mut self.bus_url, get("BUS_URL"));
        set_string(&mut self.store_url, get("STORE_URL"));
        set_string(&mut self.store_user, get("STORE_USER"));
        set_string(&mut self.store_pass, get("STORE_PASS"));
        set_string(&mut self.store_db, get("STORE_DB"));
        set_string(&mut self.consumer_group, get("CONSUMER_GROUP"));
        set_string(&mut self.dlq_subject, get("DLQ_SUBJECT"));
        set_string(&mut self.log_level, get("LOG_LEVEL"));
        if let Some(v) = get("FANOUT_SUBJECT") {
            self.fanout_subject = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = get("GEO_API_URL") {
            self.geo_api_url = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = get("SUBJECTS") {
            self.subjects = parse_subjects(&v)?;
        }
        if let Some(v) = get("FULL_POLICY") {
            self.full_policy = FullPolicy::parse(&v)?;
        }

        set_parsed(&mut self.batch_size, "BATCH_SIZE", get("BATCH_SIZE"))?;
        set_parsed(&mut self.max_retries, "MAX_RETRIES", get("MAX_RETRIES"))?;
        set_parsed(&mut self.ring_capacity, "RING_CAPACITY", get("RING_CAPACITY"))?;
        set_parsed(&mut self.dedup_capacity, "DEDUP_CAPACITY", get("DEDUP_CAPACITY"))?;
        set_parsed(
            &mut self.max_message_size,
            "MAX_MESSAGE_SIZE",
            get("MAX_MESSAGE_SIZE"),
        )?;
        set_parsed(
            &mut self.max_connections,
            "MAX_CONNECTIONS",
            get("MAX_CONNECTIONS"),
        )?;
        set_parsed(&mut self.max_workers, "MAX_WORKERS", get("MAX_WORKERS"))?;
        set_parsed(&mut self.metrics_port, "METRICS_PORT", get("METRICS_PORT"))?;
        set_parsed(&mut self.fetch_batch, "FETCH_BATCH", get("FETCH_BATCH"))?;
        set_parsed(
            &mut self.geo_cache_size,
            "GEO_CACHE_SIZE",
            get("GEO_CACHE_SIZE"),
        )?;

        set_duration(&mut self.batch_timeout_ms, "BATCH_TIMEOUT", get("BATCH_TIMEOUT"))?;
        set_duration(&mut self.retry_delay_ms, "RETRY_DELAY", get("RETRY_DELAY"))?;
        set_duration(
            &mut self.max_retry_delay_ms,
            "MAX_RETRY_DELAY",
            get("MAX_RETRY_DELAY"),
        )?;
        set_duration(&mut self.dedup_window_ms, "DEDUP_WINDOW", get("DEDUP_WINDOW"))?;
        set_duration(
            &mut self.full_block_timeout_ms,
            "FULL_BLOCK_TIMEOUT",
            get("FULL_BLOCK_TIMEOUT"),
        )?;
        set_duration(&mut self.geo_timeout_ms, "GEO_TIMEOUT", get("GEO_TIMEOUT"))?;
        set_duration(
            &mut self.fetch_max_wait_ms,
            "FETCH_MAX_WAIT",
            get("FETCH_MAX_WAIT"),
        )?;
        set_duration(
            &mut self.connect_timeout_ms,
            "CONNECT_TIMEOUT",
            get("CONNECT_TIMEOUT"),
        )?;
        set_duration(&mut self.query_timeout_ms, "QUERY_TIMEOUT", get("QUERY_TIMEOUT"))?;
        set_duration(
            &mut self.shutdown_grace_ms,
            "SHUTDOWN_GRACE",
            get("SHUTDOWN_GRACE"),
        )?;
        set_duration(
            &mut self.shutdown_deadline_ms,
            "SHUTDOWN_DEADLINE",
            get("SHUTDOWN_DEADLINE"),
        )?;
        set_duration(
            &mut self.health_threshold_ms,
            "HEALTH_THRESHOLD",
            get("HEALTH_THRESHOLD"),
        )?;
        set_duration(
            &mut self.unhealthy_open_duration_ms,
            "UNHEALTHY_OPEN_DURATION",
            get("UNHEALTHY_OPEN_DURATION"),
        )?;

        if let Some(v) = get("TLS_ENABLE") {
            self.tls.enable = matches!(v.as_str(), "1" | "true" | "on" | "yes");
        }
        if let Some(v) = get("TLS_CERT") {
            self.tls.cert = Some(v);
        }
        if let Some(v) = get("TLS_KEY") {
            self.tls.key = Some(v);
        }
        if let Some(v) = get("TLS_CA") {
            self.tls.ca = Some(v);
        }

        Ok(())
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.ring_capacity.is_power_of_two() {
            bail!(
                "RING_CAPACITY must be a power of two, got {}",
                self.ring_capacity
            );
        }
        if self.batch_size == 0 {
            bail!("BATCH_SIZE must be > 0");
        }
        if self.subjects.is_empty() {
            bail!("at least one subject is required");
        }
        if self.tls.enable && (self.tls.cert.is_none() || self.tls.key.is_none()) {
            bail!("TLS_ENABLE requires TLS_CERT and TLS_KEY");
        }
        Ok(())
    }

    /// Effective writer worker count.
    pub fn worker_count(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            num_cpus::get().min(16).max(1)
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn full_block_timeout(&self) -> Duration {
        Duration::from_millis(self.full_block_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn geo_timeout(&self) -> Duration {
        Duration::from_millis(self.geo_timeout_ms)
    }

    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn health_threshold(&self) -> Duration {
        Duration::from_millis(self.health_threshold_ms)
    }

    pub fn unhealthy_open_duration(&self) -> Duration {
        Duration::from_millis(self.unhealthy_open_duration_ms)
    }
}

/// Parse `"subject=dialect,subject=dialect"`.
fn parse_subjects(spec: &str) -> Result<Vec<SubjectConfig>> {
    let mut subjects = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (subject, dialect) = part
            .split_once('=')
            .with_context(|| format!("expected subject=dialect, got {part}"))?;
        subjects.push(SubjectConfig {
            subject: subject.trim().to_string(),
            dialect: dialect.trim().parse()?,
        });
    }
    if subjects.is_empty() {
        bail!("SUBJECTS is empty");
    }
    Ok(subjects)
}

/// Parse `"5s"`, `"500ms"`, `"2m"` or a plain millisecond count.
pub fn parse_duration_ms(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: u64 = digits.parse().context("duration must start with digits")?;
    match unit.trim() {
        "" | "ms" => Ok(value),
        "s" => Ok(value * 1_000),
        "m" => Ok(value * 60_000),
        "h" => Ok(value * 3_600_000),
        other => bail!("unknown duration unit: {other}"),
    }
}
