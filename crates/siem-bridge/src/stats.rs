// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge statistics: atomic counters, gauges, and bucketed latency
//! histograms, rendered in Prometheus text exposition format.
//!
//! Counter increments are Relaxed atomics; histograms use fixed bucket
//! bounds with an integer micro-unit sum so observation stays lock-free.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Fixed-bucket histogram. Sum is tracked in micro-units (1e-6 of the
/// observed value) so it fits an atomic integer.
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        let buckets = (0..bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, d: Duration) {
        self.observe(d.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    fn render(&self, out: &mut String, name: &str) {
        use std::fmt::Write;
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, bound) in self.bounds.iter().enumerate() {
            let _ = writeln!(
                out,
                "{name}_bucket{{le=\"{bound}\"}} {}",
                self.buckets[i].load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", self.count());
        let _ = writeln!(out, "{name}_sum {}", self.sum());
        let _ = writeln!(out, "{name}_count {}", self.count());
    }
}

const BATCH_SIZE_BOUNDS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0,
];

const LATENCY_BOUNDS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Circuit state gauge values.
pub const CIRCUIT_CLOSED: u64 = 0;
pub const CIRCUIT_OPEN: u64 = 1;
pub const CIRCUIT_HALF_OPEN: u64 = 2;

/// All bridge counters, gauges, and histograms.
#[derive(Debug)]
pub struct BridgeStats {
    pub events_in: Counter,
    pub events_decoded: Counter,
    pub events_dropped_dedup: Counter,
    pub events_dropped_full: Counter,
    pub events_written: Counter,
    pub events_dlq: Counter,
    pub decode_errors: Counter,
    pub enrichment_lookups: Counter,
    pub circuit_opens: Counter,
    pub values_clamped: Counter,
    pub ungraceful_shutdown: Counter,
    pub bus_reconnects: Counter,

    pub ring_fill: Gauge,
    pub circuit_state: Gauge,
    pub inflight_batches: Gauge,

    pub batch_size: Histogram,
    pub write_latency_seconds: Histogram,
    pub end_to_end_latency_seconds: Histogram,

    /// Unix ms of the last successful store write (0 = never).
    pub last_write_unix_ms: AtomicU64,
    /// Unix ms since the circuit entered open (0 = not open).
    pub circuit_open_since_ms: AtomicU64,
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            events_in: Counter::default(),
            events_decoded: Counter::default(),
            events_dropped_dedup: Counter::default(),
            events_dropped_full: Counter::default(),
            events_written: Counter::default(),
            events_dlq: Counter::default(),
            decode_errors: Counter::default(),
            enrichment_lookups: Counter::default(),
            circuit_opens: Counter::default(),
            values_clamped: Counter::default(),
            ungraceful_shutdown: Counter::default(),
            bus_reconnects: Counter::default(),
            ring_fill: Gauge::default(),
            circuit_state: Gauge::default(),
            inflight_batches: Gauge::default(),
            batch_size: Histogram::new(BATCH_SIZE_BOUNDS),
            write_latency_seconds: Histogram::new(LATENCY_BOUNDS),
            end_to_end_latency_seconds: Histogram::new(LATENCY_BOUNDS),
            last_write_unix_ms: AtomicU64::new(0),
            circuit_open_since_ms: AtomicU64::new(0),
        }
    }

    /// Record a successful store write at the current wall clock.
    pub fn mark_write(&self) {
        self.last_write_unix_ms
            .store(unix_ms_now(), Ordering::Relaxed);
    }

    /// Millis since the last successful write; `None` if none yet.
    pub fn since_last_write_ms(&self) -> Option<u64> {
        let last = self.last_write_unix_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some(unix_ms_now().saturating_sub(last))
    }

    /// Record the circuit entering the open state.
    pub fn mark_circuit_open(&self) {
        self.circuit_open_since_ms
            .store(unix_ms_now(), Ordering::Relaxed);
    }

    /// Record the circuit leaving the open state.
    pub fn clear_circuit_open(&self) {
        self.circuit_open_since_ms.store(0, Ordering::Relaxed);
    }

    /// Millis the circuit has been open; `None` when not open.
    pub fn circuit_open_for_ms(&self) -> Option<u64> {
        let since = self.circuit_open_since_ms.load(Ordering::Relaxed);
        if since == 0 {
            return None;
        }
        Some(unix_ms_now().saturating_sub(since))
    }

    /// Prometheus text exposition.
    pub fn render_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(4096);

        let counters: [(&str, &Counter); 12] = [
            ("siem_bridge_events_in_total", &self.events_in),
            ("siem_bridge_events_decoded_total", &self.events_decoded),
            (
                "siem_bridge_events_dropped_dedup_total",
                &self.events_dropped_dedup,
            ),
            (
                "siem_bridge_events_dropped_full_total",
                &self.events_dropped_full,
            ),
            ("siem_bridge_events_written_total", &self.events_written),
            ("siem_bridge_events_dlq_total", &self.events_dlq),
            ("siem_bridge_decode_errors_total", &self.decode_errors),
            (
                "siem_bridge_enrichment_lookups_total",
                &self.enrichment_lookups,
            ),
            ("siem_bridge_circuit_opens_total", &self.circuit_opens),
            ("siem_bridge_values_clamped_total", &self.values_clamped),
            (
                "siem_bridge_ungraceful_shutdown_total",
                &self.ungraceful_shutdown,
            ),
            ("siem_bridge_bus_reconnects_total", &self.bus_reconnects),
        ];
        for (name, counter) in counters {
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.get());
        }

        let gauges: [(&str, &Gauge); 3] = [
            ("siem_bridge_ring_fill", &self.ring_fill),
            ("siem_bridge_circuit_state", &self.circuit_state),
            ("siem_bridge_inflight_batches", &self.inflight_batches),
        ];
        for (name, gauge) in gauges {
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {}", gauge.get());
        }

        self.batch_size.render(&mut out, "siem_bridge_batch_size");
        self.write_latency_seconds
            .render(&mut out, "siem_bridge_write_latency_seconds");
        self.end_to_end_latency_seconds
            .render(&mut out, "siem_bridge_end_to_end_latency_seconds");

        out
    }

    /// JSON snapshot for the `/stats` endpoint.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_in: self.events_in.get(),
            events_decoded: self.events_decoded.get(),
            events_dropped_dedup: self.events_dropped_dedup.get(),
            events_dropped_full: self.events_dropped_full.get(),
            events_written: self.events_written.get(),
            events_dlq: self.events_dlq.get(),
            decode_errors: self.decode_errors.get(),
            enrichment_lookups: self.enrichment_lookups.get(),
            circuit_opens: self.circuit_opens.get(),
            values_clamped: self.values_clamped.get(),
            ring_fill: self.ring_fill.get(),
            circuit_state: self.circuit_state.get(),
            inflight_batches: self.inflight_batches.get(),
            batches_written: self.batch_size.count(),
            last_write_unix_ms: self.last_write_unix_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the bridge counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub events_in: u64,
    pub events_decoded: u64,
    pub events_dropped_dedup: u64,
    pub events_dropped_full: u64,
    pub events_written: u64,
    pub events_dlq: u64,
    pub decode_errors: u64,
    pub enrichment_lookups: u64,
    pub circuit_opens: u64,
    pub values_clamped: u64,
    pub ring_fill: u64,
    pub circuit_state: u64,
    pub inflight_batches: u64,
    pub batches_written: u64,
    pub last_write_unix_ms: u64,
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let stats = BridgeStats::new();
        stats.events_in.inc();
        stats.events_in.add(4);
        assert_eq!(stats.events_in.get(), 5);

        stats.ring_fill.set(17);
        assert_eq!(stats.ring_fill.get(), 17);
        stats.inflight_batches.inc();
        stats.inflight_batches.inc();
        stats.inflight_batches.dec();
        assert_eq!(stats.inflight_batches.get(), 1);
    }

    #[test]
    fn test_histogram_buckets_cumulative() {
        let h = Histogram::new(&[1.0, 5.0, 10.0]);
        h.observe(0.5);
        h.observe(3.0);
        h.observe(7.0);
        h.observe(100.0);

        assert_eq!(h.count(), 4);
        assert!((h.sum() - 110.5).abs() < 1e-3);

        let mut out = String::new();
        h.render(&mut out, "t");
        assert!(out.contains("t_bucket{le=\"1\"} 1"));
        assert!(out.contains("t_bucket{le=\"5\"} 2"));
        assert!(out.contains("t_bucket{le=\"10\"} 3"));
        assert!(out.contains("t_bucket{le=\"+Inf\"} 4"));
    }

    #[test]
    fn test_render_contains_core_series() {
        let stats = BridgeStats::new();
        stats.events_written.add(10);
        stats.batch_size.observe(10.0);
        let text = stats.render_prometheus();
        assert!(text.contains("siem_bridge_events_written_total 10"));
        assert!(text.contains("# TYPE siem_bridge_ring_fill gauge"));
        assert!(text.contains("siem_bridge_batch_size_count 1"));
        assert!(text.contains("siem_bridge_write_latency_seconds_sum"));
    }

    #[test]
    fn test_last_write_tracking() {
        let stats = BridgeStats::new();
        assert!(stats.since_last_write_ms().is_none());
        stats.mark_write();
        assert!(stats.since_last_write_ms().unwrap() < 1_000);
    }
}
