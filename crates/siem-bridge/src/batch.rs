// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batch accumulation and store writes.
//!
//! Worker tasks drain the ring into local batches (bounded by size and by
//! time since the first event), convert them to `threats` rows, and write
//! them through the circuit breaker under the retry policy. Bus acks happen
//! strictly after store durability; exhausted batches are dead-lettered
//! per-message so a DLQ publish failure degrades to a nak, never to silent
//! loss.

use crate::breaker::{CircuitBreaker, ExecuteError};
use crate::bus::{AckHandle, MessageBus};
use crate::event::Event;
use crate::retry::{ClassifyFn, RetryPolicy};
use crate::ring::EventRing;
use crate::stats::BridgeStats;
use crate::store::{ColumnarStore, ThreatRow};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One event travelling from a subscriber to the store, with its bus ack
/// handle and ingestion instant (end-to-end latency).
pub struct PipelineItem {
    pub event: Event,
    pub handle: Arc<dyn AckHandle>,
    pub ingested: Instant,
}

impl PipelineItem {
    pub fn new(event: Event, handle: Arc<dyn AckHandle>) -> Self {
        Self {
            event,
            handle,
            ingested: Instant::now(),
        }
    }
}

impl std::fmt::Debug for PipelineItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineItem")
            .field("event_id", &self.event.id)
            .finish()
    }
}

/// Writer tuning.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub dlq_subject: String,
    pub fanout_subject: Option<String>,
}

/// Batch writer over the ring.
pub struct BatchWriter<S: ColumnarStore, B: MessageBus> {
    ring: Arc<EventRing<PipelineItem>>,
    store: Arc<S>,
    bus: Arc<B>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    classify: ClassifyFn,
    stats: Arc<BridgeStats>,
    config: WriterConfig,
}

impl<S: ColumnarStore, B: MessageBus> BatchWriter<S, B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: Arc<EventRing<PipelineItem>>,
        store: Arc<S>,
        bus: Arc<B>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        classify: ClassifyFn,
        stats: Arc<BridgeStats>,
        config: WriterConfig,
    ) -> Self {
        Self {
            ring,
            store,
            bus,
            breaker,
            retry,
            classify,
            stats,
            config,
        }
    }

    /// Enqueue an event for eventual write (test and fan-in paths; the
    /// subscribers put directly into the shared ring).
    pub fn submit(&self, item: PipelineItem) -> Result<(), PipelineItem> {
        self.ring.try_put(item)
    }

    /// Spawn the worker tasks. They exit once the ring is closed and
    /// drained.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker_id| {
                let writer = Arc::clone(self);
                tokio::spawn(async move { writer.run_worker(worker_id).await })
            })
            .collect()
    }

    /// Stop accepting events. Workers drain what remains and quiesce.
    pub fn close(&self) {
        self.ring.close();
    }

    /// Synchronous-for-tests flush: drain whatever is in the ring right now
    /// and write it out in batches.
    pub async fn flush_now(&self) {
        loop {
            let mut batch = Vec::new();
            while batch.len() < self.config.batch_size {
                match self.ring.try_pop() {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }
            if batch.is_empty() {
                return;
            }
            self.write_batch(batch).await;
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        tracing::debug!("batch writer {worker_id} started");
        loop {
            let Some(first) = self.ring.get().await else {
                break;
            };

            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + self.config.batch_timeout;
            while batch.len() < self.config.batch_size {
                match tokio::time::timeout_at(deadline, self.ring.get()).await {
                    Ok(Some(item)) => batch.push(item),
                    // Ring closed: write what we have, then drain the rest.
                    Ok(None) => break,
                    // Batch timeout elapsed since the first event.
                    Err(_) => break,
                }
            }

            self.stats.ring_fill.set(self.ring.len() as u64);
            self.write_batch(batch).await;
        }
        tracing::debug!("batch writer {worker_id} stopped");
    }

    /// Write one batch: breaker + retries, then ack or dead-letter.
    pub async fn write_batch(&self, batch: Vec<PipelineItem>) {
        if batch.is_empty() {
            return;
        }

        let batch_id = Uuid::new_v4();
        let rows: Vec<ThreatRow> = batch.iter().map(|item| ThreatRow::from(&item.event)).collect();

        self.stats.inflight_batches.inc();
        let outcome = self.write_with_retry(&rows, batch_id).await;
        self.stats.inflight_batches.dec();

        match outcome {
            Ok(write_latency) => self.complete_batch(batch, batch_id, write_latency).await,
            Err(reason) => self.dead_letter_batch(batch, batch_id, &reason).await,
        }
    }

    async fn write_with_retry(
        &self,
        rows: &[ThreatRow],
        batch_id: Uuid,
    ) -> Result<Duration, String> {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            match self.breaker.execute(self.store.insert_batch(rows)).await {
                Ok(()) => return Ok(started.elapsed()),
                Err(ExecuteError::Open) => {
                    if attempt >= self.retry.max_retries {
                        return Err("circuit open".to_string());
                    }
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        batch = %batch_id,
                        attempt,
                        "circuit open, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(ExecuteError::Inner(e)) => {
                    if (self.classify)(&e) && attempt < self.retry.max_retries {
                        let delay = self.retry.delay(attempt);
                        tracing::warn!(
                            batch = %batch_id,
                            attempt,
                            error = %e,
                            "transient store failure, retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        return Err(e.to_string());
                    }
                }
            }
        }
    }

    async fn complete_batch(
        &self,
        batch: Vec<PipelineItem>,
        batch_id: Uuid,
        write_latency: Duration,
    ) {
        let count = batch.len();
        self.stats.events_written.add(count as u64);
        self.stats.batch_size.observe(count as f64);
        self.stats
            .write_latency_seconds
            .observe_duration(write_latency);
        self.stats.mark_write();

        for item in &batch {
            self.stats
                .end_to_end_latency_seconds
                .observe_duration(item.ingested.elapsed());
        }

        // Ack strictly after store durability.
        for item in &batch {
            if let Err(e) = item.handle.ack().await {
                tracing::debug!(batch = %batch_id, "ack failed: {e}");
            }
        }

        if let Some(subject) = &self.config.fanout_subject {
            for item in &batch {
                match serde_json::to_vec(&item.event) {
                    Ok(json) => {
                        if let Err(e) = self.bus.publish(subject, json).await {
                            tracing::debug!(batch = %batch_id, "fan-out publish failed: {e}");
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(batch = %batch_id, "fan-out encode failed: {e}"),
                }
            }
        }

        tracing::debug!(batch = %batch_id, count, "batch written in {write_latency:?}");
    }

    async fn dead_letter_batch(&self, batch: Vec<PipelineItem>, batch_id: Uuid, reason: &str) {
        // One error line per batch, not per message.
        tracing::error!(
            batch = %batch_id,
            count = batch.len(),
            "batch write failed ({reason}), routing to {}",
            self.config.dlq_subject
        );

        for item in batch {
            let raw = item.event.raw.clone();
            match self.bus.publish(&self.config.dlq_subject, raw).await {
                Ok(()) => {
                    self.stats.events_dlq.inc();
                    // DLQ publication is the durability evidence; ack now.
                    if let Err(e) = item.handle.ack().await {
                        tracing::debug!(batch = %batch_id, "post-DLQ ack failed: {e}");
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        batch = %batch_id,
                        "DLQ publish failed ({e}), nak for redelivery"
                    );
                    if let Err(e) = item.handle.nak().await {
                        tracing::debug!(batch = %batch_id, "nak failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::bus::MemoryBus;
    use crate::event::EventKind;
    use crate::retry::default_classifier;
    use crate::store::{FailureMode, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestAck {
        acks: AtomicU64,
        naks: AtomicU64,
    }

    impl TestAck {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                acks: AtomicU64::new(0),
                naks: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl AckHandle for TestAck {
        async fn ack(&self) -> Result<(), crate::bus::BusError> {
            self.acks.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn nak(&self) -> Result<(), crate::bus::BusError> {
            self.naks.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn item(ack: &Arc<TestAck>) -> PipelineItem {
        let mut event = Event::new("legacy", EventKind::Threat);
        event.threat_type = "test".to_string();
        event.raw = b"{\"raw\":true}".to_vec();
        PipelineItem::new(event, Arc::clone(ack) as Arc<dyn AckHandle>)
    }

    fn writer(
        store: &MemoryStore,
        bus: &MemoryBus,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Arc<BatchWriter<MemoryStore, MemoryBus>> {
        let retry = RetryPolicy {
            initial: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_retries: 3,
            jitter: 0.0,
        };
        Arc::new(BatchWriter::new(
            Arc::new(EventRing::with_capacity(1024)),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            retry,
            default_classifier(),
            Arc::new(BridgeStats::new()),
            WriterConfig {
                batch_size,
                batch_timeout,
                dlq_subject: "dlq".to_string(),
                fanout_subject: None,
            },
        ))
    }

    #[tokio::test]
    async fn test_worker_flushes_on_batch_size() {
        let store = MemoryStore::new();
        let bus = MemoryBus::new();
        let writer = writer(&store, &bus, 3, Duration::from_secs(60));
        let handles = writer.spawn_workers(1);

        let ack = TestAck::new();
        for _ in 0..3 {
            writer.submit(item(&ack)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.row_count() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("batch written");

        assert_eq!(store.insert_calls(), 1);
        assert_eq!(ack.acks.load(Ordering::Relaxed), 3);

        writer.close();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_worker_flushes_on_timeout() {
        let store = MemoryStore::new();
        let bus = MemoryBus::new();
        let writer = writer(&store, &bus, 100, Duration::from_millis(50));
        let handles = writer.spawn_workers(1);

        let ack = TestAck::new();
        writer.submit(item(&ack)).unwrap();
        writer.submit(item(&ack)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.row_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timeout flush");

        assert_eq!(store.row_count(), 2);
        writer.close();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let store = MemoryStore::new();
        store.set_failure_mode(FailureMode::Transient { remaining: 2 });
        let bus = MemoryBus::new();
        let writer = writer(&store, &bus, 10, Duration::from_secs(60));

        let ack = TestAck::new();
        writer.write_batch(vec![item(&ack)]).await;

        assert_eq!(store.row_count(), 1);
        assert_eq!(store.insert_calls(), 3);
        assert_eq!(ack.acks.load(Ordering::Relaxed), 1);
        assert!(bus.published("dlq").is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters() {
        let store = MemoryStore::new();
        store.set_failure_mode(FailureMode::Permanent);
        let bus = MemoryBus::new();
        let writer = writer(&store, &bus, 10, Duration::from_secs(60));

        let ack = TestAck::new();
        writer.write_batch(vec![item(&ack), item(&ack)]).await;

        // Not retried: one attempt, straight to DLQ, raw payloads verbatim.
        assert_eq!(store.insert_calls(), 1);
        let dlq = bus.published("dlq");
        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq[0], b"{\"raw\":true}".to_vec());
        assert_eq!(ack.acks.load(Ordering::Relaxed), 2);
        assert_eq!(ack.naks.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted_dead_letters() {
        let store = MemoryStore::new();
        store.set_failure_mode(FailureMode::Transient { remaining: 99 });
        let bus = MemoryBus::new();
        let writer = writer(&store, &bus, 10, Duration::from_secs(60));

        let ack = TestAck::new();
        writer.write_batch(vec![item(&ack)]).await;

        // Initial attempt + max_retries.
        assert_eq!(store.insert_calls(), 4);
        assert_eq!(bus.published("dlq").len(), 1);
        assert_eq!(ack.acks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_flush_now_drains_ring() {
        let store = MemoryStore::new();
        let bus = MemoryBus::new();
        let writer = writer(&store, &bus, 2, Duration::from_secs(60));

        let ack = TestAck::new();
        for _ in 0..5 {
            writer.submit(item(&ack)).unwrap();
        }
        writer.flush_now().await;

        assert_eq!(store.row_count(), 5);
        // 2 + 2 + 1
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn test_fanout_publishes_after_write() {
        let store = MemoryStore::new();
        let bus = MemoryBus::new();
        let writer = BatchWriter::new(
            Arc::new(EventRing::with_capacity(16)),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            RetryPolicy::default(),
            default_classifier(),
            Arc::new(BridgeStats::new()),
            WriterConfig {
                batch_size: 10,
                batch_timeout: Duration::from_secs(60),
                dlq_subject: "dlq".to_string(),
                fanout_subject: Some("ultra_siem.events".to_string()),
            },
        );

        let ack = TestAck::new();
        writer.write_batch(vec![item(&ack)]).await;

        assert_eq!(store.row_count(), 1);
        let fanned = bus.published("ultra_siem.events");
        assert_eq!(fanned.len(), 1);
        let event: Event = serde_json::from_slice(&fanned[0]).unwrap();
        assert_eq!(event.threat_type, "test");
    }
}
