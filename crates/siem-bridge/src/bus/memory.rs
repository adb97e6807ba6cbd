// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory message bus with nak redelivery.
//!
//! Backs the `--mock` CLI mode and the integration tests. Messages pulled
//! from a subject stay in-flight until acked; a nak (or test-driven
//! visibility replay) puts them back on the queue.

use super::{AckHandle, BusError, BusMessage, MessageBus, StreamRetention, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Clone)]
struct StoredMessage {
    id: u64,
    payload: Vec<u8>,
}

#[derive(Default)]
struct SubjectQueue {
    pending: VecDeque<StoredMessage>,
    inflight: HashMap<u64, StoredMessage>,
}

struct MemoryBusInner {
    queues: Mutex<HashMap<String, SubjectQueue>>,
    /// Log of everything published through the bus, per subject.
    published: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    streams: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    acked: AtomicU64,
    naked: AtomicU64,
    connected: AtomicBool,
    notify: Notify,
}

/// In-memory bus. Cloning shares the underlying queues.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBusInner {
                queues: Mutex::new(HashMap::new()),
                published: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                acked: AtomicU64::new(0),
                naked: AtomicU64::new(0),
                connected: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a message without going through `publish` bookkeeping
    /// (producer-side injection in tests).
    pub fn inject(&self, subject: &str, payload: impl Into<Vec<u8>>) {
        let message = StoredMessage {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            payload: payload.into(),
        };
        self.inner
            .queues
            .lock()
            .entry(subject.to_string())
            .or_default()
            .pending
            .push_back(message);
        self.inner.notify.notify_waiters();
    }

    /// Everything published to a subject (DLQ/fan-out assertions).
    pub fn published(&self, subject: &str) -> Vec<Vec<u8>> {
        self.inner
            .published
            .lock()
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages waiting for delivery on a subject.
    pub fn pending_count(&self, subject: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(subject)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Messages delivered but not yet acked or naked.
    pub fn inflight_count(&self, subject: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(subject)
            .map(|q| q.inflight.len())
            .unwrap_or(0)
    }

    pub fn ack_count(&self) -> u64 {
        self.inner.acked.load(Ordering::Relaxed)
    }

    pub fn nak_count(&self) -> u64 {
        self.inner.naked.load(Ordering::Relaxed)
    }

    pub fn asserted_streams(&self) -> Vec<String> {
        self.inner.streams.lock().iter().cloned().collect()
    }

    /// Flip connectivity (health endpoint tests).
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Relaxed);
    }
}

struct MemoryAckHandle {
    inner: Arc<MemoryBusInner>,
    subject: String,
    id: u64,
}

#[async_trait]
impl AckHandle for MemoryAckHandle {
    async fn ack(&self) -> Result<(), BusError> {
        let mut queues = self.inner.queues.lock();
        if let Some(queue) = queues.get_mut(&self.subject) {
            if queue.inflight.remove(&self.id).is_some() {
                self.inner.acked.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn nak(&self) -> Result<(), BusError> {
        let mut queues = self.inner.queues.lock();
        if let Some(queue) = queues.get_mut(&self.subject) {
            if let Some(message) = queue.inflight.remove(&self.id) {
                queue.pending.push_back(message);
                self.inner.naked.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(queues);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    inner: Arc<MemoryBusInner>,
    subject: String,
}

impl MemorySubscription {
    fn try_take(&self, batch: usize) -> Vec<BusMessage> {
        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(self.subject.clone()).or_default();

        let mut out = Vec::new();
        while out.len() < batch {
            let Some(message) = queue.pending.pop_front() else {
                break;
            };
            queue.inflight.insert(message.id, message.clone());
            out.push(BusMessage {
                subject: self.subject.clone(),
                payload: message.payload.clone(),
                handle: Arc::new(MemoryAckHandle {
                    inner: Arc::clone(&self.inner),
                    subject: self.subject.clone(),
                    id: message.id,
                }),
            });
        }
        out
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn fetch(
        &mut self,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        if !self.inner.connected.load(Ordering::Relaxed) {
            return Err(BusError::Connection("memory bus disconnected".to_string()));
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let messages = self.try_take(batch);
            if !messages.is_empty() {
                return Ok(messages);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }

            let notified = self.inner.notify.notified();
            // Double check after registering to avoid a missed wakeup.
            let messages = self.try_take(batch);
            if !messages.is_empty() {
                return Ok(messages);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(
        &self,
        subject: &str,
        _group: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        if !self.inner.connected.load(Ordering::Relaxed) {
            return Err(BusError::Connection("memory bus disconnected".to_string()));
        }
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            subject: subject.to_string(),
        }))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.inner
            .published
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push(payload.clone());

        let message = StoredMessage {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            payload,
        };
        self.inner
            .queues
            .lock()
            .entry(subject.to_string())
            .or_default()
            .pending
            .push_back(message);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn ensure_stream(
        &self,
        subject: &str,
        _retention: &StreamRetention,
    ) -> Result<(), BusError> {
        self.inner.streams.lock().insert(subject.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fetch_ack() {
        let bus = MemoryBus::new();
        bus.publish("t", b"one".to_vec()).await.unwrap();
        bus.publish("t", b"two".to_vec()).await.unwrap();

        let mut sub = bus.subscribe("t", "g").await.unwrap();
        let messages = sub.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, b"one");
        assert_eq!(bus.inflight_count("t"), 2);

        for message in &messages {
            message.handle.ack().await.unwrap();
        }
        assert_eq!(bus.ack_count(), 2);
        assert_eq!(bus.inflight_count("t"), 0);
        assert_eq!(bus.pending_count("t"), 0);
    }

    #[tokio::test]
    async fn test_nak_redelivers() {
        let bus = MemoryBus::new();
        bus.inject("t", b"again".to_vec());

        let mut sub = bus.subscribe("t", "g").await.unwrap();
        let messages = sub.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(messages.len(), 1);
        messages[0].handle.nak().await.unwrap();

        assert_eq!(bus.nak_count(), 1);
        assert_eq!(bus.pending_count("t"), 1);

        let redelivered = sub.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].payload, b"again");
    }

    #[tokio::test]
    async fn test_fetch_times_out_empty() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("empty", "g").await.unwrap();
        let start = Instant::now();
        let messages = sub.fetch(10, Duration::from_millis(30)).await.unwrap();
        assert!(messages.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("t", "g").await.unwrap();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                bus.publish("t", b"late".to_vec()).await.unwrap();
            })
        };

        let messages = sub.fetch(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(messages.len(), 1);
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_published_log_and_streams() {
        let bus = MemoryBus::new();
        bus.publish("dlq", b"dead".to_vec()).await.unwrap();
        assert_eq!(bus.published("dlq"), vec![b"dead".to_vec()]);

        bus.ensure_stream("t", &StreamRetention::default())
            .await
            .unwrap();
        assert_eq!(bus.asserted_streams(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnected_bus_errors() {
        let bus = MemoryBus::new();
        bus.set_connected(false);
        assert!(!bus.is_connected());
        assert!(bus.subscribe("t", "g").await.is_err());
    }
}
