// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-subject pull subscriber.
//!
//! # Operation
//!
//! 1. Bind a durable pull consumer for the subject
//! 2. Fetch message batches (bounded wait)
//! 3. Per message: decode -> dedup -> enrich -> ring
//! 4. Terminal outcomes (malformed, duplicate) ack immediately; accepted
//!    events carry their ack handle to the batch writer
//! 5. A full ring applies the configured full policy (default: nak and let
//!    the bus redeliver)
//!
//! Transient bus errors back off and continue; anything else returns to the
//! supervisor, which restarts the subscriber.

use crate::batch::PipelineItem;
use crate::bus::{BusError, BusMessage, MessageBus};
use crate::config::FullPolicy;
use crate::dedup::{DedupVerdict, Deduper};
use crate::dialect::Normalizer;
use crate::enrich::Enricher;
use crate::ring::EventRing;
use crate::stats::BridgeStats;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Subscriber tuning for one subject.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub subject: String,
    pub group: String,
    pub fetch_batch: usize,
    pub fetch_max_wait: Duration,
    pub full_policy: FullPolicy,
    pub full_block_timeout: Duration,
    pub dlq_subject: String,
}

/// One subject's pull-and-dispatch loop.
pub struct SubjectSubscriber<B: MessageBus> {
    config: SubscriberConfig,
    bus: Arc<B>,
    normalizer: Arc<Normalizer>,
    deduper: Arc<Deduper>,
    enricher: Arc<Enricher>,
    ring: Arc<EventRing<PipelineItem>>,
    stats: Arc<BridgeStats>,
    shutdown: watch::Receiver<bool>,
}

impl<B: MessageBus> SubjectSubscriber<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SubscriberConfig,
        bus: Arc<B>,
        normalizer: Arc<Normalizer>,
        deduper: Arc<Deduper>,
        enricher: Arc<Enricher>,
        ring: Arc<EventRing<PipelineItem>>,
        stats: Arc<BridgeStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            bus,
            normalizer,
            deduper,
            enricher,
            ring,
            stats,
            shutdown,
        }
    }

    /// Run until shutdown. Returns `Err` on a non-transient bus failure so
    /// the supervisor can restart with backoff.
    pub async fn run(self) -> Result<(), BusError> {
        let mut subscription = self
            .bus
            .subscribe(&self.config.subject, &self.config.group)
            .await?;

        tracing::info!(
            subject = %self.config.subject,
            group = %self.config.group,
            "subscriber started"
        );

        let mut shutdown = self.shutdown.clone();
        let mut backoff = Duration::from_millis(200);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = subscription.fetch(self.config.fetch_batch, self.config.fetch_max_wait) => result,
            };

            match fetched {
                Ok(messages) => {
                    backoff = Duration::from_millis(200);
                    for message in messages {
                        self.handle_message(message).await;
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        subject = %self.config.subject,
                        "transient bus error: {e}; backing off {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
                Err(e) => {
                    tracing::error!(subject = %self.config.subject, "bus failure: {e}");
                    return Err(e);
                }
            }
        }

        tracing::info!(subject = %self.config.subject, "subscriber stopped");
        Ok(())
    }

    async fn handle_message(&self, message: BusMessage) {
        self.stats.events_in.inc();

        let event = match self.normalizer.decode(&message.subject, &message.payload) {
            Ok(event) => event,
            Err(e) => {
                // Redelivery cannot fix a malformed message.
                self.stats.decode_errors.inc();
                tracing::debug!(subject = %message.subject, "dropping message: {e}");
                let _ = message.handle.ack().await;
                return;
            }
        };
        self.stats.events_decoded.inc();

        if self.deduper.check(&event) == DedupVerdict::Duplicate {
            self.stats.events_dropped_dedup.inc();
            let _ = message.handle.ack().await;
            return;
        }

        let event = self.enricher.enrich(event).await;
        let item = PipelineItem::new(event, Arc::clone(&message.handle));

        match self.ring.try_put(item) {
            Ok(()) => {
                self.stats.ring_fill.set(self.ring.len() as u64);
            }
            Err(item) => self.handle_ring_full(item).await,
        }
    }

    async fn handle_ring_full(&self, item: PipelineItem) {
        match self.config.full_policy {
            FullPolicy::Refuse => {
                self.stats.events_dropped_full.inc();
                let _ = item.handle.nak().await;
            }
            FullPolicy::Dlq => {
                self.stats.events_dropped_full.inc();
                match self
                    .bus
                    .publish(&self.config.dlq_subject, item.event.raw.clone())
                    .await
                {
                    Ok(()) => {
                        self.stats.events_dlq.inc();
                        let _ = item.handle.ack().await;
                    }
                    Err(e) => {
                        tracing::warn!("DLQ publish on full ring failed: {e}");
                        let _ = item.handle.nak().await;
                    }
                }
            }
            FullPolicy::Block => {
                let deadline = Instant::now() + self.config.full_block_timeout;
                let mut item = item;
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    match self.ring.try_put(item) {
                        Ok(()) => return,
                        Err(back) => item = back,
                    }
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                self.stats.events_dropped_full.inc();
                let _ = item.handle.nak().await;
            }
            FullPolicy::DropOldest => {
                let mut item = item;
                loop {
                    if let Some(oldest) = self.ring.take_oldest() {
                        self.stats.events_dropped_full.inc();
                        let _ = oldest.handle.nak().await;
                    }
                    match self.ring.try_put(item) {
                        Ok(()) => return,
                        Err(back) => item = back,
                    }
                    if self.ring.is_closed() {
                        let _ = item.handle.nak().await;
                        return;
                    }
                }
            }
        }
    }
}
