// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge supervisor.
//!
//! Owns startup order and graceful shutdown:
//!
//! 1. Store reachability + idempotent schema DDL
//! 2. Stream assertion for every subject and the DLQ
//! 3. Metrics endpoint, writer workers, subscribers
//!
//! On SIGINT/SIGTERM: subscribers stop pulling, the ring drains (bounded),
//! writers flush and quiesce, handles close, final stats are logged. A hard
//! deadline forces progress and counts `ungraceful_shutdown`.

use crate::batch::{BatchWriter, PipelineItem, WriterConfig};
use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::bus::{MessageBus, StreamRetention};
use crate::config::Config;
use crate::dedup::Deduper;
use crate::dialect::Normalizer;
use crate::enrich::{Enricher, GeoProvider};
use crate::http::{self, HttpState};
use crate::ring::EventRing;
use crate::stats::BridgeStats;
use crate::store::{ColumnarStore, THREATS_DDL};
use crate::subscriber::{SubjectSubscriber, SubscriberConfig};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// The assembled bridge.
pub struct BridgeService<B: MessageBus, S: ColumnarStore> {
    config: Config,
    bus: Arc<B>,
    store: Arc<S>,
    geo: Arc<dyn GeoProvider>,
    stats: Arc<BridgeStats>,
}

impl<B: MessageBus, S: ColumnarStore> BridgeService<B, S> {
    pub fn new(config: Config, bus: B, store: S, geo: Arc<dyn GeoProvider>) -> Self {
        Self {
            config,
            bus: Arc::new(bus),
            store: Arc::new(store),
            geo,
            stats: Arc::new(BridgeStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// Fatal-on-failure initialization: store reachability, schema,
    /// stream assertions.
    pub async fn init(&self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.store.ping().await {
                Ok(()) => break,
                Err(e) if attempt < 3 => {
                    attempt += 1;
                    tracing::warn!("store ping failed ({e}), retry {attempt}/3");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => return Err(e).context("store unreachable"),
            }
        }

        self.store
            .exec(THREATS_DDL)
            .await
            .context("creating threats table")?;
        tracing::info!("threats table asserted");

        let retention = StreamRetention::default();
        for subject in &self.config.subjects {
            self.bus
                .ensure_stream(&subject.subject, &retention)
                .await
                .with_context(|| format!("asserting stream for {}", subject.subject))?;
        }
        self.bus
            .ensure_stream(&self.config.dlq_subject, &retention)
            .await
            .context("asserting DLQ stream")?;

        tracing::info!("bridge initialized");
        Ok(())
    }

    /// Run until an OS termination signal.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// Run until `signal` resolves (injectable for tests).
    pub async fn run_with_shutdown(self, signal: impl Future<Output = ()>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!("SIEM bridge starting");
        tracing::info!("  bus: {}", self.config.bus_url);
        tracing::info!("  store: {} (db {})", self.config.store_url, self.config.store_db);
        tracing::info!(
            "  subjects: {}",
            self.config
                .subjects
                .iter()
                .map(|s| s.subject.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        tracing::info!("  ring: {} slots", self.config.ring_capacity);
        tracing::info!(
            "  batch: {} events / {:?}",
            self.config.batch_size,
            self.config.batch_timeout()
        );

        let ring: Arc<EventRing<PipelineItem>> =
            Arc::new(EventRing::with_capacity(self.config.ring_capacity));

        let breaker = self.build_breaker();
        let normalizer = Arc::new(Normalizer::new(
            self.config
                .subjects
                .iter()
                .map(|s| (s.subject.clone(), s.dialect)),
            self.config.max_message_size,
            Arc::clone(&self.stats),
        ));
        let deduper = Arc::new(Deduper::new(
            self.config.dedup_window(),
            self.config.dedup_capacity,
        ));
        let enricher = Arc::new(Enricher::new(
            Arc::clone(&self.geo),
            self.config.geo_cache_size,
            self.config.geo_timeout(),
            Arc::clone(&self.stats),
        ));

        let writer = Arc::new(BatchWriter::new(
            Arc::clone(&ring),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            breaker,
            crate::retry::RetryPolicy::new(
                self.config.retry_delay(),
                self.config.max_retry_delay(),
                self.config.max_retries,
            ),
            crate::retry::default_classifier(),
            Arc::clone(&self.stats),
            WriterConfig {
                batch_size: self.config.batch_size,
                batch_timeout: self.config.batch_timeout(),
                dlq_subject: self.config.dlq_subject.clone(),
                fanout_subject: self.config.fanout_subject.clone(),
            },
        ));

        let http_handle = self.spawn_http(shutdown_rx.clone());
        let worker_handles = writer.spawn_workers(self.config.worker_count());
        let subscriber_handles =
            self.spawn_subscribers(&ring, &normalizer, &deduper, &enricher, &shutdown_rx);

        tracing::info!(
            "bridge running: {} subscribers, {} writer workers",
            subscriber_handles.len(),
            worker_handles.len()
        );

        signal.await;
        tracing::info!("shutdown signal received");

        self.shutdown(
            shutdown_tx,
            ring,
            writer,
            subscriber_handles,
            worker_handles,
            http_handle,
        )
        .await;

        Ok(())
    }

    fn build_breaker(&self) -> Arc<CircuitBreaker> {
        let settings = &self.config.breaker;
        let config = BreakerConfig {
            interval: Duration::from_millis(settings.interval_ms),
            threshold: settings.threshold,
            trip_ratio: settings.trip_ratio,
            timeout: Duration::from_millis(settings.timeout_ms),
            recovery_successes: settings.recovery_successes,
        };

        let stats = Arc::clone(&self.stats);
        Arc::new(
            CircuitBreaker::new(config).with_observer(Arc::new(move |state| {
                stats.circuit_state.set(state.as_gauge());
                match state {
                    BreakerState::Open => {
                        stats.circuit_opens.inc();
                        stats.mark_circuit_open();
                        tracing::warn!("circuit breaker opened");
                    }
                    BreakerState::HalfOpen => {
                        tracing::info!("circuit breaker half-open, probing");
                    }
                    BreakerState::Closed => {
                        stats.clear_circuit_open();
                        tracing::info!("circuit breaker closed");
                    }
                }
            })),
        )
    }

    fn spawn_http(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let state = Arc::new(HttpState {
            stats: Arc::clone(&self.stats),
            bus_connected: Arc::new(move || bus.is_connected()),
            health_threshold: self.config.health_threshold(),
            unhealthy_open_duration: self.config.unhealthy_open_duration(),
        });
        let port = self.config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = http::serve(state, port, shutdown).await {
                tracing::error!("metrics endpoint failed: {e}");
            }
        })
    }

    fn spawn_subscribers(
        &self,
        ring: &Arc<EventRing<PipelineItem>>,
        normalizer: &Arc<Normalizer>,
        deduper: &Arc<Deduper>,
        enricher: &Arc<Enricher>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.config
            .subjects
            .iter()
            .map(|subject| {
                let config = SubscriberConfig {
                    subject: subject.subject.clone(),
                    group: self.config.consumer_group.clone(),
                    fetch_batch: self.config.fetch_batch,
                    fetch_max_wait: self.config.fetch_max_wait(),
                    full_policy: self.config.full_policy,
                    full_block_timeout: self.config.full_block_timeout(),
                    dlq_subject: self.config.dlq_subject.clone(),
                };
                let bus = Arc::clone(&self.bus);
                let normalizer = Arc::clone(normalizer);
                let deduper = Arc::clone(deduper);
                let enricher = Arc::clone(enricher);
                let ring = Arc::clone(ring);
                let stats = Arc::clone(&self.stats);
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    let mut backoff = Duration::from_secs(1);
                    loop {
                        let subscriber = SubjectSubscriber::new(
                            config.clone(),
                            Arc::clone(&bus),
                            Arc::clone(&normalizer),
                            Arc::clone(&deduper),
                            Arc::clone(&enricher),
                            Arc::clone(&ring),
                            Arc::clone(&stats),
                            shutdown.clone(),
                        );

                        match subscriber.run().await {
                            Ok(()) => break,
                            Err(e) => {
                                if *shutdown.borrow() {
                                    break;
                                }
                                stats.bus_reconnects.inc();
                                tracing::error!(
                                    subject = %config.subject,
                                    "subscriber failed ({e}), restarting in {backoff:?}"
                                );
                                tokio::time::sleep(backoff).await;
                                backoff = (backoff * 2).min(Duration::from_secs(30));
                            }
                        }
                    }
                })
            })
            .collect()
    }

    async fn shutdown(
        &self,
        shutdown_tx: watch::Sender<bool>,
        ring: Arc<EventRing<PipelineItem>>,
        writer: Arc<BatchWriter<S, B>>,
        subscriber_handles: Vec<JoinHandle<()>>,
        worker_handles: Vec<JoinHandle<()>>,
        http_handle: JoinHandle<()>,
    ) {
        let deadline = Instant::now() + self.config.shutdown_deadline();
        let _ = shutdown_tx.send(true);

        // 1. Subscribers stop pulling.
        for handle in subscriber_handles {
            if join_until(handle, deadline).await.is_err() {
                self.stats.ungraceful_shutdown.inc();
                tracing::warn!("subscriber did not stop before the deadline");
            }
        }

        // 2. Let the ring drain within the grace period.
        let drain_deadline =
            (Instant::now() + self.config.shutdown_grace()).min(deadline);
        while !ring.is_empty() && Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if !ring.is_empty() {
            tracing::warn!("{} events still in ring at close", ring.len());
        }

        // 3. Close the ring; workers flush what remains and exit.
        writer.close();
        for handle in worker_handles {
            if join_until(handle, deadline).await.is_err() {
                self.stats.ungraceful_shutdown.inc();
                tracing::warn!("writer worker aborted at the shutdown deadline");
            }
        }

        // 4. Release external handles.
        self.store.close().await;
        let _ = http_handle.await;

        // 5. Final stats.
        let snapshot = self.stats.snapshot();
        tracing::info!(
            "bridge stopped: in={} written={} dlq={} dedup_dropped={} decode_errors={}",
            snapshot.events_in,
            snapshot.events_written,
            snapshot.events_dlq,
            snapshot.events_dropped_dedup,
            snapshot.decode_errors
        );
    }
}

/// Await a task until `deadline`; abort it on expiry.
async fn join_until(mut handle: JoinHandle<()>, deadline: Instant) -> Result<(), ()> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(_) => Ok(()),
        Err(_) => {
            handle.abort();
            Err(())
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                tracing::error!("installing SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
