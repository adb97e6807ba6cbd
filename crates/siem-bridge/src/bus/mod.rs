// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message bus abstraction.
//!
//! The bridge only assumes pull-based durable subscriptions with per-message
//! ack/nak, fire-and-forget publish (DLQ, fan-out), and an optional stream
//! assertion capability.
//!
//! # Implementations
//!
//! - [`NatsBus`] -- NATS JetStream (production)
//! - [`MemoryBus`] -- in-memory queues with nak redelivery (`--mock` mode
//!   and tests)

pub mod memory;
pub mod nats;

pub use memory::MemoryBus;
pub use nats::NatsBus;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus timeout: {0}")]
    Timeout(String),
    #[error("bus connection: {0}")]
    Connection(String),
    #[error("bus request: {0}")]
    Request(String),
}

impl BusError {
    /// Errors worth a backoff-and-continue instead of a subscriber restart.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Timeout(_) | BusError::Request(_))
    }
}

/// Stream assertion parameters.
#[derive(Debug, Clone, Copy)]
pub struct StreamRetention {
    /// Maximum message age before the bus may discard.
    pub max_age: Duration,
    /// Durable (file) storage rather than memory.
    pub durable_storage: bool,
}

impl Default for StreamRetention {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 3600),
            durable_storage: true,
        }
    }
}

/// Per-message acknowledgment handle. Travels with the event through the
/// pipeline; resolved only once the batch is durable (or dead-lettered).
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Positive acknowledgment: the bus may forget the message.
    async fn ack(&self) -> Result<(), BusError>;

    /// Negative acknowledgment: redeliver after the visibility timeout.
    async fn nak(&self) -> Result<(), BusError>;
}

/// One message pulled from a subscription.
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub handle: Arc<dyn AckHandle>,
}

impl std::fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Pull-based subscription bound to a durable consumer group.
#[async_trait]
pub trait Subscription: Send {
    /// Fetch up to `batch` messages, waiting at most `max_wait`. An empty
    /// result is a normal idle poll, not an error.
    async fn fetch(&mut self, batch: usize, max_wait: Duration)
        -> Result<Vec<BusMessage>, BusError>;
}

/// The bridge's view of the message bus.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Assert the stream backing a subject. Buses without the capability
    /// return Ok.
    async fn ensure_stream(
        &self,
        subject: &str,
        retention: &StreamRetention,
    ) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;
}
