// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SIEM Bridge
//!
//! High-throughput bridge between a message bus carrying security events
//! and a columnar analytical store, with at-least-once delivery.
//!
//! # Architecture
//!
//! ```text
//! Bus subjects -> SubjectSubscriber -> Normalizer -> Deduper -> Enricher
//!                                                                 |
//!                                                             EventRing
//!                                                                 |
//!                                                       BatchWriter workers
//!                                                                 |
//!                                                 CircuitBreaker -> ColumnarStore
//! ```
//!
//! Failed batches are dead-lettered to a bus subject; bus acks happen only
//! after store durability or DLQ publication.
//!
//! # Example
//!
//! ```ignore
//! use siem_bridge::{BridgeService, Config, MemoryBus, MemoryStore, NullGeoProvider};
//! use std::sync::Arc;
//!
//! let config = Config::load(None)?;
//! let service = BridgeService::new(
//!     config,
//!     MemoryBus::new(),
//!     MemoryStore::new(),
//!     Arc::new(NullGeoProvider),
//! );
//! service.init().await?;
//! service.run().await?;
//! ```

pub mod batch;
pub mod breaker;
pub mod bus;
pub mod config;
pub mod dedup;
pub mod dialect;
pub mod enrich;
pub mod event;
pub mod http;
pub mod retry;
pub mod ring;
pub mod service;
pub mod stats;
pub mod store;
pub mod subscriber;

pub use batch::{BatchWriter, PipelineItem, WriterConfig};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use bus::{AckHandle, BusError, BusMessage, MemoryBus, MessageBus, NatsBus, Subscription};
pub use config::{Config, FullPolicy, SubjectConfig};
pub use dedup::{DedupVerdict, Deduper};
pub use dialect::{DecodeError, Dialect, Normalizer};
pub use enrich::{Enricher, GeoProvider, HttpGeoProvider, NullGeoProvider};
pub use event::{DataClassification, Event, EventKind, GeoInfo};
pub use retry::RetryPolicy;
pub use ring::EventRing;
pub use service::BridgeService;
pub use stats::BridgeStats;
pub use store::{ClickHouseStore, ColumnarStore, MemoryStore, StoreError, ThreatRow};
pub use subscriber::{SubjectSubscriber, SubscriberConfig};
