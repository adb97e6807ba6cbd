// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event enrichment.
//!
//! The enricher is infallible: it only adds fields. It owns `id`,
//! `timestamp_ms`, `geo`, `compliance_tags`, and `data_classification`;
//! everything else is decoder territory.
//!
//! # Operation
//!
//! 1. Assign a fresh UUID when `id` is unset
//! 2. Default `timestamp_ms` to the ingestion instant
//! 3. Resolve `geo` for public source IPs (cache, then provider under a
//!    hard deadline; non-routable addresses get the PRIVATE marker)
//! 4. Derive compliance tags from the category and identity presence
//! 5. Default `data_classification` to internal

pub mod compliance;
pub mod geo;

pub use geo::{GeoCache, GeoError, GeoProvider, HttpGeoProvider, NullGeoProvider};

use crate::event::{DataClassification, Event, GeoInfo};
use crate::stats::BridgeStats;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub struct Enricher {
    cache: GeoCache,
    provider: Arc<dyn GeoProvider>,
    geo_timeout: Duration,
    stats: Arc<BridgeStats>,
}

impl Enricher {
    pub fn new(
        provider: Arc<dyn GeoProvider>,
        cache_size: usize,
        geo_timeout: Duration,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            cache: GeoCache::new(cache_size),
            provider,
            geo_timeout,
            stats,
        }
    }

    /// Enrich an event. Never rejects.
    pub async fn enrich(&self, mut event: Event) -> Event {
        if event.id.is_none() {
            event.id = Some(Uuid::new_v4());
        }
        if event.timestamp_ms.is_none() {
            event.timestamp_ms = Some(unix_ms_now());
        }

        if event.geo.is_none() {
            if let Some(ip) = event.src_ip().and_then(|s| s.parse::<IpAddr>().ok()) {
                event.geo = Some(self.resolve_geo(ip).await);
            }
        }

        if event.compliance_tags.is_empty() {
            event.compliance_tags =
                compliance::tags_for(&event.threat_type, event.kind, event.has_user());
        }

        if event.data_classification.is_none() {
            event.data_classification = Some(DataClassification::Internal);
        }

        event
    }

    async fn resolve_geo(&self, ip: IpAddr) -> GeoInfo {
        if !is_public(ip) {
            return GeoInfo::private();
        }

        if let Some(cached) = self.cache.get(&ip) {
            return cached;
        }

        self.stats.enrichment_lookups.inc();
        let info = match tokio::time::timeout(self.geo_timeout, self.provider.lookup(ip)).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                tracing::debug!("geo lookup failed for {ip}: {e}");
                GeoInfo::unknown()
            }
            Err(_) => {
                tracing::debug!("geo lookup deadline exceeded for {ip}");
                GeoInfo::unknown()
            }
        };

        // Unknowns are cached with a short TTL so the next event retries.
        self.cache.put(ip, info.clone());
        info
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }
}

/// True when the address is globally routable enough to be worth a lookup.
fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let is_unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let is_link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || is_unique_local
                || is_link_local)
        }
    }
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
