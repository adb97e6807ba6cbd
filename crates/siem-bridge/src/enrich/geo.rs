// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Geo lookup provider and bounded LRU cache.

use crate::event::GeoInfo;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// TTL for provider-miss entries: short, so the next lookup retries.
const UNKNOWN_TTL: Duration = Duration::from_secs(30);

/// TTL for resolved entries.
const RESOLVED_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geo lookup timed out")]
    Timeout,
    #[error("geo provider: {0}")]
    Provider(String),
}

/// IP to geo record resolution.
#[async_trait]
pub trait GeoProvider: Send + Sync + 'static {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError>;
}

/// Provider that never knows anything. Default when no geo endpoint is
/// configured.
pub struct NullGeoProvider;

#[async_trait]
impl GeoProvider for NullGeoProvider {
    async fn lookup(&self, _ip: IpAddr) -> Result<GeoInfo, GeoError> {
        Ok(GeoInfo::unknown())
    }
}

/// JSON-over-HTTP provider: `GET {base}/{ip}`.
pub struct HttpGeoProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct GeoResponse {
    #[serde(default)]
    country: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
    #[serde(default)]
    asn: u32,
    #[serde(default)]
    as_name: String,
    #[serde(default)]
    is_tor: bool,
    #[serde(default)]
    reputation: f32,
}

impl HttpGeoProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        let url = format!("{}/{}", self.base_url, ip);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                GeoError::Timeout
            } else {
                GeoError::Provider(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(GeoError::Provider(format!(
                "status {} from {url}",
                response.status()
            )));
        }

        let geo: GeoResponse = response
            .json()
            .await
            .map_err(|e| GeoError::Provider(e.to_string()))?;

        if geo.country.is_empty() {
            return Ok(GeoInfo::unknown());
        }
        Ok(GeoInfo {
            country: geo.country,
            city: geo.city,
            region: geo.region,
            lat: geo.lat,
            lon: geo.lon,
            asn: geo.asn,
            as_name: geo.as_name,
            is_tor: geo.is_tor,
            reputation: geo.reputation,
        })
    }
}

struct CachedGeo {
    info: GeoInfo,
    inserted: Instant,
    ttl: Duration,
}

/// Bounded LRU of resolved lookups. Lookups touch recency, so reads take the
/// same short lock as writes.
pub struct GeoCache {
    inner: Mutex<LruCache<IpAddr, CachedGeo>>,
}

impl GeoCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fresh cached record, if any. Expired entries are dropped on access.
    pub fn get(&self, ip: &IpAddr) -> Option<GeoInfo> {
        let mut cache = self.inner.lock();
        match cache.get(ip) {
            Some(entry) if entry.inserted.elapsed() < entry.ttl => Some(entry.info.clone()),
            Some(_) => {
                cache.pop(ip);
                None
            }
            None => None,
        }
    }

    /// Insert with the TTL class matching the record (unknown records get
    /// the short retry TTL).
    pub fn put(&self, ip: IpAddr, info: GeoInfo) {
        let ttl = if info.is_unknown() {
            UNKNOWN_TTL
        } else {
            RESOLVED_TTL
        };
        self.inner.lock().put(
            ip,
            CachedGeo {
                info,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn resolved(country: &str) -> GeoInfo {
        GeoInfo {
            country: country.to_string(),
            ..GeoInfo::unknown()
        }
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = GeoCache::new(8);
        assert!(cache.get(&ip("203.0.113.1")).is_none());

        cache.put(ip("203.0.113.1"), resolved("DE"));
        assert_eq!(cache.get(&ip("203.0.113.1")).unwrap().country, "DE");
        assert!(cache.get(&ip("203.0.113.2")).is_none());
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = GeoCache::new(2);
        cache.put(ip("203.0.113.1"), resolved("DE"));
        cache.put(ip("203.0.113.2"), resolved("FR"));
        // Touch .1 so .2 is the LRU victim.
        let _ = cache.get(&ip("203.0.113.1"));
        cache.put(ip("203.0.113.3"), resolved("NL"));

        assert!(cache.get(&ip("203.0.113.1")).is_some());
        assert!(cache.get(&ip("203.0.113.2")).is_none());
        assert!(cache.get(&ip("203.0.113.3")).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_null_provider_is_unknown() {
        let provider = NullGeoProvider;
        let geo = provider.lookup(ip("203.0.113.1")).await.unwrap();
        assert!(geo.is_unknown());
    }
}
