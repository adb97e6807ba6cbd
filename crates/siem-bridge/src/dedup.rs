// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Short-window duplicate suppression.
//!
//! Fingerprint is a hash over `(source, kind, src_ip)`. Events without a
//! source IP hash `(source, kind, id)` instead, which makes them always
//! fresh; events with neither a source IP nor an id (dedup runs before the
//! enricher assigns ids) have no stable identity and pass through
//! unrecorded. Entries expire after the window; when the map hits capacity
//! the oldest entries are evicted regardless of expiry.

use crate::event::Event;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Fresh,
    Duplicate,
}

struct DedupInner {
    /// fingerprint -> first seen.
    map: HashMap<u64, Instant>,
    /// Insertion order for capacity eviction.
    order: VecDeque<(u64, Instant)>,
}

/// Bounded time-window deduplicator.
pub struct Deduper {
    window: Duration,
    capacity: usize,
    inner: Mutex<DedupInner>,
}

impl Deduper {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            inner: Mutex::new(DedupInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Check an event against the window; fresh events are recorded.
    pub fn check(&self, event: &Event) -> DedupVerdict {
        let Some(fp) = fingerprint(event) else {
            return DedupVerdict::Fresh;
        };
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(first_seen) = inner.map.get(&fp) {
            if now.duration_since(*first_seen) < self.window {
                return DedupVerdict::Duplicate;
            }
        }

        // Fresh (or expired): record with a new window start.
        if inner.map.len() >= self.capacity && !inner.map.contains_key(&fp) {
            Self::evict_oldest(&mut inner);
        }
        inner.map.insert(fp, now);
        inner.order.push_back((fp, now));
        DedupVerdict::Fresh
    }

    /// Number of tracked fingerprints.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_oldest(inner: &mut DedupInner) {
        while let Some((fp, seen)) = inner.order.pop_front() {
            // Skip stale queue entries left behind by refreshed fingerprints.
            match inner.map.get(&fp) {
                Some(current) if *current == seen => {
                    inner.map.remove(&fp);
                    return;
                }
                _ => continue,
            }
        }
    }
}

/// Hash over the dedup identity tuple. `None` when the event carries
/// neither a source IP nor an id; hashing nothing there would collapse
/// distinct events onto one fingerprint.
fn fingerprint(event: &Event) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    event.source.hash(&mut hasher);
    event.kind.as_str().hash(&mut hasher);
    match (event.src_ip(), event.id) {
        (Some(ip), _) => ip.hash(&mut hasher),
        (None, Some(id)) => id.hash(&mut hasher),
        (None, None) => return None,
    }
    Some(hasher.finish())
}
