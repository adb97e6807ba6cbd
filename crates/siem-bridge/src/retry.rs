// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Exponential backoff with jitter for batch writes.

use crate::store::StoreError;
use std::sync::Arc;
use std::time::Duration;

/// Pluggable transient-error predicate.
pub type ClassifyFn = Arc<dyn Fn(&StoreError) -> bool + Send + Sync>;

/// Default classification: timeouts, connection failures, throttling.
pub fn default_classifier() -> ClassifyFn {
    Arc::new(StoreError::is_transient)
}

/// Exponential backoff: `min(initial * 2^attempt, max_delay)` with a
/// symmetric jitter factor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Fractional jitter (0.2 means +/-20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = (self.initial.as_millis() as u64)
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped_ms = base_ms.min(self.max_delay.as_millis() as u64);

        let jitter_span = (capped_ms as f64 * self.jitter) as i64;
        let jitter = if jitter_span > 0 {
            fastrand::i64(-jitter_span..=jitter_span)
        } else {
            0
        };

        Duration::from_millis((capped_ms as i64 + jitter).max(0) as u64)
    }
}
