// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Circuit breaker guarding the store write path.
//!
//! # States
//!
//! - **Closed**: requests flow; failures are counted over a rolling window.
//!   Trips open when the window holds at least `threshold` requests and the
//!   failure ratio reaches `trip_ratio`.
//! - **Open**: requests fail fast. After `timeout`, the next request is
//!   allowed through as a probe (half-open).
//! - **HalfOpen**: `recovery_successes` consecutive successes close the
//!   circuit; any failure reopens it.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Gauge encoding: 0 closed, 1 open, 2 half-open.
    pub fn as_gauge(self) -> u64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Rolling observation window.
    pub interval: Duration,
    /// Minimum requests in the window before the ratio matters.
    pub threshold: u32,
    /// Failure ratio that trips the breaker.
    pub trip_ratio: f64,
    /// Time spent open before probing.
    pub timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub recovery_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            threshold: 3,
            trip_ratio: 0.6,
            timeout: Duration::from_secs(60),
            recovery_successes: 3,
        }
    }
}

/// Error wrapper distinguishing fail-fast from inner failures.
#[derive(Debug)]
pub enum ExecuteError<E> {
    /// The circuit is open; the call was not attempted.
    Open,
    /// The call ran and failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for ExecuteError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteError::Open => write!(f, "circuit open"),
            ExecuteError::Inner(e) => write!(f, "{e}"),
        }
    }
}

type StateCallback = Arc<dyn Fn(BreakerState) + Send + Sync>;

struct BreakerInner {
    state: BreakerState,
    window_start: Instant,
    requests: u32,
    failures: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

/// Circuit breaker with a state-change observer.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    on_change: Option<StateCallback>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window_start: Instant::now(),
                requests: 0,
                failures: 0,
                opened_at: None,
                half_open_successes: 0,
            }),
            on_change: None,
        }
    }

    /// Attach a state-change observer (metrics wiring).
    pub fn with_observer(mut self, observer: StateCallback) -> Self {
        self.on_change = Some(observer);
        self
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Run a fallible operation under the breaker.
    pub async fn execute<T, E, F>(&self, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(ExecuteError::Open);
        }

        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(ExecuteError::Inner(e))
            }
        }
    }

    /// True when a request may proceed. Handles the open -> half-open
    /// transition when the open timeout has elapsed.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state != BreakerState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                self.roll_window(&mut inner);
                inner.requests += 1;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.recovery_successes {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                self.roll_window(&mut inner);
                inner.requests += 1;
                inner.failures += 1;

                let ratio = f64::from(inner.failures) / f64::from(inner.requests);
                if inner.requests >= self.config.threshold && ratio >= self.config.trip_ratio {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.timeout {
                    self.transition(inner, BreakerState::HalfOpen);
                }
            }
        }
    }

    fn roll_window(&self, inner: &mut BreakerInner) {
        if inner.window_start.elapsed() >= self.config.interval {
            inner.window_start = Instant::now();
            inner.requests = 0;
            inner.failures = 0;
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: BreakerState) {
        if inner.state == next {
            return;
        }
        inner.state = next;
        match next {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes = 0;
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                inner.window_start = Instant::now();
                inner.requests = 0;
                inner.failures = 0;
            }
        }
        if let Some(observer) = &self.on_change {
            observer(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            interval: Duration::from_secs(10),
            threshold: 3,
            trip_ratio: 0.6,
            timeout: Duration::from_millis(50),
            recovery_successes: 3,
        }
    }

    #[test]
    fn test_trips_after_threshold_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_ratio_below_trip_stays_closed() {
        let breaker = CircuitBreaker::new(fast_config());
        // 2 failures out of 5 = 0.4 < 0.6
        breaker.record_failure();
        breaker.record_success();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_recovery() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire());

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_observer_sees_transitions() {
        let opens = Arc::new(AtomicU64::new(0));
        let observed = Arc::clone(&opens);
        let breaker = CircuitBreaker::new(fast_config()).with_observer(Arc::new(move |state| {
            if state == BreakerState::Open {
                observed.fetch_add(1, Ordering::Relaxed);
            }
        }));

        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(opens.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_execute_fails_fast_when_open() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        let result: Result<(), ExecuteError<&str>> =
            breaker.execute(async { Ok(()) }).await;
        assert!(matches!(result, Err(ExecuteError::Open)));
    }

    #[tokio::test]
    async fn test_execute_records_outcomes() {
        let breaker = CircuitBreaker::new(fast_config());

        let ok: Result<u32, ExecuteError<&str>> = breaker.execute(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..3 {
            let _: Result<(), ExecuteError<&str>> =
                breaker.execute(async { Err("boom") }).await;
        }
        // 3 failures out of 4 = 0.75 >= 0.6
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
