// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory columnar store with injectable failure modes.
//!
//! Backs the `--mock` CLI mode and the integration tests: failure scenarios
//! (stalls, transient bursts, permanent rejections) are switched at runtime.

use super::{ColumnarStore, StoreError, ThreatRow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Failure behavior for the next insert calls.
#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    /// Inserts succeed.
    None,
    /// The next `remaining` inserts fail with a timeout.
    Transient { remaining: u32 },
    /// Every insert fails with a non-retryable server error.
    Permanent,
    /// Inserts succeed after a delay (backpressure scenarios).
    Stall(Duration),
}

struct MemoryStoreInner {
    rows: Mutex<Vec<ThreatRow>>,
    ddl: Mutex<Vec<String>>,
    mode: Mutex<FailureMode>,
    insert_calls: AtomicU64,
    failed_inserts: AtomicU64,
    pings: AtomicU64,
}

/// In-memory store. Cloning shares the row log and failure mode.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                rows: Mutex::new(Vec::new()),
                ddl: Mutex::new(Vec::new()),
                mode: Mutex::new(FailureMode::None),
                insert_calls: AtomicU64::new(0),
                failed_inserts: AtomicU64::new(0),
                pings: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_failure_mode(&self, mode: FailureMode) {
        *self.inner.mode.lock() = mode;
    }

    pub fn rows(&self) -> Vec<ThreatRow> {
        self.inner.rows.lock().clone()
    }

    pub fn row_count(&self) -> usize {
        self.inner.rows.lock().len()
    }

    pub fn ddl_statements(&self) -> Vec<String> {
        self.inner.ddl.lock().clone()
    }

    pub fn insert_calls(&self) -> u64 {
        self.inner.insert_calls.load(Ordering::Relaxed)
    }

    pub fn failed_inserts(&self) -> u64 {
        self.inner.failed_inserts.load(Ordering::Relaxed)
    }

    pub fn ping_count(&self) -> u64 {
        self.inner.pings.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ColumnarStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.pings.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn exec(&self, ddl: &str) -> Result<(), StoreError> {
        self.inner.ddl.lock().push(ddl.to_string());
        Ok(())
    }

    async fn insert_batch(&self, rows: &[ThreatRow]) -> Result<(), StoreError> {
        self.inner.insert_calls.fetch_add(1, Ordering::Relaxed);

        let mode = *self.inner.mode.lock();
        match mode {
            FailureMode::None => {}
            FailureMode::Transient { remaining } => {
                if remaining > 0 {
                    *self.inner.mode.lock() = FailureMode::Transient {
                        remaining: remaining - 1,
                    };
                    self.inner.failed_inserts.fetch_add(1, Ordering::Relaxed);
                    return Err(StoreError::Timeout("injected transient failure".into()));
                }
            }
            FailureMode::Permanent => {
                self.inner.failed_inserts.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::Server {
                    code: 400,
                    message: "injected permanent failure".into(),
                });
            }
            FailureMode::Stall(delay) => {
                tokio::time::sleep(delay).await;
            }
        }

        self.inner.rows.lock().extend_from_slice(rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind};

    fn row() -> ThreatRow {
        ThreatRow::from(&Event::new("test", EventKind::Generic))
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let store = MemoryStore::new();
        store.insert_batch(&[row(), row()]).await.unwrap();
        assert_eq!(store.row_count(), 2);
        assert_eq!(store.insert_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_mode_recovers() {
        let store = MemoryStore::new();
        store.set_failure_mode(FailureMode::Transient { remaining: 2 });

        assert!(store.insert_batch(&[row()]).await.is_err());
        assert!(store.insert_batch(&[row()]).await.is_err());
        store.insert_batch(&[row()]).await.unwrap();
        assert_eq!(store.row_count(), 1);
        assert_eq!(store.failed_inserts(), 2);
    }

    #[tokio::test]
    async fn test_permanent_mode_is_not_transient() {
        let store = MemoryStore::new();
        store.set_failure_mode(FailureMode::Permanent);
        let err = store.insert_batch(&[row()]).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_ddl_recorded() {
        let store = MemoryStore::new();
        store.exec(super::super::THREATS_DDL).await.unwrap();
        store.exec(super::super::THREATS_DDL).await.unwrap();
        assert_eq!(store.ddl_statements().len(), 2);
    }
}
