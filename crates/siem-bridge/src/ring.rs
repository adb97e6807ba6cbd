// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free bounded MPMC ring buffer between the subscribers and the batch
//! writers.
//!
//! Each slot carries a sequence counter. Producers CAS the head, consumers
//! CAS the tail; the slot sequence tells each side whether the slot is
//! theirs. A successful `try_put` happens-before the matching `get`
//! (Release store on the slot sequence, Acquire load on the other side).
//!
//! Protocol per slot (capacity `N`):
//! - `seq == pos`     -> free, producer at `pos` may claim
//! - `seq == pos + 1` -> committed, consumer at `pos` may claim
//! - producer writes value, then `seq = pos + 1` (Release)
//! - consumer reads value, then `seq = pos + N` (Release, next lap)
//!
//! The full capacity is usable: a ring of capacity 2 holds exactly two
//! items. Blocking consumers park on a `Notify`; `close()` wakes them all,
//! lets them drain what remains, then `get` returns `None` forever.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free MPMC queue with an async blocking consumer side.
pub struct EventRing<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    /// Next enqueue position (producers CAS).
    head: AtomicUsize,
    /// Next dequeue position (consumers CAS).
    tail: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
}

// SAFETY: slots are handed off between threads through the per-slot sequence
// protocol; a slot's value is only touched by the thread that claimed the
// matching position via CAS.
unsafe impl<T: Send> Send for EventRing<T> {}
unsafe impl<T: Send> Sync for EventRing<T> {}

impl<T> EventRing<T> {
    /// Create a ring with the given capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is zero or not a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two, got {capacity}"
        );

        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Non-blocking enqueue. Returns the item back when the ring is full or
    /// closed.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(item);
        }

        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(pos) as isize;

            if dif == 0 {
                // Slot free: claim it.
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave this thread exclusive
                        // ownership of the slot until the sequence advances.
                        unsafe {
                            (*slot.value.get()).write(item);
                        }
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        self.notify.notify_one();
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                // Consumer has not freed this slot's previous lap: full.
                return Err(item);
            } else {
                // Another producer won this slot; re-read the head.
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Non-blocking dequeue. Safe to call from any thread (used by both the
    /// writer workers and the drop-oldest full policy).
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if dif == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave this thread exclusive
                        // ownership of the committed value in this slot.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                // Slot not yet committed for this lap: empty.
                return None;
            } else {
                // Another consumer won this slot; re-read the tail.
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Blocking dequeue. Waits for an item or for `close()`. Once the ring
    /// is closed and drained, returns `None` forever.
    pub async fn get(&self) -> Option<T> {
        loop {
            if let Some(item) = self.pop_and_renotify() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                // Drain race: a producer may have committed between the pop
                // and the closed check.
                return self.try_pop();
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before the re-checks: close() uses
            // notify_waiters(), which stores no permit and only reaches
            // already-registered waiters.
            notified.as_mut().enable();

            if let Some(item) = self.pop_and_renotify() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                continue;
            }
            notified.await;
        }
    }

    /// Pop, chaining the wakeup when more items remain. A `Notify` holds at
    /// most one stored permit, so consecutive producer notifications can
    /// collapse; the woken consumer re-arms the next one.
    fn pop_and_renotify(&self) -> Option<T> {
        let item = self.try_pop()?;
        if !self.is_empty() {
            self.notify.notify_one();
        }
        Some(item)
    }

    /// Evict the oldest entry (drop-oldest full policy).
    pub fn take_oldest(&self) -> Option<T> {
        self.try_pop()
    }

    /// Stop accepting new items and wake all parked consumers. Items already
    /// enqueued remain poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Approximate occupancy (racy, for gauges).
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }
}

impl<T> Drop for EventRing<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_pop_basic() {
        let ring = EventRing::with_capacity(16);
        ring.try_put(7u32).unwrap();
        ring.try_put(8u32).unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.try_pop(), Some(7));
        assert_eq!(ring.try_pop(), Some(8));
        assert_eq!(ring.try_pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_capacity_two_holds_exactly_two() {
        let ring = EventRing::with_capacity(2);
        ring.try_put(1u8).unwrap();
        ring.try_put(2u8).unwrap();
        // Third is refused and handed back.
        assert_eq!(ring.try_put(3u8), Err(3));
        assert_eq!(ring.try_pop(), Some(1));
        // Space again.
        ring.try_put(3u8).unwrap();
        assert_eq!(ring.try_pop(), Some(2));
        assert_eq!(ring.try_pop(), Some(3));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_non_power_of_two_panics() {
        let _ = EventRing::<u8>::with_capacity(6);
    }

    #[test]
    fn test_wraparound() {
        let ring = EventRing::with_capacity(4);
        for lap in 0..5u32 {
            for i in 0..4 {
                ring.try_put(lap * 10 + i).unwrap();
            }
            assert!(ring.try_put(99).is_err());
            for i in 0..4 {
                assert_eq!(ring.try_pop(), Some(lap * 10 + i));
            }
        }
    }

    #[test]
    fn test_closed_ring_refuses_puts_but_drains() {
        let ring = EventRing::with_capacity(8);
        ring.try_put(1u8).unwrap();
        ring.close();
        assert!(ring.try_put(2u8).is_err());
        assert_eq!(ring.try_pop(), Some(1));
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn test_mpmc_no_loss_no_duplication() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 10_000;

        let ring = Arc::new(EventRing::with_capacity(1024));
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = (p as u64) << 32 | i;
                    loop {
                        match ring.try_put(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let total = (PRODUCERS as u64) * PER_PRODUCER;
        let consumed = Arc::new(AtomicUsize::new(0));
        let mut sums = Vec::new();
        for _ in 0..CONSUMERS {
            let ring = Arc::clone(&ring);
            let consumed = Arc::clone(&consumed);
            sums.push(std::thread::spawn(move || {
                let mut sum = 0u64;
                while (consumed.load(Ordering::Relaxed) as u64) < total {
                    if let Some(v) = ring.try_pop() {
                        consumed.fetch_add(1, Ordering::Relaxed);
                        sum += v & 0xFFFF_FFFF;
                    } else {
                        std::thread::yield_now();
                    }
                }
                sum
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        let consumed_sum: u64 = sums.into_iter().map(|h| h.join().unwrap()).sum();

        // Each producer contributes sum(0..PER_PRODUCER) in the low bits.
        let expected = PRODUCERS as u64 * (PER_PRODUCER * (PER_PRODUCER - 1) / 2);
        assert_eq!(consumed_sum, expected);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_per_producer_fifo() {
        let ring = Arc::new(EventRing::with_capacity(64));
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let mut v = i;
                    loop {
                        match ring.try_put(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            })
        };

        let mut last = None;
        let mut seen = 0;
        while seen < 1000 {
            if let Some(v) = ring.try_pop() {
                if let Some(prev) = last {
                    assert!(v > prev, "FIFO violated: {v} after {prev}");
                }
                last = Some(v);
                seen += 1;
            }
        }
        producer.join().unwrap();
    }

    #[tokio::test]
    async fn test_get_wakes_on_put() {
        let ring = Arc::new(EventRing::with_capacity(4));
        let consumer = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.get().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ring.try_put(42u32).unwrap();

        let got = consumer.await.unwrap();
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn test_get_returns_none_after_close_and_drain() {
        let ring = Arc::new(EventRing::with_capacity(4));
        ring.try_put(1u8).unwrap();
        ring.close();

        assert_eq!(ring.get().await, Some(1));
        assert_eq!(ring.get().await, None);
        assert_eq!(ring.get().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_parked_consumer() {
        let ring = Arc::new(EventRing::<u8>::with_capacity(4));
        let consumer = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.get().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ring.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_races_with_get() {
        // close() fires immediately, racing the consumer's registration
        // window; every iteration must still wake and return the sentinel.
        for _ in 0..200 {
            let ring = Arc::new(EventRing::<u8>::with_capacity(4));
            let consumer = {
                let ring = Arc::clone(&ring);
                tokio::spawn(async move { ring.get().await })
            };

            ring.close();
            let got = tokio::time::timeout(std::time::Duration::from_secs(2), consumer)
                .await
                .expect("consumer woken by close")
                .unwrap();
            assert_eq!(got, None);
        }
    }
}
