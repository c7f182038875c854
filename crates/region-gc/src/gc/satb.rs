//! Snapshot-at-the-beginning (SATB) write barrier queue.
//!
//! While concurrent marking is active, every reference store first records
//! the value being overwritten. Marking treats recorded values as roots, so
//! every object reachable when marking started is marked even if mutators
//! unlink it afterwards.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use crate::oop::Address;

/// Shared queue of pre-write values.
#[derive(Debug, Default)]
pub struct SatbMarkQueueSet {
    active: AtomicBool,
    queue: SegQueue<Address>,
    enqueued: AtomicUsize,
}

impl SatbMarkQueueSet {
    /// An inactive, empty queue set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the barrier is recording.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Turn recording on or off. Only changed at a safepoint.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Record `old`, the value about to be overwritten.
    pub fn enqueue(&self, old: Address) {
        if self.is_active() {
            self.queue.push(old);
            self.enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take one recorded value.
    pub fn pop(&self) -> Option<Address> {
        self.queue.pop()
    }

    /// Whether nothing is waiting to be processed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of values waiting to be processed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Total values recorded over the queue's lifetime. Never reset, so a
    /// cycle's count is the difference of two readings.
    #[must_use]
    pub fn total_enqueued(&self) -> usize {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Drop all pending values. The lifetime counter is kept.
    pub fn abandon(&self) {
        while self.queue.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_queue_ignores_enqueue() {
        let satb = SatbMarkQueueSet::new();
        satb.enqueue(Address::new(0x1000));
        assert!(satb.is_empty());
        assert_eq!(satb.total_enqueued(), 0);
    }

    #[test]
    fn test_active_queue_records() {
        let satb = SatbMarkQueueSet::new();
        satb.set_active(true);
        satb.enqueue(Address::new(0x1000));
        satb.enqueue(Address::new(0x2000));
        assert_eq!(satb.len(), 2);
        assert_eq!(satb.pop(), Some(Address::new(0x1000)));
        satb.abandon();
        assert!(satb.is_empty());
        assert_eq!(satb.total_enqueued(), 2);
    }

    #[test]
    fn test_counter_survives_abandon() {
        let satb = SatbMarkQueueSet::new();
        satb.set_active(true);
        satb.enqueue(Address::new(0x1000));
        let before = satb.total_enqueued();
        satb.abandon();
        satb.enqueue(Address::new(0x2000));
        assert_eq!(satb.total_enqueued() - before, 1);
    }
}
