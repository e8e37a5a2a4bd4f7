//! C2: bounded capture queue and object pools.
//!
//! The capture adapter produces faster than the pipeline can drain under
//! load; rather than block capture (which risks dropping packets at the
//! kernel level, which we can't observe) the queue is bounded and
//! drop-oldest: a full queue silently evicts its head to admit the new
//! tail. `PacketPool` recycles `PacketRecord` allocations across cycles so
//! steady-state operation does no heap churn.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::PacketRecord;

/// Default bound from spec §6 (`monitoring.queue.max_size`).
pub const DEFAULT_CAPACITY: usize = 50_000;

/// Bounded MPMC-style queue of captured packets. Single internal mutex
/// guards a `VecDeque`; pushes beyond capacity drop the oldest entry.
pub struct PacketQueue {
    inner: Mutex<VecDeque<PacketRecord>>,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
    popped: AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Push a packet. Returns `true` if an older packet was dropped to make
    /// room for it.
    pub fn push(&self, record: PacketRecord) -> bool {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.inner.lock();
        let mut dropped = false;
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            dropped = true;
        }
        guard.push_back(record);
        dropped
    }

    pub fn pop(&self) -> Option<PacketRecord> {
        let mut guard = self.inner.lock();
        let item = guard.pop_front();
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Pop up to `n` items at once, used by the orchestrator's adaptive
    /// intake batching.
    pub fn pop_batch(&self, n: usize) -> Vec<PacketRecord> {
        let mut guard = self.inner.lock();
        let take = n.min(guard.len());
        let batch: Vec<_> = guard.drain(..take).collect();
        drop(guard);
        if !batch.is_empty() {
            self.popped.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of capacity currently occupied, for adaptive intake sizing.
    pub fn utilization(&self) -> f32 {
        self.len() as f32 / self.capacity as f32
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn popped_count(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Object pool for `PacketRecord`, avoiding per-packet allocation once the
/// pool has warmed up. Records are cleared (`PacketRecord::clear`) before
/// reuse so no stale field leaks into the next packet.
pub struct PacketPool {
    free: Mutex<Vec<PacketRecord>>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl PacketPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Take a record from the pool, or allocate a fresh one if empty.
    pub fn acquire(&self) -> PacketRecord {
        if let Some(mut record) = self.free.lock().pop() {
            record.clear();
            self.reused.fetch_add(1, Ordering::Relaxed);
            record
        } else {
            self.created.fetch_add(1, Ordering::Relaxed);
            PacketRecord::default()
        }
    }

    /// Return a record to the pool for reuse.
    pub fn release(&self, record: PacketRecord) {
        self.free.lock().push(record);
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn reused_count(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    /// Fraction of `acquire` calls served from the free list rather than
    /// fresh allocation. `0.0` until the pool has served at least one
    /// request.
    pub fn reuse_rate(&self) -> f32 {
        let created = self.created_count();
        let reused = self.reused_count();
        let total = created + reused;
        if total == 0 {
            0.0
        } else {
            reused as f32 / total as f32
        }
    }

    /// Shrink the free list's backing allocation down to its current
    /// length. Called from the periodic memory-ceiling sweep (spec §6:
    /// "requests pool compaction") rather than on every release, since
    /// `Vec::shrink_to_fit` is itself an allocation and not worth paying
    /// for per packet.
    pub fn compact(&self) {
        self.free.lock().shrink_to_fit();
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Endpoint;
    use std::net::IpAddr;

    fn sample() -> PacketRecord {
        PacketRecord {
            source: Endpoint::new(IpAddr::from([10, 0, 0, 1]), Some(1234)),
            ..Default::default()
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let q = PacketQueue::new(2);
        assert!(!q.push(sample()));
        assert!(!q.push(sample()));
        assert!(q.push(sample()));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped_count(), 1);
    }

    #[test]
    fn pop_batch_respects_available_items() {
        let q = PacketQueue::new(10);
        for _ in 0..5 {
            q.push(sample());
        }
        let batch = q.pop_batch(100);
        assert_eq!(batch.len(), 5);
        assert!(q.is_empty());
    }

    #[test]
    fn utilization_tracks_occupancy() {
        let q = PacketQueue::new(4);
        q.push(sample());
        q.push(sample());
        assert_eq!(q.utilization(), 0.5);
    }

    #[test]
    fn compact_does_not_lose_free_entries() {
        let pool = PacketPool::new();
        for _ in 0..8 {
            pool.release(sample());
        }
        pool.compact();
        assert_eq!(pool.free.lock().len(), 8);
    }

    #[test]
    fn pool_reuses_released_records() {
        let pool = PacketPool::new();
        let r1 = pool.acquire();
        assert_eq!(pool.created_count(), 1);
        pool.release(r1);
        let r2 = pool.acquire();
        assert_eq!(pool.reused_count(), 1);
        assert!(r2.info.is_empty());
        assert_eq!(pool.reuse_rate(), 0.5);
    }
}
