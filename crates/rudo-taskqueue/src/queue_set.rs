//! Sets of per-worker queues with whole-queue claiming.
//!
//! Besides task-level stealing, a queue set can hand out *whole queues*: each
//! call to [`ClaimableQueueSet::claim_next`] returns a distinct queue until
//! all are handed out. This is typically used to distribute roots before the
//! steal-based mark loop starts. Leading queues owned by threads that do not
//! take part in claiming can be excluded with [`ClaimableQueueSet::reserve`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::buffered::BufferedQueue;
use crate::config::QueueSetConfig;
use crate::stats::QueueStatsSnapshot;
use crate::task::ChunkedTask;
use crate::worklist::OverflowStack;

/// Aggregate view of a queue set used by the terminator.
pub trait TaskQueueSet: Send + Sync {
    /// Number of pending tasks across the whole set.
    ///
    /// The value is a racy snapshot; the terminator re-validates it under its
    /// monitor before declaring termination.
    fn tasks(&self) -> usize;
}

/// Per-worker pseudo-random state for choosing steal victims.
#[derive(Debug, Clone, Copy)]
pub struct StealSeed(u32);

impl StealSeed {
    /// Seed derived from a worker id.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(worker: usize) -> Self {
        Self((worker as u32).wrapping_add(1).wrapping_mul(0x9E37_79B9) | 1)
    }

    fn next(&mut self) -> u32 {
        // xorshift32
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// A set of buffered queues, one per worker, with an atomic claim cursor.
pub struct ClaimableQueueSet<T: Copy> {
    queues: Box<[CachePadded<BufferedQueue<T>>]>,
    overflow: Arc<OverflowStack<T>>,
    claimed: CachePadded<AtomicUsize>,
    #[cfg(debug_assertions)]
    reserved: AtomicUsize,
}

/// The queue set used for mark tasks.
pub type MarkQueueSet = ClaimableQueueSet<ChunkedTask>;

impl<T: Copy> ClaimableQueueSet<T> {
    /// Create `workers` queues of `capacity` slots each, sharing one overflow
    /// stack.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or `capacity` is not a power of 2.
    #[must_use]
    pub fn new(workers: usize, capacity: usize) -> Self {
        assert!(workers > 0, "queue set needs at least one queue");
        let overflow = Arc::new(OverflowStack::new());
        let queues = (0..workers)
            .map(|id| CachePadded::new(BufferedQueue::new(id, capacity, Arc::clone(&overflow))))
            .collect();
        Self {
            queues,
            overflow,
            claimed: CachePadded::new(AtomicUsize::new(0)),
            #[cfg(debug_assertions)]
            reserved: AtomicUsize::new(0),
        }
    }

    /// Create a set from a configuration, applying its reservation.
    ///
    /// # Panics
    ///
    /// Panics if `config.queue_capacity` is not a power of 2 or
    /// `config.reserved` exceeds `config.workers`.
    #[must_use]
    pub fn with_config(config: &QueueSetConfig) -> Self {
        let set = Self::new(config.workers.max(1), config.queue_capacity);
        if config.reserved > 0 {
            set.reserve(config.reserved);
        }
        set
    }

    /// Number of queues in the set.
    #[must_use]
    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Queue `index`, if it exists.
    #[must_use]
    pub fn queue(&self, index: usize) -> Option<&BufferedQueue<T>> {
        self.queues.get(index).map(|q| &**q)
    }

    /// Iterate over all queues in index order.
    pub fn iter(&self) -> impl Iterator<Item = &BufferedQueue<T>> {
        self.queues.iter().map(|q| &**q)
    }

    /// The overflow stack shared by every queue in the set.
    #[must_use]
    pub const fn overflow(&self) -> &Arc<OverflowStack<T>> {
        &self.overflow
    }

    /// Exclude the first `n` queues from claiming.
    ///
    /// Must be called before any [`claim_next`](Self::claim_next) of the
    /// phase.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the set size.
    pub fn reserve(&self, n: usize) {
        assert!(n <= self.size(), "cannot reserve more queues than the set holds");
        self.claimed.store(n, Ordering::Release);
        #[cfg(debug_assertions)]
        self.reserved.store(n, Ordering::Relaxed);
    }

    /// Number of reserved queues recorded by the last [`reserve`](Self::reserve).
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Claim the next unclaimed queue.
    ///
    /// Every queue index in `[reserved, size)` is returned to exactly one
    /// caller. Returns `None` once all queues are claimed.
    pub fn claim_next(&self) -> Option<&BufferedQueue<T>> {
        let size = self.size();
        // Keeps the cursor from running far past the end under contention.
        if self.claimed.load(Ordering::Relaxed) >= size {
            return None;
        }
        let index = self.claimed.fetch_add(1, Ordering::AcqRel);
        self.queue(index)
    }

    /// Reset the claim cursor to zero. Re-apply any reservation afterwards.
    pub fn clear_claimed(&self) {
        self.claimed.store(0, Ordering::Release);
    }

    /// Steal one task for worker `thief`.
    ///
    /// Peers are tried starting at a pseudo-random offset; the shared
    /// overflow stack is tried last. An overflow pop is recorded in the
    /// thief's own queue statistics.
    pub fn steal(&self, thief: usize, seed: &mut StealSeed) -> Option<T> {
        let size = self.size();
        if size > 1 {
            let start = seed.next() as usize % size;
            for offset in 0..size {
                let victim = (start + offset) % size;
                if victim == thief {
                    continue;
                }
                if let Some(item) = self.queues[victim].steal() {
                    return Some(item);
                }
            }
        }
        let item = self.overflow.pop()?;
        if let Some(queue) = self.queues.get(thief) {
            queue.stats().record_overflow_pop();
        }
        Some(item)
    }

    /// Whether every queue and the overflow stack are empty.
    ///
    /// Exact only when no producers or consumers are running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overflow.is_empty()
            && self
                .iter()
                .all(|q| q.buffer_empty() && q.stealable() == 0)
    }

    /// Empty every queue and the overflow stack. Phase-boundary operation.
    pub fn clear(&self) {
        for queue in self.iter() {
            queue.clear();
        }
        self.overflow.clear();
    }

    /// Sum of the statistics of every queue.
    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.iter()
            .map(|q| q.stats().snapshot())
            .fold(QueueStatsSnapshot::default(), |total, s| total + s)
    }

    /// Zero the statistics of every queue.
    pub fn reset_stats(&self) {
        for queue in self.iter() {
            queue.stats().reset();
        }
    }
}

impl<T: Copy + Send> TaskQueueSet for ClaimableQueueSet<T> {
    /// Buffered, queued and overflowed tasks.
    ///
    /// Buffered tasks are counted even though they cannot be stolen, so a
    /// worker that offers termination with a non-empty buffer is sent back
    /// to drain it instead of terminating the phase.
    fn tasks(&self) -> usize {
        self.iter().map(BufferedQueue::len).sum::<usize>() + self.overflow.len()
    }
}

impl<T: Copy> std::fmt::Debug for ClaimableQueueSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimableQueueSet")
            .field("size", &self.size())
            .field("claimed", &self.claimed.load(Ordering::Relaxed))
            .field("overflow", &self.overflow.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{ClaimableQueueSet, MarkQueueSet, StealSeed, TaskQueueSet};
    use crate::config::QueueSetConfig;
    use crate::task::ChunkedTask;

    #[test]
    fn test_claim_hands_out_each_queue_once() {
        let set: ClaimableQueueSet<usize> = ClaimableQueueSet::new(4, 16);
        let ids: Vec<usize> = std::iter::from_fn(|| set.claim_next().map(|q| q.id())).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(set.claim_next().is_none());
        assert!(set.claim_next().is_none());
    }

    #[test]
    fn test_reserve_skips_leading_queues() {
        let set: ClaimableQueueSet<usize> = ClaimableQueueSet::new(4, 16);
        set.reserve(2);
        #[cfg(debug_assertions)]
        assert_eq!(set.reserved(), 2);

        assert_eq!(set.claim_next().map(|q| q.id()), Some(2));
        assert_eq!(set.claim_next().map(|q| q.id()), Some(3));
        assert!(set.claim_next().is_none());
    }

    #[test]
    fn test_reserve_everything() {
        let set: ClaimableQueueSet<usize> = ClaimableQueueSet::new(3, 16);
        set.reserve(3);
        assert!(set.claim_next().is_none());
    }

    #[test]
    #[should_panic(expected = "cannot reserve more queues")]
    fn test_over_reservation_panics() {
        let set: ClaimableQueueSet<usize> = ClaimableQueueSet::new(2, 16);
        set.reserve(3);
    }

    #[test]
    fn test_clear_claimed_allows_reuse() {
        let set: ClaimableQueueSet<usize> = ClaimableQueueSet::new(2, 16);
        while set.claim_next().is_some() {}
        set.clear_claimed();
        assert_eq!(set.claim_next().map(|q| q.id()), Some(0));
    }

    #[test]
    fn test_with_config_applies_reservation() {
        let config = QueueSetConfig::new(3).with_queue_capacity(8).with_reserved(1);
        let set: ClaimableQueueSet<usize> = ClaimableQueueSet::with_config(&config);
        assert_eq!(set.size(), 3);
        assert_eq!(set.claim_next().map(|q| q.id()), Some(1));
    }

    #[test]
    fn test_steal_skips_thief_and_falls_back_to_overflow() {
        let set: ClaimableQueueSet<usize> = ClaimableQueueSet::new(2, 2);
        let mut seed = StealSeed::new(0);
        {
            let mut own = set.queue(0).unwrap().owner().unwrap();
            own.push(1);
            own.push(2);
        }
        // Only queue 0 holds a stealable task, and worker 0 is the thief.
        assert_eq!(set.steal(0, &mut seed), None);
        assert_eq!(set.steal(1, &mut seed), Some(1));

        set.overflow().push(9);
        assert_eq!(set.steal(0, &mut seed), Some(9));
    }

    #[test]
    fn test_stats_balance_after_thief_drains_overflow() {
        let set: ClaimableQueueSet<usize> = ClaimableQueueSet::new(2, 2);
        let mut seed = StealSeed::new(1);
        let mut owner = set.queue(0).unwrap().owner().unwrap();
        for i in 1..=5 {
            owner.push(i);
        }
        assert_eq!(set.stats().overflow_spills, 2);

        let mut stolen = Vec::new();
        while let Some(task) = set.steal(1, &mut seed) {
            stolen.push(task);
        }
        assert_eq!(stolen.len(), 4);
        assert_eq!(owner.pop(), Some(5));
        assert_eq!(owner.pop(), None);

        let stats = set.stats();
        assert_eq!(stats.steals, 2);
        assert_eq!(set.queue(1).unwrap().stats().snapshot().overflow_pops, 2);
        assert_eq!(stats.pops(), stats.pushes);
    }

    #[test]
    fn test_tasks_counts_buffer_queue_and_overflow() {
        let set: MarkQueueSet = ClaimableQueueSet::new(2, 2);
        assert_eq!(set.tasks(), 0);
        assert!(set.is_empty());

        let mut owner = set.queue(1).unwrap().owner().unwrap();
        for i in 1..=5 {
            owner.push(ChunkedTask::new(i * 8));
        }
        // 1 buffered, 2 queued, 2 overflowed.
        assert_eq!(set.tasks(), 5);
        assert!(!set.is_empty());
        assert_eq!(set.stats().pushes, 5);
        assert_eq!(set.stats().overflow_spills, 2);

        drop(owner);
        set.clear();
        assert_eq!(set.tasks(), 0);
        assert!(set.is_empty());

        set.reset_stats();
        assert_eq!(set.stats().pushes, 0);
    }

    #[test]
    #[should_panic(expected = "at least one queue")]
    fn test_empty_set_rejected() {
        let _ = ClaimableQueueSet::<usize>::new(0, 16);
    }
}
