//! Per-queue task statistics.

use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one buffered queue.
///
/// All counters use relaxed atomics; values are advisory and only exact once
/// the phase has quiesced.
#[derive(Debug, Default)]
pub struct QueueStats {
    pushes: AtomicU64,
    buffer_pops: AtomicU64,
    local_pops: AtomicU64,
    overflow_spills: AtomicU64,
    overflow_pops: AtomicU64,
    steals: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    /// Tasks pushed by the owner.
    pub pushes: u64,
    /// Tasks popped straight from the write buffer.
    pub buffer_pops: u64,
    /// Tasks popped by the owner from its bounded queue.
    pub local_pops: u64,
    /// Tasks demoted to the overflow stack because the bounded queue was full.
    pub overflow_spills: u64,
    /// Tasks this queue's worker took from the overflow stack, popped or
    /// stolen.
    pub overflow_pops: u64,
    /// Tasks taken from this queue by other threads.
    pub steals: u64,
}

impl QueueStats {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_push(&self) {
        Self::bump(&self.pushes);
    }

    pub(crate) fn record_buffer_pop(&self) {
        Self::bump(&self.buffer_pops);
    }

    pub(crate) fn record_local_pop(&self) {
        Self::bump(&self.local_pops);
    }

    pub(crate) fn record_overflow_spill(&self) {
        Self::bump(&self.overflow_spills);
    }

    pub(crate) fn record_overflow_pop(&self) {
        Self::bump(&self.overflow_pops);
    }

    pub(crate) fn record_steal(&self) {
        Self::bump(&self.steals);
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            pushes: self.pushes.load(Ordering::Relaxed),
            buffer_pops: self.buffer_pops.load(Ordering::Relaxed),
            local_pops: self.local_pops.load(Ordering::Relaxed),
            overflow_spills: self.overflow_spills.load(Ordering::Relaxed),
            overflow_pops: self.overflow_pops.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        for counter in [
            &self.pushes,
            &self.buffer_pops,
            &self.local_pops,
            &self.overflow_spills,
            &self.overflow_pops,
            &self.steals,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl QueueStatsSnapshot {
    /// Tasks removed from the queue by any path.
    #[must_use]
    pub const fn pops(&self) -> u64 {
        self.buffer_pops + self.local_pops + self.overflow_pops + self.steals
    }
}

impl Add for QueueStatsSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            pushes: self.pushes + rhs.pushes,
            buffer_pops: self.buffer_pops + rhs.buffer_pops,
            local_pops: self.local_pops + rhs.local_pops,
            overflow_spills: self.overflow_spills + rhs.overflow_spills,
            overflow_pops: self.overflow_pops + rhs.overflow_pops,
            steals: self.steals + rhs.steals,
        }
    }
}

impl AddAssign for QueueStatsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
