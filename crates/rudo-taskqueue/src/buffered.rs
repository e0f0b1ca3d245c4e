//! Per-worker task queue with a single-slot write buffer.
//!
//! Marking is depth-first: the task pushed last is usually the next one
//! popped. Keeping that task in a one-slot buffer owned by the worker turns
//! the common push-one/pop-one cycle into plain local accesses. Only the
//! previous buffer occupant is ever demoted into the shared structures: first
//! the bounded [`StealQueue`], then the shared [`OverflowStack`] once the
//! queue is full.
//!
//! # Ownership
//!
//! The buffer is visible only to the queue's owner. Owner operations live on
//! [`QueueOwner`], and [`BufferedQueue::owner`] hands out at most one such
//! handle at a time. Other threads steal through [`BufferedQueue::steal`] and
//! the shared overflow stack, never through the buffer.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::stats::QueueStats;
use crate::worklist::{OverflowStack, StealQueue};

/// A bounded steal queue fronted by a one-slot write buffer.
pub struct BufferedQueue<T: Copy> {
    id: usize,
    buffer: UnsafeCell<MaybeUninit<T>>,
    /// Written only by the owner; read by anyone counting pending tasks.
    occupied: AtomicBool,
    owned: AtomicBool,
    queue: StealQueue<T>,
    overflow: Arc<OverflowStack<T>>,
    stats: QueueStats,
}

impl<T: Copy> BufferedQueue<T> {
    /// Create queue `id` with a bounded part of `capacity` items, spilling
    /// into `overflow`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of 2.
    #[must_use]
    pub fn new(id: usize, capacity: usize, overflow: Arc<OverflowStack<T>>) -> Self {
        Self {
            id,
            buffer: UnsafeCell::new(MaybeUninit::uninit()),
            occupied: AtomicBool::new(false),
            owned: AtomicBool::new(false),
            queue: StealQueue::new(capacity),
            overflow,
            stats: QueueStats::default(),
        }
    }

    /// Index of this queue in its set (the owning worker's id).
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Take exclusive owner access.
    ///
    /// Returns `None` while another [`QueueOwner`] for this queue is alive.
    pub fn owner(&self) -> Option<QueueOwner<'_, T>> {
        self.owned
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| QueueOwner { queue: self })
    }

    /// Whether an owner handle is currently held.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::Relaxed)
    }

    /// Steal one task from the bounded part. Callable from any thread.
    pub fn steal(&self) -> Option<T> {
        let item = self.queue.steal();
        if item.is_some() {
            self.stats.record_steal();
        }
        item
    }

    /// Whether the write buffer is empty.
    #[must_use]
    pub fn buffer_empty(&self) -> bool {
        !self.occupied.load(Ordering::Acquire)
    }

    /// Discard the buffered task without an owner handle.
    ///
    /// Only meaningful at a phase boundary, when no owner is pushing.
    pub fn clear_buffer(&self) {
        self.occupied.store(false, Ordering::Release);
    }

    /// Whether the buffer, the bounded queue and the shared overflow stack are
    /// all empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer_empty() && self.queue.is_empty() && self.overflow.is_empty()
    }

    /// Tasks held by this queue: the bounded part plus the buffer slot.
    /// The shared overflow stack is not included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(!self.buffer_empty())
    }

    /// Number of tasks other threads can steal from the bounded part.
    #[must_use]
    pub fn stealable(&self) -> usize {
        self.queue.len()
    }

    /// The shared overflow stack this queue spills into.
    #[must_use]
    pub const fn overflow(&self) -> &Arc<OverflowStack<T>> {
        &self.overflow
    }

    /// Counters for this queue.
    #[must_use]
    pub const fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Empty the buffer and the bounded part. Phase-boundary operation.
    pub fn clear(&self) {
        self.clear_buffer();
        self.queue.clear();
    }
}

impl<T: Copy> std::fmt::Debug for BufferedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedQueue")
            .field("id", &self.id)
            .field("buffered", &!self.buffer_empty())
            .field("queue", &self.queue)
            .field("overflow", &self.overflow.len())
            .finish_non_exhaustive()
    }
}

// SAFETY: BufferedQueue is safe to share between threads because:
// - the buffer slot is only read or written through a QueueOwner, and at most
//   one QueueOwner exists per queue (guarded by the `owned` CAS)
// - `occupied` is atomic, so other threads may observe it
// - the bounded queue and overflow stack are themselves Sync
unsafe impl<T: Copy + Send> Send for BufferedQueue<T> {}

// SAFETY: See Send impl
unsafe impl<T: Copy + Send> Sync for BufferedQueue<T> {}

/// Exclusive owner access to a [`BufferedQueue`].
///
/// Dropping the handle releases ownership so another thread (for example the
/// worker of a later phase) can take it.
pub struct QueueOwner<'a, T: Copy> {
    queue: &'a BufferedQueue<T>,
}

impl<'a, T: Copy> QueueOwner<'a, T> {
    /// The owned queue.
    #[must_use]
    pub const fn queue(&self) -> &'a BufferedQueue<T> {
        self.queue
    }

    /// Push a task. Always succeeds.
    ///
    /// The new task lands in the buffer; a previously buffered task moves to
    /// the bounded queue, or to the overflow stack if the queue is full.
    pub fn push(&mut self, item: T) {
        let q = self.queue;
        if q.occupied.load(Ordering::Relaxed) {
            // SAFETY: the buffer is occupied, so it was initialised by an
            // earlier push through this handle or a previous owner's.
            let previous = unsafe { (*q.buffer.get()).assume_init() };
            // SAFETY: `&mut self` on the unique owner handle.
            if let Err(previous) = unsafe { q.queue.push(previous) } {
                q.overflow.push(previous);
                q.stats.record_overflow_spill();
                #[cfg(feature = "tracing")]
                crate::tracing::log_overflow_spill(q.id, q.overflow.len());
            }
        }
        // SAFETY: only the owner touches the buffer.
        unsafe { (*q.buffer.get()).write(item) };
        q.occupied.store(true, Ordering::Release);
        q.stats.record_push();
    }

    /// Take the buffered task, if any, without touching the queue or the
    /// overflow stack.
    pub fn pop_buffer(&mut self) -> Option<T> {
        let q = self.queue;
        if !q.occupied.load(Ordering::Relaxed) {
            return None;
        }
        // SAFETY: occupied implies initialised; only the owner reads it.
        let item = unsafe { (*q.buffer.get()).assume_init() };
        q.occupied.store(false, Ordering::Release);
        q.stats.record_buffer_pop();
        Some(item)
    }

    /// Pop the most recently queued task from the bounded part.
    pub fn pop_local(&mut self) -> Option<T> {
        // SAFETY: `&mut self` on the unique owner handle.
        let item = unsafe { self.queue.queue.pop() };
        if item.is_some() {
            self.queue.stats.record_local_pop();
        }
        item
    }

    /// Pop a task from the shared overflow stack.
    pub fn pop_overflow(&mut self) -> Option<T> {
        let item = self.queue.overflow.pop();
        if item.is_some() {
            self.queue.stats.record_overflow_pop();
        }
        item
    }

    /// Pop from the buffer, then the bounded part, then the overflow stack.
    pub fn pop(&mut self) -> Option<T> {
        self.pop_buffer()
            .or_else(|| self.pop_local())
            .or_else(|| self.pop_overflow())
    }

    /// Discard the buffered task.
    pub fn clear_buffer(&mut self) {
        self.queue.clear_buffer();
    }

    /// Whether the write buffer is empty.
    #[must_use]
    pub fn buffer_empty(&self) -> bool {
        self.queue.buffer_empty()
    }

    /// Whether buffer, bounded queue and overflow stack are all empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Copy> Drop for QueueOwner<'_, T> {
    fn drop(&mut self) {
        self.queue.owned.store(false, Ordering::Release);
    }
}

impl<T: Copy> std::fmt::Debug for QueueOwner<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("QueueOwner").field(self.queue).finish()
    }
}
