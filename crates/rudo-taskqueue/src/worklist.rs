//! Work-stealing queue primitives for parallel marking.
//!
//! [`StealQueue`] is a fixed-capacity, lock-free deque based on the Chase-Lev
//! algorithm. [`OverflowStack`] is the unbounded, lock-protected spill area
//! that absorbs tasks when a bounded queue is full.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

/// Default capacity of each per-worker bounded queue.
pub const TASKQUEUE_SIZE: usize = 1 << 14;

/// Lock-free bounded work stealing queue.
///
/// Based on: "Simple and Efficient Work-Stealing Queues for Parallel Programming"
/// by Chase and Lev (2005), without the resizing step.
///
/// The queue uses a circular buffer with separate bottom (owner) and top
/// (stealer) indices. The owner pushes and pops at the bottom (LIFO), while
/// any thread may steal from the top (FIFO).
///
/// # Invariants
///
/// - capacity is a power of 2 and `mask = capacity - 1`
/// - the queue is empty when `bottom == top`
/// - the queue is full when `bottom - top == capacity`
/// - size is always `bottom - top` (modulo arithmetic)
pub struct StealQueue<T: Copy> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    bottom: CachePadded<AtomicUsize>,
    top: CachePadded<AtomicUsize>,
    mask: usize,
}

impl<T: Copy> StealQueue<T> {
    /// Create a new steal queue holding up to `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of 2.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "StealQueue capacity must be a power of 2"
        );

        Self {
            buffer: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            bottom: CachePadded::new(AtomicUsize::new(0)),
            top: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
        }
    }

    /// Maximum number of items the queue holds.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        self.buffer[index & self.mask].get()
    }

    /// Push an item at the owner end.
    ///
    /// Returns the item back if the queue is full.
    ///
    /// # Safety
    ///
    /// Only the queue's owner may call `push` and [`pop`](Self::pop), and
    /// never concurrently with each other. Stealers use
    /// [`steal`](Self::steal).
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b.wrapping_sub(t) >= self.capacity() {
            return Err(item);
        }

        // SAFETY: Slot `b` lies outside `[top, bottom)`, so no stealer can
        // successfully claim it, and the caller guarantees we are the only
        // writer.
        unsafe { (*self.slot(b)).write(item) };

        // Release makes the slot write visible to stealers that observe the
        // new bottom.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop an item from the owner end (LIFO).
    ///
    /// # Safety
    ///
    /// Same contract as [`push`](Self::push).
    #[allow(clippy::cast_possible_wrap)]
    pub unsafe fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        if b.wrapping_sub(t) as isize <= 0 {
            return None;
        }

        let new_b = b.wrapping_sub(1);
        self.bottom.store(new_b, Ordering::Relaxed);
        // Orders the bottom decrement before the top read below; pairs with
        // the fence in `steal`.
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        let size = new_b.wrapping_sub(t) as isize;
        if size < 0 {
            self.bottom.store(b, Ordering::Release);
            return None;
        }

        // SAFETY: `new_b` is inside `[top, bottom)` and was written by push.
        let item = unsafe { (*self.slot(new_b)).assume_init_read() };
        if size > 0 {
            return Some(item);
        }

        // Last item: race stealers for it on `top`.
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b, Ordering::Release);
        won.then_some(item)
    }

    /// Steal an item from the top end (FIFO).
    ///
    /// Safe to call from any thread, concurrently with the owner and with
    /// other stealers. Returns `None` when the queue is empty or the race for
    /// the top item was lost.
    #[allow(clippy::cast_possible_wrap)]
    pub fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if b.wrapping_sub(t) as isize <= 0 {
            return None;
        }

        // SAFETY: The slot was published by push before bottom moved past it.
        // The owner may overwrite it once `top` has moved on, in which case
        // the CAS below fails and the value read here is discarded. `T: Copy`
        // means a discarded value needs no drop.
        let item = unsafe { self.slot(t).cast::<T>().read_volatile() };

        self.top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| item)
    }

    /// Number of items currently in the queue. Racy when read by non-owners.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        (b.wrapping_sub(t) as isize).max(0) as usize
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Discard all items by stealing them.
    pub fn clear(&self) {
        while !self.is_empty() {
            let _ = self.steal();
        }
    }
}

impl<T: Copy> std::fmt::Debug for StealQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StealQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

// SAFETY: StealQueue is safe to share between threads because:
// - bottom is written only by the single owner (enforced by the unsafe
//   push/pop contract)
// - top is advanced only through CAS, so each slot is claimed at most once
// - slot writes are published with Release on bottom and read after an
//   Acquire load of bottom
unsafe impl<T: Copy + Send> Send for StealQueue<T> {}

// SAFETY: See Send impl
unsafe impl<T: Copy + Send> Sync for StealQueue<T> {}

/// Unbounded overflow stack shared by the queues of one queue set.
///
/// Pushes and pops take the lock. The length is mirrored in an atomic so
/// emptiness and task counts can be read without locking.
#[derive(Debug)]
pub struct OverflowStack<T> {
    items: Mutex<Vec<T>>,
    len: AtomicUsize,
}

impl<T> OverflowStack<T> {
    /// Create an empty overflow stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Push an item.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        items.push(item);
        self.len.store(items.len(), Ordering::Release);
    }

    /// Pop the most recently pushed item.
    pub fn pop(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let mut items = self.items.lock();
        let item = items.pop();
        self.len.store(items.len(), Ordering::Release);
        item
    }

    /// Number of items, read without locking.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the stack is empty, read without locking.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all items.
    pub fn clear(&self) {
        let mut items = self.items.lock();
        items.clear();
        self.len.store(0, Ordering::Release);
    }
}

impl<T> Default for OverflowStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{OverflowStack, StealQueue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_steal_queue_basic() {
        let queue: StealQueue<i32> = StealQueue::new(1024);

        assert!(queue.is_empty());

        // SAFETY: single-threaded test, this thread is the owner.
        unsafe {
            assert!(queue.push(42).is_ok());
            assert!(!queue.is_empty());

            assert_eq!(queue.pop(), Some(42));
            assert!(queue.is_empty());

            assert_eq!(queue.pop(), None);
        }
    }

    #[test]
    fn test_steal_queue_fifo() {
        let queue: StealQueue<i32> = StealQueue::new(1024);

        // SAFETY: single-threaded test, this thread is the owner.
        unsafe {
            queue.push(1).unwrap();
            queue.push(2).unwrap();
            queue.push(3).unwrap();
        }

        assert_eq!(queue.steal(), Some(1));
        assert_eq!(queue.steal(), Some(2));
        assert_eq!(queue.steal(), Some(3));
        assert_eq!(queue.steal(), None);
    }

    #[test]
    fn test_steal_queue_lifo() {
        let queue: StealQueue<i32> = StealQueue::new(1024);

        // SAFETY: single-threaded test, this thread is the owner.
        unsafe {
            queue.push(1).unwrap();
            queue.push(2).unwrap();
            queue.push(3).unwrap();

            assert_eq!(queue.pop(), Some(3));
            assert_eq!(queue.pop(), Some(2));
            assert_eq!(queue.pop(), Some(1));
        }
    }

    #[test]
    fn test_steal_queue_bounds() {
        let queue: StealQueue<i32> = StealQueue::new(16);

        // SAFETY: single-threaded test, this thread is the owner.
        unsafe {
            for i in 0..16 {
                assert!(queue.push(i).is_ok());
            }
            assert_eq!(queue.push(999), Err(999));
        }

        assert!(queue.is_full());
        assert_eq!(queue.len(), 16);
    }

    #[test]
    #[should_panic(expected = "power of 2")]
    fn test_steal_queue_rejects_odd_capacity() {
        let _ = StealQueue::<i32>::new(12);
    }

    #[test]
    fn test_steal_queue_wrap_around() {
        let queue: StealQueue<i32> = StealQueue::new(8);

        // SAFETY: single-threaded test, this thread is the owner.
        unsafe {
            for round in 0..5 {
                for i in 0..8 {
                    queue.push(round * 100 + i).unwrap();
                }
                for i in 0..4 {
                    assert_eq!(queue.steal(), Some(round * 100 + i));
                }
                for i in (4..8).rev() {
                    assert_eq!(queue.pop(), Some(round * 100 + i));
                }
                assert!(queue.is_empty());
            }
        }
    }

    #[test]
    fn test_steal_queue_clear() {
        let queue: StealQueue<i32> = StealQueue::new(8);
        // SAFETY: single-threaded test, this thread is the owner.
        unsafe {
            queue.push(1).unwrap();
            queue.push(2).unwrap();
        }
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_pop_and_steal_take_each_item_once() {
        const ITEMS: usize = 20_000;
        const STEALERS: usize = 3;

        let queue: Arc<StealQueue<usize>> = Arc::new(StealQueue::new(256));
        let seen: Arc<Vec<AtomicUsize>> = Arc::new((0..ITEMS).map(|_| AtomicUsize::new(0)).collect());
        let done = Arc::new(AtomicUsize::new(0));

        let stealers: Vec<_> = (0..STEALERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let seen = Arc::clone(&seen);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while done.load(Ordering::Acquire) == 0 || !queue.is_empty() {
                        if let Some(item) = queue.steal() {
                            seen[item].fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        let mut next = 0;
        while next < ITEMS {
            // SAFETY: this thread is the only owner.
            unsafe {
                if queue.push(next).is_ok() {
                    next += 1;
                }
                if next % 3 == 0 {
                    if let Some(item) = queue.pop() {
                        seen[item].fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        done.store(1, Ordering::Release);

        for stealer in stealers {
            stealer.join().unwrap();
        }

        for (item, count) in seen.iter().enumerate() {
            assert_eq!(count.load(Ordering::Relaxed), 1, "item {item}");
        }
    }

    #[test]
    fn test_overflow_stack_lifo() {
        let stack = OverflowStack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);

        stack.push(1);
        stack.push(2);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_overflow_stack_clear() {
        let stack = OverflowStack::new();
        for i in 0..10 {
            stack.push(i);
        }
        stack.clear();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);
    }
}
