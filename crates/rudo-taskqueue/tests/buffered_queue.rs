//! Integration tests for the buffered per-worker queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rudo_taskqueue::{BufferedQueue, ChunkedTask, OverflowStack};

fn queue(capacity: usize) -> BufferedQueue<ChunkedTask> {
    BufferedQueue::new(0, capacity, Arc::new(OverflowStack::new()))
}

/// Pushing far past the bounded capacity never loses a task.
#[test]
fn test_push_over_capacity_keeps_every_task() {
    let q = queue(8);
    let mut owner = q.owner().unwrap();

    let tasks: Vec<ChunkedTask> = (1..=100).map(|i| ChunkedTask::new(i * 16)).collect();
    for &task in &tasks {
        owner.push(task);
    }

    assert_eq!(q.stealable(), 8);
    assert_eq!(q.overflow().len(), 100 - 8 - 1);
    assert!(!q.buffer_empty());

    let mut drained = HashSet::new();
    while let Some(task) = owner.pop() {
        assert!(drained.insert(task), "task popped twice: {task:?}");
    }
    assert_eq!(drained.len(), tasks.len());
    assert!(q.is_empty());
}

/// The most recent push is always the next buffer pop.
#[test]
fn test_buffer_holds_most_recent_push() {
    let q = queue(16);
    let mut owner = q.owner().unwrap();

    for i in 1..10 {
        owner.push(ChunkedTask::new(i));
        assert_eq!(owner.pop_buffer(), Some(ChunkedTask::new(i)));
        assert_eq!(q.stealable(), 0);
        assert!(q.overflow().is_empty());
    }
    let stats = q.stats().snapshot();
    assert_eq!(stats.pushes, 9);
    assert_eq!(stats.buffer_pops, 9);
    assert_eq!(stats.local_pops, 0);
}

/// Chunked tasks survive the queue and overflow paths unchanged.
#[test]
fn test_chunked_tasks_round_trip_through_queue() {
    let q = queue(2);
    let mut owner = q.owner().unwrap();

    let root = ChunkedTask::root_chunk(0x4000, 300);
    let (lo, hi) = root.split().unwrap();
    let pushed = [root, lo, hi, ChunkedTask::new(0x8000)];
    for task in pushed {
        owner.push(task);
    }

    let mut popped = Vec::new();
    while let Some(task) = owner.pop() {
        popped.push(task);
    }
    for task in pushed {
        assert!(popped.contains(&task));
    }
    assert_eq!(popped.len(), pushed.len());
}

/// Thieves never see the buffered task, and every queued task is taken once.
#[test]
fn test_owner_and_thieves_share_work_exactly_once() {
    const TASKS: usize = 10_000;
    const THIEVES: usize = 3;

    let q = Arc::new(BufferedQueue::new(0, 64, Arc::new(OverflowStack::new())));
    let barrier = Arc::new(Barrier::new(THIEVES + 1));
    let done = Arc::new(AtomicBool::new(false));

    let thieves: Vec<_> = (0..THIEVES)
        .map(|_| {
            let q = Arc::clone(&q);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                barrier.wait();
                let mut stolen = Vec::new();
                loop {
                    if let Some(item) = q.steal() {
                        stolen.push(item);
                    } else if let Some(item) = q.overflow().pop() {
                        stolen.push(item);
                    } else if done.load(Ordering::Acquire) {
                        break;
                    } else {
                        thread::yield_now();
                    }
                }
                stolen
            })
        })
        .collect();

    let mut mine = Vec::new();
    {
        let mut owner = q.owner().unwrap();
        barrier.wait();
        for i in 1..=TASKS {
            owner.push(i);
            if i % 3 == 0 {
                if let Some(item) = owner.pop() {
                    mine.push(item);
                }
            }
        }
        while let Some(item) = owner.pop() {
            mine.push(item);
        }
    }
    done.store(true, Ordering::Release);

    let mut all = mine;
    for thief in thieves {
        all.extend(thief.join().unwrap());
    }
    all.sort_unstable();
    assert_eq!(all, (1..=TASKS).collect::<Vec<_>>());
}

/// Owner handles can move between threads, one at a time.
#[test]
fn test_owner_handle_moves_between_threads() {
    let q = Arc::new(queue(8));

    let first = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            let mut owner = q.owner().unwrap();
            owner.push(ChunkedTask::new(0x10));
            owner.push(ChunkedTask::new(0x20));
        })
    };
    first.join().unwrap();
    assert!(!q.is_owned());

    let mut owner = q.owner().unwrap();
    assert_eq!(owner.pop_buffer(), Some(ChunkedTask::new(0x20)));
    assert_eq!(owner.pop_local(), Some(ChunkedTask::new(0x10)));
}
