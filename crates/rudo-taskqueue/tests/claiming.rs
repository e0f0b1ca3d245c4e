//! Integration tests for whole-queue claiming.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use rudo_taskqueue::{ClaimableQueueSet, MarkQueueSet, QueueSetConfig};

fn claim_concurrently(set: &Arc<MarkQueueSet>, threads: usize) -> Vec<usize> {
    let barrier = Arc::new(Barrier::new(threads));
    let claimed = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let set = Arc::clone(set);
            let barrier = Arc::clone(&barrier);
            let claimed = Arc::clone(&claimed);
            thread::spawn(move || {
                barrier.wait();
                let mut mine = Vec::new();
                while let Some(queue) = set.claim_next() {
                    mine.push(queue.id());
                }
                claimed.lock().unwrap().extend(mine);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut ids = Arc::try_unwrap(claimed).unwrap().into_inner().unwrap();
    ids.sort_unstable();
    ids
}

/// N concurrent claimers receive every unreserved index exactly once.
#[test]
fn test_concurrent_claim_is_one_to_one() {
    for reserved in [0, 1, 3] {
        let config = QueueSetConfig::new(8)
            .with_queue_capacity(16)
            .with_reserved(reserved);
        let set = Arc::new(MarkQueueSet::with_config(&config));

        let ids = claim_concurrently(&set, 8);
        assert_eq!(ids, (reserved..8).collect::<Vec<_>>());

        for _ in 0..4 {
            assert!(set.claim_next().is_none());
        }
    }
}

/// More claimers than queues: the surplus gets nothing.
#[test]
fn test_surplus_claimers_get_none() {
    let set = Arc::new(ClaimableQueueSet::new(3, 16));
    let ids = claim_concurrently(&set, 12);
    assert_eq!(ids, vec![0, 1, 2]);
}

/// A cleared cursor hands the queues out again in the next phase.
#[test]
fn test_claiming_across_phases() {
    let set = Arc::new(MarkQueueSet::new(4, 16));
    set.reserve(1);
    assert_eq!(claim_concurrently(&set, 4), vec![1, 2, 3]);

    set.clear_claimed();
    assert_eq!(claim_concurrently(&set, 4), vec![0, 1, 2, 3]);

    set.clear_claimed();
    set.reserve(4);
    assert!(claim_concurrently(&set, 4).is_empty());
}

/// Claiming does not take ownership; claimed queues stay usable.
#[test]
fn test_claimed_queue_is_still_ownable() {
    let set = MarkQueueSet::new(2, 16);
    let queue = set.claim_next().unwrap();
    assert!(!queue.is_owned());
    let owner = queue.owner();
    assert!(owner.is_some());
}
