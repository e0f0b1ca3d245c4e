//! Parallel mark worker loop.
//!
//! A [`MarkWorker`] owns one queue of a [`ClaimableQueueSet`] and drains it,
//! steals from peers once it runs dry, and finally offers termination. The
//! scan callback receives every task together with the worker's
//! [`QueueOwner`], so tracing an object pushes its children straight into the
//! worker's write buffer.

use std::sync::Arc;

use crate::buffered::QueueOwner;
use crate::config::{QueueSetConfig, TerminatorConfig};
use crate::queue_set::{ClaimableQueueSet, MarkQueueSet, StealSeed};
use crate::terminator::{TerminationCheck, Terminator};

/// Totals reported by [`MarkWorker::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// Tasks handed to the scan callback, stolen ones included.
    pub processed: usize,
    /// Tasks taken from peer queues or the overflow stack by stealing.
    pub stolen: usize,
    /// Whether the phase ended by cancellation instead of quiescence.
    pub cancelled: bool,
}

/// One worker of a parallel mark phase.
pub struct MarkWorker<'a, T: Copy> {
    id: usize,
    owner: QueueOwner<'a, T>,
    terminator: &'a Terminator<ClaimableQueueSet<T>>,
    seed: StealSeed,
    check: Option<&'a dyn TerminationCheck>,
}

impl<'a, T: Copy + Send> MarkWorker<'a, T> {
    /// Bind worker `id` to its queue.
    ///
    /// Returns `None` if the set has no queue `id` or the queue is already
    /// owned.
    #[must_use]
    pub fn new(terminator: &'a Terminator<ClaimableQueueSet<T>>, id: usize) -> Option<Self> {
        let owner = terminator.queue_set().queue(id)?.owner()?;
        Some(Self {
            id,
            owner,
            terminator,
            seed: StealSeed::new(id),
            check: None,
        })
    }

    /// Consult `check` whenever this worker waits in the terminator.
    #[must_use]
    pub fn with_check(mut self, check: &'a dyn TerminationCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Worker id, equal to the index of its queue.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Owner access to the worker's queue, for seeding roots.
    pub fn owner(&mut self) -> &mut QueueOwner<'a, T> {
        &mut self.owner
    }

    /// Process every queue handed out by
    /// [`ClaimableQueueSet::claim_next`].
    ///
    /// This worker's own queue is drained through its owner handle. Any other
    /// claimed queue is drained by stealing, so its write buffer stays with
    /// its owner and the owner can still bind while this runs. Everything the
    /// scan callback pushes lands in this worker's queue. Returns the number
    /// of tasks scanned.
    pub fn drain_claimed<F>(&mut self, mut scan: F) -> usize
    where
        F: FnMut(T, &mut QueueOwner<'a, T>),
    {
        let terminator = self.terminator;
        let set = terminator.queue_set();
        let mut processed = 0;
        while let Some(queue) = set.claim_next() {
            if queue.id() == self.id {
                while let Some(task) = self.owner.pop_buffer().or_else(|| self.owner.pop_local())
                {
                    scan(task, &mut self.owner);
                    processed += 1;
                }
                continue;
            }
            while let Some(task) = queue.steal() {
                scan(task, &mut self.owner);
                processed += 1;
            }
        }
        processed
    }

    /// Run the mark loop until the phase terminates or is cancelled.
    ///
    /// Tasks are taken from the write buffer, the bounded queue, the shared
    /// overflow stack and finally from peers. With nothing left anywhere the
    /// worker offers termination; a `false` answer sends it back to
    /// stealing.
    pub fn run<F>(&mut self, mut scan: F) -> WorkerOutcome
    where
        F: FnMut(T, &mut QueueOwner<'a, T>),
    {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::span_mark_worker(self.id, self.terminator.phase()).entered();

        let terminator = self.terminator;
        let set = terminator.queue_set();
        let mut outcome = WorkerOutcome::default();
        loop {
            while let Some(task) = self.owner.pop() {
                scan(task, &mut self.owner);
                outcome.processed += 1;
                if self.terminator.is_cancelled() {
                    return self.finish(outcome);
                }
            }

            if let Some(task) = set.steal(self.id, &mut self.seed) {
                outcome.stolen += 1;
                outcome.processed += 1;
                scan(task, &mut self.owner);
                continue;
            }

            if self.terminator.offer_termination(self.check) {
                return self.finish(outcome);
            }
        }
    }

    fn finish(&self, mut outcome: WorkerOutcome) -> WorkerOutcome {
        outcome.cancelled = self.terminator.is_cancelled();
        #[cfg(feature = "tracing")]
        crate::tracing::log_worker_done(outcome.processed, outcome.stolen, outcome.cancelled);
        outcome
    }
}

impl<T: Copy> std::fmt::Debug for MarkWorker<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkWorker")
            .field("id", &self.id)
            .field("queue", self.owner.queue())
            .finish_non_exhaustive()
    }
}

/// Build the shared queue set and terminator of a parallel mark phase.
///
/// Reserved queues belong to threads outside the phase, so the terminator
/// counts only the unreserved ones as workers.
///
/// # Panics
///
/// Panics if the reservation leaves no unreserved queue.
#[must_use]
pub fn init_parallel_marking(
    queue_config: &QueueSetConfig,
    terminator_config: TerminatorConfig,
) -> (Arc<MarkQueueSet>, Arc<Terminator<MarkQueueSet>>) {
    let set = Arc::new(MarkQueueSet::with_config(queue_config));
    let workers = set.size() - queue_config.reserved;
    let terminator = Arc::new(Terminator::with_config(
        workers,
        Arc::clone(&set),
        terminator_config,
    ));
    (set, terminator)
}
