//! Work-stealing termination detection with a rotating spin-master.
//!
//! Workers that run out of local work and fail to steal call
//! [`Terminator::offer_termination`]. Among the offering workers at most one
//! is the *spin-master*: it polls the pending-task count of the queue set
//! without blocking, while the others wait on a monitor. When new work shows
//! up the spin-master leaves and wakes enough sleepers to steal it. When every
//! worker has offered and no tasks are pending, the phase is over.
//!
//! A static spin-master that simply goes to sleep after its spin budget leaves
//! nobody watching for new work or for termination until some sleeper's
//! timeout fires. Instead, before sleeping the spin-master gives up the role
//! and wakes another idle worker to take it over, so detection latency is one
//! hand-off instead of one wait timeout.
//!
//! # Per-worker states
//!
//! | State        | Meaning                                                   |
//! |--------------|-----------------------------------------------------------|
//! | Active       | Has or is looking for work; not inside the terminator     |
//! | Offering     | Counted as idle; deciding whether to spin or block        |
//! | Spin-master  | Busy-polls the task count and the offered count           |
//! | Blocked      | Waits on the monitor for at most one polling interval     |
//! | Terminated   | Every worker offered and the re-check found no tasks      |
//! | Cancelled    | Forced termination; pending tasks are ignored             |
//!
//! Termination is only declared while holding the monitor, with every worker
//! counted as offered, after reading the task count again. A task pushed by a
//! worker on its way into the terminator is therefore never lost: the worker
//! that completes the count finds it and sends everybody back to work.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::TerminatorConfig;
use crate::queue_set::TaskQueueSet;
use crate::tracing::{next_phase_id, PhaseId};

/// Caller-supplied hooks consulted while a worker waits for termination.
pub trait TerminationCheck {
    /// Leave the terminator and resume work even though no tasks are visible.
    fn should_exit_termination(&self) -> bool {
        false
    }

    /// Terminate the phase now, regardless of pending tasks.
    fn should_force_termination(&self) -> bool {
        false
    }
}

/// Termination check used once a phase has been cancelled: always forces
/// termination.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelledTerminator;

impl TerminationCheck for CancelledTerminator {
    fn should_force_termination(&self) -> bool {
        true
    }
}

/// Role of a worker inside [`Terminator::offer_termination`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    SpinMaster,
    Blocked,
}

/// Result of one spell as spin-master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpinOutcome {
    Terminated,
    Cancelled,
    /// Tasks (or an exit request) were seen; the role has been released and
    /// the worker leaves the terminator.
    FoundWork,
    /// Another worker took the role while this one slept.
    Relinquished,
}

#[derive(Debug, Default)]
struct Monitor {
    spin_master: Option<ThreadId>,
    sleepers: usize,
}

/// Termination detector shared by the workers of one parallel phase.
pub struct Terminator<S: ?Sized> {
    queue_set: Arc<S>,
    config: TerminatorConfig,
    workers: AtomicUsize,
    /// Modified only while holding `monitor`; read lock-free by the
    /// spin-master.
    offered: AtomicUsize,
    terminated: AtomicBool,
    cancelled: AtomicBool,
    monitor: Mutex<Monitor>,
    blocker: Condvar,
    phase: AtomicU64,
}

impl<S: TaskQueueSet + ?Sized> Terminator<S> {
    /// Create a terminator for `workers` threads over `queue_set`.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    #[must_use]
    pub fn new(workers: usize, queue_set: Arc<S>) -> Self {
        Self::with_config(workers, queue_set, TerminatorConfig::default())
    }

    /// Create a terminator with an explicit back-off schedule.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    #[must_use]
    pub fn with_config(workers: usize, queue_set: Arc<S>, config: TerminatorConfig) -> Self {
        assert!(workers > 0, "terminator needs at least one worker");
        Self {
            queue_set,
            config,
            workers: AtomicUsize::new(workers),
            offered: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            monitor: Mutex::new(Monitor::default()),
            blocker: Condvar::new(),
            phase: AtomicU64::new(next_phase_id().0),
        }
    }

    /// The queue set this terminator watches.
    #[must_use]
    pub const fn queue_set(&self) -> &Arc<S> {
        &self.queue_set
    }

    /// The back-off schedule.
    #[must_use]
    pub const fn config(&self) -> &TerminatorConfig {
        &self.config
    }

    /// Number of participating workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::Relaxed)
    }

    /// Identifier of the current phase, for correlating trace events.
    #[must_use]
    pub fn phase(&self) -> PhaseId {
        PhaseId(self.phase.load(Ordering::Relaxed))
    }

    /// Workers not currently inside [`offer_termination`](Self::offer_termination).
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers()
            .saturating_sub(self.offered.load(Ordering::Acquire))
    }

    /// Whether quiescence has been detected.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Whether the phase has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The thread currently acting as spin-master, if any.
    #[must_use]
    pub fn spin_master(&self) -> Option<ThreadId> {
        self.monitor.lock().spin_master
    }

    /// Force termination: every current and future caller of
    /// [`offer_termination`](Self::offer_termination) returns `true` until the
    /// terminator is reset.
    pub fn cancel(&self) {
        let mut monitor = self.monitor.lock();
        self.cancel_locked(&mut monitor);
    }

    /// Prepare for another phase with the same number of workers.
    ///
    /// Must not be called while any worker is inside the terminator.
    pub fn reset_for_reuse(&self) {
        let mut monitor = self.monitor.lock();
        debug_assert!(monitor.sleepers == 0, "reset while workers are waiting");
        monitor.spin_master = None;
        self.offered.store(0, Ordering::Release);
        self.terminated.store(false, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);
        self.phase.store(next_phase_id().0, Ordering::Relaxed);
    }

    /// Prepare for another phase with `workers` workers.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn reset_for_reuse_with(&self, workers: usize) {
        assert!(workers > 0, "terminator needs at least one worker");
        self.workers.store(workers, Ordering::Relaxed);
        self.reset_for_reuse();
    }

    /// Offer to terminate the phase.
    ///
    /// Call once the worker's own queue is empty and stealing failed. Returns
    /// `true` when the phase is over, either because every worker is idle and
    /// no tasks are pending or because the phase was cancelled. Returns
    /// `false` when the worker should resume stealing: tasks appeared, or
    /// `check` asked to exit.
    pub fn offer_termination(&self, check: Option<&dyn TerminationCheck>) -> bool {
        if forced(check) {
            self.cancel();
            return true;
        }
        if self.is_terminated() || self.is_cancelled() {
            return true;
        }

        let workers = self.workers();
        let mut monitor = self.monitor.lock();
        let offered = self.offered.load(Ordering::Relaxed) + 1;
        debug_assert!(offered <= workers, "more offers than workers");
        self.offered.store(offered, Ordering::Release);

        if offered == workers {
            return self.complete_or_resume(&mut monitor);
        }

        let me = thread::current().id();
        loop {
            let role = if monitor.spin_master.is_none() {
                monitor.spin_master = Some(me);
                #[cfg(feature = "tracing")]
                crate::tracing::log_spin_master_acquired(self.phase());
                Offer::SpinMaster
            } else {
                Offer::Blocked
            };

            match role {
                Offer::SpinMaster => {
                    let outcome =
                        MutexGuard::unlocked(&mut monitor, || self.spin_master_work(me, check));
                    match outcome {
                        SpinOutcome::Terminated | SpinOutcome::Cancelled => return true,
                        SpinOutcome::FoundWork => {
                            self.offered.fetch_sub(1, Ordering::AcqRel);
                            return false;
                        }
                        SpinOutcome::Relinquished => {}
                    }
                }
                Offer::Blocked => {
                    monitor.sleepers += 1;
                    self.blocker.wait_for(&mut monitor, self.config.sleep);
                    monitor.sleepers -= 1;
                }
            }

            if self.is_terminated() || self.is_cancelled() {
                return true;
            }
            if forced(check) {
                self.cancel_locked(&mut monitor);
                return true;
            }

            let tasks = self.queue_set.tasks();
            if tasks > 0 || should_exit(check) {
                self.offered.fetch_sub(1, Ordering::AcqRel);
                #[cfg(feature = "tracing")]
                crate::tracing::log_exit_termination(self.phase(), tasks);
                return false;
            }
        }
    }

    /// Every worker has offered: terminate if the set is really empty,
    /// otherwise send the caller (and any sleepers) back to work.
    fn complete_or_resume(&self, monitor: &mut Monitor) -> bool {
        let tasks = self.queue_set.tasks();
        if tasks == 0 {
            self.terminate(monitor);
            return true;
        }
        self.offered.fetch_sub(1, Ordering::AcqRel);
        // The pending tasks may sit in a sleeper's write buffer, which only
        // that sleeper can drain.
        self.blocker.notify_all();
        #[cfg(feature = "tracing")]
        crate::tracing::log_exit_termination(self.phase(), tasks);
        false
    }

    fn terminate(&self, monitor: &mut Monitor) {
        monitor.spin_master = None;
        self.terminated.store(true, Ordering::Release);
        self.blocker.notify_all();
        #[cfg(feature = "tracing")]
        crate::tracing::log_termination(self.phase(), self.workers());
    }

    fn cancel_locked(&self, monitor: &mut Monitor) {
        monitor.spin_master = None;
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            #[cfg(feature = "tracing")]
            crate::tracing::log_cancelled(self.phase(), self.offered.load(Ordering::Relaxed));
        }
        self.blocker.notify_all();
    }

    /// Give up the spin-master role before sleeping. Wakes one blocked worker
    /// to take it over, if there is one; returns whether a successor was
    /// woken.
    fn relinquish_spin_master(&self, monitor: &mut Monitor) -> bool {
        monitor.spin_master = None;
        let successor = monitor.sleepers > 0;
        if successor {
            self.blocker.notify_one();
        }
        #[cfg(feature = "tracing")]
        crate::tracing::log_spin_master_handoff(self.phase(), successor);
        successor
    }

    /// Wake sleepers to steal `tasks` newly visible tasks. The caller takes
    /// one of them itself.
    fn wake_for_tasks(&self, monitor: &Monitor, tasks: usize) {
        if tasks > monitor.sleepers {
            self.blocker.notify_all();
        } else {
            for _ in 1..tasks {
                self.blocker.notify_one();
            }
        }
    }

    fn spin_master_work(&self, me: ThreadId, check: Option<&dyn TerminationCheck>) -> SpinOutcome {
        let config = &self.config;
        let hard_spin_start = config.initial_hard_spins();
        let mut hard_spin_limit = hard_spin_start;
        let mut hard_spin_count = 0u32;
        let mut yield_count = 0u32;

        loop {
            if yield_count <= config.yields_before_sleep {
                yield_count += 1;
                if hard_spin_count > config.spin_to_yield_ratio {
                    thread::yield_now();
                    hard_spin_count = 0;
                    hard_spin_limit = hard_spin_start;
                } else {
                    hard_spin_limit = hard_spin_limit.saturating_mul(2).min(config.hard_spins);
                    for _ in 0..hard_spin_limit {
                        std::hint::spin_loop();
                    }
                    hard_spin_count += 1;
                }
            } else {
                yield_count = 0;
                let mut monitor = self.monitor.lock();
                if self.is_terminated() {
                    return SpinOutcome::Terminated;
                }
                if self.is_cancelled() {
                    return SpinOutcome::Cancelled;
                }
                self.relinquish_spin_master(&mut monitor);
                monitor.sleepers += 1;
                self.blocker.wait_for(&mut monitor, config.sleep);
                monitor.sleepers -= 1;
                if self.is_terminated() {
                    return SpinOutcome::Terminated;
                }
                if self.is_cancelled() {
                    return SpinOutcome::Cancelled;
                }
                if monitor.spin_master.is_some() {
                    return SpinOutcome::Relinquished;
                }
                monitor.spin_master = Some(me);
            }

            if self.is_terminated() {
                return SpinOutcome::Terminated;
            }
            if self.is_cancelled() || forced(check) {
                self.cancel();
                return SpinOutcome::Cancelled;
            }

            let tasks = self.queue_set.tasks();
            let exit = tasks > 0 || should_exit(check);
            let all_offered = self.offered.load(Ordering::Acquire) == self.workers();
            if !exit && !all_offered {
                continue;
            }

            let mut monitor = self.monitor.lock();
            if self.is_terminated() {
                return SpinOutcome::Terminated;
            }
            if self.offered.load(Ordering::Acquire) == self.workers()
                && self.queue_set.tasks() == 0
            {
                self.terminate(&mut monitor);
                return SpinOutcome::Terminated;
            }
            if exit {
                monitor.spin_master = None;
                self.wake_for_tasks(&monitor, tasks);
                return SpinOutcome::FoundWork;
            }
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for Terminator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminator")
            .field("workers", &self.workers.load(Ordering::Relaxed))
            .field("offered", &self.offered.load(Ordering::Relaxed))
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn forced(check: Option<&dyn TerminationCheck>) -> bool {
    check.is_some_and(|c| c.should_force_termination())
}

fn should_exit(check: Option<&dyn TerminationCheck>) -> bool {
    check.is_some_and(|c| c.should_exit_termination())
}
