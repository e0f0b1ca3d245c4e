//! Configuration for queue sets and the termination protocol.

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::worklist::TASKQUEUE_SIZE;

/// Get the number of CPUs available for parallel marking.
#[must_use]
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Shape of a queue set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSetConfig {
    /// Number of worker queues. At least 1.
    pub workers: usize,
    /// Capacity of each bounded queue. Must be a power of 2.
    pub queue_capacity: usize,
    /// Leading queues excluded from claiming.
    pub reserved: usize,
}

impl Default for QueueSetConfig {
    fn default() -> Self {
        Self {
            workers: available_parallelism(),
            queue_capacity: TASKQUEUE_SIZE,
            reserved: 0,
        }
    }
}

impl QueueSetConfig {
    /// Create a configuration with the given worker count.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..Default::default()
        }
    }

    /// Set the number of worker queues.
    pub const fn set_workers(&mut self, workers: usize) {
        self.workers = if workers < 1 { 1 } else { workers };
    }

    /// Set the bounded queue capacity, rounded up to a power of 2.
    pub const fn set_queue_capacity(&mut self, capacity: usize) {
        self.queue_capacity = capacity.next_power_of_two();
    }

    /// Set how many leading queues are excluded from claiming.
    pub const fn set_reserved(&mut self, reserved: usize) {
        self.reserved = reserved;
    }

    /// Builder-style [`set_queue_capacity`](Self::set_queue_capacity).
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.set_queue_capacity(capacity);
        self
    }

    /// Builder-style [`set_reserved`](Self::set_reserved).
    #[must_use]
    pub const fn with_reserved(mut self, reserved: usize) -> Self {
        self.set_reserved(reserved);
        self
    }
}

/// Back-off schedule of the spin-master.
///
/// The spin-master starts with short bursts of hard spins that double up to
/// `hard_spins`, yields the CPU after every `spin_to_yield_ratio` bursts, and
/// after `yields_before_sleep` rounds hands its role to another idle worker
/// and waits for `sleep`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminatorConfig {
    /// Upper bound on spin-loop iterations per burst.
    pub hard_spins: u32,
    /// Spin bursts between yields. Zero yields after every burst.
    pub spin_to_yield_ratio: u32,
    /// Spin/yield rounds before the spin-master sleeps.
    pub yields_before_sleep: u32,
    /// Polling interval for blocked workers and for a sleeping spin-master.
    pub sleep: Duration,
}

impl Default for TerminatorConfig {
    fn default() -> Self {
        Self {
            hard_spins: 4096,
            spin_to_yield_ratio: 10,
            yields_before_sleep: 5000,
            sleep: Duration::from_millis(1),
        }
    }
}

impl TerminatorConfig {
    /// Set the polling interval.
    pub const fn set_sleep(&mut self, sleep: Duration) {
        self.sleep = sleep;
    }

    /// Set the number of spin/yield rounds before sleeping.
    pub const fn set_yields_before_sleep(&mut self, yields: u32) {
        self.yields_before_sleep = yields;
    }

    /// Builder-style [`set_sleep`](Self::set_sleep).
    #[must_use]
    pub const fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// Builder-style [`set_yields_before_sleep`](Self::set_yields_before_sleep).
    #[must_use]
    pub const fn with_yields_before_sleep(mut self, yields: u32) -> Self {
        self.yields_before_sleep = yields;
        self
    }

    /// Spin-loop iterations of the first burst after a yield.
    #[must_use]
    pub const fn initial_hard_spins(&self) -> u32 {
        if self.spin_to_yield_ratio == 0 {
            return self.hard_spins;
        }
        match self.hard_spins.checked_shr(self.spin_to_yield_ratio) {
            Some(limit) if limit > 0 => limit,
            _ => 1,
        }
    }
}
