//! Task queues and termination detection for parallel GC marking.
//!
//! `rudo-taskqueue` distributes marking work across a fixed pool of worker
//! threads. Each worker owns a bounded work-stealing queue fronted by a
//! one-slot write buffer; idle workers steal from their peers, and a
//! [`Terminator`] decides when every worker is idle and no work is left.
//!
//! # Components
//!
//! - [`ChunkedTask`]: a word-sized mark task, either a plain object reference
//!   or a reference plus a power-of-two chunk of an object array
//! - [`BufferedQueue`] / [`QueueOwner`]: per-worker queue with a write buffer
//!   that only the owner sees
//! - [`ClaimableQueueSet`]: the per-worker queues of a phase, with
//!   whole-queue claiming and peer stealing
//! - [`Terminator`]: termination detection with a rotating spin-master
//! - [`MarkWorker`]: the pop/steal/offer loop tying the above together
//!
//! # Quick Start
//!
//! ```
//! use rudo_taskqueue::{init_parallel_marking, MarkWorker, QueueSetConfig, TerminatorConfig};
//!
//! let config = QueueSetConfig::new(2).with_queue_capacity(64);
//! let (_set, terminator) = init_parallel_marking(&config, TerminatorConfig::default());
//!
//! std::thread::scope(|s| {
//!     for id in 0..2 {
//!         let terminator = &terminator;
//!         s.spawn(move || {
//!             let mut worker = MarkWorker::new(terminator, id).unwrap();
//!             worker.run(|_task, _owner| {});
//!         });
//!     }
//! });
//! assert!(terminator.is_terminated());
//! ```
//!
//! # Feature Flags
//!
//! - `tracing`: emit spans and events for spin-master hand-offs, termination
//!   and overflow spills
//! - `plain-task`: use the three-field task layout even on 64-bit targets

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod buffered;
mod config;
mod marker;
mod queue_set;
mod stats;
mod task;
mod terminator;
mod worklist;

/// Phase identifiers and, with the `tracing` feature, trace events.
pub mod tracing;

pub use buffered::{BufferedQueue, QueueOwner};
pub use config::{available_parallelism, QueueSetConfig, TerminatorConfig};
pub use marker::{init_parallel_marking, MarkWorker, WorkerOutcome};
pub use queue_set::{ClaimableQueueSet, MarkQueueSet, StealSeed, TaskQueueSet};
pub use stats::{QueueStats, QueueStatsSnapshot};
pub use task::{
    ChunkedTask, CHUNK_BITS, CHUNK_LIMIT, EXPONENT_BITS, EXPONENT_LIMIT, MAX_CHUNKED_LEN,
    REFERENCE_BITS,
};
pub use terminator::{CancelledTerminator, TerminationCheck, Terminator};
pub use worklist::{OverflowStack, StealQueue, TASKQUEUE_SIZE};
