//! Tracing support for queue distribution and termination.
//!
//! When the `tracing` feature is enabled, this module emits structured spans
//! and events for the parallel mark phase. Without the feature only the
//! [`PhaseId`] counter remains.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one parallel phase.
///
/// Used to correlate all events emitted while one terminator is live. It is a
/// monotonically increasing counter starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseId(pub u64);

static NEXT_PHASE_ID: AtomicU64 = AtomicU64::new(1);

/// Generate the next unique phase ID.
pub fn next_phase_id() -> PhaseId {
    PhaseId(NEXT_PHASE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Create a span for one mark worker.
#[cfg(feature = "tracing")]
pub fn span_mark_worker(worker: usize, phase: PhaseId) -> ::tracing::Span {
    ::tracing::debug_span!("mark_worker", worker, phase = phase.0)
}

/// Log a worker taking the spin-master role.
#[cfg(feature = "tracing")]
pub fn log_spin_master_acquired(phase: PhaseId) {
    ::tracing::trace!(phase = phase.0, "spin_master_acquired");
}

/// Log the spin-master giving up its role before sleeping.
#[cfg(feature = "tracing")]
pub fn log_spin_master_handoff(phase: PhaseId, successor_woken: bool) {
    ::tracing::trace!(phase = phase.0, successor_woken, "spin_master_handoff");
}

/// Log a worker leaving the terminator to resume work.
#[cfg(feature = "tracing")]
pub fn log_exit_termination(phase: PhaseId, tasks: usize) {
    ::tracing::trace!(phase = phase.0, tasks, "exit_termination");
}

/// Log detected quiescence.
#[cfg(feature = "tracing")]
pub fn log_termination(phase: PhaseId, workers: usize) {
    ::tracing::debug!(phase = phase.0, workers, "termination");
}

/// Log a forced termination.
#[cfg(feature = "tracing")]
pub fn log_cancelled(phase: PhaseId, offered: usize) {
    ::tracing::debug!(phase = phase.0, offered, "termination_cancelled");
}

/// Log a task demoted to the shared overflow stack.
#[cfg(feature = "tracing")]
pub fn log_overflow_spill(queue: usize, overflow_len: usize) {
    ::tracing::trace!(queue, overflow_len, "overflow_spill");
}

/// Log the totals of one mark worker.
#[cfg(feature = "tracing")]
pub fn log_worker_done(processed: usize, stolen: usize, cancelled: bool) {
    ::tracing::debug!(processed, stolen, cancelled, "mark_worker_done");
}

#[cfg(test)]
mod tests {
    use super::next_phase_id;

    #[test]
    fn test_phase_ids_increase() {
        let a = next_phase_id();
        let b = next_phase_id();
        assert!(b.0 > a.0);
    }
}
