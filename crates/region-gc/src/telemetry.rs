//! GC tracing support.
//!
//! When the `tracing` feature is enabled, collections emit structured
//! spans and events through the `tracing` crate. Without it every hook is
//! an empty inline function.

use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier for a collection or marking cycle.
///
/// Monotonically increasing from 1 across all engines in the process; used
/// to correlate every event of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

/// Generate the next unique GC ID.
pub fn next_gc_id() -> GcId {
    GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
}

/// Phases of the two collection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcPhase {
    /// Concurrent cycle: root marking at a pause.
    InitialMark,
    /// Concurrent cycle: parallel marking alongside mutators.
    ConcurrentMark,
    /// Concurrent cycle: final marking at a pause.
    Remark,
    /// Concurrent cycle: liveness publication and region reclamation.
    Cleanup,
    /// Full compaction phase 1.
    Mark,
    /// Full compaction phase 2.
    CalculateNewAddresses,
    /// Full compaction phase 3.
    AdjustPointers,
    /// Full compaction phase 4.
    Compact,
}

#[cfg(feature = "tracing")]
mod internal {
    use super::{GcId, GcPhase};
    use crate::oop::Address;
    use tracing::{span, Level};

    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    pub fn log_phase_end(phase: GcPhase, micros: u128) {
        tracing::debug!(phase = ?phase, micros, "phase_end");
    }

    pub fn log_region_commit(index: usize, zero_filled: bool) {
        tracing::trace!(index, zero_filled, "region_commit");
    }

    pub fn log_heap_resize(committed_before: usize, committed_after: usize) {
        tracing::debug!(committed_before, committed_after, "heap_resize");
    }

    pub fn log_overflow_restart(restarts: usize, new_limit: usize) {
        tracing::debug!(restarts, new_limit, "mark_overflow_restart");
    }

    pub fn log_mark_abort(gc_id: GcId) {
        tracing::debug!(gc_id = gc_id.0, "mark_abort");
    }

    pub fn log_cleanup(regions_reclaimed: usize, live_bytes: usize) {
        tracing::debug!(regions_reclaimed, live_bytes, "cleanup");
    }

    pub fn log_compaction_summary(live_objects: usize, moved_objects: usize, regions_freed: usize) {
        tracing::debug!(live_objects, moved_objects, regions_freed, "compaction_summary");
    }

    pub fn log_allocation_failure(requested_bytes: usize, attempt: u32) {
        tracing::debug!(requested_bytes, attempt, "allocation_failure");
    }

    pub fn log_marking_verified(reachable: usize) {
        tracing::debug!(reachable, "marking_verified");
    }

    pub fn log_weak_root_cleared(referent: Address) {
        tracing::trace!(referent = %referent, "weak_root_cleared");
    }

    pub fn log_mark_thread_panic(message: &str) {
        tracing::error!(message, "mark_thread_panic");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
mod internal {
    use super::{GcId, GcPhase};
    use crate::oop::Address;

    #[inline]
    pub fn trace_gc_collection(_collection_type: &str, _gc_id: GcId) {}

    #[inline]
    pub fn trace_phase(_phase: GcPhase) {}

    #[inline]
    pub fn log_phase_end(_phase: GcPhase, _micros: u128) {}

    #[inline]
    pub fn log_region_commit(_index: usize, _zero_filled: bool) {}

    #[inline]
    pub fn log_heap_resize(_committed_before: usize, _committed_after: usize) {}

    #[inline]
    pub fn log_overflow_restart(_restarts: usize, _new_limit: usize) {}

    #[inline]
    pub fn log_mark_abort(_gc_id: GcId) {}

    #[inline]
    pub fn log_cleanup(_regions_reclaimed: usize, _live_bytes: usize) {}

    #[inline]
    pub fn log_compaction_summary(_live_objects: usize, _moved_objects: usize, _regions_freed: usize) {}

    #[inline]
    pub fn log_allocation_failure(_requested_bytes: usize, _attempt: u32) {}

    #[inline]
    pub fn log_marking_verified(_reachable: usize) {}

    #[inline]
    pub fn log_weak_root_cleared(_referent: Address) {}

    #[inline]
    pub fn log_mark_thread_panic(_message: &str) {}
}

pub(crate) use internal::*;
