//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::telemetry::{self, GcId, GcPhase};

/// Statistics from the most recent full compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullGcMetrics {
    /// Identifier of the collection.
    pub gc_id: GcId,
    /// Wall time of the whole pause.
    pub duration: Duration,
    /// Phase 1: marking.
    pub mark_duration: Duration,
    /// Phase 2: computing forwarding addresses.
    pub calculate_new_addresses_duration: Duration,
    /// Phase 3: updating references.
    pub adjust_pointers_duration: Duration,
    /// Phase 4: moving objects.
    pub compact_duration: Duration,
    /// Whether soft references were cleared.
    pub cleared_soft_refs: bool,
    /// Objects that survived.
    pub live_objects: usize,
    /// Bytes that survived.
    pub live_bytes: usize,
    /// Surviving objects that changed address.
    pub moved_objects: usize,
    /// Regions returned to the free list (including humongous).
    pub regions_freed: usize,
    /// Humongous objects reclaimed.
    pub humongous_objects_freed: usize,
    /// Used bytes before the collection.
    pub used_before: usize,
    /// Used bytes after the collection.
    pub used_after: usize,
    /// Committed bytes after any shrinking.
    pub committed_after: usize,
}

/// How a concurrent marking cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Marking, remark and cleanup all ran.
    Completed,
    /// The cycle was aborted; nothing was reclaimed.
    Aborted,
}

/// Statistics from the most recent concurrent marking cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkMetrics {
    /// Identifier of the cycle.
    pub gc_id: GcId,
    /// How the cycle ended.
    pub outcome: MarkOutcome,
    /// Initial-mark pause.
    pub initial_mark_duration: Duration,
    /// Concurrent phase, mutators running.
    pub concurrent_duration: Duration,
    /// Remark pause.
    pub remark_duration: Duration,
    /// Cleanup pause.
    pub cleanup_duration: Duration,
    /// Objects marked by this cycle.
    pub marked_objects: usize,
    /// Live bytes below TAMS, summed over regions.
    pub live_bytes: usize,
    /// Regions reclaimed at cleanup.
    pub regions_reclaimed: usize,
    /// Times marking restarted after mark-stack overflow.
    pub overflow_restarts: usize,
    /// Values recorded by the SATB barrier.
    pub satb_entries: usize,
    /// Successful steals across all workers.
    pub steals: usize,
}

/// Times consecutive phases.
///
/// ```
/// use region_gc::metrics::PhaseTimer;
/// use region_gc::GcPhase;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... phase work ...
/// let elapsed = timer.end(GcPhase::Mark);
/// assert!(elapsed >= std::time::Duration::ZERO);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// A timer with no phase running.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the current phase, log it, and return its duration.
    pub fn end(&mut self, phase: GcPhase) -> Duration {
        let elapsed = self
            .current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed());
        telemetry::log_phase_end(phase, elapsed.as_micros());
        elapsed
    }
}

/// Cumulative counters for one engine.
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    full_collections: AtomicUsize,
    marking_cycles: AtomicUsize,
    aborted_cycles: AtomicUsize,
    regions_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
}

impl GlobalMetrics {
    /// All counters zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_full_gc(&self, metrics: &FullGcMetrics) {
        self.full_collections.fetch_add(1, Ordering::Relaxed);
        self.regions_reclaimed
            .fetch_add(metrics.regions_freed, Ordering::Relaxed);
        self.add_pause(metrics.duration);
    }

    pub(crate) fn record_mark_cycle(&self, metrics: &MarkMetrics) {
        self.marking_cycles.fetch_add(1, Ordering::Relaxed);
        if metrics.outcome == MarkOutcome::Aborted {
            self.aborted_cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.regions_reclaimed
            .fetch_add(metrics.regions_reclaimed, Ordering::Relaxed);
        self.add_pause(
            metrics.initial_mark_duration + metrics.remark_duration + metrics.cleanup_duration,
        );
    }

    fn add_pause(&self, pause: Duration) {
        let ns = u64::try_from(pause.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Full compactions run.
    #[must_use]
    pub fn full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Concurrent marking cycles finished (completed or aborted).
    #[must_use]
    pub fn marking_cycles(&self) -> usize {
        self.marking_cycles.load(Ordering::Relaxed)
    }

    /// Concurrent marking cycles that were aborted.
    #[must_use]
    pub fn aborted_cycles(&self) -> usize {
        self.aborted_cycles.load(Ordering::Relaxed)
    }

    /// Regions reclaimed by all collections.
    #[must_use]
    pub fn regions_reclaimed(&self) -> usize {
        self.regions_reclaimed.load(Ordering::Relaxed)
    }

    /// Total time spent in pauses.
    #[must_use]
    pub fn total_pause_time(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }
}
