//! The collector engine: heap, concurrent marking, full compaction and the
//! mutator interface.
//!
//! An engine owns one reserved heap. Mutator threads allocate and access
//! objects through it; a background mark thread runs concurrent cycles on
//! request; allocation failure triggers a full compaction.
//!
//! # Address stability
//!
//! Full compaction moves objects. An [`Address`] returned by
//! [`GcEngine::allocate`] or read from a field stays valid only until the
//! next call that may compact (any allocation, or
//! [`GcEngine::invoke_full_compaction`]). Keep long-lived references in
//! root slots, which the collector updates.

use std::any::Any;
use std::collections::HashSet;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::GcConfig;
use crate::error::GcError;
use crate::gc::compact::{shrink_to_free_ratio, CompactAll, CompactionPolicy, MarkSweepCompactor};
use crate::gc::marker::ConcurrentMark;
use crate::gc::safepoint::Safepoint;
use crate::gc::TaskStats;
use crate::heap::{Heap, HeapRegion};
use crate::metrics::{FullGcMetrics, GlobalMetrics, MarkMetrics, MarkOutcome};
use crate::oop::{Address, ObjectShape, WORD_SIZE};
use crate::roots::{RootEnumerator, RootParity, RootSet, SoftRefPolicy};
use crate::telemetry::{self, next_gc_id};
use crate::verify;

/// Allocation attempts: plain, after a full compaction, after one that also
/// clears soft references.
const ALLOCATION_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct CycleState {
    in_progress: bool,
    full_gc_pending: bool,
    handle: Option<JoinHandle<()>>,
}

struct Shared<R> {
    config: GcConfig,
    heap: Heap,
    cm: ConcurrentMark,
    roots: R,
    parity: RootParity,
    safepoint: Safepoint,
    full_gc_lock: Mutex<()>,
    cycle: Mutex<CycleState>,
    cycle_done: Condvar,
    policy: RwLock<Arc<dyn CompactionPolicy>>,
    last_full_gc: Mutex<Option<FullGcMetrics>>,
    last_mark: Mutex<Option<MarkMetrics>>,
    has_completed_cycle: AtomicBool,
    metrics: GlobalMetrics,
}

/// A region-based garbage collector instance.
///
/// `R` supplies the roots; the default [`RootSet`] is a handle-based
/// registry owned by the engine.
///
/// # Examples
///
/// ```
/// use region_gc::{GcConfig, GcEngine, ObjectShape, RootKind};
///
/// let config = GcConfig::default()
///     .with_region_bytes(64 * 1024)
///     .with_heap_bytes(256 * 1024, 1024 * 1024);
/// let engine = GcEngine::create(config).unwrap();
///
/// let node = engine
///     .allocate(ObjectShape::Instance { refs: 1, prims: 1 })
///     .unwrap();
/// let root = engine.roots().add(RootKind::ThreadStack, Some(node));
/// engine.write_prim(node, 0, 42);
///
/// assert!(engine.invoke_full_compaction(false));
/// let node = engine.roots().get(root).unwrap();
/// assert_eq!(engine.read_prim(node, 0), 42);
/// ```
pub struct GcEngine<R: RootEnumerator + 'static = RootSet> {
    shared: Arc<Shared<R>>,
}

impl GcEngine<RootSet> {
    /// Create an engine with an empty [`RootSet`].
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the heap cannot be reserved.
    pub fn create(config: GcConfig) -> Result<Self, GcError> {
        Self::with_roots(config, RootSet::new())
    }
}

impl<R: RootEnumerator + 'static> GcEngine<R> {
    /// Create an engine that takes its roots from `roots`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the heap cannot be reserved.
    pub fn with_roots(config: GcConfig, roots: R) -> Result<Self, GcError> {
        config.validate()?;
        let heap = Heap::new(&config)?;
        let cm = ConcurrentMark::new(&config, &heap);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                heap,
                cm,
                roots,
                parity: RootParity::new(),
                safepoint: Safepoint::new(),
                full_gc_lock: Mutex::new(()),
                cycle: Mutex::new(CycleState::default()),
                cycle_done: Condvar::new(),
                policy: RwLock::new(Arc::new(CompactAll)),
                last_full_gc: Mutex::new(None),
                last_mark: Mutex::new(None),
                has_completed_cycle: AtomicBool::new(false),
                metrics: GlobalMetrics::new(),
            }),
        })
    }

    /// Abort any marking cycle and release the heap.
    pub fn destroy(self) {
        drop(self);
    }

    /// The configuration the engine was created with.
    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    /// The root source.
    #[must_use]
    pub fn roots(&self) -> &R {
        &self.shared.roots
    }

    /// The heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.shared.heap
    }

    /// The concurrent marking state.
    #[must_use]
    pub fn concurrent_mark(&self) -> &ConcurrentMark {
        &self.shared.cm
    }

    /// Replace the region selection of later full compactions.
    pub fn set_compaction_policy(&self, policy: impl CompactionPolicy + 'static) {
        *self.shared.policy.write() = Arc::new(policy);
    }

    // ------------------------------------------------------------------
    // mutator interface
    // ------------------------------------------------------------------

    /// Allocate a zeroed object of `shape`.
    ///
    /// On failure runs a full compaction and retries, then once more with
    /// soft references cleared.
    ///
    /// # Errors
    ///
    /// [`GcError::ObjectTooLarge`] if the object can never fit, and
    /// [`GcError::OutOfMemory`] if no space is left after both compactions.
    pub fn allocate(&self, shape: ObjectShape) -> Result<Address, GcError> {
        let requested_bytes = shape.size_words().saturating_mul(WORD_SIZE);
        if !shape.is_encodable() || requested_bytes > self.heap().regions().max_capacity_bytes() {
            return Err(GcError::ObjectTooLarge { requested_bytes });
        }
        for attempt in 0..ALLOCATION_ATTEMPTS {
            {
                let _mutator = self.shared.safepoint.mutator();
                if let Some(addr) = self.heap().allocate(shape) {
                    return Ok(addr);
                }
            }
            telemetry::log_allocation_failure(requested_bytes, attempt);
            if attempt + 1 < ALLOCATION_ATTEMPTS {
                self.invoke_full_compaction(attempt > 0);
            }
        }
        Err(GcError::OutOfMemory { requested_bytes })
    }

    /// Read reference field `index` of `obj`.
    #[must_use]
    pub fn read_ref(&self, obj: Address, index: usize) -> Option<Address> {
        let _mutator = self.shared.safepoint.mutator();
        self.heap().obj(obj).ref_slot(index).load_ref()
    }

    /// Store `value` into reference field `index` of `obj`.
    ///
    /// While marking is active the overwritten value is recorded so the
    /// snapshot taken at initial mark stays complete.
    pub fn write_ref(&self, obj: Address, index: usize, value: Option<Address>) {
        let _mutator = self.shared.safepoint.mutator();
        let slot = self.heap().obj(obj).ref_slot(index);
        let satb = self.shared.cm.satb();
        if satb.is_active() {
            if let Some(old) = slot.load_ref() {
                satb.enqueue(old);
            }
        }
        slot.store_ref(value);
    }

    /// Read primitive word `index` of `obj`.
    #[must_use]
    pub fn read_prim(&self, obj: Address, index: usize) -> usize {
        let _mutator = self.shared.safepoint.mutator();
        self.heap().obj(obj).prim_slot(index).load()
    }

    /// Store `value` into primitive word `index` of `obj`.
    pub fn write_prim(&self, obj: Address, index: usize, value: usize) {
        let _mutator = self.shared.safepoint.mutator();
        self.heap().obj(obj).prim_slot(index).store(value);
    }

    /// Length of the array at `obj`.
    #[must_use]
    pub fn array_length(&self, obj: Address) -> usize {
        let _mutator = self.shared.safepoint.mutator();
        self.heap().obj(obj).array_length()
    }

    /// Shape of the object at `obj`.
    #[must_use]
    pub fn shape_of(&self, obj: Address) -> ObjectShape {
        let _mutator = self.shared.safepoint.mutator();
        self.heap().obj(obj).shape()
    }

    // ------------------------------------------------------------------
    // cycle control
    // ------------------------------------------------------------------

    /// Start a concurrent marking cycle on a background thread.
    ///
    /// Returns `Ok(false)` if a cycle is already running or a full
    /// compaction is under way.
    ///
    /// # Errors
    ///
    /// [`GcError::ThreadSpawn`] if the mark thread cannot be started.
    ///
    /// # Panics
    ///
    /// Resumes the panic of a previous cycle's mark thread that nobody has
    /// waited for yet.
    pub fn start_marking_cycle(&self) -> Result<bool, GcError> {
        let mut cycle = self.shared.cycle.lock();
        if cycle.in_progress || cycle.full_gc_pending {
            return Ok(false);
        }
        if let Some(finished) = cycle.handle.take() {
            join_mark_thread(finished);
        }
        cycle.in_progress = true;
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("region-gc-mark".to_owned())
            .spawn(move || {
                let _done = CycleDone(&shared);
                shared.run_marking_cycle();
            });
        match spawned {
            Ok(handle) => {
                cycle.handle = Some(handle);
                Ok(true)
            }
            Err(err) => {
                cycle.in_progress = false;
                Err(GcError::ThreadSpawn(err))
            }
        }
    }

    /// Whether no marking cycle is running.
    #[must_use]
    pub fn is_cycle_complete(&self) -> bool {
        !self.shared.cycle.lock().in_progress
    }

    /// Block until the running marking cycle, if any, has finished.
    ///
    /// # Panics
    ///
    /// If the mark thread panicked, the panic is resumed on the caller.
    pub fn wait_for_marking(&self) {
        self.shared.wait_for_marking();
    }

    /// Ask the running marking cycle to stop and wait for it.
    pub fn abort_marking(&self) {
        self.shared.abort_marking();
    }

    /// Run a full compaction, aborting any marking cycle first.
    ///
    /// Returns `false` if the heap could not be resized afterwards.
    pub fn invoke_full_compaction(&self, clear_all_soft_refs: bool) -> bool {
        self.shared.full_compaction(clear_all_soft_refs)
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// The committed region containing `addr`.
    #[must_use]
    pub fn region_containing(&self, addr: Address) -> Option<&HeapRegion> {
        self.heap().regions().region_containing(addr)
    }

    /// Committed regions on the free list.
    #[must_use]
    pub fn num_free_regions(&self) -> usize {
        self.heap().regions().num_free_regions()
    }

    /// Committed capacity in bytes.
    #[must_use]
    pub fn total_capacity_bytes(&self) -> usize {
        self.heap().regions().total_capacity_bytes()
    }

    /// Live bytes of region `index` as of the last completed marking, plus
    /// everything allocated there since.
    #[must_use]
    pub fn region_live_bytes(&self, index: usize) -> Option<usize> {
        self.heap().regions().at(index).map(HeapRegion::live_bytes)
    }

    /// Whether the card containing `addr` held live data at the last
    /// completed marking.
    #[must_use]
    pub fn is_card_live(&self, addr: Address) -> bool {
        self.shared.cm.liveness().is_card_live(addr)
    }

    /// Whether the last completed marking found `obj` live.
    #[must_use]
    pub fn is_marked_in_last_cycle(&self, obj: Address) -> bool {
        self.shared.has_completed_cycle.load(Ordering::Acquire)
            && self.shared.cm.prev_bitmap().is_marked(obj)
    }

    /// Whether `obj` is known dead: it predates the last completed marking
    /// and was not marked by it.
    #[must_use]
    pub fn is_obj_dead(&self, obj: Address) -> bool {
        let Some(region) = self.region_containing(obj) else {
            return false;
        };
        !region.obj_allocated_since_prev_marking(obj) && !self.shared.cm.prev_bitmap().is_marked(obj)
    }

    /// Objects reachable from the strong roots, found by a serial trace at
    /// a pause.
    #[must_use]
    pub fn reachable_objects(&self) -> HashSet<Address> {
        let _pause = self.shared.safepoint.begin();
        verify::reference_trace(
            self.heap(),
            self.roots(),
            &self.shared.parity,
            SoftRefPolicy::KeepAlive,
        )
    }

    // ------------------------------------------------------------------
    // metrics
    // ------------------------------------------------------------------

    /// Statistics of the most recent full compaction.
    #[must_use]
    pub fn last_full_gc_metrics(&self) -> Option<FullGcMetrics> {
        *self.shared.last_full_gc.lock()
    }

    /// Statistics of the most recent marking cycle.
    #[must_use]
    pub fn last_mark_metrics(&self) -> Option<MarkMetrics> {
        *self.shared.last_mark.lock()
    }

    /// Counters over the engine's lifetime.
    #[must_use]
    pub fn global_metrics(&self) -> &GlobalMetrics {
        &self.shared.metrics
    }

    /// Number of pauses taken so far.
    #[must_use]
    pub fn pause_count(&self) -> u64 {
        self.shared.safepoint.pause_count()
    }
}

impl<R: RootEnumerator + 'static> Drop for GcEngine<R> {
    fn drop(&mut self) {
        if self.shared.cycle.lock().in_progress {
            self.shared.cm.abort();
        }
        let finished = {
            let mut cycle = self.shared.cycle.lock();
            while cycle.in_progress {
                self.shared.cycle_done.wait(&mut cycle);
            }
            cycle.handle.take()
        };
        if let Some(Err(payload)) = finished.map(JoinHandle::join) {
            telemetry::log_mark_thread_panic(panic_message(&*payload));
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Join a finished mark thread, resuming its panic on the caller.
fn join_mark_thread(handle: JoinHandle<()>) {
    if let Err(payload) = handle.join() {
        telemetry::log_mark_thread_panic(panic_message(&*payload));
        panic::resume_unwind(payload);
    }
}

impl<R: RootEnumerator + 'static> std::fmt::Debug for GcEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcEngine")
            .field("heap", &self.shared.heap)
            .field("cm", &self.shared.cm)
            .finish_non_exhaustive()
    }
}

/// Marks the cycle finished when the mark thread exits, even by panic.
struct CycleDone<'a, R>(&'a Shared<R>);

impl<R> Drop for CycleDone<'_, R> {
    fn drop(&mut self) {
        self.0.cycle.lock().in_progress = false;
        self.0.cycle_done.notify_all();
    }
}

/// Keeps new marking cycles from starting until a full compaction ends.
struct FullGcPending<'a, R>(&'a Shared<R>);

impl<'a, R> FullGcPending<'a, R> {
    fn enter(shared: &'a Shared<R>) -> Self {
        shared.cycle.lock().full_gc_pending = true;
        Self(shared)
    }
}

impl<R> Drop for FullGcPending<'_, R> {
    fn drop(&mut self) {
        self.0.cycle.lock().full_gc_pending = false;
    }
}

impl<R: RootEnumerator> Shared<R> {
    fn wait_for_marking(&self) {
        let finished = {
            let mut cycle = self.cycle.lock();
            while cycle.in_progress {
                self.cycle_done.wait(&mut cycle);
            }
            cycle.handle.take()
        };
        if let Some(handle) = finished {
            join_mark_thread(handle);
        }
    }

    fn abort_marking(&self) {
        if self.cycle.lock().in_progress {
            self.cm.abort();
        }
        self.wait_for_marking();
    }

    fn run_marking_cycle(&self) {
        let gc_id = next_gc_id();
        #[allow(clippy::let_unit_value)]
        let _span = telemetry::trace_gc_collection("concurrent_mark", gc_id);
        let satb_before = self.cm.satb().total_enqueued();

        let start = Instant::now();
        {
            let _pause = self.safepoint.begin();
            #[allow(clippy::let_unit_value)]
            let _phase = telemetry::trace_phase(telemetry::GcPhase::InitialMark);
            self.cm
                .checkpoint_roots_initial(&self.heap, &self.roots, &self.parity);
        }
        let initial_mark_duration = start.elapsed();
        telemetry::log_phase_end(
            telemetry::GcPhase::InitialMark,
            initial_mark_duration.as_micros(),
        );

        let start = Instant::now();
        let mut completed = {
            #[allow(clippy::let_unit_value)]
            let _phase = telemetry::trace_phase(telemetry::GcPhase::ConcurrentMark);
            self.cm.mark_from_roots(&self.heap)
        };
        let concurrent_duration = start.elapsed();
        telemetry::log_phase_end(
            telemetry::GcPhase::ConcurrentMark,
            concurrent_duration.as_micros(),
        );

        let start = Instant::now();
        if completed {
            let _pause = self.safepoint.begin();
            #[allow(clippy::let_unit_value)]
            let _phase = telemetry::trace_phase(telemetry::GcPhase::Remark);
            completed = self.cm.checkpoint_roots_final(
                &self.heap,
                &self.roots,
                &self.parity,
                self.config.verify_marking,
            );
        }
        let remark_duration = start.elapsed();

        let start = Instant::now();
        let mut metrics = MarkMetrics {
            gc_id,
            outcome: MarkOutcome::Completed,
            initial_mark_duration,
            concurrent_duration,
            remark_duration,
            cleanup_duration: std::time::Duration::ZERO,
            marked_objects: 0,
            live_bytes: 0,
            regions_reclaimed: 0,
            overflow_restarts: self.cm.restarts(),
            satb_entries: 0,
            steals: 0,
        };
        let stats: TaskStats = if completed {
            let summary = {
                let _pause = self.safepoint.begin();
                #[allow(clippy::let_unit_value)]
                let _phase = telemetry::trace_phase(telemetry::GcPhase::Cleanup);
                self.cm.cleanup(&self.heap)
            };
            self.has_completed_cycle.store(true, Ordering::Release);
            metrics.live_bytes = summary.live_bytes;
            metrics.regions_reclaimed = summary.regions_reclaimed;
            summary.stats
        } else {
            telemetry::log_mark_abort(gc_id);
            metrics.outcome = MarkOutcome::Aborted;
            let _pause = self.safepoint.begin();
            self.cm.abandon(&self.heap)
        };
        self.cm.clear_next_bitmap();
        metrics.cleanup_duration = start.elapsed();
        telemetry::log_phase_end(telemetry::GcPhase::Cleanup, metrics.cleanup_duration.as_micros());

        metrics.marked_objects = stats.marked_objects;
        metrics.steals = stats.steals;
        metrics.satb_entries = self.cm.satb().total_enqueued() - satb_before;
        self.metrics.record_mark_cycle(&metrics);
        *self.last_mark.lock() = Some(metrics);
    }

    fn full_compaction(&self, clear_all_soft_refs: bool) -> bool {
        let _full = self.full_gc_lock.lock();
        let _pending = FullGcPending::enter(self);
        self.abort_marking();

        let gc_id = next_gc_id();
        #[allow(clippy::let_unit_value)]
        let _span = telemetry::trace_gc_collection("full_compaction", gc_id);
        let start = Instant::now();
        let _pause = self.safepoint.begin();

        let used_before = self.heap.used_bytes();
        let soft = if clear_all_soft_refs {
            SoftRefPolicy::ClearAll
        } else {
            SoftRefPolicy::KeepAlive
        };
        let policy: Arc<dyn CompactionPolicy> = Arc::clone(&*self.policy.read());
        let summary = MarkSweepCompactor::new(
            &self.heap,
            &self.roots,
            &self.parity,
            self.cm.next_bitmap(),
            &*policy,
            soft,
        )
        .collect();
        self.cm.reset_after_full_gc();
        self.has_completed_cycle.store(false, Ordering::Release);

        let resized = shrink_to_free_ratio(
            &self.heap,
            usize::from(self.config.max_free_ratio),
            self.config.initial_regions(),
        );

        let [mark, calculate, adjust, compact] = summary.phase_durations;
        let metrics = FullGcMetrics {
            gc_id,
            duration: start.elapsed(),
            mark_duration: mark,
            calculate_new_addresses_duration: calculate,
            adjust_pointers_duration: adjust,
            compact_duration: compact,
            cleared_soft_refs: clear_all_soft_refs,
            live_objects: summary.live_objects,
            live_bytes: summary.live_bytes,
            moved_objects: summary.moved_objects,
            regions_freed: summary.regions_freed,
            humongous_objects_freed: summary.humongous_freed,
            used_before,
            used_after: self.heap.used_bytes(),
            committed_after: self.heap.regions().total_capacity_bytes(),
        };
        self.metrics.record_full_gc(&metrics);
        *self.last_full_gc.lock() = Some(metrics);
        resized.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roots::RootKind;

    fn small_config() -> GcConfig {
        GcConfig::default()
            .with_region_bytes(64 * 1024)
            .with_heap_bytes(256 * 1024, 1024 * 1024)
            .with_parallel_workers(2)
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let config = small_config().with_region_bytes(3000);
        assert!(matches!(
            GcEngine::create(config),
            Err(GcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_allocate_and_access_fields() {
        let engine = GcEngine::create(small_config()).unwrap();
        let a = engine
            .allocate(ObjectShape::Instance { refs: 2, prims: 1 })
            .unwrap();
        let b = engine.allocate(ObjectShape::TypeArray { length: 3 }).unwrap();
        engine.write_ref(a, 1, Some(b));
        engine.write_prim(b, 2, 7);
        assert_eq!(engine.read_ref(a, 0), None);
        assert_eq!(engine.read_ref(a, 1), Some(b));
        assert_eq!(engine.read_prim(b, 2), 7);
        assert_eq!(engine.array_length(b), 3);
        assert_eq!(engine.shape_of(b), ObjectShape::TypeArray { length: 3 });
    }

    #[test]
    fn test_object_too_large() {
        let engine = GcEngine::create(small_config()).unwrap();
        let err = engine
            .allocate(ObjectShape::TypeArray { length: 1 << 20 })
            .unwrap_err();
        assert!(matches!(err, GcError::ObjectTooLarge { .. }));
    }

    #[test]
    fn test_marking_cycle_completes_and_records_metrics() {
        let engine = GcEngine::create(small_config()).unwrap();
        let live = engine
            .allocate(ObjectShape::Instance { refs: 1, prims: 0 })
            .unwrap();
        let dead = engine
            .allocate(ObjectShape::Instance { refs: 0, prims: 4 })
            .unwrap();
        engine.roots().add(RootKind::Static, Some(live));

        assert!(engine.start_marking_cycle().unwrap());
        engine.wait_for_marking();
        assert!(engine.is_cycle_complete());

        let metrics = engine.last_mark_metrics().unwrap();
        assert_eq!(metrics.outcome, MarkOutcome::Completed);
        assert_eq!(metrics.marked_objects, 1);
        assert!(engine.is_marked_in_last_cycle(live));
        assert!(engine.is_obj_dead(dead));
        assert!(!engine.is_obj_dead(live));
        assert!(engine.is_card_live(live));
        assert_eq!(engine.global_metrics().marking_cycles(), 1);
    }

    #[test]
    fn test_full_compaction_updates_roots() {
        let engine = GcEngine::create(small_config()).unwrap();
        let _garbage = engine.allocate(ObjectShape::TypeArray { length: 10 }).unwrap();
        let a = engine
            .allocate(ObjectShape::Instance { refs: 0, prims: 1 })
            .unwrap();
        engine.write_prim(a, 0, 99);
        let root = engine.roots().add(RootKind::ThreadStack, Some(a));

        assert!(engine.invoke_full_compaction(false));
        let moved = engine.roots().get(root).unwrap();
        assert!(moved < a);
        assert_eq!(engine.read_prim(moved, 0), 99);

        let metrics = engine.last_full_gc_metrics().unwrap();
        assert_eq!(metrics.live_objects, 1);
        assert_eq!(metrics.moved_objects, 1);
        assert!(metrics.used_after < metrics.used_before);
    }
}
