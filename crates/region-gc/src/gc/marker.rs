//! Concurrent marking coordinator.
//!
//! A cycle runs in four steps:
//!
//! 1. **Initial mark** (pause): every region records its top as TAMS, the
//!    SATB barrier is switched on, and root referents are marked.
//! 2. **Concurrent mark**: `n` workers claim regions by advancing the global
//!    finger, sweep each region's mark bits below TAMS, and trace from every
//!    marked object, stealing from each other when they run dry.
//! 3. **Remark** (pause): the barrier is switched off and the remaining SATB
//!    values are traced to a fixed point.
//! 4. **Cleanup** (pause): per-task liveness is merged, the finished bitmap
//!    becomes the "previous" bitmap, and fully dead regions are freed.
//!
//! If the workers' overflow stacks exceed the mark stack limit, the round is
//! abandoned and restarted from the bottom of the heap with a doubled
//! limit. Marks already set are kept, so a restart only rescans.

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use super::mark::{CardGeometry, LivenessAccounting, MarkBitmap, ObjArraySlicer, TaskLiveness};
use super::mark_task::{MarkTask, StepOutcome, TaskStats};
use super::satb::SatbMarkQueueSet;
use super::terminator::ParallelTaskTerminator;
use super::worklist::{MarkTaskEntry, OverflowTaskQueue, TaskQueueSet, INITIAL_STEAL_SEED};
use crate::config::{GcConfig, MARK_QUEUE_SIZE};
use crate::heap::{Heap, HeapRegion};
use crate::oop::{Address, HeapWord};
use crate::roots::{RootClosures, RootEnumerator, RootParity, SoftRefPolicy};
use crate::telemetry;
use crate::verify;

/// Per-worker marking queue.
pub type CmTaskQueue = OverflowTaskQueue<MarkTaskEntry, MARK_QUEUE_SIZE>;

/// The marking workers' queues.
pub type CmTaskQueueSet = TaskQueueSet<CmTaskQueue>;

/// Result of one attempt to claim a region.
#[derive(Debug, Clone, Copy)]
pub enum RegionClaim<'h> {
    /// A region with objects below TAMS to sweep.
    Region(&'h HeapRegion),
    /// A region was claimed but has nothing to sweep.
    Empty,
    /// The finger has passed the end of the heap.
    OutOfRegions,
}

/// State owned by one marking worker between rounds.
pub(crate) struct TaskState {
    pub(crate) liveness: TaskLiveness,
    pub(crate) seed: i32,
    pub(crate) stats: TaskStats,
}

/// Results published by cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Live bytes below TAMS across all regions.
    pub live_bytes: usize,
    /// Regions freed, humongous ones included.
    pub regions_reclaimed: usize,
    /// Humongous objects freed.
    pub humongous_reclaimed: usize,
    /// Worker counters summed over the cycle.
    pub stats: TaskStats,
}

/// The concurrent marking state shared by all workers.
pub struct ConcurrentMark {
    n_workers: usize,
    use_local_finger: bool,
    bitmaps: [MarkBitmap; 2],
    next_index: AtomicUsize,
    finger: CachePadded<AtomicUsize>,
    heap_start: Address,
    heap_end: Address,
    queues: Arc<CmTaskQueueSet>,
    terminator: ParallelTaskTerminator<CmTaskQueueSet>,
    tasks: Box<[Mutex<TaskState>]>,
    liveness: LivenessAccounting,
    satb: SatbMarkQueueSet,
    slicer: ObjArraySlicer,
    has_aborted: AtomicBool,
    has_overflown: AtomicBool,
    overflow_entries: AtomicUsize,
    mark_stack_limit: AtomicUsize,
    initial_mark_stack_limit: usize,
    restarts: AtomicUsize,
}

impl ConcurrentMark {
    /// Marking state for `heap`.
    #[must_use]
    pub fn new(config: &GcConfig, heap: &Heap) -> Self {
        let (start, end) = (heap.start(), heap.end());
        let n = config.parallel_workers.max(1);
        let geometry = CardGeometry::new(start, end, config.card_bytes);
        let queues = Arc::new(TaskQueueSet::new(n, CmTaskQueue::new));
        let tasks = (0..n)
            .map(|_| {
                Mutex::new(TaskState {
                    liveness: TaskLiveness::new(heap.regions().max_regions(), &geometry),
                    seed: INITIAL_STEAL_SEED,
                    stats: TaskStats::default(),
                })
            })
            .collect();
        Self {
            n_workers: n,
            use_local_finger: config.use_local_finger,
            bitmaps: [MarkBitmap::new(start, end), MarkBitmap::new(start, end)],
            next_index: AtomicUsize::new(0),
            finger: CachePadded::new(AtomicUsize::new(end.as_usize())),
            heap_start: start,
            heap_end: end,
            terminator: ParallelTaskTerminator::new(n, Arc::clone(&queues), config.termination),
            queues,
            tasks,
            liveness: LivenessAccounting::new(geometry),
            satb: SatbMarkQueueSet::new(),
            slicer: ObjArraySlicer::new(config.obj_array_stride),
            has_aborted: AtomicBool::new(false),
            has_overflown: AtomicBool::new(false),
            overflow_entries: AtomicUsize::new(0),
            mark_stack_limit: AtomicUsize::new(config.mark_stack_limit),
            initial_mark_stack_limit: config.mark_stack_limit,
            restarts: AtomicUsize::new(0),
        }
    }

    // ------------------------------------------------------------------
    // accessors
    // ------------------------------------------------------------------

    /// Number of marking workers.
    #[must_use]
    pub const fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Whether tasks consult their local finger first.
    #[must_use]
    pub const fn use_local_finger(&self) -> bool {
        self.use_local_finger
    }

    /// Bitmap being built by the marking in progress.
    #[must_use]
    pub fn next_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.next_index.load(Ordering::Acquire)]
    }

    /// Bitmap of the last completed marking.
    #[must_use]
    pub fn prev_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[1 - self.next_index.load(Ordering::Acquire)]
    }

    /// The SATB barrier queue.
    #[must_use]
    pub const fn satb(&self) -> &SatbMarkQueueSet {
        &self.satb
    }

    /// Merged liveness of the last cleanup.
    #[must_use]
    pub const fn liveness(&self) -> &LivenessAccounting {
        &self.liveness
    }

    /// Card geometry used for liveness.
    #[must_use]
    pub const fn card_geometry(&self) -> &CardGeometry {
        self.liveness.geometry()
    }

    /// The array slicer.
    #[must_use]
    pub const fn slicer(&self) -> &ObjArraySlicer {
        &self.slicer
    }

    /// The workers' queues.
    #[must_use]
    pub fn queues(&self) -> &CmTaskQueueSet {
        &self.queues
    }

    /// The termination protocol.
    #[must_use]
    pub const fn terminator(&self) -> &ParallelTaskTerminator<CmTaskQueueSet> {
        &self.terminator
    }

    /// Current global finger.
    #[must_use]
    pub fn finger(&self) -> Address {
        Address::new(self.finger.load(Ordering::Acquire))
    }

    /// Number of overflow restarts in the current cycle.
    #[must_use]
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Current mark stack limit.
    #[must_use]
    pub fn mark_stack_limit(&self) -> usize {
        self.mark_stack_limit.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // abort / overflow
    // ------------------------------------------------------------------

    /// Ask every worker to stop at its next check.
    pub fn abort(&self) {
        self.has_aborted.store(true, Ordering::Release);
    }

    /// Whether the cycle was aborted.
    #[must_use]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted.load(Ordering::Acquire)
    }

    /// Whether the current round overflowed.
    #[must_use]
    pub fn has_overflown(&self) -> bool {
        self.has_overflown.load(Ordering::Acquire)
    }

    pub(crate) fn set_has_overflown(&self) {
        self.has_overflown.store(true, Ordering::Release);
    }

    /// Whether workers must leave the current round.
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.has_aborted() || self.has_overflown()
    }

    /// Exit condition for workers waiting in termination.
    #[must_use]
    pub fn should_exit_termination(&self) -> bool {
        self.should_abort() || !self.satb.is_empty()
    }

    /// Reserve room for one overflow-stack entry; `false` once the mark
    /// stack limit is reached.
    pub(crate) fn reserve_overflow_slot(&self) -> bool {
        let limit = self.mark_stack_limit.load(Ordering::Relaxed);
        let prev = self.overflow_entries.fetch_add(1, Ordering::AcqRel);
        if prev >= limit {
            self.overflow_entries.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub(crate) fn release_overflow_slot(&self) {
        self.overflow_entries.fetch_sub(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // region claiming
    // ------------------------------------------------------------------

    /// Claim the region at the global finger and advance the finger past it.
    pub fn claim_region<'h>(&self, heap: &'h Heap) -> RegionClaim<'h> {
        let regions = heap.regions();
        let end = self.heap_end.as_usize();
        let mut finger = self.finger.load(Ordering::Acquire);
        loop {
            if finger >= end {
                return RegionClaim::OutOfRegions;
            }
            let index = regions.addr_to_index(Address::new(finger));
            let region_end = regions.region_bottom(index + 1).as_usize();
            match self.finger.compare_exchange(
                finger,
                region_end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Pairs with the fence between `try_mark` and the finger
                    // check in `MarkTask`.
                    fence(Ordering::SeqCst);
                    return match regions.at(index) {
                        Some(region)
                            if !region.is_continues_humongous()
                                && !region.is_free()
                                && region.next_top_at_mark_start() > region.bottom() =>
                        {
                            RegionClaim::Region(region)
                        }
                        _ => RegionClaim::Empty,
                    };
                }
                Err(current) => finger = current,
            }
        }
    }

    /// Whether every region has been claimed.
    #[must_use]
    pub fn out_of_regions(&self) -> bool {
        self.finger.load(Ordering::Acquire) >= self.heap_end.as_usize()
    }

    // ------------------------------------------------------------------
    // cycle steps
    // ------------------------------------------------------------------

    fn reset_round_state(&self) {
        for queue in self.queues.iter() {
            queue.clear();
        }
        self.overflow_entries.store(0, Ordering::Release);
        self.has_overflown.store(false, Ordering::Release);
        self.terminator.reset_for_reuse();
    }

    /// Initial mark. Must run at a safepoint.
    ///
    /// Records TAMS for every region, activates the SATB barrier and marks
    /// every strong root referent in parallel.
    pub fn checkpoint_roots_initial<R: RootEnumerator + ?Sized>(
        &self,
        heap: &Heap,
        roots: &R,
        parity: &RootParity,
    ) {
        self.has_aborted.store(false, Ordering::Release);
        self.reset_round_state();
        self.mark_stack_limit
            .store(self.initial_mark_stack_limit, Ordering::Relaxed);
        self.restarts.store(0, Ordering::Relaxed);
        self.liveness.clear();
        for task in &*self.tasks {
            let mut state = task.lock();
            state.liveness.clear();
            state.stats = TaskStats::default();
        }

        for region in heap.regions().iter() {
            region.note_start_of_marking();
        }
        self.finger
            .store(self.heap_start.as_usize(), Ordering::Release);

        self.satb.abandon();
        self.satb.set_active(true);

        let parity = parity.advance();
        self.run_on_workers(|worker| self.mark_roots(worker, heap, roots, parity));
    }

    fn mark_roots<R: RootEnumerator + ?Sized>(
        &self,
        worker: usize,
        heap: &Heap,
        roots: &R,
        parity: u32,
    ) {
        let mut state = self.tasks[worker].lock();
        let state = &mut *state;
        let geometry = self.card_geometry();
        let bitmap = self.next_bitmap();
        let mut mark = |slot: &HeapWord| {
            let Some(obj) = slot.load_ref() else { return };
            let region = heap.regions().region_containing(obj).unwrap_or_else(|| {
                panic!("root {obj} points outside the committed heap")
            });
            if region.obj_allocated_since_next_marking(obj) {
                return;
            }
            if bitmap.try_mark(obj) {
                let bytes = heap.obj(obj).size_bytes();
                count_marked(&mut state.liveness, geometry, heap, region, obj, bytes);
                state.stats.marked_objects += 1;
            }
        };
        roots.process_roots(parity, SoftRefPolicy::KeepAlive, &mut RootClosures::strong(&mut mark));
    }

    fn run_on_workers(&self, work: impl Fn(usize) + Sync) {
        if self.n_workers == 1 {
            work(0);
            return;
        }
        let work = &work;
        std::thread::scope(|scope| {
            for worker in 0..self.n_workers {
                scope.spawn(move || work(worker));
            }
        });
    }

    fn run_marking_round(&self, heap: &Heap) {
        self.terminator.reset_for_reuse();
        self.run_on_workers(|worker| {
            let mut state = self.tasks[worker].lock();
            let outcome = MarkTask::new(worker, self, heap, &mut state).do_marking_step();
            debug_assert!(outcome == StepOutcome::Completed || self.should_abort());
        });
    }

    fn restart_for_overflow(&self) {
        let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        let new_limit = self.mark_stack_limit().saturating_mul(2);
        self.mark_stack_limit.store(new_limit, Ordering::Relaxed);
        self.reset_round_state();
        self.finger
            .store(self.heap_start.as_usize(), Ordering::Release);
        telemetry::log_overflow_restart(restarts, new_limit);
    }

    /// Run marking rounds until one finishes without overflow.
    ///
    /// Returns `false` if the cycle was aborted.
    pub fn mark_to_completion(&self, heap: &Heap) -> bool {
        loop {
            self.run_marking_round(heap);
            if self.has_aborted() {
                self.reset_round_state();
                return false;
            }
            if self.has_overflown() {
                self.restart_for_overflow();
                continue;
            }
            return true;
        }
    }

    /// Concurrent phase. Runs with mutators active.
    ///
    /// Returns `false` if the cycle was aborted.
    pub fn mark_from_roots(&self, heap: &Heap) -> bool {
        self.mark_to_completion(heap)
    }

    /// Remark. Must run at a safepoint.
    ///
    /// Deactivates the barrier, traces the remaining SATB values, clears
    /// weak roots whose referents died, and optionally verifies the result.
    /// Returns `false` if the cycle was aborted.
    pub fn checkpoint_roots_final<R: RootEnumerator + ?Sized>(
        &self,
        heap: &Heap,
        roots: &R,
        parity: &RootParity,
        verify_marking: bool,
    ) -> bool {
        self.satb.set_active(false);
        if !self.mark_to_completion(heap) {
            return false;
        }
        debug_assert!(self.satb.is_empty());

        let bitmap = self.next_bitmap();
        roots.process_weak_roots(SoftRefPolicy::KeepAlive, &mut |slot: &HeapWord| {
            if let Some(obj) = slot.load_ref() {
                if !is_live_in_next_marking(heap, bitmap, obj) {
                    telemetry::log_weak_root_cleared(obj);
                    slot.store_ref(None);
                }
            }
        });

        if verify_marking {
            let reachable = verify::reference_trace(heap, roots, parity, SoftRefPolicy::KeepAlive);
            verify::verify_marking(heap, bitmap, &reachable);
            telemetry::log_marking_verified(reachable.len());
        }
        true
    }

    /// Cleanup. Must run at a safepoint after a successful remark.
    ///
    /// Publishes liveness, swaps the bitmaps and frees dead regions. The new
    /// next bitmap still holds stale marks; clear it with
    /// [`clear_next_bitmap`](Self::clear_next_bitmap) before the next cycle.
    pub fn cleanup(&self, heap: &Heap) -> CleanupSummary {
        heap.retire_alloc_region();
        let mut stats = TaskStats::default();
        for task in &*self.tasks {
            let mut state = task.lock();
            self.liveness.merge(&mut state.liveness, heap.regions());
            stats.accumulate(&state.stats);
            state.stats = TaskStats::default();
        }

        let mut live_bytes = 0;
        for region in heap.regions().iter() {
            live_bytes += region.next_marked_bytes();
            region.note_end_of_marking();
        }
        self.next_index.fetch_xor(1, Ordering::AcqRel);

        let prev = self.prev_bitmap();
        let mut dead_regions = Vec::new();
        let mut dead_humongous = Vec::new();
        for region in heap.regions().iter() {
            let existed_at_start = region.prev_top_at_mark_start() > region.bottom();
            if region.is_starts_humongous() {
                if existed_at_start && !prev.is_marked(region.bottom()) {
                    dead_humongous.push(region.index());
                }
            } else if !region.is_humongous()
                && !region.is_free()
                && region.prev_marked_bytes() == 0
                && region.top() == region.prev_top_at_mark_start()
            {
                dead_regions.push(region.index());
            }
        }

        let mut regions_reclaimed = dead_regions.len();
        for &index in &dead_regions {
            heap.regions().free_region(index);
        }
        for &index in &dead_humongous {
            regions_reclaimed += heap.free_humongous(index);
        }
        self.finger.store(self.heap_end.as_usize(), Ordering::Release);
        telemetry::log_cleanup(regions_reclaimed, live_bytes);

        CleanupSummary {
            live_bytes,
            regions_reclaimed,
            humongous_reclaimed: dead_humongous.len(),
            stats,
        }
    }

    /// Clear the next bitmap. Runs concurrently after cleanup or abort.
    pub fn clear_next_bitmap(&self) {
        self.next_bitmap().clear_all();
    }

    /// Discard the state of an aborted cycle. Must run at a safepoint.
    pub fn abandon(&self, heap: &Heap) -> TaskStats {
        self.satb.set_active(false);
        self.satb.abandon();
        self.reset_round_state();
        self.finger.store(self.heap_end.as_usize(), Ordering::Release);
        let mut stats = TaskStats::default();
        for task in &*self.tasks {
            let mut state = task.lock();
            state.liveness.clear();
            stats.accumulate(&state.stats);
            state.stats = TaskStats::default();
        }
        for region in heap.regions().iter() {
            region.abandon_marking();
        }
        stats
    }

    /// Forget both bitmaps; used by full compaction.
    pub(crate) fn reset_after_full_gc(&self) {
        self.bitmaps[0].clear_all();
        self.bitmaps[1].clear_all();
        self.liveness.clear();
        self.has_aborted.store(false, Ordering::Release);
    }
}

fn is_live_in_next_marking(heap: &Heap, bitmap: &MarkBitmap, obj: Address) -> bool {
    heap.region_of(obj).obj_allocated_since_next_marking(obj) || bitmap.is_marked(obj)
}

/// Count a newly marked object. A humongous object's bytes are split over
/// the regions it spans.
pub(crate) fn count_marked(
    liveness: &mut TaskLiveness,
    geometry: &CardGeometry,
    heap: &Heap,
    region: &HeapRegion,
    obj: Address,
    bytes: usize,
) {
    if !region.is_starts_humongous() {
        liveness.count_region(geometry, region.index(), obj, bytes);
        return;
    }
    let obj_end = obj.add_bytes(bytes);
    let mut index = region.index();
    let mut start = obj;
    while start < obj_end {
        let end = heap.regions().region_bottom(index + 1).min(obj_end);
        liveness.count_region(geometry, index, start, end.bytes_since(start));
        start = end;
        index += 1;
    }
}

impl std::fmt::Debug for ConcurrentMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMark")
            .field("n_workers", &self.n_workers)
            .field("finger", &self.finger())
            .field("has_aborted", &self.has_aborted())
            .field("has_overflown", &self.has_overflown())
            .field("restarts", &self.restarts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oop::ObjectShape;
    use crate::roots::{RootKind, RootSet};

    fn config() -> GcConfig {
        GcConfig::default()
            .with_region_bytes(64 * 1024)
            .with_heap_bytes(256 * 1024, 1024 * 1024)
            .with_parallel_workers(2)
    }

    fn node(heap: &Heap) -> Address {
        heap.allocate(ObjectShape::Instance { refs: 1, prims: 1 })
            .unwrap()
    }

    #[test]
    fn test_claim_region_visits_each_region_once() {
        let config = config();
        let heap = Heap::new(&config).unwrap();
        let cm = ConcurrentMark::new(&config, &heap);
        node(&heap);
        assert!(matches!(cm.claim_region(&heap), RegionClaim::OutOfRegions));

        cm.checkpoint_roots_initial(&heap, &RootSet::new(), &RootParity::new());
        assert_eq!(cm.finger(), heap.start());
        let mut swept = 0;
        let mut claims = 0;
        loop {
            match cm.claim_region(&heap) {
                RegionClaim::Region(region) => {
                    assert_eq!(region.index(), 0);
                    swept += 1;
                }
                RegionClaim::Empty => {}
                RegionClaim::OutOfRegions => break,
            }
            claims += 1;
        }
        assert_eq!(swept, 1);
        assert_eq!(claims, heap.regions().max_regions());
        assert!(cm.out_of_regions());
    }

    #[test]
    fn test_overflow_slots_respect_limit() {
        let config = config().with_mark_stack_limit(2);
        let heap = Heap::new(&config).unwrap();
        let cm = ConcurrentMark::new(&config, &heap);
        assert!(cm.reserve_overflow_slot());
        assert!(cm.reserve_overflow_slot());
        assert!(!cm.reserve_overflow_slot());
        cm.release_overflow_slot();
        assert!(cm.reserve_overflow_slot());
    }

    #[test]
    fn test_cycle_marks_reachable_and_swaps_bitmaps() {
        let config = config();
        let heap = Heap::new(&config).unwrap();
        let cm = ConcurrentMark::new(&config, &heap);
        let roots = RootSet::new();
        let parity = RootParity::new();
        let a = node(&heap);
        let b = node(&heap);
        let dead = node(&heap);
        heap.obj(a).ref_slot(0).store_ref(Some(b));
        roots.add(RootKind::ThreadStack, Some(a));

        cm.checkpoint_roots_initial(&heap, &roots, &parity);
        assert!(cm.next_bitmap().is_marked(a));
        assert!(cm.mark_from_roots(&heap));
        assert!(cm.checkpoint_roots_final(&heap, &roots, &parity, true));
        let summary = cm.cleanup(&heap);

        let prev = cm.prev_bitmap();
        assert!(prev.is_marked(a));
        assert!(prev.is_marked(b));
        assert!(!prev.is_marked(dead));
        assert_eq!(summary.live_bytes, 2 * heap.obj(a).size_bytes());
        assert_eq!(summary.stats.marked_objects, 2);
        assert_eq!(summary.regions_reclaimed, 0);
    }

    #[test]
    fn test_abort_then_abandon_resets_finger() {
        let config = config();
        let heap = Heap::new(&config).unwrap();
        let cm = ConcurrentMark::new(&config, &heap);
        let roots = RootSet::new();
        roots.add(RootKind::Static, Some(node(&heap)));

        cm.checkpoint_roots_initial(&heap, &roots, &RootParity::new());
        cm.abort();
        assert!(!cm.mark_from_roots(&heap));
        cm.abandon(&heap);
        assert!(!cm.satb().is_active());
        assert!(cm.out_of_regions());
        assert!(cm.queues().iter().all(|q| q.is_empty()));
    }
}
