//! Serial four-phase mark-sweep-compact.
//!
//! 1. **Mark**: trace from the roots with an explicit stack, then clear weak
//!    roots whose referents died.
//! 2. **Calculate new addresses**: slide the live objects of every region
//!    in the compaction order down towards the first such region, storing
//!    each destination in the object's mark word.
//! 3. **Adjust pointers**: rewrite roots and the reference fields of every
//!    live object to the referents' destinations.
//! 4. **Compact**: copy each forwarded object to its destination, lowest
//!    first, and lower region tops.
//!
//! Phases 2 and 4 walk the same region order; phase 3 must finish before
//! phase 4 overwrites any forwarding information. Humongous objects are
//! never moved. A destination is always strictly below its source, which
//! rules out forwarding cycles.

use std::time::Duration;

use super::mark::MarkBitmap;
use crate::heap::{Heap, HeapRegion};
use crate::metrics::PhaseTimer;
use crate::oop::{Address, HeapWord, MarkWord};
use crate::roots::{RootClosures, RootEnumerator, RootParity, SoftRefPolicy};
use crate::telemetry::{self, GcPhase};

/// Chooses which regions a full compaction slides.
pub trait CompactionPolicy: Send + Sync {
    /// Whether `region`, holding `live_bytes` after marking, is compacted.
    fn should_compact(&self, region: &HeapRegion, live_bytes: usize) -> bool;
}

/// Compact every non-humongous region.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactAll;

impl CompactionPolicy for CompactAll {
    fn should_compact(&self, _region: &HeapRegion, _live_bytes: usize) -> bool {
        true
    }
}

/// Leave regions whose live share exceeds `max_live_percent` in place.
#[derive(Debug, Clone, Copy)]
pub struct LiveThresholdPolicy {
    /// Highest live percentage of a region that is still compacted.
    pub max_live_percent: usize,
}

impl CompactionPolicy for LiveThresholdPolicy {
    fn should_compact(&self, region: &HeapRegion, live_bytes: usize) -> bool {
        live_bytes * 100 <= self.max_live_percent * region.capacity_bytes()
    }
}

/// Results of one full compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Objects found live.
    pub live_objects: usize,
    /// Bytes found live.
    pub live_bytes: usize,
    /// Live objects that changed address.
    pub moved_objects: usize,
    /// Regions returned to the free list, humongous ones included.
    pub regions_freed: usize,
    /// Dead humongous objects freed.
    pub humongous_freed: usize,
    /// Time spent in each phase, in phase order.
    pub phase_durations: [Duration; 4],
}

/// Allocation cursor of phase 2.
#[derive(Debug, Clone, Copy)]
struct CompactPoint {
    /// Position in the compaction order of the destination region.
    order_pos: usize,
    top: Address,
}

/// One full compaction over `heap`.
pub struct MarkSweepCompactor<'a, R: ?Sized, P: ?Sized> {
    heap: &'a Heap,
    roots: &'a R,
    parity: &'a RootParity,
    bitmap: &'a MarkBitmap,
    policy: &'a P,
    soft: SoftRefPolicy,
    /// Regions slid by phases 2 and 4, ascending.
    order: Vec<usize>,
    /// Live bytes per region index after phase 1.
    live_bytes: Vec<usize>,
    dead_humongous: Vec<usize>,
    summary: CompactionSummary,
}

impl<'a, R, P> MarkSweepCompactor<'a, R, P>
where
    R: RootEnumerator + ?Sized,
    P: CompactionPolicy + ?Sized,
{
    /// A compactor marking into `bitmap`, which it clears first.
    pub fn new(
        heap: &'a Heap,
        roots: &'a R,
        parity: &'a RootParity,
        bitmap: &'a MarkBitmap,
        policy: &'a P,
        soft: SoftRefPolicy,
    ) -> Self {
        Self {
            heap,
            roots,
            parity,
            bitmap,
            policy,
            soft,
            order: Vec::new(),
            live_bytes: vec![0; heap.regions().max_regions()],
            dead_humongous: Vec::new(),
            summary: CompactionSummary::default(),
        }
    }

    /// Run all four phases. Must be called at a safepoint.
    pub fn collect(mut self) -> CompactionSummary {
        self.heap.retire_alloc_region();
        let mut timer = PhaseTimer::new();

        let phases: [(GcPhase, fn(&mut Self)); 4] = [
            (GcPhase::Mark, Self::mark_phase),
            (GcPhase::CalculateNewAddresses, Self::calculate_new_addresses),
            (GcPhase::AdjustPointers, Self::adjust_pointers),
            (GcPhase::Compact, Self::compact),
        ];
        for (i, (phase, run)) in phases.into_iter().enumerate() {
            #[allow(clippy::let_unit_value)]
            let _span = telemetry::trace_phase(phase);
            timer.start();
            run(&mut self);
            self.summary.phase_durations[i] = timer.end(phase);
        }

        self.bitmap.clear_all();
        for region in self.heap.regions().iter() {
            region.reset_marking_after_compaction();
        }
        telemetry::log_compaction_summary(
            self.summary.live_objects,
            self.summary.moved_objects,
            self.summary.regions_freed,
        );
        self.summary
    }

    // ------------------------------------------------------------------
    // phase 1
    // ------------------------------------------------------------------

    fn mark_phase(&mut self) {
        let (heap, bitmap) = (self.heap, self.bitmap);
        bitmap.clear_all();

        let mut stack: Vec<Address> = Vec::new();
        let mut live_objects = 0;
        let mut live_bytes = 0;
        let per_region = &mut self.live_bytes;
        let mut mark = |obj: Address, stack: &mut Vec<Address>| {
            assert!(
                heap.is_in_reserved(obj),
                "reference {obj} outside the reserved heap"
            );
            if !bitmap.try_mark(obj) {
                return;
            }
            let region = heap.region_of(obj);
            let bytes = heap.obj(obj).size_bytes();
            per_region[region.humongous_start_index()] += bytes;
            live_objects += 1;
            live_bytes += bytes;
            stack.push(obj);
        };

        {
            let mut root = |slot: &HeapWord| {
                if let Some(obj) = slot.load_ref() {
                    mark(obj, &mut stack);
                }
            };
            self.roots.process_roots(
                self.parity.advance(),
                self.soft,
                &mut RootClosures::strong(&mut root),
            );
        }

        while let Some(obj) = stack.pop() {
            for slot in heap.obj(obj).all_ref_slots() {
                if let Some(referent) = slot.load_ref() {
                    mark(referent, &mut stack);
                }
            }
        }

        self.roots
            .process_weak_roots(self.soft, &mut |slot: &HeapWord| {
                if let Some(obj) = slot.load_ref() {
                    if !bitmap.is_marked(obj) {
                        telemetry::log_weak_root_cleared(obj);
                        slot.store_ref(None);
                    }
                }
            });

        self.summary.live_objects = live_objects;
        self.summary.live_bytes = live_bytes;
    }

    // ------------------------------------------------------------------
    // phase 2
    // ------------------------------------------------------------------

    fn calculate_new_addresses(&mut self) {
        let heap = self.heap;
        let regions = heap.regions();

        self.order.clear();
        self.dead_humongous.clear();
        for region in regions.iter() {
            let index = region.index();
            if region.is_starts_humongous() {
                if !self.bitmap.is_marked(region.bottom()) {
                    self.dead_humongous.push(index);
                }
            } else if !region.is_humongous()
                && !region.is_free()
                && self.policy.should_compact(region, self.live_bytes[index])
            {
                region.set_compaction_top(region.bottom());
                self.order.push(index);
            }
        }

        let Some(&first) = self.order.first() else { return };
        let mut cp = CompactPoint {
            order_pos: 0,
            top: regions.region_bottom(first),
        };
        let mut moved = 0;
        for &index in &self.order {
            let Some(src) = regions.at(index) else { continue };
            for obj in self
                .bitmap
                .iter(src.bottom(), src.top(), |a| heap.next_object(a))
            {
                let object = heap.obj(obj);
                let size = object.size_words();
                cp = self.fit(cp, size);
                let dest = cp.top;
                assert!(
                    dest <= obj,
                    "object {obj} would be forwarded upwards to {dest}"
                );
                if dest != obj {
                    object.set_mark_word(MarkWord::Forwarded(dest));
                    moved += 1;
                }
                cp.top = dest.add_words(size);
            }
        }
        if let Some(dest) = regions.at(self.order[cp.order_pos]) {
            dest.set_compaction_top(cp.top);
        }
        self.summary.moved_objects = moved;
    }

    /// Advance `cp` until `size` words fit in its destination region.
    fn fit(&self, mut cp: CompactPoint, size: usize) -> CompactPoint {
        let regions = self.heap.regions();
        loop {
            let index = self.order[cp.order_pos];
            let dest = regions
                .at(index)
                .unwrap_or_else(|| panic!("compaction region {index} is not committed"));
            if cp.top.add_words(size) <= dest.end() {
                return cp;
            }
            dest.set_compaction_top(cp.top);
            cp.order_pos += 1;
            assert!(
                cp.order_pos < self.order.len(),
                "compaction ran out of destination regions"
            );
            cp.top = regions.region_bottom(self.order[cp.order_pos]);
        }
    }

    // ------------------------------------------------------------------
    // phase 3
    // ------------------------------------------------------------------

    fn adjust_pointers(&mut self) {
        let heap = self.heap;
        {
            let mut strong = |slot: &HeapWord| adjust_slot(heap, slot);
            let mut weak = |slot: &HeapWord| adjust_slot(heap, slot);
            self.roots.process_roots(
                self.parity.advance(),
                self.soft,
                &mut RootClosures {
                    strong: &mut strong,
                    code: None,
                    weak: Some(&mut weak),
                },
            );
        }

        for region in heap.regions().iter() {
            if region.is_free() || region.is_continues_humongous() {
                continue;
            }
            for obj in self
                .bitmap
                .iter(region.bottom(), region.top(), |a| heap.next_object(a))
            {
                for slot in heap.obj(obj).all_ref_slots() {
                    adjust_slot(heap, slot);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // phase 4
    // ------------------------------------------------------------------

    fn compact(&mut self) {
        let heap = self.heap;
        let regions = heap.regions();

        for &index in &self.order {
            let Some(src) = regions.at(index) else { continue };
            for obj in self
                .bitmap
                .iter(src.bottom(), src.top(), |a| heap.next_object(a))
            {
                let object = heap.obj(obj);
                if let Some(dest) = object.forwardee() {
                    heap.copy_words(obj, dest, object.size_words());
                    heap.obj(dest).set_mark_word(MarkWord::Neutral);
                }
            }
        }

        let mut freed = 0;
        for &index in &self.order {
            let Some(region) = regions.at(index) else { continue };
            let new_top = region.compaction_top();
            region.set_top(new_top);
            if new_top == region.bottom() {
                regions.free_region(index);
                freed += 1;
            }
        }
        for region in regions.iter().filter(|r| r.is_starts_humongous()) {
            heap.obj(region.bottom()).set_mark_word(MarkWord::Neutral);
        }
        for &index in &self.dead_humongous {
            freed += heap.free_humongous(index);
        }
        self.summary.regions_freed = freed;
        self.summary.humongous_freed = self.dead_humongous.len();
    }
}

/// Point `slot` at its referent's destination.
fn adjust_slot(heap: &Heap, slot: &HeapWord) {
    let Some(referent) = slot.load_ref() else { return };
    assert!(
        heap.is_in_reserved(referent),
        "reference {referent} outside the reserved heap"
    );
    if let Some(dest) = heap.obj(referent).forwardee() {
        assert!(dest < referent, "forwarding loop at {referent}");
        slot.store_ref(Some(dest));
    }
}

/// Uncommit free regions until at most `max_free_ratio` percent of the
/// committed capacity is free, keeping at least `min_regions` committed.
///
/// Returns the number of regions uncommitted.
///
/// # Errors
///
/// Returns [`GcError::CommitFailed`](crate::GcError::CommitFailed) if the OS
/// refuses to uncommit.
pub fn shrink_to_free_ratio(
    heap: &Heap,
    max_free_ratio: usize,
    min_regions: usize,
) -> Result<usize, crate::GcError> {
    let regions = heap.regions();
    let committed = regions.num_committed_regions();
    let free = regions.num_free_regions();
    let used = committed - free;
    // Smallest committed count whose free share is within the ratio.
    let keep_free = if max_free_ratio >= 100 {
        free
    } else {
        (used * max_free_ratio).div_ceil(100 - max_free_ratio)
    };
    let target = (used + keep_free).max(min_regions);
    if committed <= target {
        return Ok(0);
    }
    let before = regions.total_capacity_bytes();
    let shrunk = regions.shrink_by(committed - target)?;
    telemetry::log_heap_resize(before, regions.total_capacity_bytes());
    Ok(shrunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::oop::ObjectShape;
    use crate::roots::{RootKind, RootSet};

    fn heap() -> Heap {
        let config = GcConfig::default()
            .with_region_bytes(64 * 1024)
            .with_heap_bytes(256 * 1024, 1024 * 1024);
        Heap::new(&config).unwrap()
    }

    fn node(heap: &Heap) -> Address {
        heap.allocate(ObjectShape::Instance { refs: 1, prims: 1 })
            .unwrap()
    }

    fn link(heap: &Heap, from: Address, to: Address) {
        heap.obj(from).ref_slot(0).store_ref(Some(to));
    }

    fn run(heap: &Heap, roots: &RootSet, policy: &dyn CompactionPolicy) -> CompactionSummary {
        let bitmap = MarkBitmap::new(heap.start(), heap.end());
        let parity = RootParity::new();
        MarkSweepCompactor::new(heap, roots, &parity, &bitmap, policy, SoftRefPolicy::KeepAlive)
            .collect()
    }

    #[test]
    fn test_slides_live_objects_down() {
        let heap = heap();
        let garbage = node(&heap);
        let a = node(&heap);
        let _more_garbage = node(&heap);
        let b = node(&heap);
        link(&heap, a, b);
        heap.obj(b).prim_slot(0).store(0xdead_beef);

        let roots = RootSet::new();
        let root = roots.add(RootKind::ThreadStack, Some(a));
        let summary = run(&heap, &roots, &CompactAll);

        assert_eq!(summary.live_objects, 2);
        assert_eq!(summary.moved_objects, 2);
        let new_a = roots.get(root).unwrap();
        assert_eq!(new_a, garbage, "first live object lands at region bottom");
        let new_b = heap.obj(new_a).ref_slot(0).load_ref().unwrap();
        assert_eq!(new_b, new_a.add_words(heap.obj(new_a).size_words()));
        assert_eq!(heap.obj(new_b).prim_slot(0).load(), 0xdead_beef);
        assert_eq!(heap.obj(new_b).mark_word(), MarkWord::Neutral);
        assert_eq!(heap.region_of(new_a).top(), new_b.add_words(4));
    }

    #[test]
    fn test_empty_regions_are_freed() {
        let heap = heap();
        let _garbage = node(&heap);
        let roots = RootSet::new();
        let free_before = heap.regions().num_free_regions();
        let summary = run(&heap, &roots, &CompactAll);
        assert_eq!(summary.live_objects, 0);
        assert_eq!(summary.regions_freed, 1);
        assert_eq!(heap.regions().num_free_regions(), free_before + 1);
    }

    #[test]
    fn test_dead_humongous_freed_live_kept() {
        let heap = heap();
        let words = heap.regions().region_words();
        let big = ObjectShape::TypeArray { length: words };
        let dead = heap.allocate(big).unwrap();
        let live = heap.allocate(big).unwrap();
        let roots = RootSet::new();
        roots.add(RootKind::Static, Some(live));

        let summary = run(&heap, &roots, &CompactAll);
        assert_eq!(summary.humongous_freed, 1);
        assert_eq!(summary.regions_freed, 2);
        assert!(heap.region_of(live).is_starts_humongous());
        assert!(heap.regions().region_containing(dead).unwrap().is_free());
    }

    #[test]
    fn test_threshold_policy_keeps_dense_region() {
        let heap = heap();
        let a = node(&heap);
        let roots = RootSet::new();
        roots.add(RootKind::Static, Some(a));
        let summary = run(
            &heap,
            &roots,
            &LiveThresholdPolicy {
                max_live_percent: 0,
            },
        );
        assert_eq!(summary.moved_objects, 0);
        assert_eq!(summary.regions_freed, 0);
        assert_eq!(heap.region_of(a).top(), a.add_words(4));
    }

    #[test]
    fn test_weak_root_to_dead_object_cleared() {
        let heap = heap();
        let dead = node(&heap);
        let roots = RootSet::new();
        let weak = roots.add(RootKind::StringTable, Some(dead));
        run(&heap, &roots, &CompactAll);
        assert_eq!(roots.get(weak), None);
    }

    #[test]
    fn test_shrink_respects_ratio() {
        let heap = heap();
        heap.regions().expand_by(8);
        let committed = heap.regions().num_committed_regions();
        let shrunk = shrink_to_free_ratio(&heap, 50, 1).unwrap();
        assert_eq!(shrunk, committed - 1);
        assert_eq!(heap.regions().num_committed_regions(), 1);
    }
}
