//! One marking worker's step.
//!
//! A step first sweeps regions claimed from the global finger: every mark
//! bit below the region's TAMS is an object to scan, and the task's local
//! finger follows the sweep. References found while scanning are marked and
//! pushed only if they lie below a finger; anything above will be reached by
//! a sweep later. Once regions run out the task drains its queues, steals,
//! and finally offers termination.

use std::sync::atomic::{fence, Ordering};

use super::marker::{count_marked, CmTaskQueue, ConcurrentMark, RegionClaim, TaskState};
use super::worklist::{GenericTaskQueue, MarkTaskEntry};
use crate::config::MARK_QUEUE_SIZE;
use crate::heap::{Heap, HeapRegion};
use crate::oop::Address;

/// Local queue size kept after a partial drain, leaving work for thieves.
const PARTIAL_DRAIN_TARGET: usize = {
    let third = GenericTaskQueue::<MarkTaskEntry, MARK_QUEUE_SIZE>::max_elems() / 3;
    if third < 128 {
        third
    } else {
        128
    }
};

/// Words scanned between SATB buffer checks.
const SATB_CHECK_INTERVAL_WORDS: usize = 16 * 1024;

/// Counters kept by one marking task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Objects this task marked.
    pub marked_objects: usize,
    /// Objects this task scanned.
    pub scanned_objects: usize,
    /// Entries taken from other tasks' queues.
    pub steals: usize,
    /// Entries spilled to the overflow stack.
    pub overflow_pushes: usize,
    /// SATB values processed.
    pub satb_processed: usize,
}

impl TaskStats {
    /// Add `other` into `self`.
    pub fn accumulate(&mut self, other: &Self) {
        self.marked_objects += other.marked_objects;
        self.scanned_objects += other.scanned_objects;
        self.steals += other.steals;
        self.overflow_pushes += other.overflow_pushes;
        self.satb_processed += other.satb_processed;
    }
}

/// How a marking step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// All tasks agreed to terminate.
    Completed,
    /// The step stopped because of an abort or an overflow.
    Aborted,
}

pub(crate) struct MarkTask<'a> {
    worker_id: usize,
    cm: &'a ConcurrentMark,
    heap: &'a Heap,
    queue: &'a CmTaskQueue,
    state: &'a mut TaskState,
    curr_region: Option<&'a HeapRegion>,
    finger: Option<Address>,
    region_limit: Address,
    words_scanned: usize,
    words_at_last_satb_check: usize,
}

impl<'a> MarkTask<'a> {
    pub(crate) fn new(
        worker_id: usize,
        cm: &'a ConcurrentMark,
        heap: &'a Heap,
        state: &'a mut TaskState,
    ) -> Self {
        Self {
            worker_id,
            cm,
            heap,
            queue: cm.queues().queue(worker_id),
            state,
            curr_region: None,
            finger: None,
            region_limit: Address::NULL,
            words_scanned: 0,
            words_at_last_satb_check: 0,
        }
    }

    /// Run until every task terminates or the round must be abandoned.
    pub(crate) fn do_marking_step(&mut self) -> StepOutcome {
        self.drain_satb_buffers();
        if self.cm.should_abort() {
            return StepOutcome::Aborted;
        }

        loop {
            if let Some(region) = self.curr_region {
                if !self.scan_region(region) {
                    return StepOutcome::Aborted;
                }
                self.giveup_current_region();
            }
            self.drain_local_queue(true);
            if self.cm.should_abort() {
                return StepOutcome::Aborted;
            }
            match self.cm.claim_region(self.heap) {
                RegionClaim::Region(region) => self.setup_for_region(region),
                RegionClaim::Empty => {}
                RegionClaim::OutOfRegions => break,
            }
        }

        loop {
            self.drain_satb_buffers();
            self.drain_local_queue(false);
            self.drain_overflow_stack();
            if self.cm.should_abort() {
                return StepOutcome::Aborted;
            }

            while let Some(entry) = self
                .cm
                .queues()
                .steal(self.worker_id, &mut self.state.seed)
            {
                self.state.stats.steals += 1;
                self.process_entry(entry);
                self.drain_local_queue(false);
                self.drain_overflow_stack();
                if self.cm.should_abort() {
                    return StepOutcome::Aborted;
                }
            }

            let cm = self.cm;
            let exit = move || cm.should_exit_termination();
            if cm.terminator().offer_termination(Some(&exit)) {
                return StepOutcome::Completed;
            }
            if cm.should_abort() {
                return StepOutcome::Aborted;
            }
        }
    }

    fn setup_for_region(&mut self, region: &'a HeapRegion) {
        self.curr_region = Some(region);
        self.finger = Some(region.bottom());
        self.region_limit = region.next_top_at_mark_start();
    }

    fn giveup_current_region(&mut self) {
        self.curr_region = None;
        self.finger = None;
        self.region_limit = Address::NULL;
    }

    /// Sweep the marked objects of `region` below its limit. Returns
    /// `false` if the round must be abandoned.
    fn scan_region(&mut self, region: &'a HeapRegion) -> bool {
        let heap = self.heap;
        let bitmap = self.cm.next_bitmap();
        let cm = self.cm;
        let start = self.finger.unwrap_or_else(|| region.bottom());
        for addr in bitmap.iter(start, self.region_limit, |a| heap.next_object(a)) {
            if cm.should_abort() {
                return false;
            }
            self.finger = Some(addr);
            self.scan_object(addr);
            self.drain_local_queue(true);
            self.maybe_drain_satb_buffers();
        }
        true
    }

    fn is_below_finger(&self, obj: Address) -> bool {
        if self.cm.use_local_finger() {
            if let Some(finger) = self.finger {
                if obj < finger {
                    return true;
                }
                if obj < self.region_limit {
                    return false;
                }
            }
        }
        obj < self.cm.finger()
    }

    /// Mark the object at `obj` if it is below TAMS and unmarked.
    fn deal_with_reference(&mut self, obj: Address) {
        let (cm, heap) = (self.cm, self.heap);
        let region = heap.region_of(obj);
        if region.obj_allocated_since_next_marking(obj) {
            return;
        }
        if !cm.next_bitmap().try_mark(obj) {
            return;
        }
        let object = heap.obj(obj);
        count_marked(
            &mut self.state.liveness,
            cm.card_geometry(),
            heap,
            region,
            obj,
            object.size_bytes(),
        );
        self.state.stats.marked_objects += 1;

        // Pairs with the fence after the finger CAS in `claim_region`: either
        // this task sees the advanced finger or the claimer's sweep sees the bit.
        fence(Ordering::SeqCst);
        if !self.is_below_finger(obj) {
            return;
        }
        if object.is_ref_free() {
            self.state.stats.scanned_objects += 1;
        } else {
            self.push(MarkTaskEntry::Object(obj));
        }
    }

    fn push(&mut self, entry: MarkTaskEntry) {
        if self.queue.taskqueue().push(entry) {
            return;
        }
        if self.cm.reserve_overflow_slot() {
            self.queue.push_overflow(entry);
            self.state.stats.overflow_pushes += 1;
        } else {
            self.cm.set_has_overflown();
        }
    }

    fn process_entry(&mut self, entry: MarkTaskEntry) {
        match entry {
            MarkTaskEntry::Object(obj) => self.scan_object(obj),
            MarkTaskEntry::ArraySlice(slice) => {
                let mut next = None;
                let (obj, range) = self
                    .cm
                    .slicer()
                    .process_slice(self.heap, slice, |e| next = Some(e));
                if let Some(e) = next {
                    self.push(e);
                }
                self.scan_ref_range(obj, range);
            }
        }
    }

    fn scan_object(&mut self, addr: Address) {
        let heap = self.heap;
        let object = heap.obj(addr);
        self.state.stats.scanned_objects += 1;
        self.words_scanned += object.size_words();

        if object.is_obj_array() && self.cm.slicer().should_be_sliced(object.array_length()) {
            let mut next = None;
            let range = self
                .cm
                .slicer()
                .process_obj(heap, addr, |e| next = Some(e));
            if let Some(e) = next {
                self.push(e);
            }
            self.scan_ref_range(addr, range);
            return;
        }
        for slot in object.all_ref_slots() {
            if let Some(referent) = slot.load_ref() {
                self.deal_with_reference(referent);
            }
        }
    }

    fn scan_ref_range(&mut self, obj: Address, range: std::ops::Range<usize>) {
        let heap = self.heap;
        self.words_scanned += range.len();
        for slot in heap.obj(obj).ref_slots(range) {
            if let Some(referent) = slot.load_ref() {
                self.deal_with_reference(referent);
            }
        }
    }

    fn drain_local_queue(&mut self, partially: bool) {
        let target = if partially { PARTIAL_DRAIN_TARGET } else { 0 };
        while self.queue.taskqueue().size() > target {
            let Some(entry) = self.queue.pop_local() else { break };
            self.process_entry(entry);
            if self.cm.should_abort() {
                return;
            }
        }
    }

    fn drain_overflow_stack(&mut self) {
        while let Some(entry) = self.queue.pop_overflow() {
            self.cm.release_overflow_slot();
            self.process_entry(entry);
            self.drain_local_queue(false);
            if self.cm.should_abort() {
                return;
            }
        }
    }

    fn drain_satb_buffers(&mut self) {
        self.words_at_last_satb_check = self.words_scanned;
        while let Some(obj) = self.cm.satb().pop() {
            self.state.stats.satb_processed += 1;
            self.deal_with_reference(obj);
        }
    }

    fn maybe_drain_satb_buffers(&mut self) {
        if self.words_scanned - self.words_at_last_satb_check >= SATB_CHECK_INTERVAL_WORDS {
            self.drain_satb_buffers();
        }
    }
}
