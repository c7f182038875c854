//! Fixed-size heap regions.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::oop::{Address, WORD_SIZE};

/// What a region currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionKind {
    /// On the free list.
    Free = 0,
    /// Regular objects, bump allocated.
    Old = 1,
    /// First region of a humongous object; the object starts at `bottom`.
    StartsHumongous = 2,
    /// Later region of a humongous object.
    ContinuesHumongous = 3,
}

impl RegionKind {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Old,
            2 => Self::StartsHumongous,
            3 => Self::ContinuesHumongous,
            _ => Self::Free,
        }
    }
}

/// A heap region `[bottom, end)` with its allocation and marking state.
///
/// The two top-at-mark-start (TAMS) values split the region for the two
/// marking bitmaps: objects at or above a TAMS were allocated after that
/// marking started and count as live for it without a mark bit.
#[derive(Debug)]
pub struct HeapRegion {
    index: u32,
    bottom: Address,
    end: Address,
    top: AtomicUsize,
    kind: AtomicU8,
    humongous_start: AtomicU32,
    committed: AtomicBool,
    next_top_at_mark_start: AtomicUsize,
    prev_top_at_mark_start: AtomicUsize,
    next_marked_bytes: AtomicUsize,
    prev_marked_bytes: AtomicUsize,
    compaction_top: AtomicUsize,
}

impl HeapRegion {
    /// A free, committed region.
    #[must_use]
    pub fn new(index: u32, bottom: Address, end: Address) -> Self {
        let b = bottom.as_usize();
        Self {
            index,
            bottom,
            end,
            top: AtomicUsize::new(b),
            kind: AtomicU8::new(RegionKind::Free as u8),
            humongous_start: AtomicU32::new(index),
            committed: AtomicBool::new(true),
            next_top_at_mark_start: AtomicUsize::new(b),
            prev_top_at_mark_start: AtomicUsize::new(b),
            next_marked_bytes: AtomicUsize::new(0),
            prev_marked_bytes: AtomicUsize::new(0),
            compaction_top: AtomicUsize::new(b),
        }
    }

    /// Position in the region table.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    /// First address.
    #[must_use]
    pub const fn bottom(&self) -> Address {
        self.bottom
    }

    /// One past the last address.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.end
    }

    /// Allocation high-water mark.
    #[must_use]
    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }

    pub(crate) fn set_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top.as_usize(), Ordering::Release);
    }

    /// Current kind.
    #[must_use]
    pub fn kind(&self) -> RegionKind {
        RegionKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// Whether the region is on the free list.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind() == RegionKind::Free
    }

    /// Whether the region is part of a humongous object.
    #[must_use]
    pub fn is_humongous(&self) -> bool {
        matches!(
            self.kind(),
            RegionKind::StartsHumongous | RegionKind::ContinuesHumongous
        )
    }

    /// Whether a humongous object starts here.
    #[must_use]
    pub fn is_starts_humongous(&self) -> bool {
        self.kind() == RegionKind::StartsHumongous
    }

    /// Whether this is a trailing humongous region.
    #[must_use]
    pub fn is_continues_humongous(&self) -> bool {
        self.kind() == RegionKind::ContinuesHumongous
    }

    /// Index of the region where this region's humongous object starts.
    #[must_use]
    pub fn humongous_start_index(&self) -> usize {
        self.humongous_start.load(Ordering::Acquire) as usize
    }

    /// Whether the region's pages are committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn set_committed(&self, committed: bool) {
        self.committed.store(committed, Ordering::Release);
    }

    /// Whether `addr` lies in `[bottom, end)`.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }

    /// Region size in bytes.
    #[must_use]
    pub const fn capacity_bytes(&self) -> usize {
        self.end.as_usize() - self.bottom.as_usize()
    }

    /// Bytes in `[bottom, top)`.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.top().bytes_since(self.bottom)
    }

    /// Bytes in `[top, end)`.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.end.bytes_since(self.top())
    }

    /// Bump-allocate `words` words, or `None` if they do not fit.
    pub fn par_allocate(&self, words: usize) -> Option<Address> {
        let bytes = words * WORD_SIZE;
        let end = self.end.as_usize();
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if end - top < bytes {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Address::new(top)),
                Err(current) => top = current,
            }
        }
    }

    // ------------------------------------------------------------------
    // kind transitions
    // ------------------------------------------------------------------

    pub(crate) fn set_old(&self) {
        self.kind.store(RegionKind::Old as u8, Ordering::Release);
    }

    pub(crate) fn set_starts_humongous(&self, obj_top: Address) {
        self.humongous_start.store(self.index, Ordering::Release);
        self.set_top(obj_top);
        self.kind
            .store(RegionKind::StartsHumongous as u8, Ordering::Release);
    }

    pub(crate) fn set_continues_humongous(&self, start_index: u32, obj_top: Address) {
        self.humongous_start.store(start_index, Ordering::Release);
        self.set_top(obj_top);
        self.kind
            .store(RegionKind::ContinuesHumongous as u8, Ordering::Release);
    }

    /// Return the region to its just-committed state.
    pub(crate) fn reset(&self) {
        let b = self.bottom.as_usize();
        self.top.store(b, Ordering::Release);
        self.humongous_start.store(self.index, Ordering::Release);
        self.next_top_at_mark_start.store(b, Ordering::Release);
        self.prev_top_at_mark_start.store(b, Ordering::Release);
        self.next_marked_bytes.store(0, Ordering::Release);
        self.prev_marked_bytes.store(0, Ordering::Release);
        self.compaction_top.store(b, Ordering::Release);
        self.kind.store(RegionKind::Free as u8, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // marking state
    // ------------------------------------------------------------------

    /// TAMS of the marking in progress.
    #[must_use]
    pub fn next_top_at_mark_start(&self) -> Address {
        Address::new(self.next_top_at_mark_start.load(Ordering::Acquire))
    }

    /// TAMS of the last completed marking.
    #[must_use]
    pub fn prev_top_at_mark_start(&self) -> Address {
        Address::new(self.prev_top_at_mark_start.load(Ordering::Acquire))
    }

    /// Record the start of a marking cycle: everything above the current
    /// top is implicitly live for it.
    pub(crate) fn note_start_of_marking(&self) {
        self.next_top_at_mark_start
            .store(self.top.load(Ordering::Acquire), Ordering::Release);
        self.next_marked_bytes.store(0, Ordering::Release);
    }

    /// Drop the state of a marking that will not finish.
    pub(crate) fn abandon_marking(&self) {
        self.next_top_at_mark_start
            .store(self.bottom.as_usize(), Ordering::Release);
        self.next_marked_bytes.store(0, Ordering::Release);
    }

    /// Publish the finished marking's results as the previous marking.
    pub(crate) fn note_end_of_marking(&self) {
        self.prev_top_at_mark_start.store(
            self.next_top_at_mark_start.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.prev_marked_bytes.store(
            self.next_marked_bytes.swap(0, Ordering::AcqRel),
            Ordering::Release,
        );
        self.next_top_at_mark_start
            .store(self.bottom.as_usize(), Ordering::Release);
    }

    /// Forget marking information; used after a full compaction. With both
    /// TAMS at bottom every object below top counts as live.
    pub(crate) fn reset_marking_after_compaction(&self) {
        let b = self.bottom.as_usize();
        self.next_top_at_mark_start.store(b, Ordering::Release);
        self.prev_top_at_mark_start.store(b, Ordering::Release);
        self.next_marked_bytes.store(0, Ordering::Release);
        self.prev_marked_bytes.store(0, Ordering::Release);
    }

    /// Whether `addr` was allocated after the current marking started.
    #[must_use]
    pub fn obj_allocated_since_next_marking(&self, addr: Address) -> bool {
        addr >= self.next_top_at_mark_start()
    }

    /// Whether `addr` was allocated after the last completed marking started.
    #[must_use]
    pub fn obj_allocated_since_prev_marking(&self, addr: Address) -> bool {
        addr >= self.prev_top_at_mark_start()
    }

    pub(crate) fn add_next_marked_bytes(&self, bytes: usize) {
        self.next_marked_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Bytes marked live by the marking in progress (after merge).
    #[must_use]
    pub fn next_marked_bytes(&self) -> usize {
        self.next_marked_bytes.load(Ordering::Acquire)
    }

    /// Bytes marked live by the last completed marking.
    #[must_use]
    pub fn prev_marked_bytes(&self) -> usize {
        self.prev_marked_bytes.load(Ordering::Acquire)
    }

    /// Live bytes as of the last completed marking, plus everything
    /// allocated since it started.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.prev_marked_bytes() + self.top().bytes_since(self.prev_top_at_mark_start())
    }

    // ------------------------------------------------------------------
    // compaction
    // ------------------------------------------------------------------

    /// Compaction destination top.
    #[must_use]
    pub fn compaction_top(&self) -> Address {
        Address::new(self.compaction_top.load(Ordering::Acquire))
    }

    pub(crate) fn set_compaction_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.compaction_top.store(top.as_usize(), Ordering::Release);
    }
}
