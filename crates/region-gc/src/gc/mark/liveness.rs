//! Per-region live bytes and per-card liveness.
//!
//! Each marking task counts into private arrays: live bytes per region and
//! a card bitmap. The arrays are merged into the regions and a global card
//! bitmap once all tasks have stopped, so the hot path takes no shared
//! write.

use super::bitmap::AtomicBitmap;
use crate::heap::HeapRegionManager;
use crate::oop::Address;

/// Maps heap addresses to card indices.
#[derive(Debug, Clone, Copy)]
pub struct CardGeometry {
    heap_start: Address,
    heap_end: Address,
    card_shift: u32,
    heap_start_card: usize,
    num_cards: usize,
}

impl CardGeometry {
    /// Cards of `card_bytes` (a power of two) over `[heap_start, heap_end)`.
    #[must_use]
    pub fn new(heap_start: Address, heap_end: Address, card_bytes: usize) -> Self {
        debug_assert!(card_bytes.is_power_of_two());
        let card_shift = card_bytes.trailing_zeros();
        let heap_start_card = heap_start.as_usize() >> card_shift;
        let num_cards = ((heap_end.as_usize() - 1) >> card_shift) - heap_start_card + 1;
        Self {
            heap_start,
            heap_end,
            card_shift,
            heap_start_card,
            num_cards,
        }
    }

    /// Number of cards covering the heap.
    #[must_use]
    pub const fn num_cards(&self) -> usize {
        self.num_cards
    }

    /// Card size in bytes.
    #[must_use]
    pub const fn card_bytes(&self) -> usize {
        1 << self.card_shift
    }

    /// Card index of `addr`, relative to the heap's first card.
    #[must_use]
    pub const fn card_index_for(&self, addr: Address) -> usize {
        (addr.as_usize() >> self.card_shift) - self.heap_start_card
    }

    /// Whether `addr` starts a card.
    #[must_use]
    pub const fn is_card_aligned(&self, addr: Address) -> bool {
        addr.as_usize() & ((1 << self.card_shift) - 1) == 0
    }

    /// Half-open card index range covering `[start, start + bytes)`.
    #[must_use]
    pub fn card_range(&self, start: Address, bytes: usize) -> (usize, usize) {
        let end = start.add_bytes(bytes);
        let start_idx = self.card_index_for(start);
        let mut end_idx = self.card_index_for(end);
        // The last card is only partly covered unless `end` is card aligned;
        // `end` at the heap end already indexes one past the last card.
        if end < self.heap_end && !self.is_card_aligned(end) {
            end_idx += 1;
        }
        (start_idx, end_idx.min(self.num_cards))
    }

    /// Whether `addr` is covered.
    #[must_use]
    pub fn covers(&self, addr: Address) -> bool {
        addr >= self.heap_start && addr < self.heap_end
    }
}

/// One marking task's private liveness counts.
#[derive(Debug)]
pub struct TaskLiveness {
    marked_bytes: Vec<usize>,
    cards: AtomicBitmap,
}

impl TaskLiveness {
    /// Zeroed counts for `max_regions` regions and `geometry`'s cards.
    #[must_use]
    pub fn new(max_regions: usize, geometry: &CardGeometry) -> Self {
        Self {
            marked_bytes: vec![0; max_regions],
            cards: AtomicBitmap::new(geometry.num_cards()),
        }
    }

    /// Count `bytes` of newly marked object at `start` against `region_index`.
    pub fn count_region(
        &mut self,
        geometry: &CardGeometry,
        region_index: usize,
        start: Address,
        bytes: usize,
    ) {
        self.marked_bytes[region_index] += bytes;
        let (start_idx, end_idx) = geometry.card_range(start, bytes);
        self.cards.set_range(start_idx, end_idx, false);
    }

    /// Bytes counted for `region_index`.
    #[must_use]
    pub fn marked_bytes(&self, region_index: usize) -> usize {
        self.marked_bytes[region_index]
    }

    /// Total bytes counted.
    #[must_use]
    pub fn total_marked_bytes(&self) -> usize {
        self.marked_bytes.iter().sum()
    }

    /// The task's card bitmap.
    #[must_use]
    pub const fn cards(&self) -> &AtomicBitmap {
        &self.cards
    }

    /// Reset all counts.
    pub fn clear(&mut self) {
        self.marked_bytes.fill(0);
        self.cards.clear_all();
    }
}

/// Merged liveness of a marking cycle.
#[derive(Debug)]
pub struct LivenessAccounting {
    geometry: CardGeometry,
    cards: AtomicBitmap,
}

impl LivenessAccounting {
    /// Empty accounting over `geometry`.
    #[must_use]
    pub fn new(geometry: CardGeometry) -> Self {
        Self {
            cards: AtomicBitmap::new(geometry.num_cards()),
            geometry,
        }
    }

    /// Card geometry.
    #[must_use]
    pub const fn geometry(&self) -> &CardGeometry {
        &self.geometry
    }

    /// Fold one task's counts into the regions and the global card bitmap,
    /// then clear the task's counts.
    pub fn merge(&self, task: &mut TaskLiveness, regions: &HeapRegionManager) {
        for (index, &bytes) in task.marked_bytes.iter().enumerate() {
            if bytes == 0 {
                continue;
            }
            if let Some(region) = regions.at(index) {
                region.add_next_marked_bytes(bytes);
            }
        }
        self.cards.union_with(&task.cards);
        task.clear();
    }

    /// Whether the card containing `addr` holds live data.
    #[must_use]
    pub fn is_card_live(&self, addr: Address) -> bool {
        self.geometry.covers(addr) && self.cards.at(self.geometry.card_index_for(addr))
    }

    /// Number of live cards.
    #[must_use]
    pub fn live_cards(&self) -> usize {
        self.cards.count_ones()
    }

    /// The merged card bitmap.
    #[must_use]
    pub const fn cards(&self) -> &AtomicBitmap {
        &self.cards
    }

    /// Forget all card liveness.
    pub fn clear(&self) {
        self.cards.clear_all();
    }
}
