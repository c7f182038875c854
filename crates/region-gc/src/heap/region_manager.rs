//! The region table: commit state, free list, and address-to-region lookup.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::region::HeapRegion;
use super::virtual_space::PageBasedVirtualSpace;
use crate::error::GcError;
use crate::oop::{Address, HeapWord, WORD_SIZE};

/// Free regions, always handed out lowest index first.
#[derive(Debug, Default)]
pub struct FreeRegionList {
    regions: BTreeSet<u32>,
}

impl FreeRegionList {
    /// Add a region.
    ///
    /// # Panics
    ///
    /// Panics if the region is already on the list.
    pub fn add(&mut self, index: u32) {
        assert!(self.regions.insert(index), "region {index} freed twice");
    }

    /// Remove and return the lowest region.
    pub fn remove_first(&mut self) -> Option<u32> {
        self.regions.pop_first()
    }

    /// Remove a specific region; `true` if it was present.
    pub fn remove(&mut self, index: u32) -> bool {
        self.regions.remove(&index)
    }

    /// Whether `index` is on the list.
    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        self.regions.contains(&index)
    }

    /// Number of free regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Free regions from highest to lowest.
    pub fn iter_rev(&self) -> impl Iterator<Item = u32> + '_ {
        self.regions.iter().rev().copied()
    }
}

/// Owns every region of the reserved heap.
///
/// Region objects are created the first time their pages are committed and
/// reused across uncommit/commit cycles, so a `&HeapRegion` stays valid for
/// the manager's lifetime.
pub struct HeapRegionManager {
    storage: PageBasedVirtualSpace,
    region_bytes: usize,
    log_region_bytes: u32,
    heap_start: Address,
    max_regions: usize,
    regions: Box<[OnceLock<HeapRegion>]>,
    free_list: Mutex<FreeRegionList>,
    committed: AtomicUsize,
    free: AtomicUsize,
}

impl HeapRegionManager {
    /// Reserve `max_regions` regions of `region_bytes` each; none committed.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::ReserveFailed`] if the reservation fails.
    pub fn reserve(region_bytes: usize, max_regions: usize) -> Result<Self, GcError> {
        debug_assert!(region_bytes.is_power_of_two());
        let storage = PageBasedVirtualSpace::reserve(region_bytes * max_regions)?;
        let heap_start = storage.low();
        Ok(Self {
            storage,
            region_bytes,
            log_region_bytes: region_bytes.trailing_zeros(),
            heap_start,
            max_regions,
            regions: (0..max_regions).map(|_| OnceLock::new()).collect(),
            free_list: Mutex::new(FreeRegionList::default()),
            committed: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
        })
    }

    /// Region size in bytes.
    #[must_use]
    pub const fn region_bytes(&self) -> usize {
        self.region_bytes
    }

    /// Region size in heap words.
    #[must_use]
    pub const fn region_words(&self) -> usize {
        self.region_bytes / WORD_SIZE
    }

    /// Number of regions in the reservation.
    #[must_use]
    pub const fn max_regions(&self) -> usize {
        self.max_regions
    }

    /// Start of the reserved heap.
    #[must_use]
    pub const fn heap_start(&self) -> Address {
        self.heap_start
    }

    /// End of the reserved heap.
    #[must_use]
    pub const fn heap_end(&self) -> Address {
        self.heap_start.add_bytes(self.region_bytes * self.max_regions)
    }

    /// The reservation as heap words.
    #[must_use]
    pub fn words(&self) -> &[HeapWord] {
        self.storage.words()
    }

    /// The page bookkeeping beneath the regions.
    #[must_use]
    pub const fn storage(&self) -> &PageBasedVirtualSpace {
        &self.storage
    }

    /// Whether `addr` lies in the reserved heap.
    #[must_use]
    pub fn is_in_reserved(&self, addr: Address) -> bool {
        addr >= self.heap_start && addr < self.heap_end()
    }

    /// Index of the region covering `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the reserved heap.
    #[must_use]
    pub fn addr_to_index(&self, addr: Address) -> usize {
        assert!(
            self.is_in_reserved(addr),
            "address {addr} outside reserved heap {}..{}",
            self.heap_start,
            self.heap_end()
        );
        addr.bytes_since(self.heap_start) >> self.log_region_bytes
    }

    /// Bottom address of region `index`.
    #[must_use]
    pub const fn region_bottom(&self, index: usize) -> Address {
        self.heap_start.add_bytes(index * self.region_bytes)
    }

    /// Committed region `index`, if any.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&HeapRegion> {
        self.regions
            .get(index)?
            .get()
            .filter(|r| r.is_committed())
    }

    /// Committed region containing `addr`, if any.
    #[must_use]
    pub fn region_containing(&self, addr: Address) -> Option<&HeapRegion> {
        if !self.is_in_reserved(addr) {
            return None;
        }
        self.at(self.addr_to_index(addr))
    }

    /// Committed regions in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = &HeapRegion> + '_ {
        (0..self.max_regions).filter_map(|i| self.at(i))
    }

    /// Number of committed regions.
    #[must_use]
    pub fn num_committed_regions(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Number of committed regions on the free list.
    #[must_use]
    pub fn num_free_regions(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// Committed capacity in bytes.
    #[must_use]
    pub fn total_capacity_bytes(&self) -> usize {
        self.num_committed_regions() * self.region_bytes
    }

    /// Reserved capacity in bytes.
    #[must_use]
    pub const fn max_capacity_bytes(&self) -> usize {
        self.max_regions * self.region_bytes
    }

    /// Bytes below top in all committed regions.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.iter().map(HeapRegion::used_bytes).sum()
    }

    fn pages_of(&self, index: usize) -> (usize, usize) {
        let page = self.storage.page_size();
        let pages_per_region = self.region_bytes.div_ceil(page);
        (index * self.region_bytes / page, pages_per_region)
    }

    /// Commit region `index` and put it on the free list. Caller holds the
    /// free-list lock.
    fn commit_region(&self, index: usize, free_list: &mut FreeRegionList) -> &HeapRegion {
        let (first_page, pages) = self.pages_of(index);
        let zero_filled = self.storage.commit(first_page, pages);
        let bottom = self.region_bottom(index);
        #[allow(clippy::cast_possible_truncation)]
        let region = self.regions[index].get_or_init(|| {
            HeapRegion::new(index as u32, bottom, bottom.add_bytes(self.region_bytes))
        });
        region.reset();
        region.set_committed(true);
        #[allow(clippy::cast_possible_truncation)]
        free_list.add(index as u32);
        self.committed.fetch_add(1, Ordering::AcqRel);
        self.free.fetch_add(1, Ordering::AcqRel);
        crate::telemetry::log_region_commit(index, zero_filled);
        region
    }

    fn is_region_committed(&self, index: usize) -> bool {
        self.regions[index].get().is_some_and(HeapRegion::is_committed)
    }

    /// Commit up to `count` uncommitted regions, lowest first.
    ///
    /// Returns the number of regions committed.
    pub fn expand_by(&self, count: usize) -> usize {
        let mut free_list = self.free_list.lock();
        self.expand_locked(count, &mut free_list)
    }

    fn expand_locked(&self, count: usize, free_list: &mut FreeRegionList) -> usize {
        let mut done = 0;
        for index in 0..self.max_regions {
            if done == count {
                break;
            }
            if !self.is_region_committed(index) {
                self.commit_region(index, free_list);
                done += 1;
            }
        }
        done
    }

    /// Uncommit up to `count` free regions, highest first.
    ///
    /// Returns the number of regions uncommitted.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::CommitFailed`] if the OS call fails.
    pub fn shrink_by(&self, count: usize) -> Result<usize, GcError> {
        let mut free_list = self.free_list.lock();
        let victims: Vec<u32> = free_list.iter_rev().take(count).collect();
        for &index in &victims {
            let (first_page, pages) = self.pages_of(index as usize);
            self.storage.uncommit(first_page, pages)?;
            free_list.remove(index);
            if let Some(region) = self.regions[index as usize].get() {
                region.set_committed(false);
            }
            self.committed.fetch_sub(1, Ordering::AcqRel);
            self.free.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(victims.len())
    }

    /// Take the lowest free region, committing one if none is free.
    pub fn allocate_free_region(&self) -> Option<&HeapRegion> {
        let mut free_list = self.free_list.lock();
        if free_list.is_empty() && self.expand_locked(1, &mut free_list) == 0 {
            return None;
        }
        let index = free_list.remove_first()?;
        self.free.fetch_sub(1, Ordering::AcqRel);
        self.at(index as usize)
    }

    /// Take `count` contiguous regions, committing as needed.
    ///
    /// Returns the index of the first region; the caller sets the kinds.
    pub fn allocate_contiguous(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.max_regions {
            return None;
        }
        let mut free_list = self.free_list.lock();
        let usable = |i: usize| {
            #[allow(clippy::cast_possible_truncation)]
            let free = free_list.contains(i as u32);
            free || !self.is_region_committed(i)
        };

        let mut start = 0;
        let mut found = None;
        while start + count <= self.max_regions {
            match (start..start + count).find(|&i| !usable(i)) {
                Some(blocked) => start = blocked + 1,
                None => {
                    found = Some(start);
                    break;
                }
            }
        }
        let start = found?;

        for index in start..start + count {
            if !self.is_region_committed(index) {
                self.commit_region(index, &mut free_list);
            }
            #[allow(clippy::cast_possible_truncation)]
            let removed = free_list.remove(index as u32);
            debug_assert!(removed);
            self.free.fetch_sub(1, Ordering::AcqRel);
        }
        Some(start)
    }

    /// Return region `index` to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the region is not committed.
    pub fn free_region(&self, index: usize) {
        let region = self
            .at(index)
            .unwrap_or_else(|| panic!("freeing uncommitted region {index}"));
        region.reset();
        #[allow(clippy::cast_possible_truncation)]
        self.free_list.lock().add(index as u32);
        self.free.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for HeapRegionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegionManager")
            .field("heap_start", &self.heap_start)
            .field("region_bytes", &self.region_bytes)
            .field("max_regions", &self.max_regions)
            .field("committed", &self.num_committed_regions())
            .field("free", &self.num_free_regions())
            .finish_non_exhaustive()
    }
}
