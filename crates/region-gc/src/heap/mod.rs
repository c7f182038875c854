//! The region-based heap.
//!
//! One contiguous reservation is split into equal power-of-two regions.
//! Regular objects are bump allocated into a current allocation region;
//! objects larger than half a region are humongous and get a run of
//! dedicated contiguous regions.

pub mod region;
pub mod region_manager;
pub mod virtual_space;

use parking_lot::Mutex;

pub use region::{HeapRegion, RegionKind};
pub use region_manager::{FreeRegionList, HeapRegionManager};
pub use virtual_space::PageBasedVirtualSpace;

use crate::config::GcConfig;
use crate::error::GcError;
use crate::oop::{initialize_object, Address, HeapWord, ObjRef, ObjectShape, WORD_SIZE};

/// The heap: region table plus mutator allocation state.
pub struct Heap {
    regions: HeapRegionManager,
    alloc_region: Mutex<Option<usize>>,
    humongous_threshold_words: usize,
}

impl Heap {
    /// Reserve the heap and commit its initial regions.
    ///
    /// # Errors
    ///
    /// Fails if the reservation fails.
    pub fn new(config: &GcConfig) -> Result<Self, GcError> {
        let regions = HeapRegionManager::reserve(config.region_bytes, config.max_regions())?;
        regions.expand_by(config.initial_regions());
        Ok(Self {
            humongous_threshold_words: regions.region_words() / 2,
            regions,
            alloc_region: Mutex::new(None),
        })
    }

    /// The region table.
    #[must_use]
    pub const fn regions(&self) -> &HeapRegionManager {
        &self.regions
    }

    /// Start of the reserved heap.
    #[must_use]
    pub const fn start(&self) -> Address {
        self.regions.heap_start()
    }

    /// End of the reserved heap.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.regions.heap_end()
    }

    /// Whether `addr` lies in the reserved heap.
    #[must_use]
    pub fn is_in_reserved(&self, addr: Address) -> bool {
        self.regions.is_in_reserved(addr)
    }

    /// Objects strictly larger than this many words are humongous.
    #[must_use]
    pub const fn humongous_threshold_words(&self) -> usize {
        self.humongous_threshold_words
    }

    /// Whether an object of `words` words is humongous.
    #[must_use]
    pub const fn is_humongous(&self, words: usize) -> bool {
        words > self.humongous_threshold_words
    }

    fn word_index(&self, addr: Address) -> usize {
        assert!(
            addr.is_word_aligned() && self.is_in_reserved(addr),
            "address {addr} is not a heap word"
        );
        addr.words_since(self.start())
    }

    /// The heap word at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is unaligned or outside the reserved heap.
    #[must_use]
    pub fn word(&self, addr: Address) -> &HeapWord {
        &self.regions.words()[self.word_index(addr)]
    }

    /// The object whose header is at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is unaligned or outside the reserved heap.
    #[must_use]
    pub fn obj(&self, addr: Address) -> ObjRef<'_> {
        ObjRef::new(addr, &self.regions.words()[self.word_index(addr)..])
    }

    /// Address just past the object at `addr`.
    #[must_use]
    pub fn next_object(&self, addr: Address) -> Address {
        self.obj(addr).end()
    }

    /// The region containing `addr`; panics if none is committed there.
    #[must_use]
    pub fn region_of(&self, addr: Address) -> &HeapRegion {
        self.regions
            .region_containing(addr)
            .unwrap_or_else(|| panic!("address {addr} is not in a committed region"))
    }

    /// Allocate and initialize an object, or `None` if no space is left.
    pub fn allocate(&self, shape: ObjectShape) -> Option<Address> {
        let words = shape.size_words();
        let addr = if self.is_humongous(words) {
            self.allocate_humongous(words)?
        } else {
            self.allocate_small(words)?
        };
        let start = self.word_index(addr);
        initialize_object(&self.regions.words()[start..start + words], shape);
        Some(addr)
    }

    fn allocate_small(&self, words: usize) -> Option<Address> {
        let mut current = self.alloc_region.lock();
        if let Some(addr) = current
            .and_then(|index| self.regions.at(index))
            .and_then(|r| r.par_allocate(words))
        {
            return Some(addr);
        }
        let region = self.regions.allocate_free_region()?;
        region.set_old();
        *current = Some(region.index());
        region.par_allocate(words)
    }

    fn allocate_humongous(&self, words: usize) -> Option<Address> {
        let region_words = self.regions.region_words();
        let count = words.div_ceil(region_words);
        let first = self.regions.allocate_contiguous(count)?;
        let start = self.regions.region_bottom(first);
        let obj_end = start.add_words(words);
        #[allow(clippy::cast_possible_truncation)]
        for index in first..first + count {
            let region = self.regions.at(index)?;
            let top = obj_end.min(region.end());
            if index == first {
                region.set_starts_humongous(top);
            } else {
                region.set_continues_humongous(first as u32, top);
            }
        }
        Some(start)
    }

    /// Number of regions occupied by the humongous object starting in
    /// region `first`.
    #[must_use]
    pub fn humongous_region_count(&self, first: usize) -> usize {
        let region = self
            .regions
            .at(first)
            .filter(|r| r.is_starts_humongous())
            .unwrap_or_else(|| panic!("region {first} does not start a humongous object"));
        self.obj(region.bottom())
            .size_words()
            .div_ceil(self.regions.region_words())
    }

    /// Free the humongous object starting in region `first`.
    ///
    /// Returns the number of regions freed.
    pub fn free_humongous(&self, first: usize) -> usize {
        let count = self.humongous_region_count(first);
        for index in (first..first + count).rev() {
            self.regions.free_region(index);
        }
        count
    }

    /// Stop allocating into the current allocation region.
    pub fn retire_alloc_region(&self) {
        *self.alloc_region.lock() = None;
    }

    /// Start of the object containing `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not below top in a committed region.
    #[must_use]
    pub fn block_start(&self, addr: Address) -> Address {
        let region = self.region_of(addr);
        if region.is_humongous() {
            return self.regions.region_bottom(region.humongous_start_index());
        }
        assert!(addr < region.top(), "address {addr} above region top");
        let mut cur = region.bottom();
        loop {
            let next = self.next_object(cur);
            if next > addr {
                return cur;
            }
            cur = next;
        }
    }

    /// Call `f` for every object in `[region.bottom, limit)`.
    pub fn walk_objects(&self, region: &HeapRegion, limit: Address, mut f: impl FnMut(ObjRef<'_>)) {
        let mut cur = region.bottom();
        while cur < limit {
            let obj = self.obj(cur);
            cur = obj.end();
            f(obj);
        }
    }

    /// Copy `words` words from `src` to `dest`, lowest first. Overlap is
    /// allowed only when `dest` is below `src`.
    pub(crate) fn copy_words(&self, src: Address, dest: Address, words: usize) {
        debug_assert!(dest <= src, "sliding copy must move objects down");
        let all = self.regions.words();
        let s = self.word_index(src);
        let d = self.word_index(dest);
        for i in 0..words {
            all[d + i].store(all[s + i].load());
        }
    }

    /// Bytes below top across committed regions.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.regions.used_bytes()
    }

    /// Size of `shape` in bytes.
    #[must_use]
    pub const fn size_bytes(shape: ObjectShape) -> usize {
        shape.size_words() * WORD_SIZE
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("regions", &self.regions)
            .field("used_bytes", &self.used_bytes())
            .finish_non_exhaustive()
    }
}
