//! Page-granular commit bookkeeping over the reserved heap range.

use sys_alloc::{Mmap, MmapOptions};

use crate::error::GcError;
use crate::gc::mark::bitmap::AtomicBitmap;
use crate::oop::{Address, HeapWord, WORD_SIZE};

/// The reserved heap range, committed and uncommitted in pages.
///
/// The whole reservation is addressable for its lifetime. Uncommitting a
/// page returns its physical memory to the OS; a later commit reports
/// whether the page is known to read as zeros. Pages that were used and then
/// uncommitted on a platform that does not zero them are tracked as dirty.
pub struct PageBasedVirtualSpace {
    mmap: Mmap,
    page_size: usize,
    committed: AtomicBitmap,
    dirty: AtomicBitmap,
}

impl PageBasedVirtualSpace {
    /// Reserve `bytes` (rounded up to whole pages).
    ///
    /// # Errors
    ///
    /// Returns [`GcError::ReserveFailed`] if the OS refuses the mapping.
    pub fn reserve(bytes: usize) -> Result<Self, GcError> {
        let page_size = sys_alloc::page_size();
        let len = bytes.div_ceil(page_size) * page_size;
        // SAFETY: the mapping is owned by `self` and every pointer derived
        // from it is bounded by `self`'s lifetime through `words()`.
        let mmap = unsafe { MmapOptions::new().len(len).no_reserve(true).map_anon() }
            .map_err(GcError::ReserveFailed)?;
        let pages = len / page_size;
        Ok(Self {
            mmap,
            page_size,
            committed: AtomicBitmap::new(pages),
            dirty: AtomicBitmap::new(pages),
        })
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start of the reservation.
    #[must_use]
    pub fn low(&self) -> Address {
        Address::new(self.mmap.ptr() as usize)
    }

    /// End of the reservation.
    #[must_use]
    pub fn high(&self) -> Address {
        self.low().add_bytes(self.mmap.len())
    }

    /// Reserved size in bytes.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.mmap.len()
    }

    /// Number of pages in the reservation.
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.committed.size()
    }

    /// The reservation viewed as heap words.
    #[must_use]
    pub fn words(&self) -> &[HeapWord] {
        // SAFETY: the mapping is readable and writable for its whole length,
        // page aligned, and lives as long as `self`. `HeapWord` is a
        // transparent atomic, so shared access from many threads is sound.
        unsafe {
            std::slice::from_raw_parts(
                self.mmap.ptr().cast::<HeapWord>(),
                self.mmap.len() / WORD_SIZE,
            )
        }
    }

    /// Whether page `page` is committed.
    #[must_use]
    pub fn is_committed(&self, page: usize) -> bool {
        self.committed.at(page)
    }

    /// Whether every page in `[start_page, start_page + count)` is committed.
    #[must_use]
    pub fn is_area_committed(&self, start_page: usize, count: usize) -> bool {
        (start_page..start_page + count).all(|page| self.committed.at(page))
    }

    /// Whether no page in `[start_page, start_page + count)` is committed.
    #[must_use]
    pub fn is_area_uncommitted(&self, start_page: usize, count: usize) -> bool {
        self.committed.next_set_bit(start_page, start_page + count) == start_page + count
    }

    /// Number of committed pages.
    #[must_use]
    pub fn committed_pages(&self) -> usize {
        self.committed.count_ones()
    }

    /// Commit pages `[start_page, start_page + count)`.
    ///
    /// Returns `true` if every page in the range reads as zeros.
    ///
    /// # Panics
    ///
    /// Panics if any page in the range is already committed.
    pub fn commit(&self, start_page: usize, count: usize) -> bool {
        let end = start_page + count;
        let mut zero_filled = true;
        for page in start_page..end {
            assert!(!self.committed.at(page), "page {page} already committed");
            if self.dirty.at(page) {
                zero_filled = false;
            }
        }
        self.committed.set_range(start_page, end, true);
        self.dirty.clear_range(start_page, end);
        zero_filled
    }

    /// Uncommit pages `[start_page, start_page + count)`.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::CommitFailed`] if the OS call fails.
    ///
    /// # Panics
    ///
    /// Panics if any page in the range is not committed.
    pub fn uncommit(&self, start_page: usize, count: usize) -> Result<(), GcError> {
        let end = start_page + count;
        for page in start_page..end {
            assert!(self.committed.at(page), "page {page} not committed");
        }
        let zeroed = self
            .mmap
            .decommit(start_page * self.page_size, count * self.page_size)
            .map_err(GcError::CommitFailed)?;
        self.committed.clear_range(start_page, end);
        if !zeroed {
            self.dirty.set_range(start_page, end, true);
        }
        Ok(())
    }

    /// Page index containing byte offset `offset` from [`low`](Self::low).
    #[must_use]
    pub const fn page_for_offset(&self, offset: usize) -> usize {
        offset / self.page_size
    }
}

impl std::fmt::Debug for PageBasedVirtualSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBasedVirtualSpace")
            .field("low", &self.low())
            .field("high", &self.high())
            .field("page_size", &self.page_size)
            .field("committed_pages", &self.committed_pages())
            .finish()
    }
}
