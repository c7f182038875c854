//! Low-level virtual memory primitives for the region heap.
//!
//! A heap reservation is a single anonymous mapping. Regions inside it are
//! committed and uncommitted page-by-page by the collector; this crate only
//! provides the OS calls behind that bookkeeping.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A handle to a reserved address range.
///
/// The range is readable and writable for its whole lifetime and is released
/// when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the physical pages backing `[offset, offset + len)` to the OS.
    ///
    /// The range stays addressable. Returns `true` if the range is guaranteed
    /// to read as zeros afterwards, `false` if its contents are unspecified.
    ///
    /// `offset` and `len` must be multiples of [`page_size`].
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<bool> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "decommit range must be page aligned",
            ));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "decommit range exceeds mapping",
            ));
        }
        if len == 0 {
            return Ok(true);
        }
        // SAFETY: the range was checked to lie inside this mapping.
        unsafe { self.inner.decommit(offset, len) }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets whether to skip reserving swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`. Heap reservations set this so that
    /// reserving a large heap does not count against overcommit limits.
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled memory map.
    ///
    /// # Safety
    ///
    /// The returned mapping owns its memory; pointers derived from
    /// [`Mmap::ptr`] must not outlive it.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe { os::MmapInner::map_anon(self.len, self.no_reserve)? };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_anon()
                .expect("failed to map")
        };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            assert_eq!(ptr::read_volatile(ptr), 0);
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_decommit_keeps_range_addressable() {
        let page = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(page * 4)
                .no_reserve(true)
                .map_anon()
                .expect("failed to map")
        };

        let second = unsafe { mmap.ptr().add(page) };
        unsafe { ptr::write_volatile(second, 7) };

        let zeroed = mmap.decommit(page, page).expect("decommit failed");
        let value = unsafe { ptr::read_volatile(second) };
        if zeroed {
            assert_eq!(value, 0);
        }

        unsafe { ptr::write_volatile(second, 9) };
        assert_eq!(unsafe { ptr::read_volatile(second) }, 9);
    }

    #[test]
    fn test_decommit_rejects_bad_ranges() {
        let page = page_size();
        let mmap = unsafe { MmapOptions::new().len(page * 2).map_anon().unwrap() };

        assert!(mmap.decommit(1, page).is_err());
        assert!(mmap.decommit(page, page * 2).is_err());
        assert!(mmap.decommit(0, 0).unwrap());
    }

    #[test]
    fn test_zero_length_rejected() {
        let result = unsafe { MmapOptions::new().map_anon() };
        assert!(result.is_err());
    }
}
