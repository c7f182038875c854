use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Alignment of `VirtualAlloc` reservations under Miri's allocator shim.
#[cfg(miri)]
const MIRI_GRANULARITY: usize = 64 * 1024;

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new committed read/write mapping.
    pub unsafe fn map_anon(len: usize, _no_reserve: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            // Miri doesn't support VirtualAlloc, use std::alloc
            let align = MIRI_GRANULARITY;
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            let ptr = VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);

            if ptr.is_null() {
                return Err(Error::last_os_error());
            }

            Ok(Self { ptr, len })
        }
    }

    /// Decommits and immediately recommits a sub-range so it stays addressable.
    ///
    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside the mapping and be page aligned.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<bool> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        #[cfg(miri)]
        {
            unsafe { ptr::write_bytes(addr, 0, len) };
            Ok(true)
        }
        #[cfg(not(miri))]
        {
            let addr = addr.cast::<std::ffi::c_void>();
            if unsafe { VirtualFree(addr, len, MEM_DECOMMIT) } == 0 {
                return Err(Error::last_os_error());
            }
            if unsafe { VirtualAlloc(addr, len, MEM_COMMIT, PAGE_READWRITE) }.is_null() {
                return Err(Error::last_os_error());
            }
            // Freshly committed pages are zero-filled.
            Ok(true)
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    let align = MIRI_GRANULARITY;
                    if let Ok(layout) = Layout::from_size_align(self.len, align) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
