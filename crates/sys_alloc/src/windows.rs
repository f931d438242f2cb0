use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

#[cfg(not(miri))]
fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    {
        match system_info().dwAllocationGranularity as usize {
            0 => 65536,
            gran => gran,
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    {
        match system_info().dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Reserves and commits `len` bytes of read/write memory.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            let layout = Layout::from_size_align(len, allocation_granularity())
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc_zeroed(layout) };
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
            let ptr = unsafe {
                VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
            };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    /// Marks the range as no longer needed so the OS may drop its pages.
    pub unsafe fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = (offset, len);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let start = unsafe { self.ptr.cast::<u8>().add(offset) };
            let ptr = unsafe {
                VirtualAlloc(start.cast::<std::ffi::c_void>(), len, MEM_RESET, PAGE_READWRITE)
            };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(())
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
        if self.len == 0 {
            return;
        }
        #[cfg(miri)]
        unsafe {
            use std::alloc::{dealloc, Layout};
            let layout = Layout::from_size_align_unchecked(self.len, allocation_granularity());
            dealloc(self.ptr.cast::<u8>(), layout);
        }
        #[cfg(not(miri))]
        unsafe {
            // MEM_RELEASE requires a zero size.
            VirtualFree(self.ptr, 0, MEM_RELEASE);
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
