//! Anonymous memory mappings used as heap page backing.
//!
//! This crate is the operating-system edge of the heap: it reserves and
//! commits anonymous read/write memory, hands out page-granular regions and
//! lets callers give physical memory back to the OS (`discard`) while keeping
//! the virtual range reserved, which is how pooled heap pages are uncommitted.

use std::io;
use std::ops::Range;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
/// Mapping lengths should be multiples of this value.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a multiple of [`allocation_granularity`].
#[must_use]
pub fn round_to_granularity(len: usize) -> usize {
    let granularity = allocation_granularity();
    len.div_ceil(granularity) * granularity
}

/// A handle to an anonymous memory mapping.
///
/// The region is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the mapped address range.
    pub fn as_range(&self) -> Range<usize> {
        let start = self.ptr() as usize;
        start..start + self.len()
    }

    /// Returns `true` if `addr` lies inside the mapping.
    pub fn contains(&self, addr: usize) -> bool {
        self.as_range().contains(&addr)
    }

    /// Releases the physical memory behind `offset..offset + len` while
    /// keeping the virtual range mapped.
    ///
    /// The contents of the range are unspecified afterwards. On Linux the
    /// pages read back as zero; on Windows the old contents may survive
    /// until the OS reclaims them.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is not page aligned or exceeds the
    /// mapping, or the OS error reported by the underlying call.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "discard range must be page aligned",
            ));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "discard range exceeds mapping",
            ));
        }
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range was checked to lie inside this mapping.
        unsafe { self.inner.discard(offset, len) }
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: the mapping is plain memory owned by this handle; access to its
// contents is synchronised by whoever holds the pointer.
unsafe impl Send for Mmap {}
// SAFETY: see `Send`.
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
}

impl MmapOptions {
    /// Creates options with length 0. A length must be set before mapping.
    pub const fn new() -> Self {
        Self { len: 0 }
    }

    /// Sets the length of the mapping in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Creates an anonymous read/write mapping placed by the OS.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, or the OS error when the
    /// mapping cannot be created.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        // SAFETY: the OS chooses the address, so no existing memory is replaced.
        let inner = unsafe { os::MmapInner::map_anon(self.len)? };
        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}
