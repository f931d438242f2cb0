//! Page memory provider.
//!
//! The [`PageAllocator`] maps page memory through a [`MemoryBackend`],
//! enforces the heap limit, keeps a small pool of uncommitted regular pages
//! for reuse and hands pages that are not pooled to an unmapper queue, which
//! a background task drains.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::address::Address;
use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult};

/// A mapped, page-granular memory region backing one heap page.
pub struct PageMemory {
    mmap: Mmap,
}

impl PageMemory {
    /// Maps `size` bytes of fresh read/write memory.
    ///
    /// # Errors
    ///
    /// Returns the operating-system error if the mapping fails.
    pub fn map(size: usize) -> io::Result<Self> {
        let len = sys_alloc::round_to_granularity(size);
        let mmap = MmapOptions::new().len(len).map_anon()?;
        Ok(Self { mmap })
    }

    /// First byte of the region.
    #[must_use]
    pub fn start(&self) -> Address {
        Address::from_ptr(self.mmap.ptr())
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    /// Returns the physical memory to the OS, keeping the range mapped.
    ///
    /// # Errors
    ///
    /// Returns the operating-system error if the hint is rejected.
    pub fn discard(&self) -> io::Result<()> {
        self.mmap.discard(0, self.mmap.len())
    }
}

impl fmt::Debug for PageMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMemory")
            .field("start", &self.start())
            .field("size", &self.size())
            .finish()
    }
}

/// Source of page memory.
pub trait MemoryBackend: Send + Sync {
    /// Maps a region of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if no memory can be obtained.
    fn map(&self, size: usize) -> io::Result<PageMemory>;

    /// Uncommits a region kept for reuse.
    ///
    /// # Errors
    ///
    /// Returns an error if the hint fails; the region stays usable.
    fn discard(&self, memory: &PageMemory) -> io::Result<()> {
        memory.discard()
    }

    /// Unmaps a region.
    fn free(&self, memory: PageMemory) {
        drop(memory);
    }
}

/// Backend that maps anonymous memory from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl MemoryBackend for SystemBackend {
    fn map(&self, size: usize) -> io::Result<PageMemory> {
        PageMemory::map(size)
    }
}

/// Requested page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// A regular page of the configured page size.
    Regular,
    /// A large-object page of at least this many bytes.
    Large(usize),
}

/// Memory returned by [`PageAllocator::allocate`].
#[derive(Debug)]
pub struct AllocatedPage {
    /// The region.
    pub memory: PageMemory,
    /// `true` if the region came out of the pool.
    pub pooled: bool,
}

/// Queue of regions waiting to be unmapped off the allocation path.
#[derive(Default)]
pub struct Unmapper {
    queue: Mutex<Vec<PageMemory>>,
}

impl Unmapper {
    fn push(&self, memory: PageMemory) {
        self.queue.lock().push(memory);
    }

    fn take(&self) -> Vec<PageMemory> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Number of queued regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Unmapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unmapper").field("queued", &self.len()).finish()
    }
}

/// Maps, pools and releases page memory within the heap limit.
pub struct PageAllocator {
    backend: Box<dyn MemoryBackend>,
    page_size: usize,
    max_heap_size: usize,
    pool_capacity: usize,
    committed: AtomicUsize,
    executable: AtomicUsize,
    pool: Mutex<Vec<PageMemory>>,
    unmapper: Unmapper,
}

impl PageAllocator {
    /// Creates an allocator for `config`.
    #[must_use]
    pub fn new(config: &HeapConfig, backend: Box<dyn MemoryBackend>) -> Self {
        Self {
            backend,
            page_size: config.page_size,
            max_heap_size: config.max_heap_size,
            pool_capacity: config.page_pool_size,
            committed: AtomicUsize::new(0),
            executable: AtomicUsize::new(0),
            pool: Mutex::new(Vec::new()),
            unmapper: Unmapper::default(),
        }
    }

    /// Regular page size.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Heap limit in bytes.
    #[must_use]
    pub const fn max_heap_size(&self) -> usize {
        self.max_heap_size
    }

    /// Bytes of page memory currently handed out.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Bytes of committed memory requested as executable.
    #[must_use]
    pub fn committed_executable(&self) -> usize {
        self.executable.load(Ordering::Acquire)
    }

    /// Number of pooled regular pages.
    #[must_use]
    pub fn pooled_pages(&self) -> usize {
        self.pool.lock().len()
    }

    /// Regions waiting to be unmapped.
    #[must_use]
    pub const fn unmapper(&self) -> &Unmapper {
        &self.unmapper
    }

    fn reserve(&self, size: usize) -> HeapResult<()> {
        self.committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |committed| {
                committed
                    .checked_add(size)
                    .filter(|&total| total <= self.max_heap_size)
            })
            .map(|_| ())
            .map_err(|committed| HeapError::OutOfMemory {
                requested: size,
                committed,
                limit: self.max_heap_size,
            })
    }

    /// Obtains memory for one page.
    ///
    /// # Errors
    ///
    /// [`HeapError::OutOfMemory`] if the page would exceed the heap limit,
    /// [`HeapError::Backend`] if the backend fails.
    pub fn allocate(&self, size: PageSize, executable: bool) -> HeapResult<AllocatedPage> {
        let bytes = match size {
            PageSize::Regular => self.page_size,
            PageSize::Large(bytes) => sys_alloc::round_to_granularity(bytes),
        };
        if bytes == 0 {
            return Err(HeapError::InvalidSize(0));
        }
        self.reserve(bytes)?;

        let pooled = if size == PageSize::Regular {
            self.pool.lock().pop()
        } else {
            None
        };
        let (memory, pooled) = match pooled {
            Some(memory) => (memory, true),
            None => match self.backend.map(bytes) {
                Ok(memory) => (memory, false),
                Err(err) => {
                    self.committed.fetch_sub(bytes, Ordering::AcqRel);
                    return Err(HeapError::Backend(err));
                }
            },
        };
        let actual = memory.size();
        if actual != bytes {
            // Backends may round up; account for what was really mapped.
            if actual > bytes {
                self.committed.fetch_add(actual - bytes, Ordering::AcqRel);
            } else {
                self.committed.fetch_sub(bytes - actual, Ordering::AcqRel);
            }
        }
        if executable {
            self.executable.fetch_add(actual, Ordering::AcqRel);
        }
        Ok(AllocatedPage { memory, pooled })
    }

    /// Gives page memory back. Regular pages are uncommitted and pooled
    /// while the pool has room; everything else is queued for unmapping.
    /// Returns `true` if the memory was pooled.
    pub fn release(&self, memory: PageMemory, regular: bool, executable: bool) -> bool {
        let size = memory.size();
        self.committed.fetch_sub(size, Ordering::AcqRel);
        if executable {
            self.executable.fetch_sub(size, Ordering::AcqRel);
        }
        if regular && size == self.page_size {
            let mut pool = self.pool.lock();
            if pool.len() < self.pool_capacity && self.backend.discard(&memory).is_ok() {
                pool.push(memory);
                return true;
            }
        }
        self.unmapper.push(memory);
        false
    }

    /// Unmaps every queued region. Returns how many were freed.
    pub fn free_queued(&self) -> usize {
        let queued = self.unmapper.take();
        let count = queued.len();
        for memory in queued {
            self.backend.free(memory);
        }
        count
    }

    /// Unmaps queued and pooled regions.
    pub fn tear_down(&self) -> usize {
        let pooled = std::mem::take(&mut *self.pool.lock());
        let count = pooled.len();
        for memory in pooled {
            self.backend.free(memory);
        }
        count + self.free_queued()
    }
}

impl fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("page_size", &self.page_size)
            .field("max_heap_size", &self.max_heap_size)
            .field("committed", &self.committed())
            .field("pooled", &self.pooled_pages())
            .field("unmapper", &self.unmapper)
            .finish_non_exhaustive()
    }
}
