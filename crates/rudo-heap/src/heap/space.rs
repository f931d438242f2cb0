//! Spaces: sets of pages with a common allocation policy.
//!
//! A [`Space`] owns regular pages and hands out memory through its
//! [`FreeList`]. Mutator threads carve [`LinearAllocationArea`]s out of free
//! blocks and bump-allocate inside them. The [`LargeObjectSpace`] gives each
//! object above the regular size limit a page of its own.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::address::{Address, PageId, SlotIndex};
use crate::config::HeapConfig;
use crate::error::HeapResult;
use crate::heap::free_list::{FreeBlock, FreeList, PageFreeItems};
use crate::heap::page::{Page, PageFlags, PageTable};
use crate::heap::page_allocator::{PageAllocator, PageSize};

/// Space a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpaceKind {
    /// Young generation.
    New = 0,
    /// Old generation, regular pages.
    Old = 1,
    /// Old generation, one object per page.
    Large = 2,
}

impl SpaceKind {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            2 => Self::Large,
            _ => Self::Old,
        }
    }

    /// Short name used in events.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Old => "old",
            Self::Large => "large",
        }
    }
}

/// Maps a fresh page and registers it in the page table.
pub(crate) fn create_page(
    table: &PageTable,
    allocator: &PageAllocator,
    size: PageSize,
    kind: SpaceKind,
    flags: PageFlags,
) -> HeapResult<Arc<Page>> {
    let executable = flags.bits() & PageFlags::EXECUTABLE.bits() != 0;
    let allocated = allocator.allocate(size, executable)?;
    let pooled = allocated.pooled;
    let page = table.insert_with(|id| Page::new(id, allocated.memory, kind, flags));
    crate::tracing::log_page_allocated(page.id().0, page.size(), pooled);
    Ok(page)
}

/// Unregisters a page and gives its memory back to the allocator.
pub(crate) fn release_page(table: &PageTable, allocator: &PageAllocator, page: &Page) {
    table.remove(page.id());
    if let Some(memory) = page.take_memory() {
        let size = memory.size();
        let pooled = allocator.release(
            memory,
            !page.is_large(),
            page.has_flag(PageFlags::EXECUTABLE),
        );
        crate::tracing::log_page_released(page.id().0, size, pooled);
    }
}

/// Bump-pointer region carved from a free block.
pub struct LinearAllocationArea {
    start: Address,
    top: Address,
    limit: Address,
    page: Arc<Page>,
}

impl LinearAllocationArea {
    /// Creates an area covering `block`.
    #[must_use]
    pub fn new(block: FreeBlock) -> Self {
        Self {
            start: block.start,
            top: block.start,
            limit: block.start.offset(block.size),
            page: block.page,
        }
    }

    /// Bumps `size` bytes off the area.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if self.limit.distance_from(self.top) < size {
            return None;
        }
        let result = self.top;
        self.top = self.top.offset(size);
        Some(result)
    }

    /// Returns `true` if `addr` was or will be bumped from this area.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.limit
    }

    /// Next address to hand out.
    #[must_use]
    pub const fn top(&self) -> Address {
        self.top
    }

    /// End of the area.
    #[must_use]
    pub const fn limit(&self) -> Address {
        self.limit
    }

    /// Bytes left.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.limit.distance_from(self.top)
    }

    /// Page the area lies on.
    #[must_use]
    pub const fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl fmt::Debug for LinearAllocationArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearAllocationArea")
            .field("start", &self.start)
            .field("top", &self.top)
            .field("limit", &self.limit)
            .field("page", &self.page.id())
            .finish()
    }
}

/// A paged, free-list backed space.
pub struct Space {
    kind: SpaceKind,
    capacity: usize,
    page_size: usize,
    free_list: Mutex<FreeList>,
    pages: Mutex<BTreeMap<PageId, Arc<Page>>>,
    committed: AtomicUsize,
    allocated_since_gc: AtomicUsize,
}

impl Space {
    /// Creates an empty space. `capacity` bounds the committed bytes the
    /// space may grow to by itself.
    #[must_use]
    pub fn new(kind: SpaceKind, config: &HeapConfig, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            page_size: config.page_size,
            free_list: Mutex::new(FreeList::new(config.free_list_strategy)),
            pages: Mutex::new(BTreeMap::new()),
            committed: AtomicUsize::new(0),
            allocated_since_gc: AtomicUsize::new(0),
        }
    }

    /// Kind of this space.
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Bytes of pages owned by this space.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Growth bound of this space.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` if another page would exceed the capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.committed() + self.page_size > self.capacity
    }

    /// Bytes available in the free list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_list.lock().available()
    }

    /// Bytes lost to small fragments.
    #[must_use]
    pub fn wasted(&self) -> usize {
        self.free_list.lock().wasted()
    }

    /// Object bytes allocated since the last collection of this space.
    #[must_use]
    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc.load(Ordering::Acquire)
    }

    pub(crate) fn note_allocated(&self, bytes: usize) {
        self.allocated_since_gc.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn reset_allocated(&self) {
        self.allocated_since_gc.store(0, Ordering::Release);
    }

    /// Snapshot of the pages, in id order.
    #[must_use]
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.lock().values().cloned().collect()
    }

    /// Number of pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns `true` if the space owns the page.
    #[must_use]
    pub fn owns(&self, id: PageId) -> bool {
        self.pages.lock().contains_key(&id)
    }

    pub(crate) fn free_list(&self) -> MutexGuard<'_, FreeList> {
        self.free_list.lock()
    }

    /// Takes a free block of at least `min` bytes.
    pub fn allocate_block(&self, min: usize) -> Option<FreeBlock> {
        self.free_list.lock().allocate(min)
    }

    /// Returns a range to the free list. Returns the bytes wasted.
    pub fn free(&self, page: &Arc<Page>, start: Address, size: usize) -> usize {
        self.free_list.lock().free(page, start, size)
    }

    /// Maps a new page, unless that would exceed the capacity. The whole
    /// page is added to the free list.
    ///
    /// # Errors
    ///
    /// Propagates allocator failures.
    pub fn expand(&self, table: &PageTable, allocator: &PageAllocator) -> HeapResult<Option<Arc<Page>>> {
        if self.is_at_capacity() {
            return Ok(None);
        }
        let flags = match self.kind {
            SpaceKind::New => PageFlags::YOUNG,
            SpaceKind::Old => PageFlags::EMPTY,
            SpaceKind::Large => PageFlags::LARGE,
        };
        let page = create_page(table, allocator, PageSize::Regular, self.kind, flags)?;
        self.add_page(Arc::clone(&page));
        self.free(&page, page.start(), page.size());
        Ok(Some(page))
    }

    pub(crate) fn add_page(&self, page: Arc<Page>) {
        page.set_space(self.kind);
        self.committed.fetch_add(page.size(), Ordering::AcqRel);
        self.free_list.lock().add_page(Arc::clone(&page));
        self.pages.lock().insert(page.id(), page);
    }

    /// Forgets a page. The caller releases its memory.
    pub(crate) fn remove_page(&self, id: PageId) -> Option<Arc<Page>> {
        let page = self.pages.lock().remove(&id)?;
        self.free_list.lock().remove_page(id);
        self.committed.fetch_sub(page.size(), Ordering::AcqRel);
        Some(page)
    }

    /// Detaches a page together with its free items.
    pub(crate) fn take_page(&self, id: PageId) -> Option<(Arc<Page>, Option<PageFreeItems>)> {
        let page = self.pages.lock().remove(&id)?;
        let items = self.free_list.lock().take_page(id);
        self.committed.fetch_sub(page.size(), Ordering::AcqRel);
        Some((page, items))
    }

    /// Attaches a page detached from another space.
    pub(crate) fn adopt_page(&self, page: Arc<Page>, items: Option<PageFreeItems>) {
        page.set_space(self.kind);
        self.committed.fetch_add(page.size(), Ordering::AcqRel);
        {
            let mut free_list = self.free_list.lock();
            match items {
                Some(items) => free_list.adopt_page(items),
                None => free_list.add_page(Arc::clone(&page)),
            }
        }
        self.pages.lock().insert(page.id(), page);
    }

    /// Unregisters every page and returns them.
    pub(crate) fn drain_pages(&self) -> Vec<Arc<Page>> {
        let pages = std::mem::take(&mut *self.pages.lock());
        self.free_list.lock().clear();
        self.committed.store(0, Ordering::Release);
        pages.into_values().collect()
    }
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("kind", &self.kind)
            .field("pages", &self.page_count())
            .field("committed", &self.committed())
            .field("free_list", &*self.free_list.lock())
            .finish_non_exhaustive()
    }
}

/// Space of single-object pages.
#[derive(Default)]
pub struct LargeObjectSpace {
    pages: Mutex<BTreeMap<PageId, Arc<Page>>>,
    committed: AtomicUsize,
    objects_size: AtomicUsize,
    allocated_since_gc: AtomicUsize,
}

impl LargeObjectSpace {
    /// Creates an empty space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a page for one object of `size` bytes and returns the page and
    /// the object address.
    ///
    /// # Errors
    ///
    /// Propagates allocator failures.
    pub fn allocate(
        &self,
        table: &PageTable,
        allocator: &PageAllocator,
        size: usize,
        executable: bool,
    ) -> HeapResult<(Arc<Page>, Address)> {
        let mut flags = PageFlags::LARGE;
        if executable {
            flags = flags.union(PageFlags::EXECUTABLE);
        }
        let page = create_page(table, allocator, PageSize::Large(size), SpaceKind::Large, flags)?;
        page.object_starts().set(SlotIndex(0));
        page.add_allocated_bytes(size);
        self.committed.fetch_add(page.size(), Ordering::AcqRel);
        self.objects_size.fetch_add(size, Ordering::AcqRel);
        self.allocated_since_gc.fetch_add(size, Ordering::AcqRel);
        let start = page.start();
        self.pages.lock().insert(page.id(), Arc::clone(&page));
        Ok((page, start))
    }

    /// Bytes of pages owned by this space.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Bytes of the objects on those pages.
    #[must_use]
    pub fn objects_size(&self) -> usize {
        self.objects_size.load(Ordering::Acquire)
    }

    /// Object bytes allocated since the last collection.
    #[must_use]
    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc.load(Ordering::Acquire)
    }

    pub(crate) fn reset_allocated(&self) {
        self.allocated_since_gc.store(0, Ordering::Release);
    }

    /// Snapshot of the pages.
    #[must_use]
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.lock().values().cloned().collect()
    }

    /// Number of objects.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Forgets a page whose object died. The caller releases its memory.
    pub(crate) fn remove_page(&self, id: PageId) -> Option<Arc<Page>> {
        let page = self.pages.lock().remove(&id)?;
        self.committed.fetch_sub(page.size(), Ordering::AcqRel);
        self.objects_size
            .fetch_sub(page.allocated_bytes(), Ordering::AcqRel);
        Some(page)
    }

    /// Unregisters every page and returns them.
    pub(crate) fn drain_pages(&self) -> Vec<Arc<Page>> {
        let pages = std::mem::take(&mut *self.pages.lock());
        self.committed.store(0, Ordering::Release);
        self.objects_size.store(0, Ordering::Release);
        pages.into_values().collect()
    }
}

impl fmt::Debug for LargeObjectSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LargeObjectSpace")
            .field("pages", &self.page_count())
            .field("committed", &self.committed())
            .field("objects_size", &self.objects_size())
            .finish_non_exhaustive()
    }
}
