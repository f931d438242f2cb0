//! Size-segregated free lists over swept pages.
//!
//! Free memory is threaded through the pages themselves: a free block stores
//! the address of the next block of the same category in its first word and
//! its own size in the second. Blocks are grouped per page and per size
//! category, so a page can be taken off the allocation path as a whole
//! (evacuation candidates) and put back later without touching its memory.
//!
//! Four category layouts are available, see [`FreeListStrategy`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::address::{Address, PageId, WORD_SIZE};
use crate::heap::page::Page;

/// Smallest block that can carry the intrusive link. Anything smaller is
/// counted as wasted.
pub const MIN_BLOCK_SIZE: usize = 16;

const LEGACY_BOUNDS: &[usize] = &[16, 88, 256, 2048, 16384, 65536];
const FAST_ALLOC_BOUNDS: &[usize] = &[16, 1024, 8192, 65536];
const MANY_BOUNDS: &[usize] = &[
    16, 32, 48, 64, 80, 96, 128, 160, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 6144,
    8192, 16384, 32768, 65536, 131_072,
];

/// How free blocks are categorized and searched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FreeListStrategy {
    /// Six coarse categories. The request's own category is searched for the
    /// best fitting block before larger categories are consulted.
    Legacy,
    /// Four categories searched from the largest down, taking the first
    /// block. Fast at the price of fragmentation.
    FastAlloc,
    /// Many fine-grained categories. The next larger categories are tried
    /// first (their head always fits), then the request's own category is
    /// searched first-fit.
    Many,
    /// Like [`Many`](Self::Many), with a bitmask of non-empty categories so
    /// empty categories are skipped in one instruction.
    #[default]
    ManyCached,
}

impl FreeListStrategy {
    /// Lower size bound of every category.
    #[must_use]
    pub const fn category_bounds(self) -> &'static [usize] {
        match self {
            Self::Legacy => LEGACY_BOUNDS,
            Self::FastAlloc => FAST_ALLOC_BOUNDS,
            Self::Many | Self::ManyCached => MANY_BOUNDS,
        }
    }

    /// Category a block of `size` bytes belongs to.
    #[must_use]
    pub fn category_for(self, size: usize) -> usize {
        let bounds = self.category_bounds();
        bounds.partition_point(|&bound| bound <= size).saturating_sub(1)
    }
}

impl FromStr for FreeListStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "fast-alloc" | "fast_alloc" | "fastalloc" => Ok(Self::FastAlloc),
            "many" => Ok(Self::Many),
            "many-cached" | "many_cached" | "manycached" => Ok(Self::ManyCached),
            other => Err(format!("unknown free list strategy: {other}")),
        }
    }
}

impl fmt::Display for FreeListStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Legacy => "legacy",
            Self::FastAlloc => "fast-alloc",
            Self::Many => "many",
            Self::ManyCached => "many-cached",
        })
    }
}

/// A block handed out by [`FreeList::allocate`].
#[derive(Debug, Clone)]
pub struct FreeBlock {
    /// First byte of the block.
    pub start: Address,
    /// Block size in bytes. At least the requested size.
    pub size: usize,
    /// Page the block lies on.
    pub page: Arc<Page>,
}

#[derive(Debug, Clone, Copy)]
struct Category {
    head: Address,
    available: usize,
    length: usize,
}

impl Category {
    const EMPTY: Self = Self {
        head: Address::NULL,
        available: 0,
        length: 0,
    };
}

/// The free items of one page, detached from a list.
///
/// Produced by [`FreeList::take_page`] and consumed by
/// [`FreeList::adopt_page`] when a page moves between spaces.
pub struct PageFreeItems {
    page: Arc<Page>,
    categories: Vec<Category>,
    evicted: bool,
    wasted: usize,
}

impl PageFreeItems {
    fn new(page: Arc<Page>, categories: usize) -> Self {
        Self {
            page,
            categories: vec![Category::EMPTY; categories],
            evicted: false,
            wasted: 0,
        }
    }

    fn available(&self) -> usize {
        self.categories.iter().map(|c| c.available).sum()
    }

    /// Page the items belong to.
    #[must_use]
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl fmt::Debug for PageFreeItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFreeItems")
            .field("page", &self.page.id())
            .field("available", &self.available())
            .field("evicted", &self.evicted)
            .field("wasted", &self.wasted)
            .finish()
    }
}

// SAFETY (all block accessors): `block` is the start of a free block of at
// least `MIN_BLOCK_SIZE` bytes on a mapped page. Only the owning free list
// touches free memory.
unsafe fn read_next(block: Address) -> Address {
    Address::new(unsafe { block.as_ptr::<usize>().read() })
}

unsafe fn read_size(block: Address) -> usize {
    unsafe { block.offset(WORD_SIZE).as_ptr::<usize>().read() }
}

unsafe fn write_block(block: Address, next: Address, size: usize) {
    unsafe {
        block.as_ptr::<usize>().write(next.as_usize());
        block.offset(WORD_SIZE).as_ptr::<usize>().write(size);
    }
}

unsafe fn write_next(block: Address, next: Address) {
    unsafe { block.as_ptr::<usize>().write(next.as_usize()) };
}

/// Free list of one space.
pub struct FreeList {
    strategy: FreeListStrategy,
    entries: BTreeMap<PageId, PageFreeItems>,
    /// Per category, the non-evicted pages with at least one block in it.
    linked: Vec<BTreeSet<PageId>>,
    non_empty: u64,
    available: usize,
    wasted: usize,
}

impl FreeList {
    /// Creates an empty free list.
    #[must_use]
    pub fn new(strategy: FreeListStrategy) -> Self {
        let categories = strategy.category_bounds().len();
        Self {
            strategy,
            entries: BTreeMap::new(),
            linked: vec![BTreeSet::new(); categories],
            non_empty: 0,
            available: 0,
            wasted: 0,
        }
    }

    /// Strategy of this list.
    #[must_use]
    pub const fn strategy(&self) -> FreeListStrategy {
        self.strategy
    }

    fn categories(&self) -> usize {
        self.linked.len()
    }

    /// Bytes available for allocation, excluding evicted pages.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.available
    }

    /// Bytes lost to fragments smaller than [`MIN_BLOCK_SIZE`].
    #[must_use]
    pub const fn wasted(&self) -> usize {
        self.wasted
    }

    /// Number of pages with an entry in this list.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.entries.len()
    }

    /// Free bytes recorded for one page, evicted or not.
    #[must_use]
    pub fn page_available(&self, id: PageId) -> usize {
        self.entries.get(&id).map_or(0, PageFreeItems::available)
    }

    /// Returns `true` if the page's items are evicted.
    #[must_use]
    pub fn is_evicted(&self, id: PageId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.evicted)
    }

    /// Registers a page without free items.
    pub fn add_page(&mut self, page: Arc<Page>) {
        let categories = self.categories();
        self.entries
            .entry(page.id())
            .or_insert_with(|| PageFreeItems::new(page, categories));
    }

    /// Forgets a page and all its free items.
    pub fn remove_page(&mut self, id: PageId) -> Option<Arc<Page>> {
        let entry = self.take_page(id)?;
        Some(entry.page)
    }

    /// Adds `start..start + size` to the list. Returns the bytes wasted,
    /// which is `size` when the range is too small to hold a block.
    pub fn free(&mut self, page: &Arc<Page>, start: Address, size: usize) -> usize {
        debug_assert!(page.contains(start));
        debug_assert!(start.is_aligned(WORD_SIZE));
        if size == 0 {
            return 0;
        }
        self.add_page(Arc::clone(page));
        let Some(entry) = self.entries.get_mut(&page.id()) else {
            return 0;
        };
        if size < MIN_BLOCK_SIZE {
            entry.wasted += size;
            self.wasted += size;
            return size;
        }

        let index = self.strategy.category_for(size);
        let category = &mut entry.categories[index];
        unsafe { write_block(start, category.head, size) };
        category.head = start;
        category.available += size;
        category.length += 1;
        if !entry.evicted {
            self.available += size;
            self.link(index, page.id());
        }
        0
    }

    fn link(&mut self, index: usize, id: PageId) {
        self.linked[index].insert(id);
        self.non_empty |= 1 << index;
    }

    fn unlink(&mut self, index: usize, id: PageId) {
        self.linked[index].remove(&id);
        if self.linked[index].is_empty() {
            self.non_empty &= !(1 << index);
        }
    }

    /// Takes a block of at least `min` bytes.
    pub fn allocate(&mut self, min: usize) -> Option<FreeBlock> {
        let min = min.max(MIN_BLOCK_SIZE);
        let own = self.strategy.category_for(min);
        match self.strategy {
            FreeListStrategy::Legacy => self
                .search_category(own, min, true)
                .or_else(|| self.take_from_larger(own)),
            FreeListStrategy::FastAlloc => self
                .take_from_largest(own)
                .or_else(|| self.search_category(own, min, false)),
            FreeListStrategy::Many => self
                .take_from_larger(own)
                .or_else(|| self.search_category(own, min, false)),
            FreeListStrategy::ManyCached => self
                .take_from_larger_cached(own)
                .or_else(|| self.search_category(own, min, false)),
        }
    }

    /// Heads of categories above `own` always fit.
    fn take_from_larger(&mut self, own: usize) -> Option<FreeBlock> {
        let index = (own + 1..self.categories()).find(|&i| !self.linked[i].is_empty())?;
        self.take_head(index)
    }

    fn take_from_larger_cached(&mut self, own: usize) -> Option<FreeBlock> {
        let above = if own + 1 >= 64 {
            0
        } else {
            self.non_empty & !((1u64 << (own + 1)) - 1)
        };
        if above == 0 {
            return None;
        }
        self.take_head(above.trailing_zeros() as usize)
    }

    fn take_from_largest(&mut self, own: usize) -> Option<FreeBlock> {
        let index = (own + 1..self.categories())
            .rev()
            .find(|&i| !self.linked[i].is_empty())?;
        self.take_head(index)
    }

    fn take_head(&mut self, index: usize) -> Option<FreeBlock> {
        let id = *self.linked[index].first()?;
        let entry = self.entries.get_mut(&id)?;
        let category = &mut entry.categories[index];
        let start = category.head;
        debug_assert!(!start.is_null());
        let (next, size) = unsafe { (read_next(start), read_size(start)) };
        category.head = next;
        category.available -= size;
        category.length -= 1;
        let emptied = category.length == 0;
        let page = Arc::clone(&entry.page);
        self.available -= size;
        if emptied {
            self.unlink(index, id);
        }
        Some(FreeBlock { start, size, page })
    }

    /// Walks category `index` for a block of at least `min` bytes. With
    /// `best_fit` the smallest such block of the first page that has one is
    /// taken, otherwise the first.
    fn search_category(&mut self, index: usize, min: usize, best_fit: bool) -> Option<FreeBlock> {
        let pages: Vec<PageId> = self.linked[index].iter().copied().collect();
        for id in pages {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let category = &mut entry.categories[index];

            // (previous, block, size) of the chosen block.
            let mut chosen: Option<(Address, Address, usize)> = None;
            let mut previous = Address::NULL;
            let mut block = category.head;
            while !block.is_null() {
                let (next, size) = unsafe { (read_next(block), read_size(block)) };
                if size >= min && chosen.is_none_or(|(_, _, best)| size < best) {
                    chosen = Some((previous, block, size));
                    if !best_fit || size == min {
                        break;
                    }
                }
                previous = block;
                block = next;
            }

            let Some((previous, block, size)) = chosen else {
                continue;
            };
            let next = unsafe { read_next(block) };
            if previous.is_null() {
                category.head = next;
            } else {
                unsafe { write_next(previous, next) };
            }
            category.available -= size;
            category.length -= 1;
            let emptied = category.length == 0;
            let page = Arc::clone(&entry.page);
            self.available -= size;
            if emptied {
                self.unlink(index, id);
            }
            return Some(FreeBlock {
                start: block,
                size,
                page,
            });
        }
        None
    }

    /// Takes a page's items off the allocation path. Returns the bytes
    /// evicted.
    pub fn evict_free_list_items(&mut self, id: PageId) -> usize {
        let Some(entry) = self.entries.get_mut(&id) else {
            return 0;
        };
        if entry.evicted {
            return 0;
        }
        entry.evicted = true;
        let evicted = entry.available();
        let occupied: Vec<usize> = entry
            .categories
            .iter()
            .enumerate()
            .filter(|(_, c)| c.length > 0)
            .map(|(i, _)| i)
            .collect();
        for index in occupied {
            self.unlink(index, id);
        }
        self.available -= evicted;
        evicted
    }

    /// Puts an evicted page's items back on the allocation path.
    pub fn relink(&mut self, id: PageId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if !entry.evicted {
            return;
        }
        entry.evicted = false;
        let restored = entry.available();
        let occupied: Vec<usize> = entry
            .categories
            .iter()
            .enumerate()
            .filter(|(_, c)| c.length > 0)
            .map(|(i, _)| i)
            .collect();
        for index in occupied {
            self.link(index, id);
        }
        self.available += restored;
    }

    /// Drops every free item of a page ahead of a resweep. Eviction state is
    /// kept.
    pub fn reset_page(&mut self, id: PageId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let evicted = entry.evicted;
        let available = entry.available();
        let wasted = std::mem::take(&mut entry.wasted);
        let occupied: Vec<usize> = entry
            .categories
            .iter()
            .enumerate()
            .filter(|(_, c)| c.length > 0)
            .map(|(i, _)| i)
            .collect();
        for category in &mut entry.categories {
            *category = Category::EMPTY;
        }
        if !evicted {
            for index in occupied {
                self.unlink(index, id);
            }
            self.available -= available;
        }
        self.wasted -= wasted;
    }

    /// Detaches a page with its free items.
    pub fn take_page(&mut self, id: PageId) -> Option<PageFreeItems> {
        let entry = self.entries.remove(&id)?;
        if !entry.evicted {
            for (index, category) in entry.categories.iter().enumerate() {
                if category.length > 0 {
                    self.unlink(index, id);
                }
            }
            self.available -= entry.available();
        }
        self.wasted -= entry.wasted;
        Some(entry)
    }

    /// Attaches a page detached from another list. Items are re-categorized
    /// when the strategies differ.
    pub fn adopt_page(&mut self, items: PageFreeItems) {
        let id = items.page.id();
        if items.categories.len() != self.categories() {
            let page = Arc::clone(&items.page);
            self.add_page(Arc::clone(&page));
            for category in &items.categories {
                let mut block = category.head;
                while !block.is_null() {
                    let (next, size) = unsafe { (read_next(block), read_size(block)) };
                    self.free(&page, block, size);
                    block = next;
                }
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.wasted += items.wasted;
            }
            self.wasted += items.wasted;
            if items.evicted {
                self.evict_free_list_items(id);
            }
            return;
        }

        if !items.evicted {
            for (index, category) in items.categories.iter().enumerate() {
                if category.length > 0 {
                    self.link(index, id);
                }
            }
            self.available += items.available();
        }
        self.wasted += items.wasted;
        self.entries.insert(id, items);
    }

    /// Iterates the free blocks of one page as `(start, size)`.
    pub fn page_blocks(&self, id: PageId) -> Vec<(Address, usize)> {
        let Some(entry) = self.entries.get(&id) else {
            return Vec::new();
        };
        let mut blocks = Vec::new();
        for category in &entry.categories {
            let mut block = category.head;
            while !block.is_null() {
                let (next, size) = unsafe { (read_next(block), read_size(block)) };
                blocks.push((block, size));
                block = next;
            }
        }
        blocks.sort_unstable_by_key(|(start, _)| *start);
        blocks
    }

    /// Forgets every page.
    pub fn clear(&mut self) {
        self.entries.clear();
        for set in &mut self.linked {
            set.clear();
        }
        self.non_empty = 0;
        self.available = 0;
        self.wasted = 0;
    }
}

impl fmt::Debug for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("strategy", &self.strategy)
            .field("pages", &self.entries.len())
            .field("available", &self.available)
            .field("wasted", &self.wasted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page::{PageFlags, PageTable};
    use crate::heap::page_allocator::{MemoryBackend, SystemBackend};
    use crate::heap::space::SpaceKind;

    fn new_page(table: &PageTable) -> Arc<Page> {
        let memory = SystemBackend.map(256 * 1024).unwrap();
        table.insert_with(|id| Page::new(id, memory, SpaceKind::Old, PageFlags::EMPTY))
    }

    #[test]
    fn test_category_for() {
        let s = FreeListStrategy::Legacy;
        assert_eq!(s.category_for(16), 0);
        assert_eq!(s.category_for(87), 0);
        assert_eq!(s.category_for(88), 1);
        assert_eq!(s.category_for(1 << 20), 5);
        let m = FreeListStrategy::ManyCached;
        assert_eq!(m.category_for(48), 2);
        assert_eq!(m.category_for(200), 8);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("legacy".parse(), Ok(FreeListStrategy::Legacy));
        assert_eq!("Fast-Alloc".parse(), Ok(FreeListStrategy::FastAlloc));
        assert_eq!("many".parse(), Ok(FreeListStrategy::Many));
        assert_eq!("many-cached".parse(), Ok(FreeListStrategy::ManyCached));
        assert!("best".parse::<FreeListStrategy>().is_err());
        assert_eq!(FreeListStrategy::FastAlloc.to_string(), "fast-alloc");
    }

    #[test]
    fn test_small_fragments_are_wasted() {
        let table = PageTable::new();
        let page = new_page(&table);
        let mut list = FreeList::new(FreeListStrategy::ManyCached);
        assert_eq!(list.free(&page, page.start(), 8), 8);
        assert_eq!(list.wasted(), 8);
        assert_eq!(list.available(), 0);
        assert!(list.allocate(8).is_none());
    }

    #[test]
    fn test_every_strategy_finds_fitting_blocks() {
        for strategy in [
            FreeListStrategy::Legacy,
            FreeListStrategy::FastAlloc,
            FreeListStrategy::Many,
            FreeListStrategy::ManyCached,
        ] {
            let table = PageTable::new();
            let page = new_page(&table);
            let mut list = FreeList::new(strategy);
            let sizes = [32usize, 100, 400, 3000, 20000];
            let mut offset = 0;
            for size in sizes {
                list.free(&page, page.start().offset(offset), size);
                offset += size + 64;
            }
            let total: usize = sizes.iter().sum();
            assert_eq!(list.available(), total, "{strategy}");

            let block = list.allocate(90).unwrap();
            assert!(block.size >= 90, "{strategy}");
            assert_eq!(block.page.id(), page.id());
            assert_eq!(list.available(), total - block.size);

            let mut taken = block.size;
            while let Some(block) = list.allocate(16) {
                taken += block.size;
            }
            assert_eq!(taken, total, "{strategy}");
            assert_eq!(list.available(), 0);
        }
    }

    #[test]
    fn test_free_then_allocate_restores_available() {
        const SIZE: usize = 96;
        const LARGE: usize = 5000;
        for strategy in [
            FreeListStrategy::Legacy,
            FreeListStrategy::FastAlloc,
            FreeListStrategy::Many,
            FreeListStrategy::ManyCached,
        ] {
            let table = PageTable::new();
            let page = new_page(&table);
            let mut list = FreeList::new(strategy);
            let freed = page.start().offset(1024);

            // A lone block comes straight back.
            assert_eq!(list.free(&page, freed, SIZE), 0);
            assert_eq!(list.available(), SIZE, "{strategy}");
            let block = list.allocate(SIZE).unwrap();
            assert_eq!((block.start, block.size), (freed, SIZE), "{strategy}");
            assert_eq!(list.available(), 0, "{strategy}");

            // With a larger block around, whichever block is handed out
            // leaves exactly the other one available.
            list.free(&page, page.start().offset(8192), LARGE);
            let before = list.available();
            list.free(&page, freed, SIZE);
            assert_eq!(list.available(), before + SIZE, "{strategy}");
            let block = list.allocate(SIZE).unwrap();
            assert_eq!(list.available(), before + SIZE - block.size, "{strategy}");
            match strategy {
                FreeListStrategy::Legacy => assert_eq!(block.start, freed),
                _ => assert_eq!(block.size, LARGE, "{strategy}"),
            }
            assert_eq!(list.wasted(), 0, "{strategy}");
        }
    }

    #[test]
    fn test_legacy_prefers_best_fit_in_category() {
        let table = PageTable::new();
        let page = new_page(&table);
        let mut list = FreeList::new(FreeListStrategy::Legacy);
        list.free(&page, page.start(), 240);
        list.free(&page, page.start().offset(1024), 104);
        list.free(&page, page.start().offset(2048), 160);
        let block = list.allocate(100).unwrap();
        assert_eq!(block.size, 104);
        assert_eq!(block.start, page.start().offset(1024));
    }

    #[test]
    fn test_many_uses_larger_category_first() {
        let table = PageTable::new();
        let page = new_page(&table);
        let mut list = FreeList::new(FreeListStrategy::Many);
        list.free(&page, page.start(), 40);
        list.free(&page, page.start().offset(1024), 64);
        // 40 sits in the request's own category; 64 is the smallest larger
        // category and is guaranteed to fit.
        let block = list.allocate(36).unwrap();
        assert_eq!(block.size, 64);
        let block = list.allocate(36).unwrap();
        assert_eq!(block.size, 40);
    }

    #[test]
    fn test_evict_and_relink() {
        let table = PageTable::new();
        let a = new_page(&table);
        let b = new_page(&table);
        let mut list = FreeList::new(FreeListStrategy::ManyCached);
        list.free(&a, a.start(), 4096);
        list.free(&b, b.start(), 1024);

        assert_eq!(list.evict_free_list_items(a.id()), 4096);
        assert_eq!(list.evict_free_list_items(a.id()), 0);
        assert!(list.is_evicted(a.id()));
        assert_eq!(list.available(), 1024);
        assert_eq!(list.page_available(a.id()), 4096);

        let block = list.allocate(512).unwrap();
        assert_eq!(block.page.id(), b.id());
        assert!(list.allocate(512).is_none());

        list.relink(a.id());
        assert_eq!(list.available(), 4096);
        assert_eq!(list.allocate(512).unwrap().page.id(), a.id());
    }

    #[test]
    fn test_take_and_adopt_across_strategies() {
        let table = PageTable::new();
        let page = new_page(&table);
        let mut young = FreeList::new(FreeListStrategy::FastAlloc);
        let mut old = FreeList::new(FreeListStrategy::Legacy);
        young.free(&page, page.start(), 500);
        young.free(&page, page.start().offset(1024), 3000);
        young.free(&page, page.start().offset(8192), 8);

        let items = young.take_page(page.id()).unwrap();
        assert_eq!(young.available(), 0);
        assert_eq!(young.wasted(), 0);
        assert_eq!(young.page_count(), 0);

        old.adopt_page(items);
        assert_eq!(old.available(), 3500);
        assert_eq!(old.wasted(), 8);
        assert_eq!(
            old.page_blocks(page.id()),
            vec![(page.start(), 500), (page.start().offset(1024), 3000)]
        );
    }

    #[test]
    fn test_reset_page() {
        let table = PageTable::new();
        let page = new_page(&table);
        let mut list = FreeList::new(FreeListStrategy::Many);
        list.free(&page, page.start(), 256);
        list.free(&page, page.start().offset(512), 4);
        list.reset_page(page.id());
        assert_eq!(list.available(), 0);
        assert_eq!(list.wasted(), 0);
        assert_eq!(list.page_count(), 1);
        assert!(list.allocate(16).is_none());
    }
}
