//! Heap pages and the page table.
//!
//! A [`Page`] is a contiguous block of mapped memory plus its side tables:
//! one tri-color bitmap per generation, an object-start table and a
//! remembered set. Pages never move. A page knows which space it belongs to
//! through a [`SpaceKind`] tag only; spaces own pages, not the other way
//! round.
//!
//! The [`PageTable`] maps any heap address to its page and owns the page
//! arena indexed by [`PageId`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(debug_assertions)]
use std::sync::atomic::AtomicU64;

use parking_lot::{Mutex, RwLock};

use crate::address::{address_of_slot, slot_index_of, Address, ObjectRef, PageId, Slot, SlotIndex};
use crate::address::WORD_SIZE;
use crate::gc::mark::{Generation, MarkBitmap, MarkingMode};
use crate::heap::object_start::ObjectStartBitmap;
use crate::heap::page_allocator::PageMemory;
use crate::heap::remembered_set::SlotSet;
use crate::heap::space::SpaceKind;

/// Page flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    /// The page belongs to the young generation.
    pub const YOUNG: Self = Self(1 << 0);
    /// The page holds a single large object.
    pub const LARGE: Self = Self(1 << 1);
    /// Free-list items were evicted; allocation avoids the page.
    pub const EVACUATION_CANDIDATE: Self = Self(1 << 2);
    /// A grey object on this page was dropped by a worklist overflow.
    pub const OVERFLOWED: Self = Self(1 << 3);
    /// The page was requested as executable.
    pub const EXECUTABLE: Self = Self(1 << 4);

    /// No flags.
    pub const EMPTY: Self = Self(0);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A heap page.
pub struct Page {
    id: PageId,
    start: Address,
    size: usize,
    slots: usize,
    memory: Mutex<Option<PageMemory>>,
    space: AtomicU8,
    flags: AtomicU32,
    major_bitmap: MarkBitmap,
    minor_bitmap: MarkBitmap,
    object_starts: ObjectStartBitmap,
    slot_set: SlotSet,
    live_bytes: AtomicUsize,
    allocated_bytes: AtomicUsize,
    age: AtomicU8,
    #[cfg(debug_assertions)]
    marking_mode: AtomicU64,
}

impl Page {
    pub(crate) fn new(id: PageId, memory: PageMemory, space: SpaceKind, flags: PageFlags) -> Self {
        let start = memory.start();
        let size = memory.size();
        let slots = size / WORD_SIZE;
        Self {
            id,
            start,
            size,
            slots,
            memory: Mutex::new(Some(memory)),
            space: AtomicU8::new(space as u8),
            flags: AtomicU32::new(flags.bits()),
            major_bitmap: MarkBitmap::new(slots),
            minor_bitmap: MarkBitmap::new(slots),
            object_starts: ObjectStartBitmap::new(slots),
            slot_set: SlotSet::new(slots),
            live_bytes: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
            age: AtomicU8::new(0),
            #[cfg(debug_assertions)]
            marking_mode: AtomicU64::new(0),
        }
    }

    /// Page identifier.
    #[must_use]
    pub const fn id(&self) -> PageId {
        self.id
    }

    /// First byte of the page.
    #[must_use]
    pub const fn start(&self) -> Address {
        self.start
    }

    /// One past the last byte of the page.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.start.offset(self.size)
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of word slots.
    #[must_use]
    pub const fn slots(&self) -> usize {
        self.slots
    }

    /// Returns `true` if `addr` lies on this page.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Slot index of `addr`.
    #[must_use]
    pub const fn slot_index(&self, addr: Address) -> SlotIndex {
        slot_index_of(self.start, addr)
    }

    /// Address of slot `index`.
    #[must_use]
    pub const fn address_of(&self, index: SlotIndex) -> Address {
        address_of_slot(self.start, index)
    }

    /// Space the page currently belongs to.
    #[must_use]
    pub fn space(&self) -> SpaceKind {
        SpaceKind::from_u8(self.space.load(Ordering::Acquire))
    }

    pub(crate) fn set_space(&self, space: SpaceKind) {
        self.space.store(space as u8, Ordering::Release);
    }

    /// Returns `true` if every bit of `flag` is set.
    #[must_use]
    pub fn has_flag(&self, flag: PageFlags) -> bool {
        self.flags.load(Ordering::Acquire) & flag.bits() == flag.bits()
    }

    /// Sets `flag`, returning whether it was newly set.
    pub fn set_flag(&self, flag: PageFlags) -> bool {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel) & flag.bits() != flag.bits()
    }

    /// Clears `flag`, returning whether it was set.
    pub fn clear_flag(&self, flag: PageFlags) -> bool {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel) & flag.bits() == flag.bits()
    }

    /// Returns `true` for young-generation pages.
    #[must_use]
    pub fn is_young(&self) -> bool {
        self.has_flag(PageFlags::YOUNG)
    }

    /// Returns `true` for large-object pages.
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.has_flag(PageFlags::LARGE)
    }

    /// Returns `true` for evacuation candidates.
    #[must_use]
    pub fn is_evacuation_candidate(&self) -> bool {
        self.has_flag(PageFlags::EVACUATION_CANDIDATE)
    }

    /// Mark bitmap of the full-heap collector.
    #[must_use]
    pub const fn major_bitmap(&self) -> &MarkBitmap {
        &self.major_bitmap
    }

    /// Mark bitmap of the young-generation collector.
    #[must_use]
    pub const fn minor_bitmap(&self) -> &MarkBitmap {
        &self.minor_bitmap
    }

    /// Mark bitmap used by `generation`.
    #[must_use]
    pub const fn bitmap(&self, generation: Generation) -> &MarkBitmap {
        match generation {
            Generation::Major => &self.major_bitmap,
            Generation::Minor => &self.minor_bitmap,
        }
    }

    /// Object-start table.
    #[must_use]
    pub const fn object_starts(&self) -> &ObjectStartBitmap {
        &self.object_starts
    }

    /// Remembered set of this page.
    #[must_use]
    pub const fn slot_set(&self) -> &SlotSet {
        &self.slot_set
    }

    /// Records `slot`, which lies on this page, in the remembered set.
    pub fn record_slot(&self, slot: Slot) -> bool {
        debug_assert!(self.contains(slot.address()));
        self.slot_set.insert(self.slot_index(slot.address()))
    }

    /// Iterates the objects recorded in the object-start table.
    pub fn objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.object_starts
            .iter(SlotIndex(0), SlotIndex(u32::MAX))
            .filter_map(|index| ObjectRef::from_address(self.address_of(index)))
    }

    /// Live bytes found by the last sweep.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Release);
    }

    /// Bytes handed out to objects on this page since its last sweep.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn add_allocated_bytes(&self, bytes: usize) {
        self.allocated_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn reset_allocated_bytes(&self) {
        self.allocated_bytes.store(0, Ordering::Release);
    }

    /// Minor collections survived while young.
    #[must_use]
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Acquire)
    }

    pub(crate) fn increment_age(&self) -> u8 {
        self.age.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub(crate) fn reset_age(&self) {
        self.age.store(0, Ordering::Release);
    }

    /// Checks that a page is marked with a single access mode per cycle.
    #[cfg(debug_assertions)]
    #[track_caller]
    pub(crate) fn note_marking_mode(&self, epoch: u64, mode: MarkingMode) {
        let tagged = (epoch << 8) | mode as u64;
        let previous = self.marking_mode.swap(tagged, Ordering::Relaxed);
        assert!(
            previous >> 8 != epoch || previous == tagged,
            "page {} marked with mixed access modes in one cycle",
            self.id.0
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    pub(crate) const fn note_marking_mode(&self, _epoch: u64, _mode: MarkingMode) {}

    pub(crate) fn take_memory(&self) -> Option<PageMemory> {
        self.memory.lock().take()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("size", &self.size)
            .field("space", &self.space())
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("live_bytes", &self.live_bytes())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct PageTableInner {
    by_start: BTreeMap<usize, PageId>,
    arena: Vec<Option<Arc<Page>>>,
    free_ids: Vec<u32>,
}

/// Address-to-page map and page arena.
#[derive(Default)]
pub struct PageTable {
    inner: RwLock<PageTableInner>,
}

impl PageTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a page built by `make` with a fresh id.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn insert_with(&self, make: impl FnOnce(PageId) -> Page) -> Arc<Page> {
        let mut inner = self.inner.write();
        let id = inner
            .free_ids
            .pop()
            .unwrap_or_else(|| {
                inner.arena.push(None);
                (inner.arena.len() - 1) as u32
            });
        let page = Arc::new(make(PageId(id)));
        inner.by_start.insert(page.start().as_usize(), page.id());
        inner.arena[id as usize] = Some(Arc::clone(&page));
        page
    }

    /// Unregisters a page.
    pub(crate) fn remove(&self, id: PageId) -> Option<Arc<Page>> {
        let mut inner = self.inner.write();
        let page = inner.arena.get_mut(id.index())?.take()?;
        inner.by_start.remove(&page.start().as_usize());
        inner.free_ids.push(id.0);
        Some(page)
    }

    /// Returns the page with `id`.
    #[must_use]
    pub fn get(&self, id: PageId) -> Option<Arc<Page>> {
        self.inner.read().arena.get(id.index())?.clone()
    }

    /// Returns the page containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: Address) -> Option<Arc<Page>> {
        let inner = self.inner.read();
        let (_, id) = inner.by_start.range(..=addr.as_usize()).next_back()?;
        let page = inner.arena[id.index()].as_ref()?;
        page.contains(addr).then(|| Arc::clone(page))
    }

    /// Returns the page containing `addr` and the slot index of `addr`.
    #[must_use]
    pub fn locate(&self, addr: Address) -> Option<(Arc<Page>, SlotIndex)> {
        let page = self.lookup(addr)?;
        let index = page.slot_index(addr);
        Some((page, index))
    }

    /// Snapshot of all registered pages, in address order.
    #[must_use]
    pub fn pages(&self) -> Vec<Arc<Page>> {
        let inner = self.inner.read();
        inner
            .by_start
            .values()
            .filter_map(|id| inner.arena[id.index()].clone())
            .collect()
    }

    /// Number of registered pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_start.len()
    }

    /// Returns `true` if no page is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable").field("pages", &self.len()).finish()
    }
}
