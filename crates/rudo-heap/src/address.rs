//! Addresses, object references and slot addressing.
//!
//! Heap memory is word-addressed: every page is divided into word-sized
//! slots, and all per-page side tables (mark bitmap, object-start bitmap,
//! remembered set) are indexed by [`SlotIndex`]. The mapping from an address
//! to `(PageId, SlotIndex)` is a pure function of the page start
//! ([`slot_index_of`]); the page itself is found through the page table.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a heap word (and of a slot) in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// `log2(WORD_SIZE)`.
pub const WORD_SIZE_LOG2: u32 = WORD_SIZE.trailing_zeros();

/// A raw address in the heap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Wraps a raw address.
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Wraps a pointer.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the raw address.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the address as a pointer.
    #[must_use]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns `true` for the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` past this one.
    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Returns `self - earlier` in bytes.
    #[must_use]
    pub const fn distance_from(self, earlier: Self) -> usize {
        debug_assert!(self.0 >= earlier.0);
        self.0 - earlier.0
    }

    /// Returns `true` if the address is a multiple of `align`.
    #[must_use]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Rounds the address up to a multiple of `align` (a power of two).
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        Self(align_up(self.0, align))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A reference to the first word of a heap object.
///
/// Object references are never null; a null field is represented as
/// `Option<ObjectRef>::None`, stored as a zero word.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectRef(Address);

impl ObjectRef {
    /// Wraps an address, returning `None` for null.
    #[must_use]
    pub const fn from_address(address: Address) -> Option<Self> {
        if address.is_null() {
            None
        } else {
            Some(Self(address))
        }
    }

    /// Returns the object's start address.
    #[must_use]
    pub const fn to_address(self) -> Address {
        self.0
    }

    /// Returns the object's start address as a raw integer.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0.as_usize()
    }

    /// Returns the address of the `index`-th word of the object.
    #[must_use]
    pub const fn word(self, index: usize) -> Address {
        self.0.offset(index * WORD_SIZE)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0.as_usize())
    }
}

/// A word-sized heap location holding either null or an [`ObjectRef`].
///
/// Slots are read and written as `AtomicUsize` so concurrent markers and
/// mutators can access the same field without a data race.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Slot(Address);

impl Slot {
    /// Creates a slot handle.
    ///
    /// # Safety
    ///
    /// `address` must be word aligned and point to a word that stays mapped
    /// for as long as the slot is used.
    #[must_use]
    pub const unsafe fn new(address: Address) -> Self {
        Self(address)
    }

    /// Returns the slot's address.
    #[must_use]
    pub const fn address(self) -> Address {
        self.0
    }

    fn cell(&self) -> &AtomicUsize {
        // SAFETY: guaranteed by `Slot::new`.
        unsafe { &*self.0.as_ptr::<AtomicUsize>() }
    }

    /// Reads the reference stored in the slot.
    #[must_use]
    pub fn load(self, order: Ordering) -> Option<ObjectRef> {
        ObjectRef::from_address(Address(self.cell().load(order)))
    }

    /// Writes a reference into the slot.
    pub fn store(self, value: Option<ObjectRef>, order: Ordering) {
        self.cell()
            .store(value.map_or(0, ObjectRef::as_usize), order);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({:#x})", self.0.as_usize())
    }
}

/// Identifier of a page in the heap's page arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PageId(pub u32);

impl PageId {
    /// Returns the id as an arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a word-sized slot within its page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SlotIndex(pub u32);

impl SlotIndex {
    /// Returns the index as `usize`.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

/// Computes the slot index of `addr` inside a page starting at `page_start`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn slot_index_of(page_start: Address, addr: Address) -> SlotIndex {
    debug_assert!(addr.as_usize() >= page_start.as_usize());
    SlotIndex(((addr.as_usize() - page_start.as_usize()) >> WORD_SIZE_LOG2) as u32)
}

/// Inverse of [`slot_index_of`].
#[must_use]
pub const fn address_of_slot(page_start: Address, index: SlotIndex) -> Address {
    page_start.offset(index.get() * WORD_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_index_round_trip() {
        let start = Address::new(0x10_0000);
        let addr = start.offset(5 * WORD_SIZE);
        let index = slot_index_of(start, addr);
        assert_eq!(index, SlotIndex(5));
        assert_eq!(address_of_slot(start, index), addr);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(17, 16), 32);
        assert!(Address::new(64).is_aligned(16));
        assert!(!Address::new(65).is_aligned(2));
    }

    #[test]
    fn test_object_ref_rejects_null() {
        assert!(ObjectRef::from_address(Address::NULL).is_none());
        let obj = ObjectRef::from_address(Address::new(0x1000)).unwrap();
        assert_eq!(obj.word(2), Address::new(0x1000 + 2 * WORD_SIZE));
    }

    #[test]
    fn test_slot_load_store() {
        let mut word: usize = 0;
        let slot = unsafe { Slot::new(Address::from_ptr(&raw mut word)) };
        assert_eq!(slot.load(Ordering::Relaxed), None);
        let obj = ObjectRef::from_address(Address::new(0x2000)).unwrap();
        slot.store(Some(obj), Ordering::Relaxed);
        assert_eq!(slot.load(Ordering::Relaxed), Some(obj));
        assert_eq!(word, 0x2000);
    }
}
