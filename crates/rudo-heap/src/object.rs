//! Object layout contract.
//!
//! The heap does not know how objects are laid out. The embedder supplies an
//! [`ObjectModel`] that reports an object's size and enumerates its
//! reference slots; the collector never reads object memory any other way.
//!
//! [`SimpleObjectModel`] is a ready-made layout for embedders (and tests)
//! that do not need their own: one header word followed by reference fields
//! and raw data.

use std::sync::atomic::Ordering;

use crate::address::{Address, ObjectRef, Slot, WORD_SIZE};

/// Receives the reference slots of an object.
pub trait SlotVisitor {
    /// Called once per reference-holding slot.
    fn visit_slot(&mut self, slot: Slot);
}

impl<F: FnMut(Slot)> SlotVisitor for F {
    fn visit_slot(&mut self, slot: Slot) {
        self(slot);
    }
}

/// Embedder-provided object layout.
///
/// Implementations are called concurrently from marking workers, so they
/// must only read immutable header data and must not allocate on the heap.
pub trait ObjectModel: Send + Sync + 'static {
    /// Returns the size of `object` in bytes, including its header.
    fn object_size(&self, object: ObjectRef) -> usize;

    /// Calls `visitor` for every slot of `object` that may hold a reference.
    fn visit_pointers(&self, object: ObjectRef, visitor: &mut dyn SlotVisitor);
}

/// Header-word object layout.
///
/// ```text
/// word 0          : size_in_words | pointer_count << 32
/// word 1..=n      : reference slots (0 = null)
/// word n+1..size  : raw data, never traced
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleObjectModel;

impl SimpleObjectModel {
    const COUNT_SHIFT: u32 = 32;

    /// Encodes a header word.
    ///
    /// # Panics
    ///
    /// Panics if the pointer fields do not fit in the object.
    #[must_use]
    pub const fn header(size: usize, pointer_count: usize) -> usize {
        let words = size / WORD_SIZE;
        assert!(pointer_count < words, "pointer fields exceed object size");
        words | (pointer_count << Self::COUNT_SHIFT)
    }

    /// Returns the smallest object size that holds `pointer_count` reference
    /// fields and `data_bytes` of raw data.
    #[must_use]
    pub const fn size_for(pointer_count: usize, data_bytes: usize) -> usize {
        (1 + pointer_count) * WORD_SIZE + crate::address::align_up(data_bytes, WORD_SIZE)
    }

    /// Writes the header of a freshly allocated, zeroed object.
    ///
    /// # Safety
    ///
    /// `object` must be the result of a heap allocation of at least `size`
    /// bytes that has not been published to other threads yet.
    pub unsafe fn initialize(object: ObjectRef, size: usize, pointer_count: usize) {
        let header = object.to_address().as_ptr::<usize>();
        // SAFETY: the caller guarantees the allocation is live and private.
        unsafe { header.write(Self::header(size, pointer_count)) };
    }

    fn decode(object: ObjectRef) -> (usize, usize) {
        // SAFETY: object references handed to the model point at
        // initialized objects.
        let raw = unsafe { read_word(object.to_address()) };
        (raw & 0xffff_ffff, raw >> Self::COUNT_SHIFT)
    }

    /// Returns the `index`-th reference field of `object`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn field(object: ObjectRef, index: usize) -> Slot {
        let (_, count) = Self::decode(object);
        assert!(index < count, "field {index} out of range ({count} fields)");
        // SAFETY: the field lies inside the object.
        unsafe { Slot::new(object.word(1 + index)) }
    }

    /// Returns the number of reference fields of `object`.
    #[must_use]
    pub fn pointer_count(object: ObjectRef) -> usize {
        Self::decode(object).1
    }
}

impl ObjectModel for SimpleObjectModel {
    fn object_size(&self, object: ObjectRef) -> usize {
        Self::decode(object).0 * WORD_SIZE
    }

    fn visit_pointers(&self, object: ObjectRef, visitor: &mut dyn SlotVisitor) {
        let (_, count) = Self::decode(object);
        for index in 0..count {
            // SAFETY: fields 1..=count lie inside the object.
            visitor.visit_slot(unsafe { Slot::new(object.word(1 + index)) });
        }
    }
}

/// Reads the raw word at `address`.
///
/// # Safety
///
/// `address` must be a mapped, word-aligned heap address.
#[must_use]
pub unsafe fn read_word(address: Address) -> usize {
    // SAFETY: guaranteed by the caller.
    unsafe { Slot::new(address) }
        .load(Ordering::Relaxed)
        .map_or(0, ObjectRef::as_usize)
}
