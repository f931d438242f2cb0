//! Per-page remembered set.
//!
//! A [`SlotSet`] records which slots of an old page may hold a reference to
//! a young object. It is a bitmap split into lazily allocated buckets, so a
//! page with no old-to-young pointers costs a handful of empty `OnceLock`s.
//! Insertion is idempotent and lock free; it runs on the write-barrier path
//! of every mutator thread.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::address::SlotIndex;

const CELL_BITS: usize = 32;
const CELLS_PER_BUCKET: usize = 32;
const SLOTS_PER_BUCKET: usize = CELL_BITS * CELLS_PER_BUCKET;

/// Returned by the [`SlotSet::iterate`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCallbackResult {
    /// Keep the slot recorded.
    Keep,
    /// Drop the slot from the set.
    Remove,
}

type Bucket = Box<[AtomicU32; CELLS_PER_BUCKET]>;

/// Bucketed slot bitmap for one page.
#[derive(Debug)]
pub struct SlotSet {
    buckets: Box<[OnceLock<Bucket>]>,
    slots: usize,
    len: AtomicUsize,
}

impl SlotSet {
    /// Creates an empty set able to hold slots `0..slots`.
    #[must_use]
    pub fn new(slots: usize) -> Self {
        let buckets = (0..slots.div_ceil(SLOTS_PER_BUCKET))
            .map(|_| OnceLock::new())
            .collect();
        Self {
            buckets,
            slots,
            len: AtomicUsize::new(0),
        }
    }

    fn locate(index: SlotIndex) -> (usize, usize, u32) {
        let i = index.get();
        let bucket = i / SLOTS_PER_BUCKET;
        let within = i % SLOTS_PER_BUCKET;
        (bucket, within / CELL_BITS, 1 << (within % CELL_BITS))
    }

    /// Records a slot. Returns `true` if it was not recorded before.
    pub fn insert(&self, index: SlotIndex) -> bool {
        debug_assert!(index.get() < self.slots, "slot outside page");
        let (bucket, cell, bit) = Self::locate(index);
        let bucket =
            self.buckets[bucket].get_or_init(|| Box::new(std::array::from_fn(|_| AtomicU32::new(0))));
        let newly = bucket[cell].fetch_or(bit, Ordering::AcqRel) & bit == 0;
        if newly {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        newly
    }

    /// Returns `true` if the slot is recorded.
    #[must_use]
    pub fn contains(&self, index: SlotIndex) -> bool {
        let (bucket, cell, bit) = Self::locate(index);
        self.buckets
            .get(bucket)
            .and_then(OnceLock::get)
            .is_some_and(|b| b[cell].load(Ordering::Acquire) & bit != 0)
    }

    /// Removes a slot. Returns `true` if it was recorded.
    pub fn remove(&self, index: SlotIndex) -> bool {
        let (bucket, cell, bit) = Self::locate(index);
        let Some(bucket) = self.buckets.get(bucket).and_then(OnceLock::get) else {
            return false;
        };
        let was = bucket[cell].fetch_and(!bit, Ordering::AcqRel) & bit != 0;
        if was {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        was
    }

    /// Removes every slot in `start..end`. Used when the sweeper frees the
    /// memory those slots belonged to.
    pub fn remove_range(&self, start: SlotIndex, end: SlotIndex) {
        let end = end.get().min(self.slots);
        let mut i = start.get();
        while i < end {
            let bucket = i / SLOTS_PER_BUCKET;
            let Some(cells) = self.buckets[bucket].get() else {
                i = (bucket + 1) * SLOTS_PER_BUCKET;
                continue;
            };
            let within = i % SLOTS_PER_BUCKET;
            let cell = within / CELL_BITS;
            let first = within % CELL_BITS;
            let last = (end - (bucket * SLOTS_PER_BUCKET + cell * CELL_BITS)).min(CELL_BITS);
            let mask = cell_mask(first, last);
            let removed = cells[cell].fetch_and(!mask, Ordering::AcqRel) & mask;
            if removed != 0 {
                self.len
                    .fetch_sub(removed.count_ones() as usize, Ordering::Relaxed);
            }
            i = bucket * SLOTS_PER_BUCKET + (cell + 1) * CELL_BITS;
        }
    }

    /// Visits every recorded slot in ascending order. Slots for which the
    /// callback returns [`SlotCallbackResult::Remove`] are dropped.
    ///
    /// Returns the number of slots kept.
    #[allow(clippy::cast_possible_truncation)]
    pub fn iterate(&self, mut callback: impl FnMut(SlotIndex) -> SlotCallbackResult) -> usize {
        let mut kept = 0;
        for (b, bucket) in self.buckets.iter().enumerate() {
            let Some(cells) = bucket.get() else {
                continue;
            };
            for (c, cell) in cells.iter().enumerate() {
                let mut bits = cell.load(Ordering::Acquire);
                let mut remove = 0u32;
                while bits != 0 {
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    let index = SlotIndex((b * SLOTS_PER_BUCKET + c * CELL_BITS + bit) as u32);
                    match callback(index) {
                        SlotCallbackResult::Keep => kept += 1,
                        SlotCallbackResult::Remove => remove |= 1 << bit,
                    }
                }
                if remove != 0 {
                    let removed = cell.fetch_and(!remove, Ordering::AcqRel) & remove;
                    self.len
                        .fetch_sub(removed.count_ones() as usize, Ordering::Relaxed);
                }
            }
        }
        kept
    }

    /// Number of recorded slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if no slot is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every slot, keeping allocated buckets.
    pub fn clear(&self) {
        for bucket in self.buckets.iter().filter_map(OnceLock::get) {
            for cell in bucket.iter() {
                cell.store(0, Ordering::Relaxed);
            }
        }
        self.len.store(0, Ordering::Relaxed);
    }
}

const fn cell_mask(first: usize, last: usize) -> u32 {
    let upper = if last >= CELL_BITS {
        u32::MAX
    } else {
        (1u32 << last) - 1
    };
    upper & !((1u32 << first) - 1)
}
