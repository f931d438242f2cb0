//! One bit per slot marking where allocated objects begin.
//!
//! Bits are set by the allocator and cleared by the sweeper. They make a
//! page iterable without reading free memory: the sweeper, the verifier, the
//! overflow rescan and page promotion all walk objects through this table.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::SlotIndex;

const BITS: usize = 64;

/// Object-start table for one page.
#[derive(Debug)]
pub struct ObjectStartBitmap {
    cells: Box<[AtomicU64]>,
    slots: usize,
}

impl ObjectStartBitmap {
    /// Creates an empty table covering `slots` slots.
    #[must_use]
    pub fn new(slots: usize) -> Self {
        let cells = (0..slots.div_ceil(BITS)).map(|_| AtomicU64::new(0)).collect();
        Self { cells, slots }
    }

    /// Records an object start.
    pub fn set(&self, index: SlotIndex) {
        let i = index.get();
        debug_assert!(i < self.slots);
        self.cells[i / BITS].fetch_or(1 << (i % BITS), Ordering::Release);
    }

    /// Removes an object start.
    pub fn clear(&self, index: SlotIndex) {
        let i = index.get();
        self.cells[i / BITS].fetch_and(!(1 << (i % BITS)), Ordering::Release);
    }

    /// Returns `true` if an object starts at `index`.
    #[must_use]
    pub fn is_set(&self, index: SlotIndex) -> bool {
        let i = index.get();
        i < self.slots && self.cells[i / BITS].load(Ordering::Acquire) & (1 << (i % BITS)) != 0
    }

    /// Returns the first object start at or after `from` and before `end`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_set(&self, from: SlotIndex, end: SlotIndex) -> Option<SlotIndex> {
        let end = end.get().min(self.slots);
        let mut i = from.get();
        while i < end {
            let cell = i / BITS;
            let bits = self.cells[cell].load(Ordering::Acquire) >> (i % BITS);
            if bits != 0 {
                let found = i + bits.trailing_zeros() as usize;
                return (found < end).then_some(SlotIndex(found as u32));
            }
            i = (cell + 1) * BITS;
        }
        None
    }

    /// Returns the closest object start at or before `index`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn find_start_at_or_before(&self, index: SlotIndex) -> Option<SlotIndex> {
        let i = index.get().min(self.slots.checked_sub(1)?);
        let mut cell = i / BITS;
        let mut bits = self.cells[cell].load(Ordering::Acquire) & mask_upto(i % BITS);
        loop {
            if bits != 0 {
                let bit = BITS - 1 - bits.leading_zeros() as usize;
                return Some(SlotIndex((cell * BITS + bit) as u32));
            }
            if cell == 0 {
                return None;
            }
            cell -= 1;
            bits = self.cells[cell].load(Ordering::Acquire);
        }
    }

    /// Iterates the object starts in `from..end`.
    pub fn iter(&self, from: SlotIndex, end: SlotIndex) -> impl Iterator<Item = SlotIndex> + '_ {
        let mut cursor = Some(from);
        std::iter::from_fn(move || {
            let found = self.next_set(cursor?, end);
            cursor = found.map(|s| SlotIndex(s.0 + 1));
            found
        })
    }

    /// Removes every object start.
    pub fn clear_all(&self) {
        for cell in &*self.cells {
            cell.store(0, Ordering::Relaxed);
        }
    }

    /// Number of recorded object starts.
    #[must_use]
    pub fn count(&self) -> usize {
        self.cells
            .iter()
            .map(|c| c.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

const fn mask_upto(bit: usize) -> u64 {
    if bit >= BITS - 1 {
        u64::MAX
    } else {
        (1 << (bit + 1)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_in_order() {
        let starts = ObjectStartBitmap::new(300);
        for i in [0u32, 5, 63, 64, 200, 299] {
            starts.set(SlotIndex(i));
        }
        let all: Vec<u32> = starts.iter(SlotIndex(0), SlotIndex(300)).map(|s| s.0).collect();
        assert_eq!(all, vec![0, 5, 63, 64, 200, 299]);

        let some: Vec<u32> = starts.iter(SlotIndex(6), SlotIndex(200)).map(|s| s.0).collect();
        assert_eq!(some, vec![63, 64]);
        assert_eq!(starts.count(), 6);
    }

    #[test]
    fn test_find_start_at_or_before() {
        let starts = ObjectStartBitmap::new(256);
        starts.set(SlotIndex(10));
        starts.set(SlotIndex(130));
        assert_eq!(starts.find_start_at_or_before(SlotIndex(9)), None);
        assert_eq!(starts.find_start_at_or_before(SlotIndex(10)), Some(SlotIndex(10)));
        assert_eq!(starts.find_start_at_or_before(SlotIndex(129)), Some(SlotIndex(10)));
        assert_eq!(starts.find_start_at_or_before(SlotIndex(255)), Some(SlotIndex(130)));
    }

    #[test]
    fn test_clear() {
        let starts = ObjectStartBitmap::new(64);
        starts.set(SlotIndex(3));
        assert!(starts.is_set(SlotIndex(3)));
        starts.clear(SlotIndex(3));
        assert!(!starts.is_set(SlotIndex(3)));
        starts.set(SlotIndex(4));
        starts.clear_all();
        assert_eq!(starts.count(), 0);
    }
}
