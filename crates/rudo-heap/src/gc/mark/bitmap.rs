//! Tri-color mark bitmap.
//!
//! Every word-sized slot of a page owns two adjacent bits:
//!
//! ```text
//! bit 2*i      black
//! bit 2*i + 1  grey
//!
//! 00 white   10 black   01 grey   11 never valid
//! ```
//!
//! Both bits of a slot live in the same `AtomicU64` cell, so a transition is
//! a single compare-and-swap on that cell. Each cell covers 32 slots.
//!
//! Transitions come in two access modes. [`Atomic`] uses CAS loops and
//! reports whether *this* call performed the transition, so exactly one of
//! several racing callers wins. [`NonAtomic`] uses plain loads and stores
//! and is only valid while a single thread marks the page. A page is never
//! marked with both modes in the same cycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::SlotIndex;

const SLOTS_PER_CELL: usize = 32;
const EVEN_BITS: u64 = 0x5555_5555_5555_5555;

/// Color of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Not yet discovered.
    White,
    /// Discovered, fields not yet visited.
    Grey,
    /// Discovered and being or done being visited.
    Black,
}

mod private {
    pub trait Sealed {}
}

/// Bitmap access mode.
pub trait AccessMode: private::Sealed {
    /// `true` for [`Atomic`].
    const ATOMIC: bool;
}

/// Compare-and-swap transitions, safe under concurrent marking.
#[derive(Debug, Clone, Copy)]
pub struct Atomic;

/// Plain load/store transitions for single-threaded marking.
#[derive(Debug, Clone, Copy)]
pub struct NonAtomic;

impl private::Sealed for Atomic {}
impl private::Sealed for NonAtomic {}

impl AccessMode for Atomic {
    const ATOMIC: bool = true;
}

impl AccessMode for NonAtomic {
    const ATOMIC: bool = false;
}

/// Access mode chosen for one marking cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkingMode {
    /// Concurrent workers or multiple mutator threads may mark.
    Atomic = 1,
    /// Only the main thread marks.
    NonAtomic = 2,
}

impl MarkingMode {
    pub(crate) const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Atomic),
            2 => Some(Self::NonAtomic),
            _ => None,
        }
    }

    /// See [`MarkBitmap::white_to_grey`].
    #[track_caller]
    pub fn white_to_grey(self, bitmap: &MarkBitmap, index: SlotIndex) -> bool {
        match self {
            Self::Atomic => bitmap.white_to_grey::<Atomic>(index),
            Self::NonAtomic => bitmap.white_to_grey::<NonAtomic>(index),
        }
    }

    /// See [`MarkBitmap::grey_to_black`].
    #[track_caller]
    pub fn grey_to_black(self, bitmap: &MarkBitmap, index: SlotIndex) -> bool {
        match self {
            Self::Atomic => bitmap.grey_to_black::<Atomic>(index),
            Self::NonAtomic => bitmap.grey_to_black::<NonAtomic>(index),
        }
    }

    /// See [`MarkBitmap::black_to_grey`].
    #[track_caller]
    pub fn black_to_grey(self, bitmap: &MarkBitmap, index: SlotIndex) -> bool {
        match self {
            Self::Atomic => bitmap.black_to_grey::<Atomic>(index),
            Self::NonAtomic => bitmap.black_to_grey::<NonAtomic>(index),
        }
    }

    /// See [`MarkBitmap::mark_black`].
    #[track_caller]
    pub fn mark_black(self, bitmap: &MarkBitmap, index: SlotIndex) -> bool {
        match self {
            Self::Atomic => bitmap.mark_black::<Atomic>(index),
            Self::NonAtomic => bitmap.mark_black::<NonAtomic>(index),
        }
    }
}

/// Two-bit-per-slot tri-color bitmap for one page.
pub struct MarkBitmap {
    cells: Box<[AtomicU64]>,
    slots: usize,
}

impl MarkBitmap {
    /// Creates an all-white bitmap covering `slots` slots.
    #[must_use]
    pub fn new(slots: usize) -> Self {
        let cells = (0..slots.div_ceil(SLOTS_PER_CELL))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { cells, slots }
    }

    /// Number of slots covered.
    #[must_use]
    pub const fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    #[track_caller]
    fn locate(&self, index: SlotIndex) -> (&AtomicU64, u64, u64) {
        let index = index.get();
        assert!(index < self.slots, "slot {index} outside bitmap");
        let shift = (index % SLOTS_PER_CELL) * 2;
        (
            &self.cells[index / SLOTS_PER_CELL],
            1 << shift,
            1 << (shift + 1),
        )
    }

    #[inline]
    #[track_caller]
    fn decode(bits: u64, black: u64, grey: u64, index: SlotIndex) -> Color {
        match (bits & black != 0, bits & grey != 0) {
            (false, false) => Color::White,
            (true, false) => Color::Black,
            (false, true) => Color::Grey,
            (true, true) => panic!("illegal mark bit pattern 11 at slot {}", index.0),
        }
    }

    /// Applies `transition` to the slot's cell and returns whether the cell
    /// changed. `transition` maps the current color to the new cell value,
    /// or `None` to leave it untouched.
    #[inline]
    #[track_caller]
    fn update<M: AccessMode>(
        &self,
        index: SlotIndex,
        transition: impl Fn(Color, u64, u64, u64) -> Option<u64>,
    ) -> bool {
        let (cell, black, grey) = self.locate(index);
        let mut old = cell.load(Ordering::Relaxed);
        loop {
            let color = Self::decode(old, black, grey, index);
            let Some(new) = transition(color, old, black, grey) else {
                return false;
            };
            if !M::ATOMIC {
                cell.store(new, Ordering::Relaxed);
                return true;
            }
            match cell.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }

    /// Returns the color of a slot.
    ///
    /// # Panics
    ///
    /// Panics on the illegal `11` pattern.
    #[must_use]
    #[track_caller]
    pub fn color(&self, index: SlotIndex) -> Color {
        let (cell, black, grey) = self.locate(index);
        Self::decode(cell.load(Ordering::Acquire), black, grey, index)
    }

    /// Returns `true` if the slot is white.
    #[must_use]
    #[track_caller]
    pub fn is_white(&self, index: SlotIndex) -> bool {
        self.color(index) == Color::White
    }

    /// Returns `true` if the slot is grey.
    #[must_use]
    #[track_caller]
    pub fn is_grey(&self, index: SlotIndex) -> bool {
        self.color(index) == Color::Grey
    }

    /// Returns `true` if the slot is black.
    #[must_use]
    #[track_caller]
    pub fn is_black(&self, index: SlotIndex) -> bool {
        self.color(index) == Color::Black
    }

    /// White to grey. Returns `true` only for the caller that performed the
    /// transition; an object that is already grey or black is left alone.
    #[track_caller]
    pub fn white_to_grey<M: AccessMode>(&self, index: SlotIndex) -> bool {
        self.update::<M>(index, |color, old, _, grey| {
            (color == Color::White).then_some(old | grey)
        })
    }

    /// Grey to black. Returns `false` if the slot is already black, which
    /// happens for duplicate worklist entries.
    ///
    /// # Panics
    ///
    /// Panics if the slot is white: only discovered objects are visited.
    #[track_caller]
    pub fn grey_to_black<M: AccessMode>(&self, index: SlotIndex) -> bool {
        self.update::<M>(index, |color, old, black, grey| match color {
            Color::Grey => Some((old & !grey) | black),
            Color::Black => None,
            Color::White => panic!("grey_to_black on white slot {}", index.0),
        })
    }

    /// Black to grey, queueing an already visited object for another visit.
    /// Returns `false` if the slot is already grey.
    ///
    /// # Panics
    ///
    /// Panics if the slot is white.
    #[track_caller]
    pub fn black_to_grey<M: AccessMode>(&self, index: SlotIndex) -> bool {
        self.update::<M>(index, |color, old, black, grey| match color {
            Color::Black => Some((old & !black) | grey),
            Color::Grey => None,
            Color::White => panic!("black_to_grey on white slot {}", index.0),
        })
    }

    /// Marks the slot black from white or grey. Returns `true` if the slot
    /// was not already black.
    #[track_caller]
    pub fn mark_black<M: AccessMode>(&self, index: SlotIndex) -> bool {
        self.update::<M>(index, |color, old, black, grey| {
            (color != Color::Black).then_some((old & !grey) | black)
        })
    }

    /// Resets slots `start..end` to white.
    pub fn clear_range(&self, start: SlotIndex, end: SlotIndex) {
        let (start, end) = (start.get(), end.get().min(self.slots));
        let mut index = start;
        while index < end {
            let cell = index / SLOTS_PER_CELL;
            let first = index % SLOTS_PER_CELL;
            let last = (end - cell * SLOTS_PER_CELL).min(SLOTS_PER_CELL);
            let mask = range_mask(first * 2, last * 2);
            self.cells[cell].fetch_and(!mask, Ordering::AcqRel);
            index = (cell + 1) * SLOTS_PER_CELL;
        }
    }

    /// Resets the whole bitmap to white.
    pub fn clear(&self) {
        for cell in &*self.cells {
            cell.store(0, Ordering::Relaxed);
        }
    }

    /// Returns `true` if no slot is grey or black.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.cells.iter().all(|c| c.load(Ordering::Relaxed) == 0)
    }

    /// Number of black slots.
    #[must_use]
    pub fn black_count(&self) -> usize {
        self.cells
            .iter()
            .map(|c| (c.load(Ordering::Relaxed) & EVEN_BITS).count_ones() as usize)
            .sum()
    }

    /// Number of grey slots.
    #[must_use]
    pub fn grey_count(&self) -> usize {
        self.cells
            .iter()
            .map(|c| ((c.load(Ordering::Relaxed) >> 1) & EVEN_BITS).count_ones() as usize)
            .sum()
    }

    /// Returns the first slot holding the illegal `11` pattern, if any.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn find_illegal_pattern(&self) -> Option<SlotIndex> {
        self.cells.iter().enumerate().find_map(|(i, c)| {
            let bits = c.load(Ordering::Relaxed);
            let both = bits & (bits >> 1) & EVEN_BITS;
            (both != 0).then(|| {
                SlotIndex((i * SLOTS_PER_CELL + both.trailing_zeros() as usize / 2) as u32)
            })
        })
    }
}

fn range_mask(from: usize, to: usize) -> u64 {
    let upper = if to >= 64 { u64::MAX } else { (1u64 << to) - 1 };
    let lower = (1u64 << from) - 1;
    upper & !lower
}

impl fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkBitmap")
            .field("slots", &self.slots)
            .field("black", &self.black_count())
            .field("grey", &self.grey_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tri_color_transitions() {
        let bitmap = MarkBitmap::new(100);
        let i = SlotIndex(42);
        assert!(bitmap.is_white(i));

        assert!(bitmap.white_to_grey::<Atomic>(i));
        assert!(bitmap.is_grey(i));
        assert!(!bitmap.white_to_grey::<Atomic>(i));

        assert!(bitmap.grey_to_black::<Atomic>(i));
        assert!(bitmap.is_black(i));
        assert!(!bitmap.grey_to_black::<Atomic>(i));
        assert!(!bitmap.white_to_grey::<Atomic>(i));

        assert!(bitmap.black_to_grey::<Atomic>(i));
        assert!(bitmap.is_grey(i));
        assert!(!bitmap.black_to_grey::<Atomic>(i));

        assert!(bitmap.mark_black::<Atomic>(i));
        assert!(!bitmap.mark_black::<Atomic>(i));
        assert!(bitmap.find_illegal_pattern().is_none());
    }

    #[test]
    fn test_neighbouring_slots_are_independent() {
        let bitmap = MarkBitmap::new(64);
        bitmap.mark_black::<NonAtomic>(SlotIndex(0));
        bitmap.white_to_grey::<NonAtomic>(SlotIndex(1));
        bitmap.mark_black::<NonAtomic>(SlotIndex(31));
        bitmap.white_to_grey::<NonAtomic>(SlotIndex(32));

        assert!(bitmap.is_black(SlotIndex(0)));
        assert!(bitmap.is_grey(SlotIndex(1)));
        assert!(bitmap.is_white(SlotIndex(2)));
        assert!(bitmap.is_black(SlotIndex(31)));
        assert!(bitmap.is_grey(SlotIndex(32)));
        assert_eq!(bitmap.black_count(), 2);
        assert_eq!(bitmap.grey_count(), 2);
    }

    #[test]
    fn test_mark_black_from_white() {
        let bitmap = MarkBitmap::new(8);
        assert!(bitmap.mark_black::<NonAtomic>(SlotIndex(3)));
        assert!(bitmap.is_black(SlotIndex(3)));
    }

    #[test]
    #[should_panic(expected = "grey_to_black on white slot")]
    fn test_grey_to_black_on_white_is_fatal() {
        let bitmap = MarkBitmap::new(8);
        bitmap.grey_to_black::<Atomic>(SlotIndex(1));
    }

    #[test]
    #[should_panic(expected = "black_to_grey on white slot")]
    fn test_black_to_grey_on_white_is_fatal() {
        let bitmap = MarkBitmap::new(8);
        bitmap.black_to_grey::<NonAtomic>(SlotIndex(1));
    }

    #[test]
    fn test_clear_range_spans_cells() {
        let bitmap = MarkBitmap::new(200);
        for i in 0..200 {
            bitmap.mark_black::<NonAtomic>(SlotIndex(i));
        }
        bitmap.clear_range(SlotIndex(10), SlotIndex(150));
        assert!(bitmap.is_black(SlotIndex(9)));
        assert!(bitmap.is_white(SlotIndex(10)));
        assert!(bitmap.is_white(SlotIndex(64)));
        assert!(bitmap.is_white(SlotIndex(149)));
        assert!(bitmap.is_black(SlotIndex(150)));
        assert_eq!(bitmap.black_count(), 60);

        bitmap.clear();
        assert!(bitmap.is_clean());
    }

    #[test]
    fn test_racing_white_to_grey_has_one_winner() {
        let bitmap = Arc::new(MarkBitmap::new(64));
        let winners: usize = (0..8)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                std::thread::spawn(move || bitmap.white_to_grey::<Atomic>(SlotIndex(7)))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
        assert!(bitmap.is_grey(SlotIndex(7)));
    }
}
