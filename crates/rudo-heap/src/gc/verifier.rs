//! Heap verification.
//!
//! The verifier walks every object of every page and reports violations of
//! the colour invariants and of remembered-set soundness. It must run while
//! every mutator is stopped and no marker is active.

use std::fmt;
use std::sync::atomic::Ordering;

use crate::address::{Address, ObjectRef, PageId, Slot, SlotIndex};
use crate::gc::mark::Color;
use crate::heap::page::PageTable;
use crate::object::ObjectModel;

/// Violations found by a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Objects walked.
    pub objects_checked: usize,
    /// Slots with both mark bits set.
    pub illegal_patterns: Vec<(PageId, SlotIndex)>,
    /// Grey objects left after marking finished.
    pub grey_objects: Vec<ObjectRef>,
    /// `(host, child)` pairs where a black host points at a white child.
    pub black_to_white: Vec<(ObjectRef, ObjectRef)>,
    /// `(host, slot)` pairs where an old host points into the young
    /// generation through an unrecorded slot.
    pub unrecorded_slots: Vec<(ObjectRef, Address)>,
}

impl VerificationReport {
    /// Returns `true` if no violation was found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.illegal_patterns.is_empty()
            && self.grey_objects.is_empty()
            && self.black_to_white.is_empty()
            && self.unrecorded_slots.is_empty()
    }

    /// Panics with the report if a violation was found.
    ///
    /// # Panics
    ///
    /// Panics unless [`is_ok`](Self::is_ok).
    #[track_caller]
    pub fn assert_ok(&self) {
        assert!(self.is_ok(), "heap verification failed: {self}");
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} objects checked, {} illegal patterns, {} grey objects, {} black-to-white edges, {} unrecorded slots",
            self.objects_checked,
            self.illegal_patterns.len(),
            self.grey_objects.len(),
            self.black_to_white.len(),
            self.unrecorded_slots.len()
        )?;
        if let Some((host, child)) = self.black_to_white.first() {
            write!(f, "; first edge {:#x} -> {:#x}", host.as_usize(), child.as_usize())?;
        }
        if let Some((host, slot)) = self.unrecorded_slots.first() {
            write!(f, "; first slot {:#x} in {:#x}", slot.as_usize(), host.as_usize())?;
        }
        Ok(())
    }
}

/// Checks the major colours: no `11` pattern anywhere and no black object
/// pointing at a white one. With `marking_done`, grey objects are
/// violations too.
pub fn verify_marking(
    pages: &PageTable,
    model: &dyn ObjectModel,
    marking_done: bool,
    report: &mut VerificationReport,
) {
    for page in pages.pages() {
        let bitmap = page.major_bitmap();
        if let Some(index) = bitmap.find_illegal_pattern() {
            report.illegal_patterns.push((page.id(), index));
        }
        for object in page.objects() {
            report.objects_checked += 1;
            match bitmap.color(page.slot_index(object.to_address())) {
                Color::Grey if marking_done => report.grey_objects.push(object),
                Color::Black => {
                    model.visit_pointers(object, &mut |slot: Slot| {
                        let Some(child) = slot.load(Ordering::Acquire) else {
                            return;
                        };
                        let Some((child_page, child_index)) = pages.locate(child.to_address()) else {
                            return;
                        };
                        if child_page.object_starts().is_set(child_index)
                            && child_page.major_bitmap().is_white(child_index)
                        {
                            report.black_to_white.push((object, child));
                        }
                    });
                }
                _ => {}
            }
        }
    }
}

/// Checks that every old-to-young pointer sits in a recorded slot.
pub fn verify_remembered_sets(pages: &PageTable, model: &dyn ObjectModel, report: &mut VerificationReport) {
    for page in pages.pages() {
        if page.is_young() {
            continue;
        }
        for object in page.objects() {
            model.visit_pointers(object, &mut |slot: Slot| {
                let Some(value) = slot.load(Ordering::Acquire) else {
                    return;
                };
                let young = pages
                    .lookup(value.to_address())
                    .is_some_and(|target| target.is_young());
                if young && !page.slot_set().contains(page.slot_index(slot.address())) {
                    report.unrecorded_slots.push((object, slot.address()));
                }
            });
        }
    }
}
