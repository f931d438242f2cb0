//! Young generation collection.
//!
//! A minor collection runs entirely in one pause. Its roots are the heap
//! roots plus the recorded slots of every old page; only young pages are
//! marked (with their own minor bitmap) and swept. Nothing moves: a young
//! page that survived `promotion_age` minor collections is handed to the
//! old generation as a whole.
//!
//! A minor collection may interrupt major marking. Dead young objects then
//! have to leave the major worklist and lose their major colour, which the
//! sweeper and [`filter_major_worklist`] take care of.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address::{ObjectRef, Slot};
use crate::gc::incremental::{drain_with_overflow, StepResult};
use crate::gc::marker::MarkingVisitor;
use crate::heap::page::{Page, PageFlags};
use crate::heap::remembered_set::SlotCallbackResult;
use crate::heap::space::release_page;
use crate::heap::sweeper::commit_outcome;
use crate::heap::{HeapInner, SweepSummary};
use crate::tracing::GcPhase;

/// Result of one minor collection.
#[derive(Debug, Default)]
pub(crate) struct MinorOutcome {
    pub(crate) marked: StepResult,
    pub(crate) swept: SweepSummary,
    pub(crate) remembered_slots: usize,
    pub(crate) pages_promoted: usize,
    pub(crate) mark_duration: Duration,
    pub(crate) sweep_duration: Duration,
}

/// Runs a minor collection. Every other thread must be stopped and every
/// LAB retired.
pub(crate) fn collect(heap: &HeapInner) -> MinorOutcome {
    let mut outcome = MinorOutcome::default();
    let young = heap.new_space.pages();
    crate::tracing::log_phase_start(GcPhase::MinorMark, heap.new_space.committed());

    // Major marking owns the overflow flags of pages it dropped work for.
    let major_overflowed: Vec<Arc<Page>> = if heap.major.is_marking() {
        young
            .iter()
            .filter(|page| page.has_flag(PageFlags::OVERFLOWED))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    let start = Instant::now();
    for page in &young {
        page.minor_bitmap().clear();
    }
    heap.minor.start(heap.major.mode());
    {
        let _phase = crate::tracing::trace_phase(GcPhase::MinorMark);
        let mut worklist = heap.minor.worklist().local();
        let mut visitor =
            MarkingVisitor::new(&heap.pages, heap.model.as_ref(), &heap.minor, &mut worklist).in_pause();
        heap.visit_roots(&mut |object| visitor.mark_root(object));
        outcome.remembered_slots = mark_remembered_slots(heap, &mut visitor);
        outcome.marked = drain_with_overflow(|| heap.new_space.pages(), &heap.minor, &mut visitor);
    }
    heap.minor.try_complete();
    heap.minor.finish();
    for page in major_overflowed {
        page.set_flag(PageFlags::OVERFLOWED);
    }
    outcome.mark_duration = start.elapsed();

    let start = Instant::now();
    outcome.swept = sweep_young(heap, young);
    if heap.major.is_marking() {
        filter_major_worklist(heap);
    }
    outcome.pages_promoted = promote_pages(heap);
    outcome.sweep_duration = start.elapsed();
    crate::tracing::log_phase_end(GcPhase::MinorSweep, outcome.swept.dead_bytes);

    if heap.config.verify_heap {
        let mut report = crate::gc::verifier::VerificationReport::default();
        crate::gc::verifier::verify_remembered_sets(&heap.pages, heap.model.as_ref(), &mut report);
        report.assert_ok();
    }
    outcome
}

/// Marks the young targets of recorded slots and drops slots that no
/// longer point into the young generation. Returns the slots kept.
fn mark_remembered_slots(heap: &HeapInner, visitor: &mut MarkingVisitor<'_>) -> usize {
    let mut kept = 0;
    for page in heap.pages.pages() {
        if page.is_young() || page.slot_set().is_empty() {
            continue;
        }
        page.slot_set().iterate(|index| {
            // Recorded slots lie inside the page.
            let slot = unsafe { Slot::new(page.address_of(index)) };
            match slot.load(Ordering::Acquire) {
                Some(value) if is_young(heap, value) => {
                    visitor.mark_root(value);
                    kept += 1;
                    SlotCallbackResult::Keep
                }
                _ => SlotCallbackResult::Remove,
            }
        });
    }
    kept
}

fn is_young(heap: &HeapInner, object: ObjectRef) -> bool {
    heap.pages
        .lookup(object.to_address())
        .is_some_and(|page| page.is_young())
}

fn sweep_young(heap: &HeapInner, young: Vec<Arc<Page>>) -> SweepSummary {
    let mut summary = SweepSummary::default();
    for outcome in heap.sweep(young, crate::gc::mark::Generation::Minor) {
        summary.add(&outcome);
        let page = &outcome.page;
        if outcome.is_empty() {
            heap.new_space.remove_page(page.id());
            release_page(&heap.pages, &heap.allocator, page);
            summary.pages_released += 1;
        } else {
            commit_outcome(&heap.new_space, &outcome);
        }
    }
    summary
}

/// Drops major worklist entries whose object did not survive.
fn filter_major_worklist(heap: &HeapInner) {
    heap.major.worklist().update(|object| {
        let (page, index) = heap.pages.locate(object.to_address())?;
        page.object_starts().is_set(index).then_some(object)
    });
}

/// Ages every young page and moves the old enough ones to the old
/// generation. Returns the number of pages promoted.
fn promote_pages(heap: &HeapInner) -> usize {
    let mut promoted = Vec::new();
    for page in heap.new_space.pages() {
        if page.increment_age() < heap.config.promotion_age {
            continue;
        }
        if let Some((page, items)) = heap.new_space.take_page(page.id()) {
            page.clear_flag(PageFlags::YOUNG);
            page.reset_age();
            heap.old_space.adopt_page(Arc::clone(&page), items);
            promoted.push(page);
        }
    }
    // Only once every promoted page is old can slots pointing at the
    // remaining young pages be told apart.
    for page in &promoted {
        record_young_slots(heap, page);
    }
    if !promoted.is_empty() {
        crate::tracing::log_promotion(promoted.len());
    }
    promoted.len()
}

fn record_young_slots(heap: &HeapInner, page: &Page) {
    let objects: Vec<ObjectRef> = page.objects().collect();
    for object in objects {
        heap.model.visit_pointers(object, &mut |slot: Slot| {
            if slot
                .load(Ordering::Relaxed)
                .is_some_and(|value| is_young(heap, value))
            {
                page.record_slot(slot);
            }
        });
    }
}
