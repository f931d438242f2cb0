//! Young generation collections triggered by allocation and interleaved
//! with major marking.

mod common;

use common::{deterministic_heap, link, object, step_to_completion};
use rudo_heap::{CollectionType, GcReason, HeapConfig, MarkingState};

const PAGE: usize = 64 * 1024;

#[test]
fn test_full_new_space_triggers_minor_collections() {
    let heap = deterministic_heap(
        HeapConfig::new()
            .with_page_size(PAGE)
            .with_new_space_capacity(2 * PAGE),
    );
    let survivor = object(&heap, 0, 64);
    let root = heap.roots().add(Some(survivor));
    for _ in 0..1000 {
        object(&heap, 0, 1016);
    }

    let metrics = heap.last_gc_metrics();
    assert_eq!(metrics.collection_type, CollectionType::Minor);
    assert_eq!(metrics.reason, GcReason::NewSpaceFull);
    assert!(metrics.objects_reclaimed > 0);
    assert!(heap.statistics().new_space_committed <= 2 * PAGE);
    assert!(heap.contains(survivor));
    heap.roots().remove(root);
}

#[test]
fn test_survivors_are_promoted_after_promotion_age() {
    let heap = deterministic_heap(HeapConfig::new().with_promotion_age(2));
    let parent = object(&heap, 1, 0);
    let child = object(&heap, 0, 8);
    link(&heap, parent, 0, Some(child));
    let root = heap.roots().add(Some(parent));

    heap.collect_minor();
    assert!(heap.is_young(parent));
    assert_eq!(heap.last_gc_metrics().pages_promoted, 0);

    heap.collect_minor();
    assert!(!heap.is_young(parent));
    assert!(!heap.is_young(child));
    assert_eq!(heap.last_gc_metrics().pages_promoted, 1);
    assert!(heap.verify().is_ok());

    // Promoted objects are only reclaimed by full collections.
    heap.roots().remove(root);
    heap.collect_minor();
    assert!(heap.contains(parent));
    heap.collect_garbage();
    assert!(!heap.contains(parent));
    assert!(!heap.contains(child));
}

#[test]
fn test_dead_young_objects_leave_the_major_worklist() {
    let heap = deterministic_heap(HeapConfig::new());
    let doomed = object(&heap, 1, 0);
    let kept = object(&heap, 0, 0);
    let doomed_child = object(&heap, 0, 0);
    link(&heap, doomed, 0, Some(doomed_child));
    let doomed_root = heap.roots().add(Some(doomed));
    let kept_root = heap.roots().add(Some(kept));

    assert!(heap.start_incremental_marking());
    heap.roots().remove(doomed_root);
    heap.collect_minor();
    assert!(!heap.contains(doomed));
    assert!(!heap.contains(doomed_child));
    assert!(heap.contains(kept));
    assert_eq!(heap.marking_state(), MarkingState::Marking);
    assert!(heap.verify().is_ok());

    step_to_completion(&heap);
    heap.finalize_incremental_marking();
    assert!(heap.contains(kept));
    assert_eq!(heap.last_gc_metrics().collection_type, CollectionType::IncrementalMajor);
    heap.roots().remove(kept_root);
}

#[test]
fn test_minor_collection_reclaims_empty_pages() {
    let heap = deterministic_heap(HeapConfig::new().with_page_size(PAGE));
    for _ in 0..200 {
        object(&heap, 0, 1016);
    }
    let before = heap.statistics().new_space_committed;
    assert!(before >= 2 * PAGE);
    heap.collect_minor();
    let metrics = heap.last_gc_metrics();
    assert!(metrics.pages_released >= 2);
    assert_eq!(metrics.objects_reclaimed, 200);
    assert!(heap.statistics().new_space_committed < before);
}
