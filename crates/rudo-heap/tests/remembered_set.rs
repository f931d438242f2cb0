//! Old-to-young slot recording.

mod common;

use std::sync::Arc;
use std::thread;

use common::{deterministic_heap, object_in};
use rudo_heap::heap::remembered_set::{SlotCallbackResult, SlotSet};
use rudo_heap::{AllocationType, HeapConfig, SimpleObjectModel, SlotIndex};

#[test]
fn test_concurrent_inserts_count_each_slot_once() {
    let set = Arc::new(SlotSet::new(64 * 1024));
    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let set = Arc::clone(&set);
            // Overlapping ranges: [t * 8192, t * 8192 + 16384).
            thread::spawn(move || {
                (t * 8192..t * 8192 + 16384)
                    .filter(|&i| set.insert(SlotIndex(i)))
                    .count()
            })
        })
        .collect();
    let newly: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(newly, 5 * 8192);
    assert_eq!(set.len(), 5 * 8192);

    let mut visited = 0;
    let kept = set.iterate(|index| {
        visited += 1;
        if index.get() % 2 == 0 {
            SlotCallbackResult::Keep
        } else {
            SlotCallbackResult::Remove
        }
    });
    assert_eq!(visited, 5 * 8192);
    assert_eq!(kept, set.len());
    assert_eq!(set.len(), 5 * 4096);
}

#[test]
fn test_recorded_slots_keep_young_objects_alive() {
    let heap = deterministic_heap(HeapConfig::new().with_promotion_age(8));
    let main = heap.main();
    let host = object_in(main, 64, 0, AllocationType::Old);
    let root = heap.roots().add(Some(host));
    let young: Vec<_> = (0..64)
        .map(|i| {
            let value = object_in(main, 0, 8, AllocationType::Young);
            heap.store(host, SimpleObjectModel::field(host, i), Some(value));
            value
        })
        .collect();
    assert!(heap.verify().is_ok());

    heap.collect_minor();
    assert!(young.iter().all(|&value| heap.contains(value)));
    assert_eq!(heap.last_gc_metrics().objects_reclaimed, 0);

    for i in (0..64).step_by(2) {
        heap.store(host, SimpleObjectModel::field(host, i), None);
    }
    heap.collect_minor();
    for (i, &value) in young.iter().enumerate() {
        assert_eq!(heap.contains(value), i % 2 == 1, "field {i}");
    }
    assert_eq!(heap.last_gc_metrics().objects_reclaimed, 32);
    assert!(heap.verify().is_ok());
    heap.roots().remove(root);
}

#[test]
fn test_old_to_old_stores_are_not_needed_by_minor_collections() {
    let heap = deterministic_heap(HeapConfig::new());
    let main = heap.main();
    let host = object_in(main, 1, 0, AllocationType::Old);
    let old = object_in(main, 0, 8, AllocationType::Old);
    heap.store(host, SimpleObjectModel::field(host, 0), Some(old));
    heap.collect_minor();
    // Minor collections never reclaim old objects, rooted or not.
    assert!(heap.contains(host));
    assert!(heap.contains(old));
    heap.collect_garbage();
    assert!(!heap.contains(host));
    assert!(!heap.contains(old));
}
