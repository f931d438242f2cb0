//! Racing markers and mutators on shared mark state.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use common::{deterministic_heap, object, object_in};
use rudo_heap::gc::mark::Atomic;
use rudo_heap::gc::{MarkBitmap, Worklist};
use rudo_heap::{AllocationType, Heap, HeapConfig, MarkingState, SimpleObjectModel, SlotIndex};

const THREADS: usize = 4;
const ROUNDS: u32 = 2_000;

#[test]
fn test_exactly_one_thread_wins_each_shade() {
    let bitmap = Arc::new(MarkBitmap::new(ROUNDS as usize * 2));
    let worklist = Arc::new(Worklist::<u32>::new(64, 1024));
    let pushes = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let (bitmap, worklist, pushes, start) = (
                Arc::clone(&bitmap),
                Arc::clone(&worklist),
                Arc::clone(&pushes),
                Arc::clone(&start),
            );
            thread::spawn(move || {
                let mut local = worklist.local();
                for round in 0..ROUNDS {
                    start.wait();
                    let index = SlotIndex(round * 2);
                    if bitmap.white_to_grey::<Atomic>(index) {
                        local.push(round).unwrap();
                        pushes.fetch_add(1, Ordering::Relaxed);
                    }
                }
                local.publish();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pushes.load(Ordering::Relaxed), ROUNDS as usize);
    assert_eq!(worklist.len(), ROUNDS as usize);
    assert_eq!(bitmap.grey_count(), ROUNDS as usize);
    assert!(bitmap.find_illegal_pattern().is_none());

    let mut seen = vec![false; ROUNDS as usize];
    let mut local = worklist.local();
    while let Some(round) = local.pop() {
        assert!(!seen[round as usize], "round {round} pushed twice");
        seen[round as usize] = true;
    }
    assert!(seen.iter().all(|&seen| seen));
}

#[test]
fn test_grey_to_black_races_with_shading() {
    let bitmap = Arc::new(MarkBitmap::new(1024));
    let start = Arc::new(Barrier::new(2));
    let blackened = {
        let (bitmap, start) = (Arc::clone(&bitmap), Arc::clone(&start));
        thread::spawn(move || {
            start.wait();
            (0..1024)
                .filter(|&i| bitmap.grey_to_black::<Atomic>(SlotIndex(i)))
                .count()
        })
    };
    start.wait();
    let shaded = (0..1024)
        .filter(|&i| bitmap.white_to_grey::<Atomic>(SlotIndex(i)))
        .count();
    let blackened = blackened.join().unwrap();

    assert_eq!(shaded, 1024);
    assert_eq!(bitmap.black_count(), blackened);
    assert_eq!(bitmap.grey_count(), 1024 - blackened);
    assert!(bitmap.find_illegal_pattern().is_none());
}

fn run_background_stores(heap: &Heap, concurrent_tasks: usize) {
    const FIELDS: usize = 256;
    let array = object(heap, FIELDS, 0);
    let root = heap.roots().add(Some(array));
    for i in 0..FIELDS / 2 {
        let child = object(heap, 0, 8);
        heap.store(array, SimpleObjectModel::field(array, i), Some(child));
    }
    assert!(heap.start_incremental_marking());

    let local = heap.new_local_heap().unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let worker = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            local.unpark();
            let mut children = Vec::new();
            for i in FIELDS / 2..FIELDS {
                let child = object_in(&local, 0, 8, AllocationType::Young);
                local.store(array, SimpleObjectModel::field(array, i), Some(child));
                children.push(child);
                local.safepoint();
            }
            drop(local);
            done.store(true, Ordering::Release);
            children
        })
    };
    while !done.load(Ordering::Acquire) {
        heap.marking_step();
        heap.safepoint();
        thread::yield_now();
    }
    let children = heap.main().parked(|| worker.join().unwrap());

    while heap.marking_state() == MarkingState::Marking {
        heap.marking_step();
    }
    heap.finalize_incremental_marking();
    assert!(children.iter().all(|&child| heap.contains(child)));
    assert_eq!(heap.last_gc_metrics().objects_reclaimed, 0);
    if concurrent_tasks == 0 {
        assert_eq!(heap.mark_stats().concurrent_objects.load(Ordering::Relaxed), 0);
    }
    heap.roots().remove(root);
}

#[test]
fn test_background_stores_during_incremental_marking() {
    let heap = deterministic_heap(HeapConfig::new());
    run_background_stores(&heap, 0);
}

#[test]
fn test_background_stores_with_concurrent_markers() {
    let heap = Heap::with_config(
        HeapConfig::new()
            .with_concurrent_marking_tasks(2)
            .with_marking_step_size(8)
            .with_marking_start_limit(usize::MAX),
    )
    .unwrap();
    run_background_stores(&heap, 2);
}
