//! Metrics reported to an embedder-supplied recorder.

mod common;

use std::sync::{Arc, Mutex};

use common::{link, object, step_to_completion};
use rudo_heap::metrics::{CycleStart, StepEvent};
use rudo_heap::{
    AllocationType, CollectionType, GcMetrics, GcReason, Heap, HeapConfig, MetricsRecorder, SimpleObjectModel,
};

#[derive(Default)]
struct Recorded {
    started: Vec<CycleStart>,
    steps: Vec<StepEvent>,
    finished: Vec<GcMetrics>,
}

#[derive(Default)]
struct Recorder(Mutex<Recorded>);

impl MetricsRecorder for Recorder {
    fn cycle_started(&self, event: &CycleStart) {
        self.0.lock().unwrap().started.push(*event);
    }

    fn marking_step(&self, event: &StepEvent) {
        self.0.lock().unwrap().steps.push(*event);
    }

    fn cycle_finished(&self, metrics: &GcMetrics) {
        self.0.lock().unwrap().finished.push(*metrics);
    }
}

fn heap(recorder: &Arc<Recorder>) -> Heap {
    Heap::builder()
        .config(
            HeapConfig::new()
                .with_concurrent_marking_tasks(0)
                .with_marking_start_limit(usize::MAX)
                .with_marking_step_size(16),
        )
        .recorder(Arc::clone(recorder) as Arc<dyn MetricsRecorder>)
        .build()
        .unwrap()
}

#[test]
fn test_incremental_cycle_reports_start_steps_and_end() {
    let recorder = Arc::new(Recorder::default());
    let heap = heap(&recorder);
    let size = SimpleObjectModel::size_for(1, 8);
    let mut previous = None;
    for _ in 0..100 {
        let object = heap.allocate(size, AllocationType::Old).unwrap();
        unsafe { SimpleObjectModel::initialize(object, size, 1) };
        link(&heap, object, 0, previous);
        previous = Some(object);
    }
    let root = heap.roots().add(previous);

    assert!(heap.start_incremental_marking());
    let steps = step_to_completion(&heap);
    heap.finalize_incremental_marking();

    let recorded = recorder.0.lock().unwrap();
    assert_eq!(recorded.started.len(), 1);
    assert_eq!(recorded.started[0].collection_type, CollectionType::IncrementalMajor);
    assert_eq!(recorded.steps.len(), steps);
    let gc_id = recorded.started[0].gc_id;
    assert!(recorded.steps.iter().all(|step| step.gc_id == gc_id));
    assert_eq!(recorded.steps.iter().map(|s| s.objects).sum::<usize>(), 100);

    let metrics = recorded.finished[0];
    assert_eq!(recorded.finished.len(), 1);
    assert_eq!(metrics.gc_id, gc_id.0);
    assert_eq!(metrics.objects_marked, 100);
    assert_eq!(metrics.bytes_marked, 100 * size);
    assert_eq!(metrics.bytes_surviving, 100 * size);
    assert_eq!(metrics.total_collections, 1);
    assert!(metrics.duration >= metrics.pause_duration);
    drop(recorded);
    heap.roots().remove(root);
}

#[test]
fn test_collections_get_increasing_ids() {
    let recorder = Arc::new(Recorder::default());
    let heap = heap(&recorder);
    heap.collect_garbage();
    heap.collect_minor();
    heap.collect_garbage();

    let recorded = recorder.0.lock().unwrap();
    let kinds: Vec<_> = recorded.finished.iter().map(|m| m.collection_type).collect();
    assert_eq!(
        kinds,
        vec![CollectionType::Major, CollectionType::Minor, CollectionType::Major]
    );
    assert!(recorded.finished.windows(2).all(|w| w[0].gc_id < w[1].gc_id));
    assert!(recorded.finished.iter().all(|m| m.reason == GcReason::Explicit));
    assert_eq!(recorded.finished[2].total_collections, 3);
}

#[test]
fn test_statistics_track_committed_memory() {
    let recorder = Arc::new(Recorder::default());
    let heap = heap(&recorder);
    let empty = heap.statistics();
    assert_eq!(empty.committed_bytes, 0);
    assert_eq!(empty.page_count, 0);

    object(&heap, 0, 56);
    let large = heap.allocate(HeapConfig::DEFAULT_PAGE_SIZE, AllocationType::Old).unwrap();
    unsafe { SimpleObjectModel::initialize(large, HeapConfig::DEFAULT_PAGE_SIZE, 0) };
    let stats = heap.statistics();
    assert_eq!(stats.new_space_committed, HeapConfig::DEFAULT_PAGE_SIZE);
    assert!(stats.large_object_committed >= HeapConfig::DEFAULT_PAGE_SIZE);
    assert_eq!(stats.large_objects_size, HeapConfig::DEFAULT_PAGE_SIZE);
    assert_eq!(stats.page_count, 2);
    assert!(stats.allocated_since_gc >= HeapConfig::DEFAULT_PAGE_SIZE);

    heap.collect_garbage();
    let stats = heap.statistics();
    assert_eq!(stats.large_object_committed, 0);
    assert_eq!(stats.allocated_since_gc, 0);
    assert_eq!(stats.total_collections, 1);
}
