//! Benchmarks for marking and allocation.
//!
//! Compares a stop-the-world collection with an incremental cycle over the
//! same object graph, and measures the allocation fast path per free-list
//! strategy.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rudo_heap::{
    AllocationType, FreeListStrategy, Heap, HeapConfig, ObjectRef, RootHandle, SimpleObjectModel,
};

fn heap(config: HeapConfig) -> Heap {
    Heap::with_config(
        config
            .with_concurrent_marking_tasks(0)
            .with_marking_start_limit(usize::MAX),
    )
    .expect("heap")
}

fn allocate(heap: &Heap, pointers: usize, data: usize, allocation: AllocationType) -> ObjectRef {
    let size = SimpleObjectModel::size_for(pointers, data);
    let object = heap.allocate(size, allocation).expect("allocation");
    unsafe { SimpleObjectModel::initialize(object, size, pointers) };
    object
}

/// Builds a binary tree of `nodes` old objects and roots it.
fn build_tree(heap: &Heap, nodes: usize) -> RootHandle {
    let objects: Vec<_> = (0..nodes)
        .map(|_| allocate(heap, 2, 16, AllocationType::Old))
        .collect();
    for (i, &object) in objects.iter().enumerate() {
        for child in 0..2 {
            if let Some(&target) = objects.get(2 * i + 1 + child) {
                heap.store(object, SimpleObjectModel::field(object, child), Some(target));
            }
        }
    }
    heap.roots().add(objects.first().copied())
}

fn benchmark_full_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("marking");
    group.sample_size(10);
    group.warm_up_time(std::time::Duration::from_millis(500));

    for nodes in [10_000, 100_000] {
        let heap = heap(HeapConfig::new());
        let root = build_tree(&heap, nodes);
        group.bench_with_input(BenchmarkId::new("stop_the_world", nodes), &nodes, |b, _| {
            b.iter(|| heap.collect_garbage());
        });
        group.bench_with_input(BenchmarkId::new("incremental", nodes), &nodes, |b, _| {
            b.iter(|| {
                heap.start_incremental_marking();
                while !heap.marking_step().worklist_empty {}
                heap.finalize_incremental_marking();
                std::hint::black_box(heap.last_pause())
            });
        });
        heap.roots().remove(root);
    }
    group.finish();
}

fn benchmark_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    group.sample_size(10);
    group.warm_up_time(std::time::Duration::from_millis(500));

    for strategy in [
        FreeListStrategy::Legacy,
        FreeListStrategy::FastAlloc,
        FreeListStrategy::ManyCached,
    ] {
        let heap = heap(HeapConfig::new().with_free_list_strategy(strategy));
        group.bench_function(BenchmarkId::new("young_10k", strategy), |b| {
            b.iter(|| {
                for _ in 0..10_000 {
                    std::hint::black_box(allocate(&heap, 1, 24, AllocationType::Young));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_full_collection, benchmark_allocation);
criterion_main!(benches);
