//! Helpers shared by the integration tests.

#![allow(dead_code)]

use rudo_heap::{AllocationType, Heap, HeapConfig, LocalHeap, ObjectRef, SimpleObjectModel};

/// A heap that never starts marking on its own and runs no background
/// marking tasks, so tests drive every transition.
pub fn deterministic_heap(config: HeapConfig) -> Heap {
    Heap::with_config(
        config
            .with_concurrent_marking_tasks(0)
            .with_marking_start_limit(usize::MAX),
    )
    .unwrap()
}

/// Allocates and initializes an object with `pointers` reference fields and
/// `data` bytes of payload.
pub fn object(heap: &Heap, pointers: usize, data: usize) -> ObjectRef {
    object_in(heap.main(), pointers, data, AllocationType::Young)
}

/// Like [`object`] on any local heap and space.
pub fn object_in(local: &LocalHeap, pointers: usize, data: usize, allocation: AllocationType) -> ObjectRef {
    let size = SimpleObjectModel::size_for(pointers, data);
    let object = local.allocate(size, allocation).unwrap();
    unsafe { SimpleObjectModel::initialize(object, size, pointers) };
    object
}

/// Stores `value` into field `index` of `host` through the barriers.
pub fn link(heap: &Heap, host: ObjectRef, index: usize, value: Option<ObjectRef>) {
    heap.store(host, SimpleObjectModel::field(host, index), value);
}

/// Steps marking until it reports no remaining work.
pub fn step_to_completion(heap: &Heap) -> usize {
    let mut steps = 0;
    loop {
        steps += 1;
        if heap.marking_step().worklist_empty {
            return steps;
        }
        assert!(steps < 100_000, "marking did not converge");
    }
}
