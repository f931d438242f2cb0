//! Free-list allocation through the public heap and space APIs.

mod common;

use common::{deterministic_heap, object_in};
use rudo_heap::heap::page::PageTable;
use rudo_heap::heap::page_allocator::{PageAllocator, SystemBackend};
use rudo_heap::heap::space::{LinearAllocationArea, Space, SpaceKind};
use rudo_heap::{AllocationType, FreeListStrategy, Heap, HeapConfig, SimpleObjectModel};

const STRATEGIES: [FreeListStrategy; 4] = [
    FreeListStrategy::Legacy,
    FreeListStrategy::FastAlloc,
    FreeListStrategy::Many,
    FreeListStrategy::ManyCached,
];

fn heap(strategy: FreeListStrategy) -> Heap {
    deterministic_heap(
        HeapConfig::new()
            .with_page_size(64 * 1024)
            .with_free_list_strategy(strategy)
            .with_parallel_sweep(false),
    )
}

#[test]
fn test_reclaimed_holes_are_reused_without_growing() {
    for strategy in STRATEGIES {
        let heap = heap(strategy);
        let main = heap.main();
        let holder = object_in(main, 400, 0, AllocationType::Old);
        let root = heap.roots().add(Some(holder));
        for i in 0..400 {
            let child = object_in(main, 0, 56, AllocationType::Old);
            if i % 2 == 0 {
                heap.store(holder, SimpleObjectModel::field(holder, i), Some(child));
            }
        }
        heap.collect_garbage();
        let metrics = heap.last_gc_metrics();
        assert_eq!(metrics.objects_reclaimed, 200, "{strategy}");
        let committed = heap.statistics().committed_bytes;
        assert!(heap.statistics().available_bytes >= 200 * 64, "{strategy}");

        for _ in 0..200 {
            object_in(main, 0, 56, AllocationType::Old);
        }
        assert_eq!(heap.statistics().committed_bytes, committed, "{strategy}");
        heap.roots().remove(root);
    }
}

#[test]
fn test_fragments_below_minimum_block_are_wasted() {
    let heap = heap(FreeListStrategy::ManyCached);
    let main = heap.main();
    let a = object_in(main, 1, 0, AllocationType::Old);
    let gap = object_in(main, 0, 0, AllocationType::Old);
    let b = object_in(main, 0, 8, AllocationType::Old);
    assert_eq!(gap.to_address().distance_from(a.to_address()), 16);
    assert_eq!(b.to_address().distance_from(gap.to_address()), 8);
    heap.store(a, SimpleObjectModel::field(a, 0), Some(b));
    let root = heap.roots().add(Some(a));

    heap.collect_garbage();
    assert!(!heap.contains(gap));
    assert!(heap.contains(b));
    assert!(heap.statistics().wasted_bytes >= 8);
    heap.roots().remove(root);
}

#[test]
fn test_space_round_trip_per_strategy() {
    for strategy in STRATEGIES {
        let config = HeapConfig::new()
            .with_page_size(64 * 1024)
            .with_free_list_strategy(strategy)
            .sanitized();
        let table = PageTable::new();
        let allocator = PageAllocator::new(&config, Box::new(SystemBackend));
        let space = Space::new(SpaceKind::Old, &config, usize::MAX);
        let page = space.expand(&table, &allocator).unwrap().unwrap();
        assert_eq!(space.available(), page.size());

        let mut lab = LinearAllocationArea::new(space.allocate_block(4096).unwrap());
        let mut objects = Vec::new();
        while let Some(address) = lab.allocate(48) {
            objects.push(address);
        }
        // Give back every other object plus the unused tail.
        let mut freed = lab.remaining();
        if lab.remaining() > 0 {
            space.free(&page, lab.top(), lab.remaining());
        }
        for &address in objects.iter().step_by(2) {
            assert_eq!(space.free(&page, address, 48), 0, "{strategy}");
            freed += 48;
        }
        let before = space.available();
        assert!(before >= freed, "{strategy}");

        let block = space.allocate_block(40).unwrap();
        assert!(block.size >= 40, "{strategy}");
        assert!(page.contains(block.start), "{strategy}");
        assert_eq!(space.available(), before - block.size, "{strategy}");
        assert_eq!(space.wasted(), 0, "{strategy}");

        // Only 48-byte holes and the tail remain, so every strategy hands
        // back a block of exactly the freed size.
        let before_free = space.available();
        assert_eq!(space.free(&page, objects[1], 48), 0, "{strategy}");
        assert_eq!(space.available(), before_free + 48, "{strategy}");
        let block = space.allocate_block(48).unwrap();
        assert_eq!(block.size, 48, "{strategy}");
        assert_eq!(space.available(), before_free, "{strategy}");
    }
}
