//! Stop-the-world pauses across many local heaps.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{deterministic_heap, object, object_in};
use rudo_heap::{AllocationType, HeapConfig, HeapError, LocalHeap};

const THREADS: usize = 8;

struct Workers {
    progress: Arc<Vec<AtomicUsize>>,
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<usize>>,
}

impl Workers {
    fn spawn(locals: Vec<LocalHeap>) -> Self {
        let progress: Arc<Vec<AtomicUsize>> = Arc::new((0..locals.len()).map(|_| AtomicUsize::new(0)).collect());
        let stop = Arc::new(AtomicBool::new(false));
        let handles = locals
            .into_iter()
            .enumerate()
            .map(|(i, local)| {
                let (progress, stop) = (Arc::clone(&progress), Arc::clone(&stop));
                thread::spawn(move || {
                    local.unpark();
                    let mut allocated = 0;
                    let mut n = 0usize;
                    while !stop.load(Ordering::Acquire) {
                        local.safepoint();
                        progress[i].fetch_add(1, Ordering::Release);
                        if n % 1024 == 0 {
                            object_in(&local, 1, 16, AllocationType::Young);
                            allocated += 1;
                        }
                        n += 1;
                    }
                    allocated
                })
            })
            .collect();
        Self {
            progress,
            stop,
            handles,
        }
    }

    fn total(&self) -> usize {
        self.progress.iter().map(|p| p.load(Ordering::Acquire)).sum()
    }

    fn all_started(&self) -> bool {
        self.progress.iter().all(|p| p.load(Ordering::Acquire) > 0)
    }
}

#[test]
fn test_pause_stops_every_local_heap() {
    let heap = deterministic_heap(HeapConfig::new());
    let locals = (0..THREADS).map(|_| heap.new_local_heap().unwrap()).collect();
    let workers = Workers::spawn(locals);
    while !workers.all_started() {
        heap.safepoint();
        thread::yield_now();
    }

    let pause = heap.request_pause();
    assert_eq!(pause.parked_threads(), THREADS);
    assert!(pause.stopped_threads() <= THREADS);
    let frozen = workers.total();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(workers.total(), frozen);
    pause.resume();

    while workers.total() == frozen {
        heap.safepoint();
        thread::yield_now();
    }
    workers.stop.store(true, Ordering::Release);
    let allocated: usize = heap
        .main()
        .parked(|| workers.handles.into_iter().map(|h| h.join().unwrap()).sum());
    assert!(allocated >= THREADS);
}

#[test]
fn test_collection_while_threads_run() {
    let heap = deterministic_heap(HeapConfig::new());
    let keep = object(&heap, 0, 64);
    let root = heap.roots().add(Some(keep));
    let locals = (0..THREADS).map(|_| heap.new_local_heap().unwrap()).collect();
    let workers = Workers::spawn(locals);
    while !workers.all_started() {
        heap.safepoint();
        thread::yield_now();
    }

    for _ in 0..3 {
        heap.collect_garbage();
        heap.collect_minor();
    }
    assert!(heap.contains(keep));
    assert_eq!(heap.statistics().total_collections, 6);

    workers.stop.store(true, Ordering::Release);
    heap.main().parked(|| {
        for handle in workers.handles {
            handle.join().unwrap();
        }
    });
    heap.roots().remove(root);
}

#[test]
fn test_parked_heaps_do_not_block_pauses() {
    let heap = deterministic_heap(HeapConfig::new());
    let parked: Vec<_> = (0..THREADS).map(|_| heap.new_local_heap().unwrap()).collect();
    assert!(parked.iter().all(LocalHeap::is_parked));
    let pause = heap.request_pause();
    assert_eq!(pause.stopped_threads(), 0);
    assert_eq!(pause.parked_threads(), THREADS);
    drop(pause);
    drop(parked);
    heap.collect_garbage();
}

#[test]
fn test_single_threaded_heap_has_no_local_heaps() {
    let heap = deterministic_heap(HeapConfig::new().with_single_threaded(true));
    assert!(matches!(heap.new_local_heap(), Err(HeapError::SingleThreaded)));
    let object = object(&heap, 0, 8);
    heap.collect_garbage();
    assert!(!heap.contains(object));
}
