//! Page sweeping.
//!
//! Sweeping walks the object-start table of a page, keeps black objects and
//! turns everything between them into free ranges. It only reads object
//! sizes and mark bits and writes the page's own side tables, so pages can
//! be swept in parallel. Rebuilding the free lists from the resulting
//! [`SweepOutcome`]s happens afterwards on one thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel;

use crate::address::{align_up, Address, WORD_SIZE};
use crate::gc::mark::Generation;
use crate::gc::task::TaskRunner;
use crate::heap::page::Page;
use crate::heap::space::Space;
use crate::object::ObjectModel;

/// Result of sweeping one page.
#[derive(Debug)]
pub struct SweepOutcome {
    /// The swept page.
    pub page: Arc<Page>,
    /// Free ranges as `(start, size)`, in address order.
    pub free_ranges: Vec<(Address, usize)>,
    /// Bytes of surviving objects.
    pub live_bytes: usize,
    /// Surviving objects.
    pub live_objects: usize,
    /// Reclaimed objects.
    pub dead_objects: usize,
    /// Bytes of reclaimed objects.
    pub dead_bytes: usize,
}

impl SweepOutcome {
    /// Returns `true` if nothing on the page survived.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live_objects == 0
    }
}

/// Sweeps `page` using the mark bits of `generation`.
///
/// Dead objects lose their object-start bit. Freed ranges are removed from
/// the page's remembered set and their major mark bits are cleared, so a
/// minor sweep during major marking leaves no stale colour behind.
pub fn sweep_page(page: &Arc<Page>, model: &dyn ObjectModel, generation: Generation) -> SweepOutcome {
    let bitmap = page.bitmap(generation);
    let starts = page.object_starts();
    let mut outcome = SweepOutcome {
        page: Arc::clone(page),
        free_ranges: Vec::new(),
        live_bytes: 0,
        live_objects: 0,
        dead_objects: 0,
        dead_bytes: 0,
    };

    let mut free_start = page.start();
    let objects: Vec<_> = page.objects().collect();
    for object in objects {
        let address = object.to_address();
        if address < free_start {
            // Stale start inside a live object.
            starts.clear(page.slot_index(address));
            continue;
        }
        let index = page.slot_index(address);
        let size = align_up(model.object_size(object).max(WORD_SIZE), WORD_SIZE);
        if bitmap.is_black(index) {
            release_range(page, &mut outcome, free_start, address);
            outcome.live_bytes += size;
            outcome.live_objects += 1;
            free_start = address.offset(size).min(page.end());
        } else {
            starts.clear(index);
            outcome.dead_objects += 1;
            outcome.dead_bytes += size;
        }
    }
    release_range(page, &mut outcome, free_start, page.end());
    outcome
}

fn release_range(page: &Page, outcome: &mut SweepOutcome, from: Address, to: Address) {
    if to <= from {
        return;
    }
    let (first, last) = (page.slot_index(from), page.slot_index(to));
    page.slot_set().remove_range(first, last);
    page.major_bitmap().clear_range(first, last);
    outcome.free_ranges.push((from, to.distance_from(from)));
}

/// Sweeps `pages` on the calling thread.
pub fn sweep_pages(pages: &[Arc<Page>], model: &dyn ObjectModel, generation: Generation) -> Vec<SweepOutcome> {
    pages
        .iter()
        .map(|page| sweep_page(page, model, generation))
        .collect()
}

/// Sweeps `pages` split into chunks, posting all chunks but the first to
/// `runner`. Chunks no worker has picked up by the time the calling thread
/// is done with its own are swept inline, so the call never depends on the
/// runner making progress.
pub fn sweep_pages_parallel(
    pages: Vec<Arc<Page>>,
    model: &Arc<dyn ObjectModel>,
    generation: Generation,
    runner: &dyn TaskRunner,
) -> Vec<SweepOutcome> {
    let workers = runner.number_of_worker_threads();
    if workers == 0 || pages.len() < 2 {
        return sweep_pages(&pages, model.as_ref(), generation);
    }
    let chunks = (workers + 1).min(pages.len());
    let chunk_len = pages.len().div_ceil(chunks);
    let pages = Arc::new(pages);
    let claimed: Arc<Vec<AtomicBool>> = Arc::new((0..chunks).map(|_| AtomicBool::new(false)).collect());
    let (tx, rx) = channel::unbounded::<Vec<SweepOutcome>>();

    for index in 1..chunks {
        let (pages, claimed, model, tx) = (
            Arc::clone(&pages),
            Arc::clone(&claimed),
            Arc::clone(model),
            tx.clone(),
        );
        runner.post_task(Box::new(move || {
            if claimed[index].swap(true, Ordering::AcqRel) {
                return;
            }
            let _ = tx.send(sweep_pages(chunk(&pages, index, chunk_len), model.as_ref(), generation));
        }));
    }
    drop(tx);

    claimed[0].store(true, Ordering::Release);
    let mut outcomes = sweep_pages(chunk(&pages, 0, chunk_len), model.as_ref(), generation);
    let mut remote = 0;
    for index in 1..chunks {
        if claimed[index].swap(true, Ordering::AcqRel) {
            remote += 1;
        } else {
            outcomes.extend(sweep_pages(chunk(&pages, index, chunk_len), model.as_ref(), generation));
        }
    }
    for _ in 0..remote {
        match rx.recv() {
            Ok(mut chunk) => outcomes.append(&mut chunk),
            Err(_) => break,
        }
    }
    outcomes
}

fn chunk(pages: &[Arc<Page>], index: usize, chunk_len: usize) -> &[Arc<Page>] {
    let start = (index * chunk_len).min(pages.len());
    let end = ((index + 1) * chunk_len).min(pages.len());
    &pages[start..end]
}

/// Rebuilds a page's free list from a sweep and updates its accounting.
/// Returns the bytes wasted in fragments.
pub fn commit_outcome(space: &Space, outcome: &SweepOutcome) -> usize {
    let page = &outcome.page;
    let mut wasted = 0;
    {
        let mut free_list = space.free_list();
        free_list.reset_page(page.id());
        for &(start, size) in &outcome.free_ranges {
            wasted += free_list.free(page, start, size);
        }
    }
    page.set_live_bytes(outcome.live_bytes);
    page.reset_allocated_bytes();
    wasted
}
