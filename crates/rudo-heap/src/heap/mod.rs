//! The heap: spaces, thread contexts and collection orchestration.
//!
//! [`Heap`] is created on the embedder's main thread and owns the main
//! thread's [`LocalHeap`]. Other threads allocate through their own
//! [`LocalHeap`] from [`Heap::new_local_heap`].
//!
//! Collections:
//!
//! * **Incremental major marking** starts when the old generation grows past
//!   the marking start limit (or on request), then advances through
//!   allocation-driven steps on the main thread and background tasks on the
//!   task runner. Once every worklist is empty the cycle is `Complete` and
//!   the next allocation slow path finalizes it in the atomic pause.
//! * **Full collections** mark and sweep everything in one pause. They run
//!   on request and when an allocation fails.
//! * **Minor collections** mark and sweep the young generation in one pause
//!   when it is full, using the remembered sets of old pages as roots.
//!
//! All orchestration takes the heap's collection lock, so at most one pause
//! runs at a time.

pub mod free_list;
pub mod local_heap;
pub mod object_start;
pub mod page;
pub mod page_allocator;
pub mod remembered_set;
pub mod space;
pub mod sweeper;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::address::{Address, ObjectRef, PageId, SlotIndex};
use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult};
use crate::gc::collection_barrier::CollectionBarrier;
use crate::gc::incremental::{drain_with_overflow, rescan_overflowed_pages, MarkingController, MarkingState, StepResult};
use crate::gc::mark::{Color, Generation, MarkingMode};
use crate::gc::marker::{ConcurrentMarking, MarkingJob, MarkingVisitor};
use crate::gc::minor;
use crate::gc::safepoint::{Safepoint, SafepointScope, ThreadContext, ThreadState};
use crate::gc::task::{DefaultTaskRunner, TaskRunner};
use crate::gc::verifier::{self, VerificationReport};
use crate::metrics::{
    CollectionType, CycleStart, GcMetrics, GcReason, MetricsRecorder, NoopRecorder, PhaseTimer,
    StepEvent,
};
use crate::object::{ObjectModel, SimpleObjectModel};
use crate::roots::{RootEnumerator, RootSet, RootVisitor};
use crate::tracing::{GcId, GcPhase};

use self::local_heap::MutatorState;
use self::page::{Page, PageFlags, PageTable};
use self::page_allocator::{MemoryBackend, PageAllocator, SystemBackend};
use self::space::{release_page, LargeObjectSpace, LinearAllocationArea, Space, SpaceKind};
use self::sweeper::{commit_outcome, sweep_pages, sweep_pages_parallel, SweepOutcome};

pub use self::local_heap::{AllocationType, LocalHeap};

/// Bookkeeping of the running major cycle.
#[derive(Debug)]
struct CycleState {
    gc_id: GcId,
    collection_type: CollectionType,
    reason: GcReason,
    started: Instant,
    timer: PhaseTimer,
    steps: usize,
}

impl CycleState {
    fn new(collection_type: CollectionType, reason: GcReason) -> Self {
        Self {
            gc_id: crate::tracing::next_gc_id(),
            collection_type,
            reason,
            started: Instant::now(),
            timer: PhaseTimer::new(),
            steps: 0,
        }
    }
}

/// Totals of one sweep.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepSummary {
    pub(crate) live_objects: usize,
    pub(crate) live_bytes: usize,
    pub(crate) dead_objects: usize,
    pub(crate) dead_bytes: usize,
    pub(crate) pages_released: usize,
    pub(crate) old_live_bytes: usize,
}

impl SweepSummary {
    pub(crate) fn add(&mut self, outcome: &SweepOutcome) {
        self.live_objects += outcome.live_objects;
        self.live_bytes += outcome.live_bytes;
        self.dead_objects += outcome.dead_objects;
        self.dead_bytes += outcome.dead_bytes;
    }
}

/// State shared by every [`LocalHeap`] and background task.
pub(crate) struct HeapInner {
    pub(crate) config: HeapConfig,
    pub(crate) model: Arc<dyn ObjectModel>,
    pub(crate) pages: PageTable,
    pub(crate) allocator: PageAllocator,
    pub(crate) new_space: Space,
    pub(crate) old_space: Space,
    pub(crate) large_space: LargeObjectSpace,
    pub(crate) roots: Arc<RootSet>,
    enumerators: RwLock<Vec<Arc<dyn RootEnumerator>>>,
    pub(crate) major: MarkingController,
    pub(crate) minor: MarkingController,
    pub(crate) safepoint: Safepoint,
    pub(crate) collection_barrier: CollectionBarrier,
    concurrent: ConcurrentMarking,
    pub(crate) task_runner: Arc<dyn TaskRunner>,
    owned_runner: Option<Arc<DefaultTaskRunner>>,
    recorder: Arc<dyn MetricsRecorder>,
    pub(crate) gc_lock: Mutex<()>,
    cycle: Mutex<Option<CycleState>>,
    last_metrics: Mutex<GcMetrics>,
    total_collections: AtomicUsize,
    next_context_id: AtomicUsize,
    torn_down: AtomicBool,
    evacuation_candidates: Mutex<Vec<PageId>>,
    marking_start_limit: AtomicUsize,
    main_context: OnceLock<Arc<ThreadContext>>,
    weak_self: Weak<HeapInner>,
}

impl HeapInner {
    pub(crate) fn next_context_id(&self) -> usize {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn space(&self, kind: SpaceKind) -> &Space {
        match kind {
            SpaceKind::New => &self.new_space,
            _ => &self.old_space,
        }
    }

    fn marking_mode(&self) -> MarkingMode {
        if self.config.single_threaded {
            MarkingMode::NonAtomic
        } else {
            MarkingMode::Atomic
        }
    }

    fn old_generation_size(&self) -> usize {
        self.old_space.committed() + self.large_space.committed()
    }

    fn allocated_since_gc(&self) -> usize {
        self.new_space.allocated_since_gc()
            + self.old_space.allocated_since_gc()
            + self.large_space.allocated_since_gc()
    }

    pub(crate) fn main_is_parked(&self) -> bool {
        self.main_context
            .get()
            .is_some_and(|context| context.thread_state() == ThreadState::Parked)
    }

    /// Zeroes freshly bumped memory and registers it as an object.
    pub(crate) fn initialize_object(&self, page: &Arc<Page>, address: Address, size: usize) -> Option<ObjectRef> {
        // Free-list blocks keep their links in the memory they describe.
        unsafe { std::ptr::write_bytes(address.as_ptr::<u8>(), 0, size) };
        page.object_starts().set(page.slot_index(address));
        page.add_allocated_bytes(size);
        self.space(page.space()).note_allocated(size);
        ObjectRef::from_address(address)
    }

    pub(crate) fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        self.roots.enumerate_roots(visitor);
        let enumerators = self.enumerators.read().clone();
        for enumerator in enumerators {
            enumerator.enumerate_roots(visitor);
        }
    }

    /// Takes the collection lock, parking `local` while waiting so a pause
    /// run by the lock holder does not wait for us.
    fn lock_gc(&self, local: &LocalHeap) -> MutexGuard<'_, ()> {
        if let Some(guard) = self.gc_lock.try_lock() {
            return guard;
        }
        local.park();
        let guard = self.gc_lock.lock();
        local.unpark();
        guard
    }

    /// Retires every LAB and publishes every barrier. Runs in a pause.
    pub(crate) fn flush_contexts(&self, scope: &SafepointScope<'_>) {
        for context in scope.contexts() {
            let mut state = context.mutator.lock();
            state.retire_labs(self);
            state.barrier.publish(&self.pages, &self.major);
        }
    }

    fn record_cycle_start(&self, cycle: &CycleState) {
        self.recorder.cycle_started(&CycleStart {
            gc_id: cycle.gc_id,
            collection_type: cycle.collection_type,
            reason: cycle.reason,
            committed_bytes: self.allocator.committed(),
            allocated_bytes: self.allocated_since_gc(),
        });
    }

    /// Starts major marking inside a pause: clears the previous colours,
    /// starts the controller and activates every barrier.
    fn begin_major_cycle(&self, scope: &SafepointScope<'_>, collection_type: CollectionType, reason: GcReason) {
        let cycle = CycleState::new(collection_type, reason);
        self.record_cycle_start(&cycle);
        crate::tracing::log_phase_start(GcPhase::StartMarking, self.allocator.committed());
        for page in self.pages.pages() {
            page.major_bitmap().clear();
            page.clear_flag(PageFlags::OVERFLOWED);
        }
        self.major.start(self.marking_mode());
        for context in scope.contexts() {
            context.mutator.lock().barrier.activate(self.major.worklist());
        }
        *self.cycle.lock() = Some(cycle);
    }

    /// Starts incremental marking. Returns `false` if a cycle was already
    /// running.
    pub(crate) fn start_marking(&self, local: &LocalHeap, reason: GcReason) -> bool {
        if self.is_torn_down() || self.major.is_marking() {
            return false;
        }
        let guard = self.lock_gc(local);
        if self.major.is_marking() {
            return false;
        }
        {
            let pause_start = Instant::now();
            let scope = self.safepoint.enter_safepoint_scope(Some(local.context().as_ref()));
            let _phase = crate::tracing::trace_phase(GcPhase::StartMarking);
            self.begin_major_cycle(&scope, CollectionType::IncrementalMajor, reason);
            let mut worklist = self.major.worklist().local();
            let mut visitor = MarkingVisitor::new(&self.pages, self.model.as_ref(), &self.major, &mut worklist);
            self.visit_roots(&mut |object| visitor.mark_root(object));
            visitor.publish();
            drop(scope);
            if let Some(cycle) = self.cycle.lock().as_mut() {
                cycle.timer.add_pause(pause_start.elapsed());
            }
        }
        drop(guard);
        self.schedule_concurrent_marking();
        true
    }

    fn schedule_concurrent_marking(&self) {
        if self.concurrent.max_tasks() == 0 || self.major.state() != MarkingState::Marking {
            return;
        }
        let heap = self.weak_self.clone();
        let job: MarkingJob = Arc::new(move |preempt: &AtomicBool| {
            if let Some(heap) = heap.upgrade() {
                heap.run_concurrent_marking(preempt);
            }
        });
        self.concurrent.schedule(&job);
    }

    fn run_concurrent_marking(&self, preempt: &AtomicBool) {
        if self.major.state() != MarkingState::Marking {
            return;
        }
        let start = Instant::now();
        let mut worklist = self.major.worklist().local();
        let mut visitor = MarkingVisitor::new(&self.pages, self.model.as_ref(), &self.major, &mut worklist)
            .concurrent();
        loop {
            let result = visitor.drain(usize::MAX, || preempt.load(Ordering::Acquire));
            if result.worklist_empty || preempt.load(Ordering::Acquire) {
                break;
            }
        }
        visitor.publish();
        self.major.stats().add_mark_time(start.elapsed());
    }

    /// One bounded incremental marking step on the main thread.
    pub(crate) fn marking_step(&self, local: &LocalHeap) -> StepResult {
        if self.major.state() != MarkingState::Marking {
            return StepResult {
                worklist_empty: true,
                ..StepResult::default()
            };
        }
        let start = Instant::now();
        let _phase = crate::tracing::trace_phase(GcPhase::Mark);
        {
            let mut state = local.context().mutator.lock();
            state.allocated_since_step = 0;
            state.barrier.publish(&self.pages, &self.major);
        }
        let mut result = {
            let mut worklist = self.major.worklist().local();
            let mut visitor = MarkingVisitor::new(&self.pages, self.model.as_ref(), &self.major, &mut worklist);
            let mut result = visitor.drain(self.config.marking_step_size, || false);
            if result.worklist_empty && self.major.take_overflow() {
                self.major
                    .stats()
                    .overflow_rescans
                    .fetch_add(1, Ordering::Relaxed);
                let pushed = rescan_overflowed_pages(&self.pages.pages(), &mut visitor);
                result.worklist_empty = pushed == 0;
            }
            visitor.publish();
            result
        };
        let elapsed = start.elapsed();
        let stats = self.major.stats();
        stats.steps.fetch_add(1, Ordering::Relaxed);
        stats.add_mark_time(elapsed);

        let gc_id = {
            let mut cycle = self.cycle.lock();
            cycle.as_mut().map_or(GcId(0), |cycle| {
                cycle.timer.mark += elapsed;
                cycle.steps += 1;
                cycle.gc_id
            })
        };
        self.recorder.marking_step(&StepEvent {
            gc_id,
            objects: result.objects,
            bytes: result.bytes,
            duration: elapsed,
        });
        crate::tracing::log_marking_step(result.objects, result.bytes, result.worklist_empty);

        if !(result.worklist_empty && self.complete_if_exhausted()) {
            result.worklist_empty = false;
            self.schedule_concurrent_marking();
        }
        result
    }

    fn shared_marking_work_exhausted(&self) -> bool {
        self.major.worklist().is_empty()
            && !self.major.has_overflow()
            && self.concurrent.active_tasks() == 0
    }

    /// Moves marking to complete if no participant holds grey work. Every
    /// registered barrier is flushed and stays locked until the transition,
    /// so a racing barrier either lands before the check or finds the cycle
    /// complete and restarts it.
    fn complete_if_exhausted(&self) -> bool {
        if !self.shared_marking_work_exhausted() {
            return false;
        }
        let contexts = self.safepoint.contexts_snapshot();
        let mut locked = Vec::with_capacity(contexts.len());
        let mut pending = false;
        for context in &contexts {
            let mut state = context.mutator.lock();
            let MutatorState {
                new_lab,
                old_lab,
                barrier,
                ..
            } = &mut *state;
            let labs: Vec<&LinearAllocationArea> =
                [new_lab.as_ref(), old_lab.as_ref()].into_iter().flatten().collect();
            pending |= barrier.publish_outside(&self.pages, &self.major, &labs);
            locked.push(state);
        }
        if pending || !self.shared_marking_work_exhausted() {
            return false;
        }
        self.major.try_complete();
        true
    }

    /// Runs the main thread's scheduling decisions on an allocation slow
    /// path.
    pub(crate) fn on_allocation_slow_path(&self, local: &LocalHeap) {
        if self.is_torn_down() {
            return;
        }
        match self.major.state() {
            MarkingState::Complete => self.collect_full(local, GcReason::MarkingComplete),
            MarkingState::Marking => {
                let due = local.context().mutator.lock().allocated_since_step
                    >= self.config.allocation_step_interval;
                if due {
                    self.marking_step(local);
                }
            }
            MarkingState::Stopped => {
                if self.old_generation_size() >= self.marking_start_limit.load(Ordering::Acquire) {
                    self.start_marking(local, GcReason::MarkingLimit);
                }
            }
        }
    }

    /// Full collection. Finalizes a running incremental cycle or marks the
    /// whole heap in the pause.
    pub(crate) fn collect_full(&self, local: &LocalHeap, reason: GcReason) {
        if self.is_torn_down() {
            return;
        }
        let guard = self.lock_gc(local);
        self.collect_full_locked(local, &guard, reason);
    }

    pub(crate) fn collect_full_locked(&self, local: &LocalHeap, _guard: &MutexGuard<'_, ()>, reason: GcReason) {
        if self.is_torn_down() {
            return;
        }
        let pause_start = Instant::now();
        self.concurrent.ensure_task_completed();
        let scope = self.safepoint.enter_safepoint_scope(Some(local.context().as_ref()));
        if !self.major.is_marking() {
            self.begin_major_cycle(&scope, CollectionType::Major, reason);
        }
        let mut cycle = self
            .cycle
            .lock()
            .take()
            .unwrap_or_else(|| CycleState::new(CollectionType::IncrementalMajor, reason));
        let collection_name = match cycle.collection_type {
            CollectionType::IncrementalMajor => "incremental_major",
            _ => "major",
        };
        let _span = crate::tracing::trace_gc_collection(collection_name, cycle.gc_id);
        let committed_before = self.allocator.committed();

        self.flush_contexts(&scope);

        cycle.timer.start();
        {
            let _phase = crate::tracing::trace_phase(GcPhase::AtomicPause);
            crate::tracing::log_phase_start(GcPhase::AtomicPause, committed_before);
            let mut worklist = self.major.worklist().local();
            let mut visitor = MarkingVisitor::new(&self.pages, self.model.as_ref(), &self.major, &mut worklist)
                .in_pause();
            self.visit_roots(&mut |object| visitor.mark_root(object));
            drain_with_overflow(|| self.pages.pages(), &self.major, &mut visitor);
        }
        cycle.timer.end_mark();

        if self.config.verify_heap {
            let _phase = crate::tracing::trace_phase(GcPhase::Verify);
            let mut report = VerificationReport::default();
            verifier::verify_marking(&self.pages, self.model.as_ref(), true, &mut report);
            verifier::verify_remembered_sets(&self.pages, self.model.as_ref(), &mut report);
            report.assert_ok();
        }

        // The pause always ends the cycle from the complete state.
        self.major.try_complete();
        self.major.finish();
        for context in scope.contexts() {
            context
                .mutator
                .lock()
                .barrier
                .deactivate(&self.pages, &self.major);
        }

        cycle.timer.start();
        let summary = self.sweep_major();
        cycle.timer.end_sweep();
        crate::tracing::log_phase_end(GcPhase::Sweep, summary.dead_bytes);
        drop(scope);
        cycle.timer.add_pause(pause_start.elapsed());

        let next_limit = self
            .config
            .marking_start_limit
            .max(summary.old_live_bytes.saturating_mul(2));
        self.marking_start_limit.store(next_limit, Ordering::Release);
        self.new_space.reset_allocated();
        self.old_space.reset_allocated();
        self.large_space.reset_allocated();

        let stats = self.major.stats();
        let metrics = GcMetrics {
            gc_id: cycle.gc_id.0,
            collection_type: cycle.collection_type,
            reason: cycle.reason,
            duration: cycle.started.elapsed(),
            pause_duration: cycle.timer.pause,
            mark_duration: cycle.timer.mark,
            sweep_duration: cycle.timer.sweep,
            objects_marked: stats.objects_marked.load(Ordering::Relaxed),
            bytes_marked: stats.bytes_marked.load(Ordering::Relaxed),
            objects_reclaimed: summary.dead_objects,
            bytes_reclaimed: summary.dead_bytes,
            bytes_surviving: summary.live_bytes,
            marking_steps: cycle.steps,
            overflow_rescans: stats.overflow_rescans.load(Ordering::Relaxed),
            barrier_restarts: stats.barrier_restarts.load(Ordering::Relaxed),
            pages_released: summary.pages_released,
            pages_promoted: 0,
            evacuation_candidates: self.evacuation_candidates.lock().len(),
            total_collections: self.total_collections.fetch_add(1, Ordering::AcqRel) + 1,
        };
        self.finish_collection(&metrics);
        self.collection_barrier.resume_threads_awaiting_collection();
    }

    /// Sweeps old and young pages with the major bits, releases dead large
    /// objects and empty pages and picks evacuation candidates.
    fn sweep_major(&self) -> SweepSummary {
        self.relink_evacuation_candidates();
        let mut pages = self.old_space.pages();
        pages.extend(self.new_space.pages());
        let outcomes = self.sweep(pages, Generation::Major);

        let mut summary = SweepSummary::default();
        let mut candidates = Vec::new();
        for outcome in &outcomes {
            summary.add(outcome);
            let page = &outcome.page;
            let space = self.space(page.space());
            if outcome.is_empty() {
                space.remove_page(page.id());
                release_page(&self.pages, &self.allocator, page);
                summary.pages_released += 1;
                continue;
            }
            commit_outcome(space, outcome);
            if page.space() == SpaceKind::Old {
                summary.old_live_bytes += outcome.live_bytes;
                if self.is_sparse(page, outcome.live_bytes) {
                    candidates.push(Arc::clone(page));
                }
            }
        }

        for page in self.large_space.pages() {
            let size = page.allocated_bytes();
            if page.major_bitmap().is_black(SlotIndex(0)) {
                page.set_live_bytes(size);
                summary.live_objects += 1;
                summary.live_bytes += size;
                summary.old_live_bytes += size;
            } else {
                self.large_space.remove_page(page.id());
                release_page(&self.pages, &self.allocator, &page);
                summary.dead_objects += 1;
                summary.dead_bytes += size;
                summary.pages_released += 1;
            }
        }

        self.select_evacuation_candidates(&candidates);
        summary
    }

    pub(crate) fn sweep(&self, pages: Vec<Arc<Page>>, generation: Generation) -> Vec<SweepOutcome> {
        let _phase = crate::tracing::trace_phase(match generation {
            Generation::Major => GcPhase::Sweep,
            Generation::Minor => GcPhase::MinorSweep,
        });
        if self.config.parallel_sweep && !self.config.single_threaded {
            sweep_pages_parallel(pages, &self.model, generation, self.task_runner.as_ref())
        } else {
            sweep_pages(&pages, self.model.as_ref(), generation)
        }
    }

    fn is_sparse(&self, page: &Page, live_bytes: usize) -> bool {
        let threshold = usize::from(self.config.evacuation_threshold_percent);
        threshold > 0 && live_bytes.saturating_mul(100) < page.size().saturating_mul(threshold)
    }

    fn select_evacuation_candidates(&self, pages: &[Arc<Page>]) {
        if pages.is_empty() {
            return;
        }
        let mut candidates = self.evacuation_candidates.lock();
        let mut free_list = self.old_space.free_list();
        for page in pages {
            page.set_flag(PageFlags::EVACUATION_CANDIDATE);
            let evicted = free_list.evict_free_list_items(page.id());
            crate::tracing::log_evacuation_candidate(page.id().0, page.live_bytes(), evicted);
            candidates.push(page.id());
        }
    }

    /// Puts the free items of every evacuation candidate back on the
    /// allocation path.
    pub(crate) fn relink_evacuation_candidates(&self) -> usize {
        let candidates = std::mem::take(&mut *self.evacuation_candidates.lock());
        let mut free_list = self.old_space.free_list();
        for &id in &candidates {
            free_list.relink(id);
            if let Some(page) = self.pages.get(id) {
                page.clear_flag(PageFlags::EVACUATION_CANDIDATE);
            }
        }
        candidates.len()
    }

    /// Young generation collection.
    pub(crate) fn collect_minor(&self, local: &LocalHeap, reason: GcReason) {
        if self.is_torn_down() {
            return;
        }
        let guard = self.lock_gc(local);
        let cycle = CycleState::new(CollectionType::Minor, reason);
        let _span = crate::tracing::trace_gc_collection("minor", cycle.gc_id);
        self.record_cycle_start(&cycle);
        self.concurrent.ensure_task_completed();
        let outcome = {
            let scope = self.safepoint.enter_safepoint_scope(Some(local.context().as_ref()));
            self.flush_contexts(&scope);
            minor::collect(self)
        };
        self.new_space.reset_allocated();

        let metrics = GcMetrics {
            gc_id: cycle.gc_id.0,
            collection_type: CollectionType::Minor,
            reason,
            duration: cycle.started.elapsed(),
            pause_duration: cycle.started.elapsed(),
            mark_duration: outcome.mark_duration,
            sweep_duration: outcome.sweep_duration,
            objects_marked: outcome.marked.objects,
            bytes_marked: outcome.marked.bytes,
            objects_reclaimed: outcome.swept.dead_objects,
            bytes_reclaimed: outcome.swept.dead_bytes,
            bytes_surviving: outcome.swept.live_bytes,
            marking_steps: 0,
            overflow_rescans: self.minor.stats().overflow_rescans.load(Ordering::Relaxed),
            barrier_restarts: 0,
            pages_released: outcome.swept.pages_released,
            pages_promoted: outcome.pages_promoted,
            evacuation_candidates: self.evacuation_candidates.lock().len(),
            total_collections: self.total_collections.fetch_add(1, Ordering::AcqRel) + 1,
        };
        self.finish_collection(&metrics);
        drop(guard);
        self.schedule_concurrent_marking();
    }

    fn finish_collection(&self, metrics: &GcMetrics) {
        *self.last_metrics.lock() = *metrics;
        self.recorder.cycle_finished(metrics);
        self.schedule_unmapping();
    }

    fn schedule_unmapping(&self) {
        if self.allocator.unmapper().is_empty() {
            return;
        }
        let heap = self.weak_self.clone();
        self.task_runner.post_task(Box::new(move || {
            if let Some(heap) = heap.upgrade() {
                heap.allocator.free_queued();
            }
        }));
    }

    pub(crate) fn tear_down(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.concurrent.cancel();
        self.collection_barrier.notify_shutdown_requested();
        self.major.abort();
        self.minor.abort();
        if let Some(runner) = &self.owned_runner {
            runner.shutdown();
        }
        self.allocator.free_queued();
    }
}

impl fmt::Debug for HeapInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapInner")
            .field("pages", &self.pages)
            .field("allocator", &self.allocator)
            .field("new_space", &self.new_space)
            .field("old_space", &self.old_space)
            .field("large_space", &self.large_space)
            .field("major", &self.major)
            .field("safepoint", &self.safepoint)
            .field("concurrent", &self.concurrent)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Heap`].
#[derive(Default)]
pub struct HeapBuilder {
    config: HeapConfig,
    model: Option<Arc<dyn ObjectModel>>,
    task_runner: Option<Arc<dyn TaskRunner>>,
    backend: Option<Box<dyn MemoryBackend>>,
    recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl HeapBuilder {
    /// Creates a builder with the default configuration and the
    /// [`SimpleObjectModel`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration. It is sanitized when the heap is built.
    #[must_use]
    pub fn config(mut self, config: HeapConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the object layout the collector traces through.
    #[must_use]
    pub fn object_model(mut self, model: impl ObjectModel) -> Self {
        self.model = Some(Arc::new(model));
        self
    }

    /// Runs background marking, sweeping and unmapping on `runner` instead
    /// of a heap-owned [`DefaultTaskRunner`].
    #[must_use]
    pub fn task_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.task_runner = Some(runner);
        self
    }

    /// Maps pages through `backend`.
    #[must_use]
    pub fn backend(mut self, backend: Box<dyn MemoryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Reports cycle events to `recorder`.
    #[must_use]
    pub fn recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Builds the heap. The calling thread becomes the heap's main thread.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Backend`] if the default task runner cannot
    /// spawn its threads.
    pub fn build(self) -> HeapResult<Heap> {
        let config = self.config.sanitized();
        let (task_runner, owned_runner): (Arc<dyn TaskRunner>, _) = match self.task_runner {
            Some(runner) => (runner, None),
            None => {
                let runner = Arc::new(DefaultTaskRunner::new(config.concurrent_marking_tasks)?);
                (Arc::clone(&runner) as Arc<dyn TaskRunner>, Some(runner))
            }
        };
        let max_tasks = if config.single_threaded {
            0
        } else {
            config.concurrent_marking_tasks
        };
        let backend = self.backend.unwrap_or_else(|| Box::new(SystemBackend));
        let model = self.model.unwrap_or_else(|| Arc::new(SimpleObjectModel));
        let recorder = self.recorder.unwrap_or_else(|| Arc::new(NoopRecorder));

        let inner = Arc::new_cyclic(|weak_self| HeapInner {
            model,
            pages: PageTable::new(),
            allocator: PageAllocator::new(&config, backend),
            new_space: Space::new(SpaceKind::New, &config, config.new_space_capacity),
            old_space: Space::new(SpaceKind::Old, &config, usize::MAX),
            large_space: LargeObjectSpace::new(),
            roots: Arc::new(RootSet::new()),
            enumerators: RwLock::new(Vec::new()),
            major: MarkingController::new(Generation::Major, &config),
            minor: MarkingController::new(Generation::Minor, &config),
            safepoint: Safepoint::new(),
            collection_barrier: CollectionBarrier::new(),
            concurrent: ConcurrentMarking::new(Arc::clone(&task_runner), max_tasks),
            task_runner,
            owned_runner,
            recorder,
            gc_lock: Mutex::new(()),
            cycle: Mutex::new(None),
            last_metrics: Mutex::new(GcMetrics::new()),
            total_collections: AtomicUsize::new(0),
            next_context_id: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
            evacuation_candidates: Mutex::new(Vec::new()),
            marking_start_limit: AtomicUsize::new(config.marking_start_limit),
            main_context: OnceLock::new(),
            weak_self: weak_self.clone(),
            config,
        });
        let main = LocalHeap::new(Arc::clone(&inner), true);
        let _ = inner.main_context.set(Arc::clone(main.context()));
        Ok(Heap { main, inner })
    }
}

impl fmt::Debug for HeapBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuilder")
            .field("config", &self.config)
            .field("custom_model", &self.model.is_some())
            .field("custom_runner", &self.task_runner.is_some())
            .finish_non_exhaustive()
    }
}

/// Point-in-time heap sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Bytes of mapped pages, pooled pages included.
    pub committed_bytes: usize,
    /// Bytes of young generation pages.
    pub new_space_committed: usize,
    /// Bytes of old generation regular pages.
    pub old_space_committed: usize,
    /// Bytes of large object pages.
    pub large_object_committed: usize,
    /// Bytes of large objects.
    pub large_objects_size: usize,
    /// Bytes on the free lists of both regular spaces.
    pub available_bytes: usize,
    /// Bytes lost to fragments below the minimum block size.
    pub wasted_bytes: usize,
    /// Pages in use.
    pub page_count: usize,
    /// Empty pages kept for reuse.
    pub pooled_pages: usize,
    /// Object bytes allocated since the last collection.
    pub allocated_since_gc: usize,
    /// Old generation size at which incremental marking starts.
    pub marking_start_limit: usize,
    /// Collections run so far.
    pub total_collections: usize,
}

/// A stop-the-world pause held by the main thread. Every other local heap
/// is parked while it lives. The main thread must not allocate, and must not
/// step marking or collect, until the scope is dropped.
#[must_use = "the pause ends when the scope is dropped"]
pub struct PauseScope<'a> {
    scope: SafepointScope<'a>,
    _guard: MutexGuard<'a, ()>,
}

impl PauseScope<'_> {
    /// Local heaps that were running and stopped for this pause.
    #[must_use]
    pub const fn stopped_threads(&self) -> usize {
        self.scope.stopped_threads()
    }

    /// Local heaps other than the main one, all parked now.
    #[must_use]
    pub fn parked_threads(&self) -> usize {
        self.scope.parked_threads()
    }

    /// Ends the pause.
    pub fn resume(self) {}
}

impl fmt::Debug for PauseScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PauseScope")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// A garbage-collected heap.
///
/// The thread that builds the heap is its main thread: it drives marking
/// steps, serves collection requests and runs minor collections. A main
/// thread that blocks outside the heap for long (joining threads, waiting
/// on I/O) should do so inside [`LocalHeap::parked`] on
/// [`Heap::main`], or background threads needing a collection will wait for
/// it.
///
/// # Examples
///
/// ```
/// use rudo_heap::{AllocationType, Heap, SimpleObjectModel};
///
/// let heap = Heap::new().unwrap();
/// let size = SimpleObjectModel::size_for(1, 0);
/// let object = heap.allocate(size, AllocationType::Young).unwrap();
/// unsafe { SimpleObjectModel::initialize(object, size, 1) };
/// let root = heap.roots().add(Some(object));
///
/// heap.collect_garbage();
/// assert!(heap.contains(object));
/// heap.roots().remove(root);
/// ```
pub struct Heap {
    main: LocalHeap,
    inner: Arc<HeapInner>,
}

impl Heap {
    /// Creates a heap with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`HeapBuilder::build`].
    pub fn new() -> HeapResult<Self> {
        HeapBuilder::new().build()
    }

    /// Creates a heap with `config`.
    ///
    /// # Errors
    ///
    /// See [`HeapBuilder::build`].
    pub fn with_config(config: HeapConfig) -> HeapResult<Self> {
        HeapBuilder::new().config(config).build()
    }

    /// Returns a builder.
    #[must_use]
    pub fn builder() -> HeapBuilder {
        HeapBuilder::new()
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.inner.config
    }

    /// The main thread's local heap.
    #[must_use]
    pub const fn main(&self) -> &LocalHeap {
        &self.main
    }

    /// Creates a local heap for another thread. It starts parked: call
    /// [`LocalHeap::unpark`] on the thread that uses it.
    ///
    /// # Errors
    ///
    /// [`HeapError::SingleThreaded`] if the heap was configured
    /// single-threaded, [`HeapError::TornDown`] after teardown.
    pub fn new_local_heap(&self) -> HeapResult<LocalHeap> {
        if self.inner.config.single_threaded {
            return Err(HeapError::SingleThreaded);
        }
        if self.inner.is_torn_down() {
            return Err(HeapError::TornDown);
        }
        let inner = Arc::clone(&self.inner);
        Ok(self.main.parked(|| LocalHeap::new(inner, false)))
    }

    /// Allocates on the main thread. See [`LocalHeap::allocate`].
    ///
    /// # Errors
    ///
    /// See [`LocalHeap::allocate`].
    pub fn allocate(&self, size: usize, allocation: AllocationType) -> HeapResult<ObjectRef> {
        self.main.allocate(size, allocation)
    }

    /// Stores a reference on the main thread. See [`LocalHeap::store`].
    pub fn store(&self, host: ObjectRef, slot: crate::address::Slot, value: Option<ObjectRef>) {
        self.main.store(host, slot, value);
    }

    /// Polls the main thread's safepoint.
    pub fn safepoint(&self) {
        self.main.safepoint();
    }

    /// Persistent roots.
    #[must_use]
    pub fn roots(&self) -> &RootSet {
        &self.inner.roots
    }

    /// Adds an embedder root source, enumerated in every collection.
    pub fn add_root_enumerator(&self, enumerator: Arc<dyn RootEnumerator>) {
        self.inner.enumerators.write().push(enumerator);
    }

    /// Runs a full collection, finalizing incremental marking if it runs.
    pub fn collect_garbage(&self) {
        self.inner.collect_full(&self.main, GcReason::Explicit);
    }

    /// Runs a young generation collection.
    pub fn collect_minor(&self) {
        self.inner.collect_minor(&self.main, GcReason::Explicit);
    }

    /// Starts incremental marking. Returns `false` if marking was already
    /// running or the heap is torn down.
    pub fn start_incremental_marking(&self) -> bool {
        self.inner.start_marking(&self.main, GcReason::Explicit)
    }

    /// Runs one bounded marking step on the main thread. The cycle becomes
    /// [`MarkingState::Complete`] once a step finds no work anywhere.
    pub fn marking_step(&self) -> StepResult {
        self.inner.marking_step(&self.main)
    }

    /// Finalizes incremental marking in the atomic pause. Does nothing when
    /// marking is stopped.
    pub fn finalize_incremental_marking(&self) {
        if self.inner.major.is_marking() {
            self.inner.collect_full(&self.main, GcReason::MarkingComplete);
        }
    }

    /// State of major marking.
    #[must_use]
    pub fn marking_state(&self) -> MarkingState {
        self.inner.major.state()
    }

    /// Stops every other local heap until the returned scope is dropped.
    pub fn request_pause(&self) -> PauseScope<'_> {
        let guard = self.inner.lock_gc(&self.main);
        let scope = self
            .inner
            .safepoint
            .enter_safepoint_scope(Some(self.main.context().as_ref()));
        PauseScope {
            scope,
            _guard: guard,
        }
    }

    /// Queues a black `host` for another visit after its fields were
    /// written without barriers. Returns `true` if the host was black.
    pub fn revisit_object(&self, host: ObjectRef) -> bool {
        self.main.revisit_object(host)
    }

    /// Old pages currently excluded from allocation as evacuation
    /// candidates.
    #[must_use]
    pub fn evacuation_candidates(&self) -> Vec<PageId> {
        self.inner.evacuation_candidates.lock().clone()
    }

    /// Gives up on the selected evacuation candidates and makes their free
    /// memory allocatable again. Returns the number of pages relinked.
    pub fn abort_evacuation(&self) -> usize {
        let _guard = self.inner.lock_gc(&self.main);
        self.inner.relink_evacuation_candidates()
    }

    /// Checks the heap in a pause. Marking colours are checked while major
    /// marking runs; remembered sets are always checked.
    pub fn verify(&self) -> VerificationReport {
        let inner = &self.inner;
        let report = {
            let _guard = inner.lock_gc(&self.main);
            inner.concurrent.ensure_task_completed();
            let _scope = inner
                .safepoint
                .enter_safepoint_scope(Some(self.main.context().as_ref()));
            let _phase = crate::tracing::trace_phase(GcPhase::Verify);
            let mut report = VerificationReport::default();
            if inner.major.is_marking() {
                verifier::verify_marking(&inner.pages, inner.model.as_ref(), false, &mut report);
            }
            verifier::verify_remembered_sets(&inner.pages, inner.model.as_ref(), &mut report);
            report
        };
        inner.schedule_concurrent_marking();
        report
    }

    /// Current sizes.
    #[must_use]
    pub fn statistics(&self) -> HeapStatistics {
        let inner = &self.inner;
        HeapStatistics {
            committed_bytes: inner.allocator.committed(),
            new_space_committed: inner.new_space.committed(),
            old_space_committed: inner.old_space.committed(),
            large_object_committed: inner.large_space.committed(),
            large_objects_size: inner.large_space.objects_size(),
            available_bytes: inner.new_space.available() + inner.old_space.available(),
            wasted_bytes: inner.new_space.wasted() + inner.old_space.wasted(),
            page_count: inner.pages.len(),
            pooled_pages: inner.allocator.pooled_pages(),
            allocated_since_gc: inner.allocated_since_gc(),
            marking_start_limit: inner.marking_start_limit.load(Ordering::Acquire),
            total_collections: inner.total_collections.load(Ordering::Acquire),
        }
    }

    /// Metrics of the last finished collection.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        *self.inner.last_metrics.lock()
    }

    /// Counters of the running or last major marking cycle.
    #[must_use]
    pub fn mark_stats(&self) -> &crate::gc::incremental::MarkStats {
        self.inner.major.stats()
    }

    /// Major marking colour of `object`, or `None` if it is not a heap
    /// object.
    #[must_use]
    pub fn color_of(&self, object: ObjectRef) -> Option<Color> {
        let (page, index) = self.inner.pages.locate(object.to_address())?;
        page.object_starts()
            .is_set(index)
            .then(|| page.major_bitmap().color(index))
    }

    /// Returns `true` if `object` is a live allocation of this heap.
    #[must_use]
    pub fn contains(&self, object: ObjectRef) -> bool {
        self.inner
            .pages
            .locate(object.to_address())
            .is_some_and(|(page, index)| page.object_starts().is_set(index))
    }

    /// Returns `true` if `object` lies in the young generation.
    #[must_use]
    pub fn is_young(&self, object: ObjectRef) -> bool {
        self.inner
            .pages
            .lookup(object.to_address())
            .is_some_and(|page| page.is_young())
    }

    /// Page holding `object`.
    #[must_use]
    pub fn page_of(&self, object: ObjectRef) -> Option<PageId> {
        self.inner
            .pages
            .lookup(object.to_address())
            .map(|page| page.id())
    }

    /// Stops background tasks, wakes threads waiting for a collection and
    /// frees queued pages. Allocation fails with [`HeapError::TornDown`]
    /// afterwards. Idempotent; also run on drop.
    pub fn tear_down(&self) {
        self.inner.tear_down();
    }

    /// Returns `true` after [`tear_down`](Self::tear_down).
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.inner.is_torn_down()
    }

    /// How long the last pause of the last collection took.
    #[must_use]
    pub fn last_pause(&self) -> Duration {
        self.last_gc_metrics().pause_duration
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.tear_down();
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("main", &self.main)
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Slot;

    fn heap() -> Heap {
        Heap::with_config(
            HeapConfig::new()
                .with_page_size(64 * 1024)
                .with_concurrent_marking_tasks(1)
                .with_marking_start_limit(usize::MAX),
        )
        .unwrap()
    }

    fn object(heap: &Heap, pointers: usize) -> ObjectRef {
        let size = SimpleObjectModel::size_for(pointers, 0);
        let object = heap.allocate(size, AllocationType::Old).unwrap();
        unsafe { SimpleObjectModel::initialize(object, size, pointers) };
        object
    }

    fn field(object: ObjectRef, index: usize) -> Slot {
        SimpleObjectModel::field(object, index)
    }

    #[test]
    fn test_full_collection_reclaims_unreachable() {
        let heap = heap();
        let kept = object(&heap, 1);
        let child = object(&heap, 0);
        let garbage = object(&heap, 0);
        heap.store(kept, field(kept, 0), Some(child));
        let root = heap.roots().add(Some(kept));

        heap.collect_garbage();
        assert!(heap.contains(kept));
        assert!(heap.contains(child));
        assert!(!heap.contains(garbage));
        let metrics = heap.last_gc_metrics();
        assert_eq!(metrics.collection_type, CollectionType::Major);
        assert_eq!(metrics.objects_marked, 2);
        assert_eq!(metrics.objects_reclaimed, 1);
        heap.roots().remove(root);
    }

    #[test]
    fn test_incremental_cycle_completes() {
        let heap = heap();
        let mut previous = object(&heap, 1);
        let root = heap.roots().add(Some(previous));
        for _ in 0..100 {
            let next = object(&heap, 1);
            heap.store(previous, field(previous, 0), Some(next));
            previous = next;
        }
        assert!(heap.start_incremental_marking());
        assert!(!heap.start_incremental_marking());
        while heap.marking_state() == MarkingState::Marking {
            heap.marking_step();
        }
        assert_eq!(heap.marking_state(), MarkingState::Complete);
        heap.finalize_incremental_marking();
        assert_eq!(heap.marking_state(), MarkingState::Stopped);
        let metrics = heap.last_gc_metrics();
        assert_eq!(metrics.collection_type, CollectionType::IncrementalMajor);
        assert_eq!(metrics.objects_marked, 101);
        assert_eq!(metrics.objects_reclaimed, 0);
        heap.roots().remove(root);
    }

    #[test]
    fn test_single_threaded_heap_has_no_local_heaps() {
        let heap = Heap::with_config(HeapConfig::new().with_single_threaded(true)).unwrap();
        assert!(matches!(heap.new_local_heap(), Err(HeapError::SingleThreaded)));
    }

    #[test]
    fn test_tear_down_is_idempotent() {
        let heap = heap();
        heap.tear_down();
        heap.tear_down();
        assert!(heap.is_torn_down());
        assert!(matches!(
            heap.allocate(16, AllocationType::Young),
            Err(HeapError::TornDown)
        ));
    }

    #[test]
    fn test_large_objects_live_and_die() {
        let heap = heap();
        let size = heap.config().max_regular_object_size() + 8;
        let large = heap.allocate(size, AllocationType::Old).unwrap();
        unsafe { SimpleObjectModel::initialize(large, size, 0) };
        let root = heap.roots().add(Some(large));
        heap.collect_garbage();
        assert!(heap.contains(large));
        assert_eq!(heap.statistics().large_objects_size, align_up_word(size));

        heap.roots().remove(root);
        heap.collect_garbage();
        assert!(!heap.contains(large));
        assert_eq!(heap.statistics().large_object_committed, 0);
    }

    struct ShadowStack(Mutex<Vec<ObjectRef>>);

    impl RootEnumerator for ShadowStack {
        fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
            for &root in self.0.lock().iter() {
                visitor.visit_root(root);
            }
        }
    }

    #[test]
    fn test_embedder_enumerator_keeps_roots_alive() {
        let heap = heap();
        let stack = Arc::new(ShadowStack(Mutex::new(Vec::new())));
        heap.add_root_enumerator(Arc::clone(&stack) as Arc<dyn RootEnumerator>);
        let parent = object(&heap, 1);
        let child = object(&heap, 0);
        heap.store(parent, field(parent, 0), Some(child));
        stack.0.lock().push(parent);

        heap.collect_garbage();
        assert!(heap.contains(parent));
        assert!(heap.contains(child));

        stack.0.lock().clear();
        heap.collect_garbage();
        assert!(!heap.contains(parent));
        assert!(!heap.contains(child));
    }

    fn align_up_word(size: usize) -> usize {
        crate::address::align_up(size, crate::address::WORD_SIZE)
    }

    #[test]
    fn test_sparse_pages_become_candidates() {
        let heap = Heap::with_config(
            HeapConfig::new()
                .with_page_size(64 * 1024)
                .with_evacuation_threshold_percent(50)
                .with_marking_start_limit(usize::MAX),
        )
        .unwrap();
        let survivor = object(&heap, 0);
        for _ in 0..64 {
            object(&heap, 0);
        }
        let root = heap.roots().add(Some(survivor));
        heap.collect_garbage();
        let page = heap.page_of(survivor).unwrap();
        assert_eq!(heap.evacuation_candidates(), vec![page]);
        assert_eq!(heap.last_gc_metrics().evacuation_candidates, 1);

        assert_eq!(heap.abort_evacuation(), 1);
        assert!(heap.evacuation_candidates().is_empty());
        heap.roots().remove(root);
    }
}
