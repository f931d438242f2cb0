//! Object visiting and background marking.
//!
//! [`MarkingVisitor`] is the single piece of code that turns grey objects
//! black: the main thread's incremental steps, the background tasks of
//! [`ConcurrentMarking`], the atomic pause and the minor collector all drain
//! through it.
//!
//! Outside a pause an object is blackened when it is popped and a `SeqCst`
//! fence separates the colour change from the first field read. The write
//! barrier stores, fences and then checks the host colour, so either the
//! marker sees the new value or the barrier sees a black host and shades
//! the value.

use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{ObjectRef, Slot};
use crate::gc::incremental::{MarkingController, StepResult};
use crate::gc::mark::{Generation, MarkingMode};
use crate::gc::task::{CancelableTaskManager, Semaphore, TaskId, TaskRunner, TryAbortResult};
use crate::gc::worklist::Local;
use crate::heap::page::{Page, PageFlags, PageTable};
use crate::object::{ObjectModel, SlotVisitor};

/// Objects processed between two preemption checks of a background task.
const PREEMPTION_CHECK_INTERVAL: usize = 64;

/// Drains grey objects of one generation through a worklist view.
pub struct MarkingVisitor<'a> {
    pages: &'a PageTable,
    model: &'a dyn ObjectModel,
    controller: &'a MarkingController,
    local: &'a mut Local<ObjectRef>,
    generation: Generation,
    mode: MarkingMode,
    epoch: u64,
    pause: bool,
    concurrent: bool,
}

impl<'a> MarkingVisitor<'a> {
    /// Creates a visitor for incremental or concurrent marking. Discovered
    /// objects are greyed and visited when popped.
    pub fn new(
        pages: &'a PageTable,
        model: &'a dyn ObjectModel,
        controller: &'a MarkingController,
        local: &'a mut Local<ObjectRef>,
    ) -> Self {
        Self {
            pages,
            model,
            controller,
            local,
            generation: controller.generation(),
            mode: controller.mode(),
            epoch: controller.epoch(),
            pause: false,
            concurrent: false,
        }
    }

    /// Switches to stop-the-world marking: discovered objects are marked
    /// black right away and popped objects are always visited.
    #[must_use]
    pub const fn in_pause(mut self) -> Self {
        self.pause = true;
        self
    }

    /// Attributes the visited objects to background marking.
    #[must_use]
    pub const fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    /// Generation being marked.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns `true` if the visitor's view and the global pool are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    fn page_of(&self, object: ObjectRef) -> Option<(Arc<Page>, crate::address::SlotIndex)> {
        let (page, index) = self.pages.locate(object.to_address())?;
        if self.generation == Generation::Minor && !page.is_young() {
            return None;
        }
        if !page.object_starts().is_set(index) {
            return None;
        }
        Some((page, index))
    }

    /// Marks a root. Roots outside the heap or outside the marked
    /// generation are ignored.
    pub fn mark_root(&mut self, object: ObjectRef) {
        self.discover(object);
    }

    fn discover(&mut self, object: ObjectRef) {
        let Some((page, index)) = self.page_of(object) else {
            return;
        };
        page.note_marking_mode(self.epoch, self.mode);
        let bitmap = page.bitmap(self.generation);
        let discovered = if self.pause {
            self.mode.mark_black(bitmap, index)
        } else {
            self.mode.white_to_grey(bitmap, index)
        };
        if discovered {
            self.push(object);
        }
    }

    /// Pushes an object that is already grey (or black during a pause).
    pub fn push(&mut self, object: ObjectRef) {
        if let Err(dropped) = self.local.push(object) {
            self.handle_overflow(&dropped);
        }
    }

    fn handle_overflow(&self, dropped: &[ObjectRef]) {
        crate::tracing::log_worklist_overflow(dropped.len());
        for &object in dropped {
            let Some((page, index)) = self.page_of(object) else {
                continue;
            };
            if self.pause {
                // Pause discoveries are black before they are visited; grey
                // them again so the rescan finds them.
                self.mode.black_to_grey(page.bitmap(self.generation), index);
            }
            page.set_flag(PageFlags::OVERFLOWED);
        }
        self.controller.record_overflow();
    }

    /// Visits one popped object. Returns its size, or `None` if it was
    /// skipped.
    fn process(&mut self, object: ObjectRef) -> Option<usize> {
        let (page, index) = self.page_of(object)?;
        let bitmap = page.bitmap(self.generation);
        if self.pause {
            self.mode.mark_black(bitmap, index);
        } else if !self.mode.grey_to_black(bitmap, index) {
            // Another marker got here first.
            return None;
        }
        fence(Ordering::SeqCst);
        let size = self.model.object_size(object);
        self.model.visit_pointers(object, self);
        Some(size)
    }

    /// Visits up to `budget` objects, stopping early when `should_yield`
    /// returns `true`.
    pub fn drain(&mut self, budget: usize, should_yield: impl Fn() -> bool) -> StepResult {
        let mut result = StepResult::default();
        while result.objects < budget {
            if result.objects % PREEMPTION_CHECK_INTERVAL == 0 && result.objects > 0 && should_yield()
            {
                break;
            }
            let Some(object) = self.local.pop() else {
                result.worklist_empty = true;
                break;
            };
            if let Some(size) = self.process(object) {
                result.objects += 1;
                result.bytes += size;
            }
        }
        self.controller
            .stats()
            .record(result.objects, result.bytes, self.concurrent);
        result
    }

    /// Publishes the view's local entries to the global pool.
    pub fn publish(&mut self) {
        self.local.publish();
    }
}

impl SlotVisitor for MarkingVisitor<'_> {
    fn visit_slot(&mut self, slot: Slot) {
        if let Some(child) = slot.load(Ordering::Acquire) {
            self.discover(child);
        }
    }
}

impl fmt::Debug for MarkingVisitor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkingVisitor")
            .field("generation", &self.generation)
            .field("mode", &self.mode)
            .field("pause", &self.pause)
            .field("concurrent", &self.concurrent)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Body of a background marking task. The flag asks it to stop early.
pub type MarkingJob = Arc<dyn Fn(&AtomicBool) + Send + Sync>;

/// Schedules background marking tasks and waits for them.
pub struct ConcurrentMarking {
    runner: Arc<dyn TaskRunner>,
    manager: Arc<CancelableTaskManager>,
    done: Arc<Semaphore>,
    pending: Mutex<Vec<TaskId>>,
    active: Arc<AtomicUsize>,
    preempt: Arc<AtomicBool>,
    max_tasks: usize,
}

impl ConcurrentMarking {
    /// Creates a scheduler posting at most `max_tasks` tasks (capped by
    /// the runner's worker count) at a time.
    #[must_use]
    pub fn new(runner: Arc<dyn TaskRunner>, max_tasks: usize) -> Self {
        let max_tasks = max_tasks.min(runner.number_of_worker_threads());
        Self {
            runner,
            manager: Arc::new(CancelableTaskManager::new()),
            done: Arc::new(Semaphore::new(0)),
            pending: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            preempt: Arc::new(AtomicBool::new(false)),
            max_tasks,
        }
    }

    /// Maximum number of simultaneous tasks.
    #[must_use]
    pub const fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    /// Tasks posted and not yet finished.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Posts tasks running `job` until `max_tasks` are active. Returns the
    /// number of tasks posted.
    pub fn schedule(&self, job: &MarkingJob) -> usize {
        let mut pending = self.pending.lock();
        if self.manager.is_canceled() {
            return 0;
        }
        let mut posted = 0;
        while self.active.load(Ordering::Acquire) < self.max_tasks {
            self.active.fetch_add(1, Ordering::AcqRel);
            let (job, done, active, preempt) = (
                Arc::clone(job),
                Arc::clone(&self.done),
                Arc::clone(&self.active),
                Arc::clone(&self.preempt),
            );
            let (id, task) = self.manager.register(move || {
                job(&preempt);
                active.fetch_sub(1, Ordering::AcqRel);
                done.signal();
            });
            pending.push(id);
            self.runner.post_task(task);
            posted += 1;
        }
        posted
    }

    /// Stops every scheduled task: unstarted ones are aborted, running ones
    /// are asked to yield and waited for. Returns the number of tasks that
    /// ran. Calling it with nothing scheduled is a no-op.
    pub fn ensure_task_completed(&self) -> usize {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return 0;
        }
        self.preempt.store(true, Ordering::Release);
        let mut waiting = 0;
        for id in pending.drain(..) {
            if self.manager.try_abort(id) == TryAbortResult::TaskAborted {
                self.active.fetch_sub(1, Ordering::AcqRel);
            } else {
                waiting += 1;
            }
        }
        for _ in 0..waiting {
            self.done.wait();
        }
        self.preempt.store(false, Ordering::Release);
        waiting
    }

    /// Stops every task for good. Later calls to
    /// [`schedule`](Self::schedule) post nothing.
    pub fn cancel(&self) -> usize {
        let stopped = self.ensure_task_completed();
        let _pending = self.pending.lock();
        let aborted = self.manager.cancel_and_wait_for_pending_tasks();
        crate::tracing::log_tasks_cancelled(stopped + aborted);
        stopped + aborted
    }
}

impl fmt::Debug for ConcurrentMarking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMarking")
            .field("max_tasks", &self.max_tasks)
            .field("active", &self.active_tasks())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::gc::mark::Color;
    use crate::gc::task::DefaultTaskRunner;
    use crate::heap::page_allocator::{PageAllocator, PageSize, SystemBackend};
    use crate::heap::space::SpaceKind;
    use crate::object::SimpleObjectModel;
    use crate::address::WORD_SIZE;

    struct Fixture {
        table: PageTable,
        page: Arc<Page>,
        _allocator: PageAllocator,
        next: usize,
    }

    impl Fixture {
        fn new() -> Self {
            let config = HeapConfig::new().with_page_size(64 * 1024).sanitized();
            let allocator = PageAllocator::new(&config, Box::new(SystemBackend));
            let table = PageTable::new();
            let memory = allocator.allocate(PageSize::Regular, false).unwrap().memory;
            let page =
                table.insert_with(|id| Page::new(id, memory, SpaceKind::Old, PageFlags::EMPTY));
            Self {
                table,
                page,
                _allocator: allocator,
                next: 0,
            }
        }

        fn object(&mut self, fields: usize) -> ObjectRef {
            let size = SimpleObjectModel::size_for(fields, 0);
            let address = self.page.start().offset(self.next);
            self.page.object_starts().set(self.page.slot_index(address));
            self.next += size;
            let object = ObjectRef::from_address(address).unwrap();
            unsafe { SimpleObjectModel::initialize(object, size, fields) };
            object
        }

        fn color(&self, object: ObjectRef) -> Color {
            self.page
                .major_bitmap()
                .color(self.page.slot_index(object.to_address()))
        }
    }

    fn link(from: ObjectRef, field: usize, to: ObjectRef) {
        SimpleObjectModel::field(from, field).store(Some(to), Ordering::Relaxed);
    }

    #[test]
    fn test_drain_marks_reachable_graph() {
        let mut fx = Fixture::new();
        let root = fx.object(2);
        let a = fx.object(1);
        let b = fx.object(0);
        let garbage = fx.object(1);
        link(root, 0, a);
        link(root, 1, b);
        link(a, 0, b);
        link(garbage, 0, a);

        let config = HeapConfig::new();
        let controller = MarkingController::new(Generation::Major, &config);
        controller.start(MarkingMode::Atomic);
        let mut local = controller.worklist().local();
        let mut visitor =
            MarkingVisitor::new(&fx.table, &SimpleObjectModel, &controller, &mut local);
        visitor.mark_root(root);
        let result = visitor.drain(usize::MAX, || false);

        assert!(result.worklist_empty);
        assert_eq!(result.objects, 3);
        assert_eq!(result.bytes, 3 * WORD_SIZE + 2 * WORD_SIZE + WORD_SIZE);
        for object in [root, a, b] {
            assert_eq!(fx.color(object), Color::Black);
        }
        assert_eq!(fx.color(garbage), Color::White);
    }

    #[test]
    fn test_budget_leaves_grey_objects() {
        let mut fx = Fixture::new();
        let root = fx.object(3);
        let children: Vec<_> = (0..3).map(|_| fx.object(0)).collect();
        for (i, &child) in children.iter().enumerate() {
            link(root, i, child);
        }

        let controller = MarkingController::new(Generation::Major, &HeapConfig::new());
        controller.start(MarkingMode::Atomic);
        let mut local = controller.worklist().local();
        let mut visitor =
            MarkingVisitor::new(&fx.table, &SimpleObjectModel, &controller, &mut local);
        visitor.mark_root(root);
        let step = visitor.drain(2, || false);
        assert_eq!(step.objects, 2);
        assert!(!step.worklist_empty);
        let greys = children
            .iter()
            .filter(|&&c| fx.color(c) == Color::Grey)
            .count();
        assert_eq!(greys, 2);
    }

    #[test]
    fn test_overflow_in_pause_is_rescanned() {
        let mut fx = Fixture::new();
        let fan_out = 40;
        let root = fx.object(fan_out);
        let children: Vec<_> = (0..fan_out).map(|_| fx.object(0)).collect();
        for (i, &child) in children.iter().enumerate() {
            link(root, i, child);
        }

        // Tiny segments and a one-segment pool force overflow.
        let config = HeapConfig::new()
            .with_segment_capacity(4)
            .with_max_global_segments(1);
        let controller = MarkingController::new(Generation::Major, &config);
        controller.start(MarkingMode::Atomic);
        let mut local = controller.worklist().local();
        let mut visitor = MarkingVisitor::new(&fx.table, &SimpleObjectModel, &controller, &mut local)
            .in_pause();
        visitor.mark_root(root);
        let table = &fx.table;
        crate::gc::incremental::drain_with_overflow(|| table.pages(), &controller, &mut visitor);

        assert!(controller.stats().overflow_rescans.load(Ordering::Relaxed) > 0);
        assert!(!fx.page.has_flag(PageFlags::OVERFLOWED));
        for child in children {
            assert_eq!(fx.color(child), Color::Black);
        }
        assert_eq!(fx.page.major_bitmap().grey_count(), 0);
    }

    #[test]
    fn test_concurrent_tasks_complete() {
        let runner: Arc<dyn TaskRunner> = Arc::new(DefaultTaskRunner::new(2).unwrap());
        let marking = ConcurrentMarking::new(Arc::clone(&runner), 4);
        assert_eq!(marking.max_tasks(), 2);

        let runs = Arc::new(AtomicUsize::new(0));
        let job: MarkingJob = {
            let runs = Arc::clone(&runs);
            Arc::new(move |preempt: &AtomicBool| {
                while !preempt.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                runs.fetch_add(1, Ordering::Relaxed);
            })
        };
        assert_eq!(marking.schedule(&job), 2);
        assert_eq!(marking.schedule(&job), 0);
        let stopped = marking.ensure_task_completed();
        assert_eq!(stopped, runs.load(Ordering::Relaxed));
        assert_eq!(marking.active_tasks(), 0);
        assert_eq!(marking.ensure_task_completed(), 0);

        marking.cancel();
        assert_eq!(marking.schedule(&job), 0);
    }
}
