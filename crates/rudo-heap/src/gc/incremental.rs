//! Marking state machine.
//!
//! One [`MarkingController`] exists per generation. It owns the global
//! worklist of the cycle and moves through
//!
//! ```text
//! Stopped -> Marking -> Complete -> (atomic pause) -> Stopped
//!               ^           |
//!               +-----------+  write barrier found new grey work
//! ```
//!
//! The controller only tracks state. Popping and visiting objects is the job
//! of [`MarkingVisitor`](crate::gc::marker::MarkingVisitor); the heap decides
//! when to step, complete and finalize.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address::ObjectRef;
use crate::config::HeapConfig;
use crate::gc::mark::{Generation, MarkingMode};
use crate::gc::marker::MarkingVisitor;
use crate::gc::worklist::Worklist;
use crate::heap::page::{Page, PageFlags};

/// State of a marking cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkingState {
    /// No cycle is running; the marking barrier is a no-op.
    Stopped = 0,
    /// Roots were pushed and grey objects are being drained.
    Marking = 1,
    /// All worklists were observed empty. The atomic pause may run.
    Complete = 2,
}

impl MarkingState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Marking,
            2 => Self::Complete,
            _ => Self::Stopped,
        }
    }

    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Marking => "marking",
            Self::Complete => "complete",
        }
    }

    const fn is_valid_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Stopped | Self::Complete, Self::Marking)
                | (Self::Marking, Self::Complete)
                | (Self::Marking | Self::Complete, Self::Stopped)
        )
    }
}

/// Result of one bounded marking step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepResult {
    /// Objects visited.
    pub objects: usize,
    /// Bytes of visited objects.
    pub bytes: usize,
    /// `true` if the step stopped because it ran out of work rather than
    /// budget.
    pub worklist_empty: bool,
}

/// Per-cycle marking counters.
#[derive(Debug, Default)]
pub struct MarkStats {
    /// Objects visited.
    pub objects_marked: AtomicUsize,
    /// Bytes of visited objects.
    pub bytes_marked: AtomicUsize,
    /// Objects visited by background tasks.
    pub concurrent_objects: AtomicUsize,
    /// Main-thread marking steps.
    pub steps: AtomicUsize,
    /// Overflow rescans performed.
    pub overflow_rescans: AtomicUsize,
    /// Times the write barrier moved `Complete` back to `Marking`.
    pub barrier_restarts: AtomicUsize,
    /// Time spent marking, in nanoseconds.
    pub mark_time_ns: AtomicU64,
}

impl MarkStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.objects_marked.store(0, Ordering::SeqCst);
        self.bytes_marked.store(0, Ordering::SeqCst);
        self.concurrent_objects.store(0, Ordering::SeqCst);
        self.steps.store(0, Ordering::SeqCst);
        self.overflow_rescans.store(0, Ordering::SeqCst);
        self.barrier_restarts.store(0, Ordering::SeqCst);
        self.mark_time_ns.store(0, Ordering::SeqCst);
    }

    /// Adds the work of one drain.
    pub fn record(&self, objects: usize, bytes: usize, concurrent: bool) {
        self.objects_marked.fetch_add(objects, Ordering::Relaxed);
        self.bytes_marked.fetch_add(bytes, Ordering::Relaxed);
        if concurrent {
            self.concurrent_objects.fetch_add(objects, Ordering::Relaxed);
        }
    }

    /// Adds marking time.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_mark_time(&self, elapsed: Duration) {
        self.mark_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Accumulated marking time.
    #[must_use]
    pub fn mark_time(&self) -> Duration {
        Duration::from_nanos(self.mark_time_ns.load(Ordering::Relaxed))
    }
}

/// Marking state of one generation.
pub struct MarkingController {
    generation: Generation,
    state: AtomicU8,
    mode: AtomicU8,
    epoch: AtomicU64,
    worklist: Arc<Worklist<ObjectRef>>,
    overflowed: AtomicBool,
    stats: MarkStats,
}

impl MarkingController {
    /// Creates a stopped controller.
    #[must_use]
    pub fn new(generation: Generation, config: &HeapConfig) -> Self {
        let mode = if config.single_threaded {
            MarkingMode::NonAtomic
        } else {
            MarkingMode::Atomic
        };
        Self {
            generation,
            state: AtomicU8::new(MarkingState::Stopped as u8),
            mode: AtomicU8::new(mode as u8),
            epoch: AtomicU64::new(0),
            worklist: Arc::new(Worklist::new(
                config.segment_capacity,
                config.max_global_segments,
            )),
            overflowed: AtomicBool::new(false),
            stats: MarkStats::new(),
        }
    }

    /// Generation this controller marks.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Current state.
    #[must_use]
    #[inline]
    pub fn state(&self) -> MarkingState {
        MarkingState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` unless the controller is stopped.
    #[must_use]
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.state() != MarkingState::Stopped
    }

    /// Bitmap access mode of the running cycle.
    #[must_use]
    pub fn mode(&self) -> MarkingMode {
        MarkingMode::from_u8(self.mode.load(Ordering::Acquire)).unwrap_or(MarkingMode::Atomic)
    }

    /// Cycle counter, bumped by every [`start`](Self::start).
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Global worklist of the cycle.
    #[must_use]
    pub const fn worklist(&self) -> &Arc<Worklist<ObjectRef>> {
        &self.worklist
    }

    /// Counters of the running or last cycle.
    #[must_use]
    pub const fn stats(&self) -> &MarkStats {
        &self.stats
    }

    fn transition(&self, from: MarkingState, to: MarkingState) -> bool {
        debug_assert!(MarkingState::is_valid_transition(from, to));
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            crate::tracing::log_state_transition(self.generation.name(), from.name(), to.name());
        }
        ok
    }

    /// Starts a cycle in `mode`. Returns the new epoch.
    ///
    /// # Panics
    ///
    /// Panics if a cycle is already running.
    pub fn start(&self, mode: MarkingMode) -> u64 {
        assert!(
            self.state() == MarkingState::Stopped,
            "{} marking started twice",
            self.generation.name()
        );
        debug_assert!(self.worklist.is_empty());
        self.stats.reset();
        self.worklist.reset_stats();
        self.overflowed.store(false, Ordering::Release);
        self.mode.store(mode as u8, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.transition(MarkingState::Stopped, MarkingState::Marking);
        epoch
    }

    /// Moves `Marking` to `Complete`. The caller must have observed every
    /// worklist empty.
    pub fn try_complete(&self) -> bool {
        self.transition(MarkingState::Marking, MarkingState::Complete)
    }

    /// Moves `Complete` back to `Marking`. Returns `true` for the caller that
    /// performed the transition.
    pub fn restart(&self) -> bool {
        let restarted = self.transition(MarkingState::Complete, MarkingState::Marking);
        if restarted {
            self.stats.barrier_restarts.fetch_add(1, Ordering::Relaxed);
            crate::tracing::log_barrier_restart(self.generation.name());
        }
        restarted
    }

    /// Ends the cycle after the atomic pause.
    ///
    /// # Panics
    ///
    /// Panics if no cycle is running or grey work is left.
    pub fn finish(&self) {
        let state = self.state();
        assert!(state != MarkingState::Stopped, "finishing a stopped cycle");
        assert!(
            self.worklist.is_empty(),
            "{} marking finished with grey objects left",
            self.generation.name()
        );
        self.transition(state, MarkingState::Stopped);
    }

    /// Ends the cycle without completing it, dropping all grey work.
    pub fn abort(&self) {
        self.worklist.clear();
        self.overflowed.store(false, Ordering::Release);
        let state = self.state();
        if state != MarkingState::Stopped {
            self.transition(state, MarkingState::Stopped);
        }
    }

    /// Notes that grey objects were dropped from a worklist.
    pub fn record_overflow(&self) {
        self.overflowed.store(true, Ordering::Release);
    }

    /// Returns and clears the overflow flag.
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::AcqRel)
    }

    /// Returns `true` if grey objects were dropped since the last rescan.
    #[must_use]
    pub fn has_overflow(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MarkingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkingController")
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("mode", &self.mode())
            .field("epoch", &self.epoch())
            .field("worklist", &self.worklist)
            .field("overflowed", &self.has_overflow())
            .finish()
    }
}

/// Pushes the grey objects of every overflowed page back onto the
/// visitor's worklist. Returns the number of objects pushed.
pub(crate) fn rescan_overflowed_pages(pages: &[Arc<Page>], visitor: &mut MarkingVisitor<'_>) -> usize {
    let generation = visitor.generation();
    let mut flagged = 0;
    let mut pushed = 0;
    for page in pages {
        if !page.clear_flag(PageFlags::OVERFLOWED) {
            continue;
        }
        flagged += 1;
        let bitmap = page.bitmap(generation);
        for object in page.objects() {
            if bitmap.is_grey(page.slot_index(object.to_address())) {
                visitor.push(object);
                pushed += 1;
            }
        }
    }
    crate::tracing::log_overflow_rescan(flagged, pushed);
    pushed
}

/// Drains the visitor's worklist and rescans overflowed pages until no
/// grey object is left anywhere.
pub(crate) fn drain_with_overflow(
    pages: impl Fn() -> Vec<Arc<Page>>,
    controller: &MarkingController,
    visitor: &mut MarkingVisitor<'_>,
) -> StepResult {
    let mut total = visitor.drain(usize::MAX, || false);
    while controller.take_overflow() {
        controller
            .stats()
            .overflow_rescans
            .fetch_add(1, Ordering::Relaxed);
        rescan_overflowed_pages(&pages(), visitor);
        let step = visitor.drain(usize::MAX, || false);
        total.objects += step.objects;
        total.bytes += step.bytes;
        total.worklist_empty = step.worklist_empty;
    }
    total
}
