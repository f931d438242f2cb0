//! Collection metrics and the external metrics consumer.

use std::time::{Duration, Instant};

use crate::tracing::GcId;

/// Type of collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Young generation collection.
    Minor = 1,
    /// Full-heap collection with all marking done in one pause.
    Major = 2,
    /// Full-heap collection whose marking ran incrementally and
    /// concurrently before the atomic pause.
    IncrementalMajor = 3,
}

/// Why a collection ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GcReason {
    /// Requested explicitly by the embedder.
    #[default]
    Explicit,
    /// The young generation reached its capacity.
    NewSpaceFull,
    /// Incremental marking reached the complete state.
    MarkingComplete,
    /// The old generation grew past the marking start limit.
    MarkingLimit,
    /// An allocation failed and the heap collected before retrying.
    AllocationFailure,
    /// A background thread asked the main thread to collect.
    BackgroundRequest,
}

/// Statistics of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcMetrics {
    /// Cycle identifier.
    pub gc_id: u64,
    /// Type of collection.
    pub collection_type: CollectionType,
    /// Trigger of the collection.
    pub reason: GcReason,
    /// Wall time from marking start to the end of the atomic pause.
    pub duration: Duration,
    /// Time spent with mutators stopped.
    pub pause_duration: Duration,
    /// Time spent marking, across steps and the atomic pause.
    pub mark_duration: Duration,
    /// Time spent sweeping.
    pub sweep_duration: Duration,
    /// Objects marked live.
    pub objects_marked: usize,
    /// Bytes of objects marked live.
    pub bytes_marked: usize,
    /// Objects reclaimed.
    pub objects_reclaimed: usize,
    /// Bytes of reclaimed objects.
    pub bytes_reclaimed: usize,
    /// Bytes of objects surviving.
    pub bytes_surviving: usize,
    /// Incremental marking steps executed on mutator threads.
    pub marking_steps: usize,
    /// Conservative rescans triggered by worklist overflow.
    pub overflow_rescans: usize,
    /// Times the write barrier moved marking back from complete.
    pub barrier_restarts: usize,
    /// Empty pages returned to the page allocator.
    pub pages_released: usize,
    /// Young pages promoted to the old generation.
    pub pages_promoted: usize,
    /// Old pages selected as evacuation candidates.
    pub evacuation_candidates: usize,
    /// Collections completed by this heap, including this one.
    pub total_collections: usize,
}

impl GcMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gc_id: 0,
            collection_type: CollectionType::None,
            reason: GcReason::Explicit,
            duration: Duration::ZERO,
            pause_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            objects_marked: 0,
            bytes_marked: 0,
            objects_reclaimed: 0,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            marking_steps: 0,
            overflow_rescans: 0,
            barrier_restarts: 0,
            pages_released: 0,
            pages_promoted: 0,
            evacuation_candidates: 0,
            total_collections: 0,
        }
    }
}

/// Reported when a cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStart {
    /// Cycle identifier.
    pub gc_id: GcId,
    /// Type of collection.
    pub collection_type: CollectionType,
    /// Trigger of the collection.
    pub reason: GcReason,
    /// Committed heap bytes.
    pub committed_bytes: usize,
    /// Bytes handed out to objects since the last collection.
    pub allocated_bytes: usize,
}

/// Reported after each marking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent {
    /// Cycle identifier.
    pub gc_id: GcId,
    /// Objects visited by the step.
    pub objects: usize,
    /// Bytes visited by the step.
    pub bytes: usize,
    /// Step duration.
    pub duration: Duration,
}

/// Consumer of collector statistics, such as an embedder's tracer.
///
/// All methods have empty defaults. Nothing a recorder does influences the
/// collector.
pub trait MetricsRecorder: Send + Sync {
    /// A cycle started.
    fn cycle_started(&self, _event: &CycleStart) {}

    /// A marking step finished.
    fn marking_step(&self, _event: &StepEvent) {}

    /// A cycle finished.
    fn cycle_finished(&self, _metrics: &GcMetrics) {}
}

/// Recorder that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}

/// Accumulates phase durations of one cycle.
///
/// # Example
///
/// ```
/// use rudo_heap::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking work ...
/// timer.end_mark();
///
/// timer.start();
/// // ... sweeping work ...
/// timer.end_sweep();
/// assert!(timer.total() >= timer.mark);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Accumulated marking time.
    pub mark: Duration,
    /// Accumulated sweeping time.
    pub sweep: Duration,
    /// Accumulated stop-the-world time.
    pub pause: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Creates a timer with all durations zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            pause: Duration::ZERO,
            current_start: None,
        }
    }

    /// Starts timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Ends a marking phase, adding its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark += start.elapsed();
        }
    }

    /// Ends a sweeping phase, adding its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep += start.elapsed();
        }
    }

    /// Adds stop-the-world time measured elsewhere.
    pub fn add_pause(&mut self, pause: Duration) {
        self.pause += pause;
    }

    /// Sum of marking and sweeping time.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.mark + self.sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_phase_timer_accumulates() {
        let mut timer = PhaseTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_mark();
        let first = timer.mark;
        timer.start();
        timer.end_mark();
        assert!(timer.mark >= first);
        timer.end_sweep();
        assert_eq!(timer.sweep, Duration::ZERO);
    }

    #[test]
    fn test_recorder_defaults_are_noops() {
        struct Counting(AtomicUsize);
        impl MetricsRecorder for Counting {
            fn cycle_finished(&self, _metrics: &GcMetrics) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        let recorder = Counting(AtomicUsize::new(0));
        recorder.marking_step(&StepEvent {
            gc_id: GcId(1),
            objects: 1,
            bytes: 8,
            duration: Duration::ZERO,
        });
        recorder.cycle_finished(&GcMetrics::new());
        assert_eq!(recorder.0.load(Ordering::Relaxed), 1);
        NoopRecorder.cycle_finished(&GcMetrics::default());
    }
}
