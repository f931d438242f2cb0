//! Heap tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured
//! spans and events for collection cycles, marking steps, safepoints and
//! page management. Without the feature every helper is an empty inline
//! function so call sites need no `cfg` of their own.

use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier for a collection cycle.
///
/// Used to correlate all events of one cycle. Monotonically increasing,
/// starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

/// Generates the next cycle id.
pub fn next_gc_id() -> GcId {
    GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
}

/// Collector phases reported in spans and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Safepoint that flips marking on and pushes roots.
    StartMarking,
    /// Incremental and concurrent marking while the mutator runs.
    Mark,
    /// Final stop-the-world marking.
    AtomicPause,
    /// Rebuilding free lists from mark bits.
    Sweep,
    /// Stop-the-world young generation marking.
    MinorMark,
    /// Young generation sweeping and page promotion.
    MinorSweep,
    /// Heap verification.
    Verify,
}

#[cfg(feature = "tracing")]
mod enabled {
    use super::{GcId, GcPhase};
    use tracing::{span, Level};

    /// Guard returned by the span helpers.
    pub type SpanGuard = span::EnteredSpan;

    /// Creates a span covering a whole collection cycle.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> SpanGuard {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Creates a span for one collector phase.
    pub fn trace_phase(phase: GcPhase) -> SpanGuard {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    pub fn log_phase_start(phase: GcPhase, bytes_before: usize) {
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
    }

    pub fn log_phase_end(phase: GcPhase, bytes_reclaimed: usize) {
        tracing::debug!(phase = ?phase, bytes_reclaimed, "phase_end");
    }

    pub fn log_state_transition(generation: &str, from: &str, to: &str) {
        tracing::debug!(generation, from, to, "marking_state_transition");
    }

    pub fn log_marking_step(objects: usize, bytes: usize, worklist_empty: bool) {
        tracing::trace!(objects, bytes, worklist_empty, "marking_step");
    }

    pub fn log_worklist_overflow(dropped: usize) {
        tracing::warn!(dropped, "marking_worklist_overflow");
    }

    pub fn log_overflow_rescan(pages: usize, objects: usize) {
        tracing::debug!(pages, objects, "overflow_rescan");
    }

    pub fn log_barrier_restart(generation: &str) {
        tracing::trace!(generation, "barrier_restarted_marking");
    }

    pub fn log_safepoint(event: &str, threads: usize) {
        tracing::debug!(event, threads, "safepoint");
    }

    pub fn log_page_allocated(page: u32, size: usize, pooled: bool) {
        tracing::trace!(page, size, pooled, "page_allocated");
    }

    pub fn log_page_released(page: u32, size: usize, pooled: bool) {
        tracing::trace!(page, size, pooled, "page_released");
    }

    pub fn log_evacuation_candidate(page: u32, live_bytes: usize, evicted: usize) {
        tracing::trace!(page, live_bytes, evicted, "evacuation_candidate");
    }

    pub fn log_promotion(pages: usize) {
        tracing::debug!(pages, "pages_promoted");
    }

    pub fn log_tasks_cancelled(count: usize) {
        tracing::debug!(count, "background_tasks_cancelled");
    }

    pub fn log_collection_retry(requested: usize) {
        tracing::warn!(requested, "allocation_failed_retrying_after_gc");
    }

    pub fn log_out_of_memory(requested: usize, committed: usize, limit: usize) {
        tracing::error!(requested, committed, limit, "out_of_memory");
    }

    pub fn log_invalid_config(name: &str, value: &str) {
        tracing::warn!(name, value, "ignoring_invalid_heap_option");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
mod disabled {
    use super::{GcId, GcPhase};

    /// Stub guard when tracing is disabled.
    #[derive(Debug)]
    pub struct SpanGuard;

    #[inline]
    pub fn trace_gc_collection(_collection_type: &str, _gc_id: GcId) -> SpanGuard {
        SpanGuard
    }

    #[inline]
    pub fn trace_phase(_phase: GcPhase) -> SpanGuard {
        SpanGuard
    }

    #[inline]
    pub fn log_phase_start(_phase: GcPhase, _bytes_before: usize) {}

    #[inline]
    pub fn log_phase_end(_phase: GcPhase, _bytes_reclaimed: usize) {}

    #[inline]
    pub fn log_state_transition(_generation: &str, _from: &str, _to: &str) {}

    #[inline]
    pub fn log_marking_step(_objects: usize, _bytes: usize, _worklist_empty: bool) {}

    #[inline]
    pub fn log_worklist_overflow(_dropped: usize) {}

    #[inline]
    pub fn log_overflow_rescan(_pages: usize, _objects: usize) {}

    #[inline]
    pub fn log_barrier_restart(_generation: &str) {}

    #[inline]
    pub fn log_safepoint(_event: &str, _threads: usize) {}

    #[inline]
    pub fn log_page_allocated(_page: u32, _size: usize, _pooled: bool) {}

    #[inline]
    pub fn log_page_released(_page: u32, _size: usize, _pooled: bool) {}

    #[inline]
    pub fn log_evacuation_candidate(_page: u32, _live_bytes: usize, _evicted: usize) {}

    #[inline]
    pub fn log_promotion(_pages: usize) {}

    #[inline]
    pub fn log_tasks_cancelled(_count: usize) {}

    #[inline]
    pub fn log_collection_retry(_requested: usize) {}

    #[inline]
    pub fn log_out_of_memory(_requested: usize, _committed: usize, _limit: usize) {}

    #[inline]
    pub fn log_invalid_config(_name: &str, _value: &str) {}
}

#[cfg(not(feature = "tracing"))]
pub use disabled::*;
#[cfg(feature = "tracing")]
pub use enabled::*;
