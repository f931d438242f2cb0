//! Marking, barriers and thread coordination.
//!
//! This module holds the collector proper:
//! - tri-color bitmaps and the marking state machine
//! - the segmented worklist shared by every marker
//! - write barriers and the per-thread barrier state
//! - safepoints, the collection barrier and the background task runner
//! - the minor collector and the heap verifier

pub mod barrier;
pub mod collection_barrier;
pub mod incremental;
pub mod mark;
pub mod marker;
pub(crate) mod minor;
pub mod safepoint;
pub mod task;
pub mod verifier;
pub mod worklist;

pub use collection_barrier::{AwaitResult, CollectionBarrier};
pub use incremental::{MarkStats, MarkingController, MarkingState, StepResult};
pub use mark::{Color, Generation, MarkBitmap, MarkingMode};
pub use safepoint::{Safepoint, SafepointScope, ThreadContext, ThreadState};
pub use task::{DefaultTaskRunner, Task, TaskRunner};
pub use verifier::VerificationReport;
pub use worklist::{Local, Worklist};
