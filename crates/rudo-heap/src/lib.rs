//! An incremental, concurrent tracing heap.
//!
//! `rudo-heap` is the core of a non-moving mark-sweep garbage collector for
//! language runtimes. The embedder describes its object layout through an
//! [`ObjectModel`] and its roots through a [`RootEnumerator`] (or the
//! built-in [`RootSet`]); the heap does the rest:
//!
//! - **Paged allocation**: regular pages with segregated free lists and
//!   per-thread linear allocation buffers, single-object pages for large
//!   objects.
//! - **Tri-color marking**: two bits per word, incremental steps on the main
//!   thread and background marking tasks draining a shared segmented
//!   worklist.
//! - **Write barriers**: a Dijkstra insertion barrier while marking and a
//!   generational barrier recording old-to-young slots.
//! - **Safepoints**: stop-the-world pauses across every thread that owns a
//!   [`LocalHeap`].
//! - **Generations**: a non-moving young generation collected by minor
//!   collections and promoted page by page.
//!
//! # Quick Start
//!
//! ```
//! use rudo_heap::{AllocationType, Heap, HeapConfig, MarkingState, SimpleObjectModel};
//!
//! let heap = Heap::with_config(HeapConfig::new().with_marking_start_limit(usize::MAX)).unwrap();
//!
//! // A node with one reference field.
//! let size = SimpleObjectModel::size_for(1, 0);
//! let parent = heap.allocate(size, AllocationType::Old).unwrap();
//! unsafe { SimpleObjectModel::initialize(parent, size, 1) };
//! let root = heap.roots().add(Some(parent));
//!
//! heap.start_incremental_marking();
//!
//! // Stores go through the barriers.
//! let child = heap.allocate(size, AllocationType::Young).unwrap();
//! unsafe { SimpleObjectModel::initialize(child, size, 1) };
//! heap.store(parent, SimpleObjectModel::field(parent, 0), Some(child));
//!
//! while heap.marking_state() == MarkingState::Marking {
//!     heap.marking_step();
//! }
//! heap.finalize_incremental_marking();
//! assert!(heap.contains(child));
//! heap.roots().remove(root);
//! ```
//!
//! # Threads
//!
//! [`Heap`] lives on the thread that built it. Every other thread allocates
//! through its own [`LocalHeap`] and must poll
//! [`LocalHeap::safepoint`] regularly, or [`park`](LocalHeap::park) while it
//! stays out of heap code.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod metrics;
pub mod object;
pub mod roots;
pub mod tracing;

pub use address::{Address, ObjectRef, PageId, Slot, SlotIndex, WORD_SIZE};
pub use config::{FreeListStrategy, HeapConfig};
pub use error::{HeapError, HeapResult};
pub use gc::{Color, MarkingState, StepResult, TaskRunner, VerificationReport};
pub use heap::{AllocationType, Heap, HeapBuilder, HeapStatistics, LocalHeap, PauseScope};
pub use metrics::{CollectionType, GcMetrics, GcReason, MetricsRecorder};
pub use object::{ObjectModel, SimpleObjectModel, SlotVisitor};
pub use roots::{RootEnumerator, RootHandle, RootSet, RootVisitor};
