//! Per-thread heap access.
//!
//! A [`LocalHeap`] is a thread's handle to the shared heap. It owns the
//! thread's linear allocation buffers (LABs) and marking barrier, and its
//! [`ThreadContext`] takes part in safepoints.
//!
//! A running local heap must poll: allocation polls on its slow path and
//! [`LocalHeap::safepoint`] polls explicitly. Code that blocks for a long
//! time outside the heap should [`park`](LocalHeap::park) first (or run
//! inside [`parked`](LocalHeap::parked)) so collections do not wait for it.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::address::{align_up, Address, ObjectRef, Slot, WORD_SIZE};
use crate::error::{HeapError, HeapResult};
use crate::gc::barrier::{generational_barrier, MarkingBarrier};
use crate::gc::collection_barrier::AwaitResult;
use crate::gc::safepoint::{ThreadContext, ThreadState};
use crate::heap::space::{LinearAllocationArea, Space, SpaceKind};
use crate::heap::HeapInner;
use crate::metrics::GcReason;

/// How long a background allocator waits for the main thread before
/// checking whether it can collect by itself.
const COLLECTION_REQUEST_POLL: Duration = Duration::from_millis(1);

/// Where an object is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocationType {
    /// Young generation. Falls back to the old generation when the young
    /// generation is full.
    #[default]
    Young,
    /// Old generation.
    Old,
    /// Executable memory in the large object space.
    Code,
}

/// Mutable per-thread allocation and barrier state. Locked by its owner on
/// every allocation and barrier, and by the collector during pauses.
#[derive(Debug, Default)]
pub(crate) struct MutatorState {
    pub(crate) new_lab: Option<LinearAllocationArea>,
    pub(crate) old_lab: Option<LinearAllocationArea>,
    pub(crate) barrier: MarkingBarrier,
    pub(crate) allocated_since_step: usize,
}

impl MutatorState {
    fn lab_mut(&mut self, kind: SpaceKind) -> &mut Option<LinearAllocationArea> {
        match kind {
            SpaceKind::New => &mut self.new_lab,
            _ => &mut self.old_lab,
        }
    }

    /// Gives the unused part of both LABs back to their spaces.
    pub(crate) fn retire_labs(&mut self, heap: &HeapInner) {
        for lab in [self.new_lab.take(), self.old_lab.take()].into_iter().flatten() {
            retire_lab(heap, &lab);
        }
    }
}

fn retire_lab(heap: &HeapInner, lab: &LinearAllocationArea) {
    if lab.remaining() > 0 {
        let page = lab.page();
        heap.space(page.space()).free(page, lab.top(), lab.remaining());
    }
}

fn report_failure(error: &HeapError) {
    if let HeapError::OutOfMemory {
        requested,
        committed,
        limit,
    } = *error
    {
        crate::tracing::log_out_of_memory(requested, committed, limit);
    }
}

/// A thread's handle to the heap.
///
/// `LocalHeap` is `Send` but not `Sync`: it is used by one thread at a time.
pub struct LocalHeap {
    heap: Arc<HeapInner>,
    context: Arc<ThreadContext>,
    _not_sync: PhantomData<Cell<()>>,
}

impl LocalHeap {
    pub(crate) fn new(heap: Arc<HeapInner>, is_main: bool) -> Self {
        let id = heap.next_context_id();
        let context = Arc::new(ThreadContext::new(id, is_main, MutatorState::default()));
        if !is_main {
            // Background heaps start parked so they can be moved to their
            // thread without stalling a safepoint.
            heap.safepoint.park(&context);
        }
        heap.safepoint.add_context(Arc::clone(&context));
        {
            // A cycle may already be running.
            let mut state = context.mutator.lock();
            if heap.major.is_marking() && !state.barrier.is_activated() {
                state.barrier.activate(heap.major.worklist());
            }
        }
        Self {
            heap,
            context,
            _not_sync: PhantomData,
        }
    }

    pub(crate) const fn inner(&self) -> &Arc<HeapInner> {
        &self.heap
    }

    pub(crate) const fn context(&self) -> &Arc<ThreadContext> {
        &self.context
    }

    /// Context identifier, unique within the heap.
    #[must_use]
    pub fn id(&self) -> usize {
        self.context.id()
    }

    /// Returns `true` for the heap's main thread.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.context.is_main()
    }

    /// Returns `true` while parked.
    #[must_use]
    pub fn is_parked(&self) -> bool {
        self.context.thread_state() == ThreadState::Parked
    }

    /// Allocates `size` bytes of zeroed memory.
    ///
    /// The object must have a valid header (as understood by the heap's
    /// object model) and be reachable from a root before this thread
    /// allocates again or polls a safepoint.
    ///
    /// # Errors
    ///
    /// [`HeapError::InvalidSize`] for zero-sized requests,
    /// [`HeapError::OutOfMemory`] if the heap limit is reached even after a
    /// full collection, [`HeapError::TornDown`] after teardown.
    pub fn allocate(&self, size: usize, allocation: AllocationType) -> HeapResult<ObjectRef> {
        debug_assert!(!self.is_parked(), "allocation on a parked local heap");
        if self.heap.is_torn_down() {
            return Err(HeapError::TornDown);
        }
        if size == 0 || size > isize::MAX as usize / 2 {
            return Err(HeapError::InvalidSize(size));
        }
        let size = align_up(size, WORD_SIZE);
        if allocation == AllocationType::Code || size > self.heap.config.max_regular_object_size() {
            return self.allocate_large(size, allocation == AllocationType::Code);
        }
        let kind = match allocation {
            AllocationType::Young => SpaceKind::New,
            _ => SpaceKind::Old,
        };
        if let Some(object) = self.try_allocate_fast(size, kind) {
            return Ok(object);
        }
        self.allocate_slow(size, kind)
    }

    fn try_allocate_fast(&self, size: usize, kind: SpaceKind) -> Option<ObjectRef> {
        let (page, address) = {
            let mut state = self.context.mutator.lock();
            let lab = state.lab_mut(kind).as_mut()?;
            let address = lab.allocate(size)?;
            let page = Arc::clone(lab.page());
            state.allocated_since_step += size;
            (page, address)
        };
        self.heap.initialize_object(&page, address, size)
    }

    fn allocate_slow(&self, size: usize, mut kind: SpaceKind) -> HeapResult<ObjectRef> {
        let mut collected = false;
        loop {
            self.safepoint();
            if self.is_main() {
                self.heap.on_allocation_slow_path(self);
            }
            if let Some(object) = self.try_allocate_fast(size, kind) {
                return Ok(object);
            }
            match self.refill_lab(size, kind) {
                Ok(refilled) => {
                    kind = refilled;
                    if let Some(object) = self.try_allocate_fast(size, kind) {
                        return Ok(object);
                    }
                }
                Err(err) if err.is_out_of_memory() && !collected => {
                    crate::tracing::log_collection_retry(size);
                    self.collect_for_allocation();
                    collected = true;
                }
                Err(err) => {
                    report_failure(&err);
                    return Err(err);
                }
            }
        }
    }

    fn allocate_large(&self, size: usize, executable: bool) -> HeapResult<ObjectRef> {
        let mut collected = false;
        loop {
            self.safepoint();
            if self.is_main() {
                self.heap.on_allocation_slow_path(self);
            }
            match self
                .heap
                .large_space
                .allocate(&self.heap.pages, &self.heap.allocator, size, executable)
            {
                Ok((_page, address)) => {
                    self.context.mutator.lock().allocated_since_step += size;
                    // Large pages are never pooled, so they come back zeroed.
                    if let Some(object) = ObjectRef::from_address(address) {
                        return Ok(object);
                    }
                    return Err(HeapError::InvalidSize(size));
                }
                Err(err) if err.is_out_of_memory() && !collected => {
                    crate::tracing::log_collection_retry(size);
                    self.collect_for_allocation();
                    collected = true;
                }
                Err(err) => {
                    report_failure(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Installs a new LAB able to hold `size` bytes. Returns the space the
    /// LAB was taken from, which may differ from `kind` when the young
    /// generation is full.
    fn refill_lab(&self, size: usize, kind: SpaceKind) -> HeapResult<SpaceKind> {
        let mut kind = kind;
        let mut minor_done = false;
        let block = loop {
            let space = self.heap.space(kind);
            let want = size.max(self.heap.config.lab_size);
            if let Some(block) = space.allocate_block(want).or_else(|| space.allocate_block(size)) {
                break block;
            }
            if space.expand(&self.heap.pages, &self.heap.allocator)?.is_some() {
                continue;
            }
            // Only the young generation has a capacity of its own.
            if self.is_main() && !minor_done {
                self.heap.collect_minor(self, GcReason::NewSpaceFull);
                minor_done = true;
                continue;
            }
            kind = SpaceKind::Old;
        };
        let block = trim_block(self.heap.space(kind), block, size, self.heap.config.lab_size);

        let mut state = self.context.mutator.lock();
        let state = &mut *state;
        if let Some(old) = state.lab_mut(kind).replace(LinearAllocationArea::new(block)) {
            retire_lab(&self.heap, &old);
        }
        let lab = match kind {
            SpaceKind::New => state.new_lab.as_ref(),
            _ => state.old_lab.as_ref(),
        };
        // Objects shaded while they sat in the retired LAB can be traced now.
        state
            .barrier
            .release_on_hold(&self.heap.pages, &self.heap.major, lab);
        Ok(kind)
    }

    fn collect_for_allocation(&self) {
        if self.is_main() {
            self.heap.collect_full(self, GcReason::AllocationFailure);
        } else {
            self.request_collection();
        }
    }

    /// Asks the main thread for a full collection and waits until one ran.
    /// Collects on this thread if the main thread is parked.
    fn request_collection(&self) {
        let barrier = &self.heap.collection_barrier;
        let Some(ticket) = barrier.request_gc() else {
            return;
        };
        loop {
            if self.heap.main_is_parked() {
                if let Some(guard) = self.heap.gc_lock.try_lock() {
                    self.heap
                        .collect_full_locked(self, &guard, GcReason::BackgroundRequest);
                    return;
                }
            }
            let result = self.parked(|| barrier.await_collection(ticket, COLLECTION_REQUEST_POLL));
            match result {
                AwaitResult::Collected | AwaitResult::Shutdown => return,
                AwaitResult::TimedOut => {}
            }
        }
    }

    /// Stores `value` into `slot` of `host` and runs the write barriers.
    pub fn store(&self, host: ObjectRef, slot: Slot, value: Option<ObjectRef>) {
        slot.store(value, Ordering::Release);
        let Some(value) = value else {
            return;
        };
        let heap = &self.heap;
        generational_barrier(&heap.pages, host, slot, value);
        if !heap.major.is_marking() {
            return;
        }
        let mut state = self.context.mutator.lock();
        let MutatorState {
            new_lab,
            old_lab,
            barrier,
            ..
        } = &mut *state;
        let lab = [new_lab.as_ref(), old_lab.as_ref()]
            .into_iter()
            .flatten()
            .find(|lab| lab.contains(value.to_address()));
        barrier.write_barrier(&heap.pages, &heap.major, host, value, lab);
    }

    /// Re-runs the barriers for `slots` of `host` after they were written
    /// without [`store`](Self::store), e.g. by a bulk copy. A black host is
    /// turned grey so marking visits it again.
    pub fn write_barrier_for_range(&self, host: ObjectRef, slots: impl IntoIterator<Item = Slot>) {
        let heap = &self.heap;
        for slot in slots {
            if let Some(value) = slot.load(Ordering::Acquire) {
                generational_barrier(&heap.pages, host, slot, value);
            }
        }
        self.revisit_object(host);
    }

    /// Turns a black `host` grey and queues it for another visit. Returns
    /// `true` if the host was black. Does nothing while marking is stopped.
    pub fn revisit_object(&self, host: ObjectRef) -> bool {
        let heap = &self.heap;
        if !heap.major.is_marking() {
            return false;
        }
        self.context
            .mutator
            .lock()
            .barrier
            .revisit(&heap.pages, &heap.major, host)
    }

    /// Polls for a safepoint request and stops here until the pause ends.
    /// On the main thread this also serves collection requests of
    /// background threads.
    pub fn safepoint(&self) {
        if self.context.is_safepoint_requested() {
            self.heap
                .safepoint
                .safepoint_slow_path(&self.context, || self.flush());
        }
        if self.is_main() && self.heap.collection_barrier.was_gc_requested() {
            self.heap.collect_full(self, GcReason::BackgroundRequest);
        }
    }

    /// Marks the thread as outside heap code. Collections no longer wait for
    /// it. The thread must not touch heap objects until it unparks.
    pub fn park(&self) {
        self.flush();
        self.heap.safepoint.park(&self.context);
    }

    /// Re-enters heap code, waiting for a running pause to end.
    pub fn unpark(&self) {
        self.heap.safepoint.unpark(&self.context);
    }

    /// Runs `f` parked.
    pub fn parked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.park();
        let _unpark = UnparkOnDrop(self);
        f()
    }

    /// Publishes barrier work so other markers can see it.
    pub(crate) fn flush(&self) {
        self.context
            .mutator
            .lock()
            .barrier
            .publish(&self.heap.pages, &self.heap.major);
    }
}

struct UnparkOnDrop<'a>(&'a LocalHeap);

impl Drop for UnparkOnDrop<'_> {
    fn drop(&mut self) {
        self.0.unpark();
    }
}

impl Drop for LocalHeap {
    fn drop(&mut self) {
        if !self.is_parked() {
            self.park();
        }
        {
            let mut state = self.context.mutator.lock();
            state.retire_labs(&self.heap);
            state.barrier.deactivate(&self.heap.pages, &self.heap.major);
        }
        self.heap.safepoint.remove_context(&self.context);
    }
}

impl fmt::Debug for LocalHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalHeap")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Splits a block much larger than a LAB, returning the tail to `space`.
fn trim_block(
    space: &Space,
    mut block: crate::heap::free_list::FreeBlock,
    size: usize,
    lab_size: usize,
) -> crate::heap::free_list::FreeBlock {
    let keep = size.max(lab_size);
    if block.size > keep + crate::heap::free_list::MIN_BLOCK_SIZE {
        let tail: Address = block.start.offset(keep);
        space.free(&block.page, tail, block.size - keep);
        block.size = keep;
    }
    block
}
