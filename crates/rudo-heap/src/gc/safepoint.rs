//! Cooperative stop-the-world.
//!
//! Every thread with heap access owns a [`ThreadContext`] registered with
//! the heap's [`Safepoint`]. A context is either running or parked. Running
//! contexts poll a request flag at allocation and at explicit poll points;
//! parked contexts promise not to touch the heap until they unpark.
//!
//! [`Safepoint::enter_safepoint_scope`] arms the barrier, raises the request
//! flag on every other context and waits until each of them is parked. The
//! returned [`SafepointScope`] keeps the world stopped; dropping it disarms
//! the barrier and lets everybody run again.
//!
//! Context state is one atomic byte:
//!
//! ```text
//! PARKED              the thread is stopped or outside heap code
//! SAFEPOINT_REQUESTED a scope is (being) entered
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::heap::local_heap::MutatorState;

const PARKED: u8 = 1 << 0;
const SAFEPOINT_REQUESTED: u8 = 1 << 1;

/// Observable state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing heap code.
    Running,
    /// Stopped at a safepoint or outside heap code.
    Parked,
}

/// Per-thread heap state shared with the collector.
pub struct ThreadContext {
    id: usize,
    is_main: bool,
    state: AtomicU8,
    pub(crate) mutator: Mutex<MutatorState>,
}

impl ThreadContext {
    pub(crate) fn new(id: usize, is_main: bool, mutator: MutatorState) -> Self {
        Self {
            id,
            is_main,
            state: AtomicU8::new(0),
            mutator: Mutex::new(mutator),
        }
    }

    /// Identifier unique within the heap.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Returns `true` for the heap's main thread.
    #[must_use]
    pub const fn is_main(&self) -> bool {
        self.is_main
    }

    /// Current state.
    #[must_use]
    pub fn thread_state(&self) -> ThreadState {
        if self.state.load(Ordering::Acquire) & PARKED == 0 {
            ThreadState::Running
        } else {
            ThreadState::Parked
        }
    }

    /// Returns `true` if a safepoint wants this context to stop.
    #[must_use]
    #[inline]
    pub fn is_safepoint_requested(&self) -> bool {
        self.state.load(Ordering::Relaxed) & SAFEPOINT_REQUESTED != 0
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id)
            .field("is_main", &self.is_main)
            .field("state", &self.thread_state())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct BarrierState {
    armed: bool,
    stopped: usize,
}

#[derive(Default)]
struct Barrier {
    state: Mutex<BarrierState>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

impl Barrier {
    fn arm(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.armed);
        state.armed = true;
        state.stopped = 0;
    }

    fn disarm(&self) {
        let mut state = self.state.lock();
        state.armed = false;
        state.stopped = 0;
        self.cv_resume.notify_all();
    }

    fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    fn notify_park(&self) {
        let mut state = self.state.lock();
        state.stopped += 1;
        self.cv_stopped.notify_all();
    }

    fn wait_in_safepoint(&self) {
        let mut state = self.state.lock();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
    }

    fn wait_until_running_threads_in_safepoint(&self, running: usize) -> usize {
        let mut state = self.state.lock();
        while state.stopped < running {
            self.cv_stopped.wait(&mut state);
        }
        debug_assert_eq!(state.stopped, running);
        state.stopped
    }
}

/// Registry of thread contexts and the stop-the-world barrier.
#[derive(Default)]
pub struct Safepoint {
    contexts: Mutex<Vec<Arc<ThreadContext>>>,
    barrier: Barrier,
}

impl Safepoint {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a context. Blocks while a scope is active.
    pub(crate) fn add_context(&self, context: Arc<ThreadContext>) {
        self.contexts.lock().push(context);
    }

    /// The registered contexts at this moment.
    pub(crate) fn contexts_snapshot(&self) -> Vec<Arc<ThreadContext>> {
        self.contexts.lock().clone()
    }

    /// Unregisters a context. The context must be parked so a scope being
    /// entered does not wait for it.
    pub(crate) fn remove_context(&self, context: &ThreadContext) {
        debug_assert_eq!(context.thread_state(), ThreadState::Parked);
        self.contexts
            .lock()
            .retain(|c| !std::ptr::eq(Arc::as_ptr(c), context));
    }

    /// Number of registered contexts.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Returns `true` while a scope is active.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.barrier.is_armed()
    }

    /// Stops every context except `initiator` and returns a guard that keeps
    /// them stopped.
    pub fn enter_safepoint_scope(&self, initiator: Option<&ThreadContext>) -> SafepointScope<'_> {
        let contexts = self.contexts.lock();
        self.barrier.arm();

        let mut running = 0;
        for context in contexts.iter() {
            if initiator.is_some_and(|i| std::ptr::eq(i, Arc::as_ptr(context))) {
                continue;
            }
            let old = context
                .state
                .fetch_or(SAFEPOINT_REQUESTED, Ordering::SeqCst);
            if old & PARKED == 0 {
                running += 1;
            }
        }
        crate::tracing::log_safepoint("requested", running);
        let stopped = self.barrier.wait_until_running_threads_in_safepoint(running);
        crate::tracing::log_safepoint("reached", contexts.len());

        SafepointScope {
            safepoint: self,
            contexts,
            initiator: initiator.map(ThreadContext::id),
            stopped,
        }
    }

    /// Slow path of a poll: stops `context` until the scope ends.
    /// `before_park` runs first, while the context is still running.
    pub(crate) fn safepoint_slow_path(&self, context: &ThreadContext, before_park: impl FnOnce()) {
        before_park();
        let old = context.state.fetch_or(PARKED, Ordering::SeqCst);
        debug_assert_eq!(old & PARKED, 0);
        self.barrier.notify_park();
        self.wait_while_requested(context);
    }

    /// Parks a running context.
    pub(crate) fn park(&self, context: &ThreadContext) {
        let old = context.state.fetch_or(PARKED, Ordering::SeqCst);
        debug_assert_eq!(old & PARKED, 0, "context parked twice");
        if old & SAFEPOINT_REQUESTED != 0 {
            // The initiator counted us as running.
            self.barrier.notify_park();
        }
    }

    /// Unparks a context, waiting for an active scope to end first.
    pub(crate) fn unpark(&self, context: &ThreadContext) {
        if context
            .state
            .compare_exchange(PARKED, 0, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            self.wait_while_requested(context);
        }
    }

    fn wait_while_requested(&self, context: &ThreadContext) {
        loop {
            self.barrier.wait_in_safepoint();
            // A new scope may have been entered between the wake-up and
            // now; it counted us as parked, so stay parked for it.
            if context
                .state
                .compare_exchange(PARKED, 0, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl fmt::Debug for Safepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Safepoint")
            .field("contexts", &self.context_count())
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Guard of a stop-the-world pause. Every context but the initiator is
/// parked while it lives.
#[must_use = "the pause ends when the scope is dropped"]
pub struct SafepointScope<'a> {
    safepoint: &'a Safepoint,
    contexts: MutexGuard<'a, Vec<Arc<ThreadContext>>>,
    initiator: Option<usize>,
    stopped: usize,
}

impl SafepointScope<'_> {
    /// All registered contexts, the initiator included.
    #[must_use]
    pub fn contexts(&self) -> &[Arc<ThreadContext>] {
        &self.contexts
    }

    /// Number of contexts that were running and stopped for this scope.
    #[must_use]
    pub const fn stopped_threads(&self) -> usize {
        self.stopped
    }

    /// Number of contexts other than the initiator, all parked now.
    #[must_use]
    pub fn parked_threads(&self) -> usize {
        self.contexts
            .iter()
            .filter(|c| Some(c.id()) != self.initiator)
            .filter(|c| c.thread_state() == ThreadState::Parked)
            .count()
    }

    /// Ends the pause.
    pub fn resume(self) {}
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        for context in self.contexts.iter() {
            if Some(context.id()) != self.initiator {
                context
                    .state
                    .fetch_and(!SAFEPOINT_REQUESTED, Ordering::SeqCst);
            }
        }
        self.safepoint.barrier.disarm();
        crate::tracing::log_safepoint("resumed", self.contexts.len());
    }
}

impl fmt::Debug for SafepointScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafepointScope")
            .field("contexts", &self.contexts.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    fn context(id: usize) -> Arc<ThreadContext> {
        Arc::new(ThreadContext::new(id, id == 0, MutatorState::default()))
    }

    #[test]
    fn test_parked_contexts_are_not_waited_for() {
        let safepoint = Safepoint::new();
        let main = context(0);
        let parked = context(1);
        safepoint.add_context(Arc::clone(&main));
        safepoint.add_context(Arc::clone(&parked));
        safepoint.park(&parked);

        let scope = safepoint.enter_safepoint_scope(Some(&main));
        assert_eq!(scope.stopped_threads(), 0);
        assert_eq!(scope.parked_threads(), 1);
        assert_eq!(main.thread_state(), ThreadState::Running);
        drop(scope);

        safepoint.unpark(&parked);
        assert_eq!(parked.thread_state(), ThreadState::Running);
    }

    #[test]
    fn test_running_threads_stop_at_poll() {
        let safepoint = Arc::new(Safepoint::new());
        let main = context(0);
        safepoint.add_context(Arc::clone(&main));

        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::new();
        for id in 1..=4 {
            let ctx = context(id);
            safepoint.add_context(Arc::clone(&ctx));
            let (safepoint, stop, progress) =
                (Arc::clone(&safepoint), Arc::clone(&stop), Arc::clone(&progress));
            threads.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if ctx.is_safepoint_requested() {
                        safepoint.safepoint_slow_path(&ctx, || {});
                    }
                    progress.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
                safepoint.park(&ctx);
                safepoint.remove_context(&ctx);
            }));
        }

        let scope = safepoint.enter_safepoint_scope(Some(&main));
        assert_eq!(scope.stopped_threads(), 4);
        assert_eq!(scope.parked_threads(), 4);
        let frozen = progress.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        // A thread may finish the increment it was executing when the
        // request arrived, but nobody runs past the poll.
        assert!(progress.load(Ordering::Relaxed) <= frozen + 4);
        scope.resume();

        let resumed = progress.load(Ordering::Relaxed);
        while progress.load(Ordering::Relaxed) == resumed {
            std::hint::spin_loop();
        }
        stop.store(true, Ordering::Relaxed);
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(safepoint.context_count(), 1);
    }
}
