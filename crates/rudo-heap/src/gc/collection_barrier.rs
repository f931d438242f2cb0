//! Hand-off of collection requests from background allocators.
//!
//! A background thread whose allocation needs a collection raises a request
//! here and waits. The main thread checks the request at its poll points,
//! collects, and resumes the waiters. A waiter that finds the main thread
//! parked may run the collection itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Stops background allocators until a requested collection has run.
#[derive(Debug, Default)]
pub struct CollectionBarrier {
    mutex: Mutex<BarrierFlags>,
    cv_wakeup: Condvar,
    collection_requested: AtomicBool,
}

#[derive(Debug, Default)]
struct BarrierFlags {
    // Bumped each time waiters are resumed so a waiter can tell a served
    // request from a new one raised after it.
    generation: u64,
    shutdown_requested: bool,
}

/// Outcome of [`CollectionBarrier::await_collection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitResult {
    /// A collection ran since the request.
    Collected,
    /// The timeout elapsed first.
    TimedOut,
    /// The heap is shutting down.
    Shutdown,
}

impl CollectionBarrier {
    /// Creates a barrier with no request pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a background thread is waiting for a collection.
    #[must_use]
    #[inline]
    pub fn was_gc_requested(&self) -> bool {
        self.collection_requested.load(Ordering::Relaxed)
    }

    /// Raises a request and returns a ticket for
    /// [`await_collection`](Self::await_collection). Returns `None` during
    /// shutdown.
    pub fn request_gc(&self) -> Option<u64> {
        let flags = self.mutex.lock();
        if flags.shutdown_requested {
            return None;
        }
        self.collection_requested.store(true, Ordering::Release);
        Some(flags.generation)
    }

    /// Waits up to `timeout` for the collection requested with `ticket`.
    pub fn await_collection(&self, ticket: u64, timeout: Duration) -> AwaitResult {
        let mut flags = self.mutex.lock();
        loop {
            if flags.shutdown_requested {
                return AwaitResult::Shutdown;
            }
            if flags.generation != ticket {
                return AwaitResult::Collected;
            }
            if self.cv_wakeup.wait_for(&mut flags, timeout).timed_out() {
                return if flags.generation == ticket {
                    AwaitResult::TimedOut
                } else {
                    AwaitResult::Collected
                };
            }
        }
    }

    /// Clears the request and wakes every waiter. Called after each full
    /// collection.
    pub fn resume_threads_awaiting_collection(&self) {
        let mut flags = self.mutex.lock();
        self.collection_requested.store(false, Ordering::Release);
        flags.generation = flags.generation.wrapping_add(1);
        self.cv_wakeup.notify_all();
    }

    /// Wakes every waiter for good.
    pub fn notify_shutdown_requested(&self) {
        let mut flags = self.mutex.lock();
        flags.shutdown_requested = true;
        self.collection_requested.store(false, Ordering::Release);
        self.cv_wakeup.notify_all();
    }

    /// Returns `true` once shutdown was requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.mutex.lock().shutdown_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_waiter_is_resumed() {
        let barrier = Arc::new(CollectionBarrier::new());
        let ticket = barrier.request_gc().unwrap();
        assert!(barrier.was_gc_requested());

        let waiter = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || barrier.await_collection(ticket, Duration::from_secs(10)))
        };
        while !barrier.was_gc_requested() {
            std::hint::spin_loop();
        }
        barrier.resume_threads_awaiting_collection();
        assert_eq!(waiter.join().unwrap(), AwaitResult::Collected);
        assert!(!barrier.was_gc_requested());
    }

    #[test]
    fn test_timeout_and_shutdown() {
        let barrier = CollectionBarrier::new();
        let ticket = barrier.request_gc().unwrap();
        assert_eq!(
            barrier.await_collection(ticket, Duration::from_millis(1)),
            AwaitResult::TimedOut
        );
        barrier.notify_shutdown_requested();
        assert!(barrier.is_shutdown_requested());
        assert_eq!(
            barrier.await_collection(ticket, Duration::from_millis(1)),
            AwaitResult::Shutdown
        );
        assert!(barrier.request_gc().is_none());
    }

    #[test]
    fn test_stale_ticket_returns_immediately() {
        let barrier = CollectionBarrier::new();
        let ticket = barrier.request_gc().unwrap();
        barrier.resume_threads_awaiting_collection();
        assert_eq!(
            barrier.await_collection(ticket, Duration::from_secs(10)),
            AwaitResult::Collected
        );
    }
}
