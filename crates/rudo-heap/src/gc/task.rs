//! Background task plumbing.
//!
//! The collector never spawns threads of its own accord: background marking
//! and sweeping jobs are posted to a [`TaskRunner`] supplied by the
//! embedder, or to the [`DefaultTaskRunner`] thread pool. Jobs that must be
//! cancellable are wrapped by a [`CancelableTaskManager`], and the collector
//! waits for in-flight jobs through a [`Semaphore`].

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Platform thread pool used for background collector work.
pub trait TaskRunner: Send + Sync {
    /// Runs `task` on some worker thread as soon as possible.
    fn post_task(&self, task: Task);

    /// Runs `task` on some worker thread after `delay`.
    fn post_delayed_task(&self, task: Task, delay: Duration);

    /// Number of threads tasks may run on in parallel.
    fn number_of_worker_threads(&self) -> usize;
}

/// Counting semaphore.
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with `count` permits.
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            count: parking_lot::const_mutex(count),
            cv: Condvar::new(),
        }
    }

    /// Adds a permit and wakes one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_one();
    }

    /// Takes a permit, blocking until one is available.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
    }

    /// Takes a permit if one becomes available within `timeout`.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cv.wait_until(&mut count, deadline).timed_out() {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &*self.count.lock())
            .finish()
    }
}

/// Identifier of a task registered with a [`CancelableTaskManager`].
pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Waiting,
    Running,
}

/// Outcome of [`CancelableTaskManager::try_abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAbortResult {
    /// The task already finished or was never registered.
    TaskRemoved,
    /// The task is executing and cannot be aborted.
    TaskRunning,
    /// The task had not started and never will.
    TaskAborted,
}

#[derive(Default)]
struct ManagerState {
    next_id: TaskId,
    tasks: HashMap<TaskId, TaskState>,
    canceled: bool,
}

/// Tracks tasks that may be aborted before they start.
#[derive(Default)]
pub struct CancelableTaskManager {
    state: Mutex<ManagerState>,
    cv: Condvar,
}

impl CancelableTaskManager {
    /// Creates a manager with no tasks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `job` and returns its id and a task that runs it unless it
    /// was aborted first. After [`cancel_and_wait_for_pending_tasks`] every
    /// new task is born aborted.
    ///
    /// [`cancel_and_wait_for_pending_tasks`]: Self::cancel_and_wait_for_pending_tasks
    pub fn register(self: &Arc<Self>, job: impl FnOnce() + Send + 'static) -> (TaskId, Task) {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            if !state.canceled {
                state.tasks.insert(id, TaskState::Waiting);
            }
            id
        };
        let manager = Arc::clone(self);
        let task: Task = Box::new(move || {
            if !manager.begin(id) {
                return;
            }
            job();
            manager.finish(id);
        });
        (id, task)
    }

    fn begin(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        match state.tasks.get_mut(&id) {
            Some(task) if *task == TaskState::Waiting => {
                *task = TaskState::Running;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, id: TaskId) {
        let mut state = self.state.lock();
        state.tasks.remove(&id);
        self.cv.notify_all();
    }

    /// Aborts a task that has not started yet.
    pub fn try_abort(&self, id: TaskId) -> TryAbortResult {
        let mut state = self.state.lock();
        match state.tasks.get(&id) {
            None => TryAbortResult::TaskRemoved,
            Some(TaskState::Running) => TryAbortResult::TaskRunning,
            Some(TaskState::Waiting) => {
                state.tasks.remove(&id);
                TryAbortResult::TaskAborted
            }
        }
    }

    /// Aborts every task that has not started yet. Returns
    /// [`TryAbortResult::TaskRunning`] if some task is still executing.
    pub fn try_abort_all(&self) -> TryAbortResult {
        let mut state = self.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| *task == TaskState::Running);
        if !state.tasks.is_empty() {
            TryAbortResult::TaskRunning
        } else if before > 0 {
            TryAbortResult::TaskAborted
        } else {
            TryAbortResult::TaskRemoved
        }
    }

    /// Aborts pending tasks, refuses new ones and blocks until running tasks
    /// have finished. Returns the number of tasks aborted.
    pub fn cancel_and_wait_for_pending_tasks(&self) -> usize {
        let mut state = self.state.lock();
        state.canceled = true;
        let before = state.tasks.len();
        state.tasks.retain(|_, task| *task == TaskState::Running);
        let aborted = before - state.tasks.len();
        while !state.tasks.is_empty() {
            self.cv.wait(&mut state);
        }
        aborted
    }

    /// Returns `true` once cancellation started.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    /// Number of registered tasks that have not finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

impl fmt::Debug for CancelableTaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CancelableTaskManager")
            .field("pending", &state.tasks.len())
            .field("canceled", &state.canceled)
            .finish()
    }
}

struct Delayed {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Fixed-size thread pool implementing [`TaskRunner`].
pub struct DefaultTaskRunner {
    tasks: Mutex<Option<Sender<Task>>>,
    delayed: Mutex<Option<Sender<(Instant, Task)>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Vec<ThreadId>,
    workers: usize,
}

impl DefaultTaskRunner {
    /// Starts `workers` worker threads (at least one) plus a timer thread.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed thread spawn.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (task_tx, task_rx) = channel::unbounded::<Task>();
        let (delayed_tx, delayed_rx) = channel::unbounded::<(Instant, Task)>();
        let mut threads = Vec::with_capacity(workers + 1);

        for index in 0..workers {
            let rx = task_rx.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("rudo-heap-worker-{index}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })?,
            );
        }

        let forward = task_tx.clone();
        threads.push(
            std::thread::Builder::new()
                .name("rudo-heap-timer".to_owned())
                .spawn(move || run_timer(&delayed_rx, &forward))?,
        );

        let thread_ids = threads.iter().map(|t| t.thread().id()).collect();
        Ok(Self {
            tasks: Mutex::new(Some(task_tx)),
            delayed: Mutex::new(Some(delayed_tx)),
            threads: Mutex::new(threads),
            thread_ids,
            workers,
        })
    }

    /// Stops accepting tasks, lets queued ones run and joins the threads.
    pub fn shutdown(&self) {
        self.delayed.lock().take();
        self.tasks.lock().take();
        let current = std::thread::current().id();
        if self.thread_ids.contains(&current) {
            // Joining would wait for ourselves; the threads exit once their
            // channels are drained.
            return;
        }
        for thread in std::mem::take(&mut *self.threads.lock()) {
            let _ = thread.join();
        }
    }
}

fn run_timer(delayed: &Receiver<(Instant, Task)>, forward: &Sender<Task>) {
    let mut queue: BinaryHeap<Reverse<Delayed>> = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        let now = Instant::now();
        while queue.peek().is_some_and(|Reverse(d)| d.due <= now) {
            if let Some(Reverse(due)) = queue.pop() {
                if forward.send(due.task).is_err() {
                    return;
                }
            }
        }
        let received = match queue.peek() {
            Some(Reverse(next)) => delayed.recv_timeout(next.due.saturating_duration_since(now)),
            None => delayed.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((due, task)) => {
                seq += 1;
                queue.push(Reverse(Delayed { due, seq, task }));
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Pending delayed tasks are dropped on shutdown.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

impl TaskRunner for DefaultTaskRunner {
    fn post_task(&self, task: Task) {
        if let Some(tx) = self.tasks.lock().as_ref() {
            let _ = tx.send(task);
        }
    }

    fn post_delayed_task(&self, task: Task, delay: Duration) {
        if let Some(tx) = self.delayed.lock().as_ref() {
            let _ = tx.send((Instant::now() + delay, task));
        }
    }

    fn number_of_worker_threads(&self) -> usize {
        self.workers
    }
}

impl Drop for DefaultTaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DefaultTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTaskRunner")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runner_executes_tasks() {
        let runner = DefaultTaskRunner::new(2).unwrap();
        let done = Arc::new(Semaphore::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let done = Arc::clone(&done);
            let counter = Arc::clone(&counter);
            runner.post_task(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                done.signal();
            }));
        }
        for _ in 0..16 {
            done.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_delayed_task_runs_after_delay() {
        let runner = DefaultTaskRunner::new(1).unwrap();
        let done = Arc::new(Semaphore::new(0));
        let start = Instant::now();
        let signal = Arc::clone(&done);
        runner.post_delayed_task(Box::new(move || signal.signal()), Duration::from_millis(20));
        assert!(done.wait_for(Duration::from_secs(5)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_semaphore_timeout() {
        let semaphore = Semaphore::new(0);
        assert!(!semaphore.wait_for(Duration::from_millis(5)));
        semaphore.signal();
        assert!(semaphore.wait_for(Duration::from_millis(5)));
    }

    #[test]
    fn test_abort_before_start() {
        let manager = Arc::new(CancelableTaskManager::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let (id, task) = manager.register(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(manager.try_abort(id), TryAbortResult::TaskAborted);
        task();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(manager.try_abort(id), TryAbortResult::TaskRemoved);
    }

    #[test]
    fn test_cancel_waits_for_running_tasks() {
        let manager = Arc::new(CancelableTaskManager::new());
        let started = Arc::new(Semaphore::new(0));
        let release = Arc::new(Semaphore::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let (s, r, f) = (Arc::clone(&started), Arc::clone(&release), Arc::clone(&finished));
        let (running_id, running) = manager.register(move || {
            s.signal();
            r.wait();
            f.fetch_add(1, Ordering::SeqCst);
        });
        let (_, pending) = manager.register(|| panic!("aborted task ran"));

        let worker = std::thread::spawn(running);
        started.wait();
        assert_eq!(manager.try_abort(running_id), TryAbortResult::TaskRunning);

        let releaser = {
            let release = Arc::clone(&release);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                release.signal();
            })
        };
        assert_eq!(manager.cancel_and_wait_for_pending_tasks(), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        pending();
        worker.join().unwrap();
        releaser.join().unwrap();

        let (_, late) = manager.register(|| panic!("task registered after cancel ran"));
        late();
        assert!(manager.is_canceled());
    }
}
