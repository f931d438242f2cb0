//! Segmented marking worklist.
//!
//! A [`Worklist`] is a global pool of fixed-capacity segments shared by all
//! marking contexts. Each context works through a [`Local`] view that owns
//! one segment to push into and one to pop from; only full segments are
//! published to the pool and only whole segments are stolen from it, so the
//! shared structure is touched once per `segment_capacity` operations.
//!
//! The pool is bounded. When a full segment cannot be published the push
//! reports the segment's entries back to the caller as overflowed; the
//! marker leaves those objects grey and finds them again with a
//! conservative rescan.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

/// A full or partially filled segment of entries.
struct Segment<T> {
    entries: Vec<T>,
}

impl<T> Segment<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }
}

/// Counters describing worklist traffic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorklistStats {
    /// Entries accepted by `push`.
    pub pushed: usize,
    /// Entries returned by `pop`.
    pub popped: usize,
    /// Entries handed back to the caller because the pool was full. These
    /// count as pushed but will never be popped.
    pub overflowed: usize,
    /// Entries removed by [`Worklist::update`].
    pub filtered: usize,
}

/// Global segment pool.
pub struct Worklist<T> {
    pool: SegQueue<Segment<T>>,
    segments: AtomicUsize,
    entries: AtomicUsize,
    segment_capacity: usize,
    max_segments: usize,
    pushed: AtomicUsize,
    popped: AtomicUsize,
    overflowed: AtomicUsize,
    filtered: AtomicUsize,
}

impl<T: Send> Worklist<T> {
    /// Creates an empty pool of at most `max_segments` segments holding
    /// `segment_capacity` entries each.
    #[must_use]
    pub fn new(segment_capacity: usize, max_segments: usize) -> Self {
        Self {
            pool: SegQueue::new(),
            segments: AtomicUsize::new(0),
            entries: AtomicUsize::new(0),
            segment_capacity: segment_capacity.max(1),
            max_segments: max_segments.max(1),
            pushed: AtomicUsize::new(0),
            popped: AtomicUsize::new(0),
            overflowed: AtomicUsize::new(0),
            filtered: AtomicUsize::new(0),
        }
    }

    /// Creates a local view bound to this pool.
    #[must_use]
    pub fn local(self: &Arc<Self>) -> Local<T> {
        Local {
            global: Arc::clone(self),
            push_segment: Segment::with_capacity(self.segment_capacity),
            pop_segment: Segment::with_capacity(self.segment_capacity),
            pushed: 0,
            popped: 0,
        }
    }

    /// Entries per segment.
    #[must_use]
    pub const fn segment_capacity(&self) -> usize {
        self.segment_capacity
    }

    /// Returns `true` if the global pool holds no segment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.load(Ordering::Acquire) == 0
    }

    /// Number of segments in the global pool.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.load(Ordering::Acquire)
    }

    /// Number of entries in the global pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    /// Returns traffic counters. Local views report their counts when they
    /// publish or are dropped.
    #[must_use]
    pub fn stats(&self) -> WorklistStats {
        WorklistStats {
            pushed: self.pushed.load(Ordering::Acquire),
            popped: self.popped.load(Ordering::Acquire),
            overflowed: self.overflowed.load(Ordering::Acquire),
            filtered: self.filtered.load(Ordering::Acquire),
        }
    }

    /// Resets the traffic counters.
    pub fn reset_stats(&self) {
        self.pushed.store(0, Ordering::Release);
        self.popped.store(0, Ordering::Release);
        self.overflowed.store(0, Ordering::Release);
        self.filtered.store(0, Ordering::Release);
    }

    fn publish(&self, segment: Segment<T>, force: bool) -> Result<(), Segment<T>> {
        if segment.entries.is_empty() {
            return Ok(());
        }
        if !force && self.segments.load(Ordering::Relaxed) >= self.max_segments {
            return Err(segment);
        }
        self.entries
            .fetch_add(segment.entries.len(), Ordering::AcqRel);
        self.segments.fetch_add(1, Ordering::AcqRel);
        self.pool.push(segment);
        Ok(())
    }

    fn steal(&self) -> Option<Segment<T>> {
        let segment = self.pool.pop()?;
        self.segments.fetch_sub(1, Ordering::AcqRel);
        self.entries
            .fetch_sub(segment.entries.len(), Ordering::AcqRel);
        Some(segment)
    }

    /// Rewrites every entry of the global pool. Entries mapped to `None` are
    /// dropped.
    ///
    /// Callers must make sure no local view is concurrently publishing or
    /// stealing (this runs inside a pause).
    pub fn update(&self, mut f: impl FnMut(T) -> Option<T>) {
        let mut drained = Vec::new();
        while let Some(segment) = self.steal() {
            drained.push(segment);
        }
        let mut filtered = 0;
        for mut segment in drained {
            let before = segment.entries.len();
            segment.entries = segment.entries.into_iter().filter_map(&mut f).collect();
            filtered += before - segment.entries.len();
            let _ = self.publish(segment, true);
        }
        self.filtered.fetch_add(filtered, Ordering::AcqRel);
    }

    /// Drops every entry of the global pool.
    pub fn clear(&self) {
        while self.steal().is_some() {}
    }
}

impl<T> fmt::Debug for Worklist<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worklist")
            .field("segments", &self.segments.load(Ordering::Relaxed))
            .field("entries", &self.entries.load(Ordering::Relaxed))
            .field("segment_capacity", &self.segment_capacity)
            .field("max_segments", &self.max_segments)
            .finish_non_exhaustive()
    }
}

/// A marking context's view of a [`Worklist`].
///
/// Push and pop are LIFO within the view. Entries become visible to other
/// views only once their segment is published.
pub struct Local<T: Send> {
    global: Arc<Worklist<T>>,
    push_segment: Segment<T>,
    pop_segment: Segment<T>,
    pushed: usize,
    popped: usize,
}

impl<T: Send> Local<T> {
    /// Pushes an entry.
    ///
    /// # Errors
    ///
    /// When the push segment is full and the global pool is at capacity, the
    /// full segment's entries are returned and the push segment restarts
    /// with `item` alone. The returned entries are no longer on any
    /// worklist.
    pub fn push(&mut self, item: T) -> Result<(), Vec<T>> {
        let mut result = Ok(());
        if self.push_segment.entries.len() >= self.global.segment_capacity {
            let full = std::mem::replace(
                &mut self.push_segment,
                Segment::with_capacity(self.global.segment_capacity),
            );
            if let Err(rejected) = self.global.publish(full, false) {
                self.global
                    .overflowed
                    .fetch_add(rejected.entries.len(), Ordering::AcqRel);
                result = Err(rejected.entries);
            }
        }
        self.push_segment.entries.push(item);
        self.pushed += 1;
        result
    }

    /// Pops an entry, refilling from the push segment and then from the
    /// global pool.
    pub fn pop(&mut self) -> Option<T> {
        if self.pop_segment.entries.is_empty() {
            if self.push_segment.entries.is_empty() {
                self.pop_segment = self.global.steal()?;
            } else {
                std::mem::swap(&mut self.pop_segment, &mut self.push_segment);
            }
        }
        let item = self.pop_segment.entries.pop()?;
        self.popped += 1;
        Some(item)
    }

    /// Returns `true` if neither local segment holds entries.
    #[must_use]
    pub fn is_local_empty(&self) -> bool {
        self.push_segment.entries.is_empty() && self.pop_segment.entries.is_empty()
    }

    /// Returns `true` if the view and the global pool are both empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_local_empty() && self.global.is_empty()
    }

    /// Number of entries held locally.
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.push_segment.entries.len() + self.pop_segment.entries.len()
    }

    /// Publishes both local segments to the global pool regardless of its
    /// bound, and reports traffic counters.
    pub fn publish(&mut self) {
        let capacity = self.global.segment_capacity;
        for segment in [&mut self.push_segment, &mut self.pop_segment] {
            let taken = std::mem::replace(segment, Segment::with_capacity(capacity));
            let _ = self.global.publish(taken, true);
        }
        self.flush_stats();
    }

    /// Drops every locally held entry.
    pub fn clear(&mut self) {
        self.push_segment.entries.clear();
        self.pop_segment.entries.clear();
    }

    /// The global pool this view is bound to.
    #[must_use]
    pub const fn global(&self) -> &Arc<Worklist<T>> {
        &self.global
    }

    fn flush_stats(&mut self) {
        self.global.pushed.fetch_add(self.pushed, Ordering::AcqRel);
        self.global.popped.fetch_add(self.popped, Ordering::AcqRel);
        self.pushed = 0;
        self.popped = 0;
    }
}

impl<T: Send> Drop for Local<T> {
    fn drop(&mut self) {
        self.publish();
    }
}

impl<T: Send> fmt::Debug for Local<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Local")
            .field("local_len", &self.local_len())
            .field("global", &self.global)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_lifo() {
        let worklist = Arc::new(Worklist::new(4, 16));
        let mut local = worklist.local();
        for i in 0..3 {
            local.push(i).unwrap();
        }
        assert_eq!(local.pop(), Some(2));
        assert_eq!(local.pop(), Some(1));
        assert_eq!(local.pop(), Some(0));
        assert_eq!(local.pop(), None);
        assert!(local.is_empty());
    }

    #[test]
    fn test_full_segments_are_shared() {
        let worklist = Arc::new(Worklist::new(4, 16));
        let mut producer = worklist.local();
        let mut consumer = worklist.local();
        for i in 0..9 {
            producer.push(i).unwrap();
        }
        // Two full segments were published; the ninth entry stays local.
        assert_eq!(worklist.segment_count(), 2);
        assert_eq!(producer.local_len(), 1);

        let mut stolen = Vec::new();
        while let Some(item) = consumer.pop() {
            stolen.push(item);
        }
        stolen.sort_unstable();
        assert_eq!(stolen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_overflow_returns_entries() {
        let worklist = Arc::new(Worklist::new(2, 1));
        let mut local = worklist.local();
        local.push(1).unwrap();
        local.push(2).unwrap();
        local.push(3).unwrap();
        local.push(4).unwrap();
        let rejected = local.push(5).unwrap_err();
        assert_eq!(rejected, vec![3, 4]);
        assert_eq!(worklist.stats().overflowed, 2);
    }

    #[test]
    fn test_update_filters_global_entries() {
        let worklist = Arc::new(Worklist::new(2, 16));
        {
            let mut local = worklist.local();
            for i in 0..10 {
                local.push(i).unwrap();
            }
        }
        worklist.update(|x| (x % 2 == 0).then_some(x * 10));
        assert_eq!(worklist.len(), 5);
        let mut local = worklist.local();
        let mut all = Vec::new();
        while let Some(x) = local.pop() {
            all.push(x);
        }
        all.sort_unstable();
        assert_eq!(all, vec![0, 20, 40, 60, 80]);
        assert_eq!(worklist.stats().filtered, 5);
    }

    #[test]
    fn test_publish_on_drop_keeps_counts() {
        let worklist = Arc::new(Worklist::new(8, 16));
        {
            let mut local = worklist.local();
            for i in 0..5 {
                local.push(i).unwrap();
            }
            local.pop();
        }
        let stats = worklist.stats();
        assert_eq!(stats.pushed, 5);
        assert_eq!(stats.popped, 1);
        assert_eq!(worklist.len(), 4);
    }
}
