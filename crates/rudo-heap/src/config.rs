//! Heap configuration.
//!
//! [`HeapConfig`] is a plain value passed to [`Heap::new`](crate::Heap::new).
//! Every knob has a documented default; [`HeapConfig::from_env`] overlays
//! `RUDO_HEAP_*` environment variables on top of the defaults.

use std::str::FromStr;

use crate::address::{align_up, WORD_SIZE};
pub use crate::heap::free_list::FreeListStrategy;

/// Configuration for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size of a regular page in bytes. Rounded to a power of two no smaller
    /// than the OS page size.
    pub page_size: usize,
    /// Upper bound on committed heap bytes. Allocation beyond this fails
    /// with out-of-memory after a full collection.
    pub max_heap_size: usize,
    /// Bytes allocated in the young generation before a minor collection.
    pub new_space_capacity: usize,
    /// Number of minor collections a young page survives before promotion.
    pub promotion_age: u8,
    /// Old-generation bytes that trigger incremental marking.
    pub marking_start_limit: usize,
    /// Free-list bucketing and search policy.
    pub free_list_strategy: FreeListStrategy,
    /// Size of linear allocation buffers handed to mutator threads.
    pub lab_size: usize,
    /// Background marking tasks scheduled per cycle (capped by the task
    /// runner's worker count).
    pub concurrent_marking_tasks: usize,
    /// Objects processed by one main-thread marking step.
    pub marking_step_size: usize,
    /// Bytes allocated between two allocation-driven marking steps.
    pub allocation_step_interval: usize,
    /// Entries per worklist segment.
    pub segment_capacity: usize,
    /// Segments the global worklist pool holds before pushes overflow.
    pub max_global_segments: usize,
    /// Empty pages kept committed for reuse instead of being unmapped.
    pub page_pool_size: usize,
    /// Old pages whose live bytes fall below this percentage of the page
    /// become evacuation candidates. Zero disables candidate selection.
    pub evacuation_threshold_percent: u8,
    /// Sweep pages on the task runner's worker threads.
    pub parallel_sweep: bool,
    /// Run the heap verifier in every atomic pause.
    pub verify_heap: bool,
    /// Marking and sweeping stay on the main thread and use non-atomic
    /// bitmap updates.
    pub single_threaded: bool,
}

impl HeapConfig {
    /// Default regular page size.
    pub const DEFAULT_PAGE_SIZE: usize = 256 * 1024;
    /// Default committed-bytes limit.
    pub const DEFAULT_MAX_HEAP_SIZE: usize = 512 * 1024 * 1024;
    /// Default young generation budget.
    pub const DEFAULT_NEW_SPACE_CAPACITY: usize = 4 * 1024 * 1024;
    /// Default promotion age.
    pub const DEFAULT_PROMOTION_AGE: u8 = 2;
    /// Default old-generation marking trigger.
    pub const DEFAULT_MARKING_START_LIMIT: usize = 16 * 1024 * 1024;
    /// Default LAB size.
    pub const DEFAULT_LAB_SIZE: usize = 32 * 1024;
    /// Default number of concurrent marking tasks.
    pub const DEFAULT_CONCURRENT_MARKING_TASKS: usize = 2;
    /// Default marking step budget in objects.
    pub const DEFAULT_MARKING_STEP_SIZE: usize = 256;
    /// Default allocation interval between marking steps.
    pub const DEFAULT_ALLOCATION_STEP_INTERVAL: usize = 64 * 1024;
    /// Default worklist segment capacity.
    pub const DEFAULT_SEGMENT_CAPACITY: usize = 64;
    /// Default global segment bound.
    pub const DEFAULT_MAX_GLOBAL_SEGMENTS: usize = 16 * 1024;
    /// Default page pool size.
    pub const DEFAULT_PAGE_POOL_SIZE: usize = 8;
    /// Default evacuation candidate threshold.
    pub const DEFAULT_EVACUATION_THRESHOLD_PERCENT: u8 = 10;

    /// Creates a configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            max_heap_size: Self::DEFAULT_MAX_HEAP_SIZE,
            new_space_capacity: Self::DEFAULT_NEW_SPACE_CAPACITY,
            promotion_age: Self::DEFAULT_PROMOTION_AGE,
            marking_start_limit: Self::DEFAULT_MARKING_START_LIMIT,
            free_list_strategy: FreeListStrategy::ManyCached,
            lab_size: Self::DEFAULT_LAB_SIZE,
            concurrent_marking_tasks: Self::DEFAULT_CONCURRENT_MARKING_TASKS,
            marking_step_size: Self::DEFAULT_MARKING_STEP_SIZE,
            allocation_step_interval: Self::DEFAULT_ALLOCATION_STEP_INTERVAL,
            segment_capacity: Self::DEFAULT_SEGMENT_CAPACITY,
            max_global_segments: Self::DEFAULT_MAX_GLOBAL_SEGMENTS,
            page_pool_size: Self::DEFAULT_PAGE_POOL_SIZE,
            evacuation_threshold_percent: Self::DEFAULT_EVACUATION_THRESHOLD_PERCENT,
            parallel_sweep: true,
            verify_heap: false,
            single_threaded: false,
        }
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the committed-bytes limit.
    #[must_use]
    pub const fn with_max_heap_size(mut self, max_heap_size: usize) -> Self {
        self.max_heap_size = max_heap_size;
        self
    }

    /// Sets the young generation budget.
    #[must_use]
    pub const fn with_new_space_capacity(mut self, capacity: usize) -> Self {
        self.new_space_capacity = capacity;
        self
    }

    /// Sets the promotion age.
    #[must_use]
    pub const fn with_promotion_age(mut self, age: u8) -> Self {
        self.promotion_age = age;
        self
    }

    /// Sets the incremental marking trigger.
    #[must_use]
    pub const fn with_marking_start_limit(mut self, limit: usize) -> Self {
        self.marking_start_limit = limit;
        self
    }

    /// Sets the free-list strategy.
    #[must_use]
    pub const fn with_free_list_strategy(mut self, strategy: FreeListStrategy) -> Self {
        self.free_list_strategy = strategy;
        self
    }

    /// Sets the LAB size.
    #[must_use]
    pub const fn with_lab_size(mut self, lab_size: usize) -> Self {
        self.lab_size = lab_size;
        self
    }

    /// Sets the number of concurrent marking tasks.
    #[must_use]
    pub const fn with_concurrent_marking_tasks(mut self, tasks: usize) -> Self {
        self.concurrent_marking_tasks = tasks;
        self
    }

    /// Sets the marking step budget.
    #[must_use]
    pub const fn with_marking_step_size(mut self, objects: usize) -> Self {
        self.marking_step_size = objects;
        self
    }

    /// Sets the allocation interval between marking steps.
    #[must_use]
    pub const fn with_allocation_step_interval(mut self, bytes: usize) -> Self {
        self.allocation_step_interval = bytes;
        self
    }

    /// Sets the worklist segment capacity.
    #[must_use]
    pub const fn with_segment_capacity(mut self, capacity: usize) -> Self {
        self.segment_capacity = capacity;
        self
    }

    /// Sets the global segment bound.
    #[must_use]
    pub const fn with_max_global_segments(mut self, segments: usize) -> Self {
        self.max_global_segments = segments;
        self
    }

    /// Sets the page pool size.
    #[must_use]
    pub const fn with_page_pool_size(mut self, pages: usize) -> Self {
        self.page_pool_size = pages;
        self
    }

    /// Sets the evacuation candidate threshold.
    #[must_use]
    pub const fn with_evacuation_threshold_percent(mut self, percent: u8) -> Self {
        self.evacuation_threshold_percent = percent;
        self
    }

    /// Enables or disables parallel sweeping.
    #[must_use]
    pub const fn with_parallel_sweep(mut self, enabled: bool) -> Self {
        self.parallel_sweep = enabled;
        self
    }

    /// Enables or disables pause-time heap verification.
    #[must_use]
    pub const fn with_verify_heap(mut self, enabled: bool) -> Self {
        self.verify_heap = enabled;
        self
    }

    /// Enables or disables single-threaded collection.
    #[must_use]
    pub const fn with_single_threaded(mut self, enabled: bool) -> Self {
        self.single_threaded = enabled;
        self
    }

    /// Builds a configuration from defaults overlaid with `RUDO_HEAP_*`
    /// environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        let read = |key: &str| lookup(&format!("RUDO_HEAP_{key}"));

        overlay(&read, "PAGE_SIZE", &mut config.page_size);
        overlay(&read, "MAX_HEAP_SIZE", &mut config.max_heap_size);
        overlay(&read, "NEW_SPACE_CAPACITY", &mut config.new_space_capacity);
        overlay(&read, "PROMOTION_AGE", &mut config.promotion_age);
        overlay(&read, "MARKING_START_LIMIT", &mut config.marking_start_limit);
        overlay(&read, "FREE_LIST_STRATEGY", &mut config.free_list_strategy);
        overlay(&read, "LAB_SIZE", &mut config.lab_size);
        overlay(
            &read,
            "CONCURRENT_MARKING_TASKS",
            &mut config.concurrent_marking_tasks,
        );
        overlay(&read, "MARKING_STEP_SIZE", &mut config.marking_step_size);
        overlay(
            &read,
            "ALLOCATION_STEP_INTERVAL",
            &mut config.allocation_step_interval,
        );
        overlay(&read, "SEGMENT_CAPACITY", &mut config.segment_capacity);
        overlay(&read, "MAX_GLOBAL_SEGMENTS", &mut config.max_global_segments);
        overlay(&read, "PAGE_POOL_SIZE", &mut config.page_pool_size);
        overlay(
            &read,
            "EVACUATION_THRESHOLD_PERCENT",
            &mut config.evacuation_threshold_percent,
        );
        overlay(&read, "PARALLEL_SWEEP", &mut config.parallel_sweep);
        overlay(&read, "VERIFY_HEAP", &mut config.verify_heap);
        overlay(&read, "SINGLE_THREADED", &mut config.single_threaded);
        config
    }

    /// Clamps values into the ranges the heap supports.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        let os_page = sys_alloc::page_size();
        self.page_size = self.page_size.max(os_page).next_power_of_two();
        self.lab_size = align_up(self.lab_size.max(MIN_LAB_SIZE), WORD_SIZE)
            .min(self.max_regular_object_size());
        self.max_heap_size = self.max_heap_size.max(self.page_size);
        self.segment_capacity = self.segment_capacity.max(1);
        self.max_global_segments = self.max_global_segments.max(1);
        self.marking_step_size = self.marking_step_size.max(1);
        self.allocation_step_interval = self.allocation_step_interval.max(WORD_SIZE);
        self.promotion_age = self.promotion_age.max(1);
        self.evacuation_threshold_percent = self.evacuation_threshold_percent.min(100);
        if self.single_threaded {
            self.concurrent_marking_tasks = 0;
            self.parallel_sweep = false;
        }
        self
    }

    /// Largest object allocated on a regular page; bigger objects get a
    /// dedicated large page.
    #[must_use]
    pub const fn max_regular_object_size(&self) -> usize {
        self.page_size / 2
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

const MIN_LAB_SIZE: usize = 4 * WORD_SIZE;

fn overlay<T: FromStr>(read: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = read(key) else {
        return;
    };
    match parse_value::<T>(raw.trim()) {
        Some(value) => *target = value,
        None => crate::tracing::log_invalid_config(key, &raw),
    }
}

/// Parses a value, accepting `k`/`m`/`g` size suffixes for integers.
fn parse_value<T: FromStr>(raw: &str) -> Option<T> {
    if let Ok(value) = raw.parse::<T>() {
        return Some(value);
    }
    let lower = raw.to_ascii_lowercase();
    match lower.as_str() {
        "on" | "yes" | "1" => return "true".parse().ok(),
        "off" | "no" | "0" => return "false".parse().ok(),
        _ => {}
    }
    let (digits, shift) = match lower.chars().last()? {
        'k' => (&lower[..lower.len() - 1], 10),
        'm' => (&lower[..lower.len() - 1], 20),
        'g' => (&lower[..lower.len() - 1], 30),
        _ => return None,
    };
    let scaled = digits.parse::<usize>().ok()?.checked_mul(1 << shift)?;
    scaled.to_string().parse().ok()
}
