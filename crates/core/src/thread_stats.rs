//! Cross-thread fiber statistics registry
//!
//! Provides visibility into fiber activity across all threads that run
//! fibers. Each `FiberThread` registers itself and updates its own slot with
//! relaxed atomic stores.
//!
//! # Design
//!
//! Fiber threads keep their idle cache and counters thread-local, but
//! diagnostics runs on a separate signal handler thread. A global registry
//! gives each thread an exclusive slot:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              FiberStatsRegistry (global)                │
//! ├─────────────────────────────────────────────────────────┤
//! │ slots: [FiberStatsSlot; MAX_THREADS]                    │
//! │                                                         │
//! │  ┌────────────────────┐  ┌────────────────────┐         │
//! │  │ Slot 0 (Thread A)  │  │ Slot 1 (Thread B)  │  ...    │
//! │  │ thread_id: u64     │  │ thread_id: u64     │         │
//! │  │ created: u64       │  │ created: u64       │         │
//! │  │ idle_cached: u64   │  │ idle_cached: u64   │         │
//! │  └────────────────────┘  └────────────────────┘         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Fiber threads come and go, so a slot is released when
//! its `FiberThread` is dropped.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of fiber threads we can track
const MAX_THREADS: usize = 256;

/// Fiber statistics for a single thread
#[derive(Debug)]
pub struct FiberStatsSlot {
    /// Thread ID (0 = slot is free)
    pub thread_id: AtomicU64,
    /// Heap fibers created from a fresh stack
    pub fibers_created: AtomicU64,
    /// Heap fibers served from the idle cache
    pub fibers_reused: AtomicU64,
    /// Heap fibers terminated
    pub fibers_terminated: AtomicU64,
    /// Fibers currently parked in the idle cache
    pub idle_cached: AtomicU64,
}

impl FiberStatsSlot {
    const fn new() -> Self {
        Self {
            thread_id: AtomicU64::new(0),
            fibers_created: AtomicU64::new(0),
            fibers_reused: AtomicU64::new(0),
            fibers_terminated: AtomicU64::new(0),
            idle_cached: AtomicU64::new(0),
        }
    }

    fn clear(&self) {
        self.fibers_created.store(0, Ordering::Relaxed);
        self.fibers_reused.store(0, Ordering::Relaxed);
        self.fibers_terminated.store(0, Ordering::Relaxed);
        self.idle_cached.store(0, Ordering::Relaxed);
    }
}

/// Global registry for cross-thread fiber statistics
pub struct FiberStatsRegistry {
    slots: Box<[FiberStatsSlot]>,
    /// Count of threads that couldn't get a slot
    pub overflow_count: AtomicU64,
}

impl FiberStatsRegistry {
    /// Create a new registry with the given capacity
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<FiberStatsSlot> = (0..capacity).map(|_| FiberStatsSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            overflow_count: AtomicU64::new(0),
        }
    }

    /// Register the current thread and get its slot index
    ///
    /// Returns None if the registry is full.
    pub fn register(&self) -> Option<usize> {
        let thread_id = current_thread_id();

        for (idx, slot) in self.slots.iter().enumerate() {
            // Claim the slot (CAS from 0 to thread_id)
            if slot
                .thread_id
                .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.clear();
                return Some(idx);
            }
        }

        self.overflow_count.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Release a slot so another thread can claim it
    pub fn unregister(&self, slot_idx: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.clear();
            slot.thread_id.store(0, Ordering::Release);
        }
    }

    #[inline]
    pub fn record_created(&self, slot_idx: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.fibers_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_reused(&self, slot_idx: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.fibers_reused.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_terminated(&self, slot_idx: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.fibers_terminated.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn set_idle_cached(&self, slot_idx: usize, cached: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.idle_cached.store(cached as u64, Ordering::Relaxed);
        }
    }

    /// Stats of one slot, if it is claimed
    pub fn slot_stats(&self, slot_idx: usize) -> Option<ThreadFiberStats> {
        let slot = self.slots.get(slot_idx)?;
        let thread_id = slot.thread_id.load(Ordering::Acquire);
        (thread_id > 0).then(|| ThreadFiberStats {
            thread_id,
            fibers_created: slot.fibers_created.load(Ordering::Relaxed),
            fibers_reused: slot.fibers_reused.load(Ordering::Relaxed),
            fibers_terminated: slot.fibers_terminated.load(Ordering::Relaxed),
            idle_cached: slot.idle_cached.load(Ordering::Relaxed),
        })
    }

    /// Stats of every registered thread
    pub fn per_thread(&self) -> Vec<ThreadFiberStats> {
        (0..self.slots.len())
            .filter_map(|idx| self.slot_stats(idx))
            .collect()
    }

    /// Aggregated statistics across all threads
    pub fn aggregate(&self) -> AggregateFiberStats {
        let mut total = AggregateFiberStats {
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
            ..AggregateFiberStats::default()
        };
        for stats in self.per_thread() {
            total.active_threads += 1;
            total.fibers_created += stats.fibers_created;
            total.fibers_reused += stats.fibers_reused;
            total.fibers_terminated += stats.fibers_terminated;
            total.idle_cached += stats.idle_cached;
        }
        total
    }

    /// Get registry capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Snapshot of one thread's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadFiberStats {
    pub thread_id: u64,
    pub fibers_created: u64,
    pub fibers_reused: u64,
    pub fibers_terminated: u64,
    pub idle_cached: u64,
}

/// Aggregated fiber statistics across all threads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateFiberStats {
    pub active_threads: usize,
    pub fibers_created: u64,
    pub fibers_reused: u64,
    pub fibers_terminated: u64,
    pub idle_cached: u64,
    pub overflow_count: u64,
}

/// Global counter for generating unique thread IDs
/// Starts at 1 because 0 means "empty slot"
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THIS_THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Get a unique ID for the current thread
///
/// IDs start at 1 and increment monotonically; they are never reused.
pub fn current_thread_id() -> u64 {
    THIS_THREAD_ID.with(|&id| id)
}

static STATS_REGISTRY: OnceLock<FiberStatsRegistry> = OnceLock::new();

/// Get the global fiber stats registry
pub fn stats_registry() -> &'static FiberStatsRegistry {
    STATS_REGISTRY.get_or_init(|| FiberStatsRegistry::new(MAX_THREADS))
}
