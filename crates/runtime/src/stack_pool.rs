//! Stack pool allocator
//!
//! Fiber stacks are fixed-size regions carved out of large reserved slabs.
//! Released stacks go onto a LIFO free list and are handed out again before
//! any new slot is carved, so a steady-state program never reserves more.
//!
//! ```text
//!  slab.low                                                     slab.top
//!  ├──────────────┬──────────────┬──────────────┬──────────────┤
//!  │  slot n-1    │     ...      │    slot 1    │    slot 0    │
//!  │[guard]       │              │[guard]       │[guard]       │
//!  └──────────────┴──────────────┴──────────────┴──────────────┘
//!                                                 ▲ base of slot 1 = top - 1 * stack_size
//! ```
//!
//! Each stack grows down from its base. The lowest `(yellow + red)` pages
//! are protected the first time the slot is carved; shadow pages above them
//! stay accessible and only move the safe limit up.
//!
//! ## Physical memory cap
//!
//! The free list keeps an *uncommit index*. Entries below it have had their
//! physical pages released (the mapping stays, so the address is still
//! valid and reusable). When more than `physical_cache_max` free entries are
//! resident, the oldest resident entry is uncommitted and the index advances.
//!
//! ## Locking
//!
//! One mutex covers slabs and the free list. It is only held around plain
//! bookkeeping and page-level syscalls, never around callbacks.

use fiber_core::vmem::{OsPages, PageProvider, checked_align_up};
use fiber_core::{FiberConfig, FiberError, FiberResult, fatal, guarantee};
use serde::Serialize;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Sizes derived from the configuration and the page size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackGeometry {
    pub page_size: usize,
    /// Usable bytes requested by configuration
    pub usable_size: usize,
    /// Full stack size including shadow/yellow/red zones, page aligned
    pub stack_size: usize,
    pub shadow_pages: usize,
    pub yellow_pages: usize,
    pub red_pages: usize,
}

impl StackGeometry {
    /// A stack size that overflows `usize` saturates; slab reservation then
    /// fails with `AllocationExhausted`.
    pub fn new(config: &FiberConfig, page_size: usize) -> Self {
        Self {
            page_size,
            usable_size: config.stack_size,
            stack_size: config.stack_bytes(page_size).unwrap_or(usize::MAX),
            shadow_pages: config.shadow_pages,
            yellow_pages: config.yellow_pages,
            red_pages: config.red_pages,
        }
    }

    /// Bytes protected at the low end of each fresh stack
    pub fn guard_zone_bytes(&self) -> usize {
        self.yellow_pages
            .saturating_add(self.red_pages)
            .saturating_mul(self.page_size)
    }

    /// Bytes below the safe limit (shadow + yellow + red)
    pub fn reserved_zone_bytes(&self) -> usize {
        self.shadow_pages
            .saturating_add(self.yellow_pages)
            .saturating_add(self.red_pages)
            .saturating_mul(self.page_size)
    }
}

/// Address range of one stack
///
/// `base` is the high end; the stack occupies `[base - size, base)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub base: usize,
    pub size: usize,
    /// Lowest address managed code may touch without entering the guard zones
    pub safe_limit: usize,
}

impl StackRegion {
    pub fn new(base: usize, size: usize, reserved_zone: usize) -> Self {
        Self {
            base,
            size,
            safe_limit: base - size + reserved_zone.min(size),
        }
    }

    /// Lowest address of the region
    pub fn low(&self) -> usize {
        self.base - self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.low() && addr < self.base
    }
}

/// Outcome of guarding a fresh stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GuardState {
    /// Guard pages are protected
    Applied,
    /// Protection failed; overflow is not detected for this stack
    Unprotected,
    /// Guard pages are turned off (or the guard zone is empty)
    Disabled,
}

/// Physical backing of a free stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident,
    Uncommitted,
}

/// One reserved slab of stacks
#[derive(Debug)]
struct StackSlab {
    low: usize,
    /// Bytes actually reserved (rounded to the allocation granularity)
    reserved: usize,
    top: usize,
    capacity: usize,
    carved: usize,
    guards: Vec<GuardState>,
}

impl StackSlab {
    fn is_full(&self) -> bool {
        self.carved == self.capacity
    }

    /// Hand out the next slot; returns its base.
    fn carve(&mut self, stack_size: usize) -> usize {
        let base = self.top - self.carved * stack_size;
        self.carved += 1;
        base
    }

    fn slot_of(&self, base: usize, stack_size: usize) -> Option<usize> {
        if base > self.top || base <= self.low {
            return None;
        }
        let offset = self.top - base;
        if offset % stack_size != 0 {
            return None;
        }
        let slot = offset / stack_size;
        (slot < self.carved).then_some(slot)
    }
}

/// LIFO of idle stack bases with an uncommit index
#[derive(Debug, Default)]
struct FreeStackList {
    entries: Vec<usize>,
    uncommit_index: usize,
}

impl FreeStackList {
    fn pop(&mut self) -> Option<usize> {
        let base = self.entries.pop()?;
        if self.entries.len() < self.uncommit_index {
            self.uncommit_index = self.entries.len();
        }
        Some(base)
    }

    /// Push a base; returns the entry that must now be uncommitted, if any.
    fn push(&mut self, base: usize, physical_cap: usize) -> Option<usize> {
        self.entries.push(base);
        if self.entries.len() - self.uncommit_index > physical_cap {
            let victim = self.entries[self.uncommit_index];
            self.uncommit_index += 1;
            Some(victim)
        } else {
            None
        }
    }

    fn residency(&self, base: usize) -> Option<Residency> {
        let pos = self.entries.iter().position(|&b| b == base)?;
        Some(if pos < self.uncommit_index {
            Residency::Uncommitted
        } else {
            Residency::Resident
        })
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    slabs: Vec<StackSlab>,
    free: FreeStackList,
    in_use: usize,
}

impl PoolInner {
    fn slab_of(&self, base: usize, stack_size: usize) -> Option<(&StackSlab, usize)> {
        self.slabs
            .iter()
            .find_map(|slab| slab.slot_of(base, stack_size).map(|slot| (slab, slot)))
    }
}

/// Pool counters for diagnostics and the at-exit report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StackPoolStats {
    pub stack_size: usize,
    pub slabs: usize,
    pub capacity: usize,
    pub carved: usize,
    pub free: usize,
    pub uncommitted: usize,
    pub in_use: usize,
    pub reserved_bytes: usize,
}

/// Allocator of fixed-size guarded fiber stacks
pub struct StackPool {
    geometry: StackGeometry,
    stacks_per_slab: usize,
    physical_cap: usize,
    guard_pages: bool,
    pages: Box<dyn PageProvider>,
    inner: Mutex<PoolInner>,
}

impl StackPool {
    /// Pool backed by the operating system
    pub fn new(config: &FiberConfig) -> Self {
        Self::with_pages(config, Box::new(OsPages))
    }

    /// Pool backed by an arbitrary page provider
    pub fn with_pages(config: &FiberConfig, pages: Box<dyn PageProvider>) -> Self {
        let geometry = StackGeometry::new(config, pages.page_size());
        Self {
            geometry,
            stacks_per_slab: config.stacks_per_slab,
            physical_cap: config.physical_cache_max,
            guard_pages: config.guard_pages,
            pages,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn geometry(&self) -> &StackGeometry {
        &self.geometry
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(|_| fatal!("stack pool lock poisoned"))
    }

    /// Hand out a stack: most recently released first, then a fresh slot.
    ///
    /// Fails only when a new slab cannot be reserved.
    pub fn acquire(self: &Arc<Self>) -> FiberResult<StackLease> {
        let stack_size = self.geometry.stack_size;
        let mut inner = self.lock();

        if let Some(base) = inner.free.pop() {
            inner.in_use += 1;
            let guard = inner
                .slab_of(base, stack_size)
                .map(|(slab, slot)| slab.guards[slot])
                .unwrap_or_else(|| fatal!("free stack {:#x} is not part of any slab", base));
            trace!("stack {:#x} reused from free list", base);
            return Ok(StackLease::new(self, base, guard, false));
        }

        if inner.slabs.last().is_none_or(StackSlab::is_full) {
            let slab = self.reserve_slab()?;
            inner.slabs.push(slab);
        }

        let guard_state;
        let base;
        {
            let Some(slab) = inner.slabs.last_mut() else {
                fatal!("stack pool has no slab after reservation");
            };
            base = slab.carve(stack_size);
            guard_state = self.apply_guard(base);
            slab.guards.push(guard_state);
        }
        inner.in_use += 1;
        trace!("stack {:#x} carved", base);
        Ok(StackLease::new(self, base, guard_state, true))
    }

    fn reserve_slab(&self) -> FiberResult<StackSlab> {
        let capacity = self.stacks_per_slab;
        let sizes = capacity
            .checked_mul(self.geometry.stack_size)
            .and_then(|used| {
                checked_align_up(used, self.pages.allocation_granularity())
                    .map(|reserved| (used, reserved))
            });
        let Some((used, reserved)) = sizes else {
            return Err(FiberError::AllocationExhausted {
                requested: usize::MAX,
                source: io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!(
                        "{} stacks of {} bytes overflow the address space",
                        capacity, self.geometry.stack_size
                    ),
                ),
            });
        };
        let low = self
            .pages
            .reserve(reserved)
            .map_err(|source| FiberError::AllocationExhausted {
                requested: reserved,
                source,
            })?;
        debug!(
            bytes = reserved,
            stacks = capacity,
            "reserved stack slab at {:#x}",
            low
        );
        Ok(StackSlab {
            low,
            reserved,
            top: low + used,
            capacity,
            carved: 0,
            guards: Vec::new(),
        })
    }

    fn apply_guard(&self, base: usize) -> GuardState {
        let len = self.geometry.guard_zone_bytes();
        if !self.guard_pages || len == 0 {
            return GuardState::Disabled;
        }
        let low = base - self.geometry.stack_size;
        match self.pages.guard(low, len) {
            Ok(()) => GuardState::Applied,
            Err(e) => {
                warn!("failed to protect guard pages at {:#x}: {}", low, e);
                if let Err(e) = self.pages.uncommit(low, len) {
                    warn!("failed to uncommit guard pages at {:#x}: {}", low, e);
                }
                GuardState::Unprotected
            }
        }
    }

    /// Return a stack to the free list. Called by `StackLease::drop`.
    pub(crate) fn release(&self, base: usize) {
        let stack_size = self.geometry.stack_size;
        let mut inner = self.lock();
        guarantee!(
            inner.slab_of(base, stack_size).is_some(),
            "released stack {:#x} does not belong to this pool",
            base
        );
        guarantee!(inner.in_use > 0, "stack {:#x} released with no stack in use", base);
        inner.in_use -= 1;

        if let Some(victim) = inner.free.push(base, self.physical_cap) {
            if let Err(e) = self.pages.uncommit(victim - stack_size, stack_size) {
                warn!("failed to uncommit free stack at {:#x}: {}", victim, e);
            }
        }
        trace!("stack {:#x} released", base);
    }

    pub fn stats(&self) -> StackPoolStats {
        let inner = self.lock();
        StackPoolStats {
            stack_size: self.geometry.stack_size,
            slabs: inner.slabs.len(),
            capacity: inner.slabs.iter().map(|s| s.capacity).sum(),
            carved: inner.slabs.iter().map(|s| s.carved).sum(),
            free: inner.free.entries.len(),
            uncommitted: inner.free.uncommit_index,
            in_use: inner.in_use,
            reserved_bytes: inner.slabs.iter().map(|s| s.reserved).sum(),
        }
    }

    /// Physical backing of a free stack; `None` if `base` is not on the free list
    pub fn residency(&self, base: usize) -> Option<Residency> {
        self.lock().free.residency(base)
    }

    /// Guard state recorded when the slot was first carved
    pub fn guard_state(&self, base: usize) -> Option<GuardState> {
        let inner = self.lock();
        inner
            .slab_of(base, self.geometry.stack_size)
            .map(|(slab, slot)| slab.guards[slot])
    }

    /// Whether `base` is a carved slot of one of this pool's slabs
    pub fn owns(&self, base: usize) -> bool {
        self.lock()
            .slab_of(base, self.geometry.stack_size)
            .is_some()
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        // Leases hold an Arc to the pool, so nothing is carved out any more.
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slab in inner.slabs.drain(..) {
            if let Err(e) = self.pages.release(slab.low, slab.reserved) {
                warn!("failed to unmap stack slab at {:#x}: {}", slab.low, e);
            }
        }
    }
}

/// A stack checked out of a `StackPool`; returned to the pool on drop
pub struct StackLease {
    region: StackRegion,
    guard: GuardState,
    fresh: bool,
    pool: Arc<StackPool>,
}

impl StackLease {
    fn new(pool: &Arc<StackPool>, base: usize, guard: GuardState, fresh: bool) -> Self {
        let geometry = pool.geometry();
        Self {
            region: StackRegion::new(base, geometry.stack_size, geometry.reserved_zone_bytes()),
            guard,
            fresh,
            pool: Arc::clone(pool),
        }
    }

    pub fn region(&self) -> StackRegion {
        self.region
    }

    pub fn base(&self) -> usize {
        self.region.base
    }

    pub fn guard_state(&self) -> GuardState {
        self.guard
    }

    /// Whether this stack was carved for this lease (as opposed to recycled)
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn pool(&self) -> &Arc<StackPool> {
        &self.pool
    }
}

impl std::fmt::Debug for StackLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackLease")
            .field("region", &self.region)
            .field("guard", &self.guard)
            .field("fresh", &self.fresh)
            .finish()
    }
}

impl Drop for StackLease {
    fn drop(&mut self) {
        self.pool.release(self.region.base);
    }
}
