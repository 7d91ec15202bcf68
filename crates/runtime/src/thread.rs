//! Per-thread fiber context
//!
//! A `FiberThread` is the fiber runtime's view of one OS thread: its thread
//! fiber, the fiber currently attached to it, the idle cache of terminated
//! fibers kept for reuse, and the thread's scratch resources.
//!
//! Everything here is thread-local. `FiberThread` is neither `Send` nor
//! `Sync`, and only the owning thread ever switches its fibers.
//!
//! ## Lifecycle
//!
//! ```text
//!   create_fiber ──► [registered, OnStack] ◄──► [registered, Current]
//!        ▲                    │ terminate
//!        │ reuse              ▼
//!   [idle cache] ◄── room? ── unregistered ── no room ──► dropped
//!                                                        (stack to pool)
//! ```
//!
//! A fiber that terminates itself with `switch_to_and_terminate` is still
//! running on its own stack when it unregisters. It waits in a one-slot
//! pending release until the target has resumed, and only then is it parked
//! or its stack returned.

use crate::fiber::{Continuation, Fiber, FiberState, ThreadToken};
use crate::linkage::ExecutionMode;
use crate::runtime::FiberRuntime;
use crate::stack_pool::StackRegion;
use crate::verify::yield_verify;
use fiber_core::scratch::ThreadScratch;
use fiber_core::thread_stats::stats_registry;
use fiber_core::vmem::ThreadStackBounds;
use fiber_core::{FiberError, FiberResult, guarantee};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Stack a new fiber should run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackRequest {
    /// A pooled stack of the configured size
    Default,
    /// A custom size; not supported
    Bytes(usize),
    /// No stack of its own: the calling thread's thread fiber
    Kernel,
}

/// Why the current fiber cannot be unmounted from its thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinReason {
    None,
    /// Holding a monitor
    Monitor,
    /// Inside a foreign (native) call frame
    Native,
}

/// Architecture-specific register save/restore
///
/// Implementations read the target's resume point with
/// `Fiber::resume_point` and store the outgoing one with
/// `Fiber::save_resume_point`.
pub trait ContextSwitch {
    /// Save `from`'s context and continue at `to`.
    fn switch(&self, from: &Fiber, to: &Fiber);

    /// Continue at `to` without saving the current context.
    fn resume(&self, to: &Fiber);
}

/// The fiber runtime state of one OS thread
pub struct FiberThread {
    runtime: Arc<FiberRuntime>,
    token: ThreadToken,
    name: Arc<str>,
    thread_fiber: Arc<Fiber>,
    current: RefCell<Arc<Fiber>>,
    idle_cache: RefCell<Vec<Arc<Fiber>>>,
    pending_release: RefCell<Option<Arc<Fiber>>>,
    scratch: RefCell<ThreadScratch>,
    mode: Cell<ExecutionMode>,
    stats_slot: Option<usize>,
    _not_send: PhantomData<*const ()>,
}

impl FiberThread {
    /// Attach the calling OS thread: create and register its thread fiber.
    pub fn attach(runtime: Arc<FiberRuntime>) -> FiberResult<Self> {
        let bounds = ThreadStackBounds::current().map_err(FiberError::ThreadStackUnavailable)?;
        let token = ThreadToken::next();
        let name: Arc<str> = Arc::from(std::thread::current().name().unwrap_or("<unnamed>"));

        let reserved = runtime.pool().geometry().reserved_zone_bytes();
        let region = StackRegion::new(bounds.base, bounds.size, reserved);
        let thread_fiber = Arc::new(Fiber::new_thread(token, Arc::clone(&name), region));
        runtime.registry().insert(&thread_fiber);

        let stats_slot = stats_registry().register();
        debug!(thread = %name, token = %token, fiber = %thread_fiber.id(), "fiber thread attached");

        Ok(Self {
            runtime,
            token,
            name,
            current: RefCell::new(Arc::clone(&thread_fiber)),
            thread_fiber,
            idle_cache: RefCell::new(Vec::new()),
            pending_release: RefCell::new(None),
            scratch: RefCell::new(ThreadScratch::new()),
            mode: Cell::new(ExecutionMode::InManaged),
            stats_slot,
            _not_send: PhantomData,
        })
    }

    pub fn runtime(&self) -> &Arc<FiberRuntime> {
        &self.runtime
    }

    pub fn token(&self) -> ThreadToken {
        self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_fiber(&self) -> &Arc<Fiber> {
        &self.thread_fiber
    }

    /// The fiber attached to this thread right now
    pub fn current(&self) -> Arc<Fiber> {
        Arc::clone(&self.current.borrow())
    }

    /// Fibers parked for reuse
    pub fn idle_cached(&self) -> usize {
        self.idle_cache.borrow().len()
    }

    /// Whether a self-terminated fiber still waits for its stack to be left
    pub fn release_pending(&self) -> bool {
        self.pending_release.borrow().is_some()
    }

    pub fn scratch(&self) -> Ref<'_, ThreadScratch> {
        self.scratch.borrow()
    }

    pub fn scratch_mut(&self) -> RefMut<'_, ThreadScratch> {
        self.scratch.borrow_mut()
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode.get()
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        self.mode.set(mode);
    }

    /// Create a fiber (or hand out this thread's own, for `Kernel`).
    ///
    /// `Default` reuses an idle fiber when one is cached, otherwise takes a
    /// fresh stack from the pool. Custom sizes are rejected.
    pub fn create_fiber(
        &self,
        request: StackRequest,
        continuation: Option<Weak<dyn Continuation>>,
    ) -> FiberResult<Arc<Fiber>> {
        match request {
            StackRequest::Kernel => {
                let current = self.current();
                guarantee!(
                    current.is_thread_fiber(),
                    "kernel continuation requested while fiber {} is current",
                    current.id()
                );
                trace!(fiber = %current.id(), "kernel continuation reuses thread fiber");
                return Ok(current);
            }
            StackRequest::Bytes(requested) => {
                return Err(FiberError::UnsupportedStackSize { requested });
            }
            StackRequest::Default => {}
        }

        self.reclaim_terminated();
        let cached = self.idle_cache.borrow_mut().pop();
        let fiber = match cached {
            Some(fiber) => {
                fiber.reset_for_reuse();
                self.update_idle_stats();
                if let Some(slot) = self.stats_slot {
                    stats_registry().record_reused(slot);
                }
                debug!(fiber = %fiber.id(), "fiber reused from idle cache");
                fiber
            }
            None => {
                let lease = self.runtime.pool().acquire()?;
                let verify = self.runtime.config().verify_on_yield;
                let fiber = Arc::new(Fiber::new_heap(
                    self.token,
                    Arc::clone(&self.name),
                    lease,
                    verify,
                ));
                if let Some(slot) = self.stats_slot {
                    stats_registry().record_created(slot);
                }
                fiber
            }
        };

        fiber.set_continuation(continuation);
        self.runtime.registry().insert(&fiber);
        trace!(fiber = %fiber.id(), thread = %self.name, "fiber created");
        Ok(fiber)
    }

    /// Retire a fiber owned by this thread.
    ///
    /// The fiber leaves the registry. It is parked in the idle cache if there
    /// is room, otherwise dropped, which returns its stack to the pool once
    /// no other `Arc` holds it.
    pub fn terminate(&self, fiber: Arc<Fiber>) {
        trace!(fiber = %fiber.id(), thread = %self.name, "terminate fiber");
        self.unregister_terminated(&fiber);
        self.park_or_release(fiber);
    }

    fn unregister_terminated(&self, fiber: &Arc<Fiber>) {
        guarantee!(
            fiber.owner() == self.token,
            "fiber {} owned by thread {} terminated by thread {}",
            fiber.id(),
            fiber.owner(),
            self.token
        );
        guarantee!(
            !fiber.is_thread_fiber(),
            "thread fiber {} cannot be terminated",
            fiber.id()
        );
        guarantee!(
            !Arc::ptr_eq(fiber, &self.current.borrow()),
            "fiber {} terminated while current",
            fiber.id()
        );

        fiber.clear_continuation();
        self.runtime.registry().remove(fiber);
        if let Some(slot) = self.stats_slot {
            stats_registry().record_terminated(slot);
        }
    }

    fn park_or_release(&self, fiber: Arc<Fiber>) {
        let mut cache = self.idle_cache.borrow_mut();
        if cache.len() < self.runtime.config().idle_cache_size {
            cache.push(fiber);
            drop(cache);
            self.update_idle_stats();
        }
    }

    /// Finish terminating the fiber that switched away with
    /// `switch_to_and_terminate`.
    ///
    /// Must run on some other stack than the terminated fiber's. The switch
    /// operations call it once the target resumes; a freshly started fiber's
    /// entry path should call it before running any code.
    pub fn reclaim_terminated(&self) {
        let pending = self.pending_release.borrow_mut().take();
        if let Some(fiber) = pending {
            trace!(fiber = %fiber.id(), "reclaim terminated fiber");
            self.park_or_release(fiber);
        }
    }

    fn update_idle_stats(&self) {
        if let Some(slot) = self.stats_slot {
            stats_registry().set_idle_cached(slot, self.idle_cached());
        }
    }

    fn check_target(&self, target: &Fiber) {
        guarantee!(
            target.owner() == self.token,
            "switch into fiber {} owned by thread {} from thread {}",
            target.id(),
            target.owner(),
            self.token
        );
        guarantee!(
            target.state() == FiberState::OnStack,
            "switch into fiber {} which is {:?}",
            target.id(),
            target.state()
        );
    }

    /// Make `target` current and swap stacks.
    ///
    /// Returns when some fiber switches back to the one that was current.
    pub fn switch_to(&self, target: &Arc<Fiber>, switch: &dyn ContextSwitch) {
        let from = self.current();
        self.check_target(target);

        if self.runtime.config().verify_on_yield {
            yield_verify(&from, target, false, &self.scratch.borrow());
        }

        from.set_state(FiberState::OnStack);
        target.set_state(FiberState::Current);
        target.mark_entered();
        *self.current.borrow_mut() = Arc::clone(target);
        trace!(from = %from.id(), to = %target.id(), "switch");

        switch.switch(&from, target);
        // Back on `from`'s stack
        self.reclaim_terminated();
    }

    /// Switch to `target` and terminate the current fiber.
    ///
    /// The outgoing context is not saved. The outgoing fiber leaves the
    /// registry before the switch, but its stack stays leased until the
    /// target side calls `reclaim_terminated`.
    pub fn switch_to_and_terminate(&self, target: &Arc<Fiber>, switch: &dyn ContextSwitch) {
        let from = self.current();
        self.check_target(target);

        if self.runtime.config().verify_on_yield {
            yield_verify(&from, target, true, &self.scratch.borrow());
        }

        from.set_state(FiberState::OnStack);
        target.set_state(FiberState::Current);
        target.mark_entered();
        *self.current.borrow_mut() = Arc::clone(target);
        trace!(from = %from.id(), to = %target.id(), "switch and terminate");

        self.unregister_terminated(&from);
        let previous = self.pending_release.borrow_mut().replace(from);
        if let Some(stale) = previous {
            // Left behind by an earlier terminating switch; its stack is not ours
            self.park_or_release(stale);
        }

        switch.resume(target);
        self.reclaim_terminated();
    }

    /// Why the current fiber is pinned to this thread
    pub fn pin_reason(&self) -> PinReason {
        let scratch = self.scratch.borrow();
        if scratch.locks_held() != 0 {
            PinReason::Monitor
        } else if scratch.foreign_frames() != 0 {
            PinReason::Native
        } else {
            PinReason::None
        }
    }

    fn compensation_applies(&self) -> bool {
        self.runtime.config().yield_with_monitor && !self.current.borrow().is_thread_fiber()
    }

    fn in_vm<R>(&self, f: impl FnOnce() -> R) -> R {
        let saved = self.mode.replace(ExecutionMode::InVm);
        let result = f();
        self.mode.set(saved);
        result
    }

    /// Ask the pool to compensate before blocking; true when not applicable.
    pub fn try_compensate(&self) -> bool {
        if !self.compensation_applies() {
            return true;
        }
        self.in_vm(|| self.runtime.compensation().try_compensate())
    }

    /// Tell the pool a blocking section ended.
    pub fn update_active_count(&self) {
        if self.compensation_applies() {
            self.in_vm(|| self.runtime.compensation().update_active_count());
        }
    }
}

impl Drop for FiberThread {
    fn drop(&mut self) {
        // Cached fibers are already unregistered; dropping them frees their stacks
        self.pending_release.get_mut().take();
        self.idle_cache.get_mut().clear();

        // Fibers never terminated can no longer run once their owner is gone
        let mut orphans = Vec::new();
        self.runtime.registry().for_each(|fiber| {
            if fiber.owner() == self.token && !fiber.is_thread_fiber() {
                orphans.push(Arc::clone(fiber));
            }
        });
        if !orphans.is_empty() {
            warn!(
                thread = %self.name,
                count = orphans.len(),
                "fiber thread detached with live fibers, unregistering them"
            );
            for fiber in &orphans {
                fiber.clear_continuation();
                self.runtime.registry().remove(fiber);
            }
        }

        self.runtime.registry().remove(&self.thread_fiber);
        if let Some(slot) = self.stats_slot {
            stats_registry().unregister(slot);
        }
        debug!(thread = %self.name, token = %self.token, "fiber thread detached");
    }
}
