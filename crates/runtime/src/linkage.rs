//! Managed-call linkage
//!
//! Two hooks connect the runtime to the host VM's calling machinery:
//!
//! - [`EntryLinkage`] runs a fiber's managed entry point. It is installed
//!   once per process and invoked from the `fiber_start` trampoline that
//!   every primed stack "returns" into on its first switch.
//! - [`CompensationPolicy`] lets a cooperative worker pool react when a
//!   fiber blocks its carrier thread (`try_compensate`) and when it stops
//!   blocking (`update_active_count`). The default does nothing.

use crate::fiber::Fiber;
use fiber_core::{fatal, guarantee};
use std::sync::OnceLock;

/// Runs the managed entry logic of a newly started fiber
pub trait EntryLinkage: Send + Sync {
    /// Must not return; a fiber leaves its stack only through a terminating switch.
    fn call_fiber_entry(&self, fiber: &Fiber);
}

static ENTRY_LINKAGE: OnceLock<Box<dyn EntryLinkage>> = OnceLock::new();

/// Install the process-wide entry linkage. Returns false if one is already installed.
pub fn install_entry_linkage(linkage: Box<dyn EntryLinkage>) -> bool {
    ENTRY_LINKAGE.set(linkage).is_ok()
}

pub fn entry_linkage_installed() -> bool {
    ENTRY_LINKAGE.get().is_some()
}

/// First code a fiber runs
///
/// The context switch primitive pops the primed frame and arrives here with
/// the fiber being started as second argument.
///
/// # Safety
/// `fiber` must point to a live `Fiber` kept alive by its `Arc` for the
/// whole time the fiber runs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fiber_start(_dummy: usize, fiber: *const libc::c_void) -> ! {
    let Some(linkage) = ENTRY_LINKAGE.get() else {
        fatal!("fiber started before an entry linkage was installed");
    };
    guarantee!(!fiber.is_null(), "fiber started with a null fiber pointer");
    // SAFETY: guaranteed by the caller
    let fiber = unsafe { &*(fiber as *const Fiber) };
    linkage.call_fiber_entry(fiber);
    fatal!("fiber {} returned from its entry point", fiber.id())
}

/// Address of `fiber_start`, the return-address sentinel of unstarted fibers
pub fn fiber_start_address() -> usize {
    fiber_start as *const () as usize
}

/// What the OS thread is doing from the VM's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    InManaged,
    InVm,
    InNative,
}

/// Hooks into a cooperative worker pool
pub trait CompensationPolicy: Send + Sync {
    /// Called before a fiber blocks its carrier. `false` means the pool
    /// could not compensate and the caller should not block.
    fn try_compensate(&self) -> bool;

    /// Called after a blocking section ends.
    fn update_active_count(&self);
}

/// Default policy: nothing to compensate
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompensation;

impl CompensationPolicy for NoCompensation {
    fn try_compensate(&self) -> bool {
        true
    }

    fn update_active_count(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder;

    impl EntryLinkage for Recorder {
        fn call_fiber_entry(&self, _fiber: &Fiber) {}
    }

    #[test]
    fn test_fiber_start_address_is_stable() {
        assert_ne!(fiber_start_address(), 0);
        assert_eq!(fiber_start_address(), fiber_start_address());
    }

    #[test]
    fn test_entry_linkage_installs_once() {
        let _first = install_entry_linkage(Box::new(Recorder));
        assert!(entry_linkage_installed());
        assert!(!install_entry_linkage(Box::new(Recorder)));
    }

    #[test]
    fn test_no_compensation() {
        let policy = NoCompensation;
        assert!(policy.try_compensate());
        policy.update_active_count();
    }
}
