//! Fiber Runtime: cooperative fibers on pooled, guarded stacks
//!
//! Key pieces:
//! - `StackPool`: fixed-size stacks carved from large reserved slabs, with
//!   guard zones and a bounded number of resident free stacks
//! - `FiberRegistry`: sharded set of live fibers, with parity-claimed
//!   parallel scans
//! - `Fiber`: identity, state, owned stack and resume point
//! - `FiberThread`: one OS thread's fibers, idle cache and switch protocol
//! - `verify`: scratch-resource bookkeeping checked on every switch
//!
//! The context switch itself (register save/restore) is supplied by the host
//! through the `ContextSwitch` trait.

pub mod fiber;
pub mod frames;
pub mod linkage;
pub mod registry;
pub mod runtime;
pub mod stack_pool;
pub mod thread;
pub mod verify;

#[cfg(feature = "diagnostics")]
pub mod diagnostics;

#[cfg(feature = "diagnostics")]
pub mod report;

#[cfg(not(feature = "diagnostics"))]
#[path = "report_stub.rs"]
pub mod report;

pub use fiber::{
    Continuation, ContinuationKind, Fiber, FiberId, FiberKind, FiberState, ResumePoint,
    ThreadToken, VirtualThreadInfo,
};
pub use frames::{
    CallFrame, FrameCursor, FrameSource, ManagedMethod, StackTraceElement, WalkMode,
    dump_stack_trace,
};
pub use linkage::{
    CompensationPolicy, EntryLinkage, ExecutionMode, NoCompensation, fiber_start_address,
    install_entry_linkage,
};
pub use registry::{ActiveUnits, FiberRegistry};
pub use runtime::{FiberRuntime, FiberRuntimeBuilder};
pub use stack_pool::{GuardState, StackLease, StackPool, StackPoolStats, StackRegion};
pub use thread::{ContextSwitch, FiberThread, PinReason, StackRequest};

pub use fiber_core::{FiberConfig, FiberError, FiberResult};

use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize the process-wide runtime from `FIBER_*` variables.
///
/// Installs the SIGQUIT diagnostics handler on first call. Idempotent.
pub fn init() -> Arc<FiberRuntime> {
    INIT.call_once(|| {
        #[cfg(feature = "diagnostics")]
        diagnostics::install_signal_handler();
    });
    Arc::clone(FiberRuntime::global())
}

/// Emit the at-exit report, if `FIBER_REPORT` asks for one.
pub fn shutdown() {
    report::emit_report();
}

/// C entry point for hosts linking the static library
///
/// # Safety
/// Safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fiber_runtime_init() {
    let _ = init();
}

/// C entry point emitting the at-exit report
///
/// # Safety
/// Safe to call from any context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fiber_runtime_report() {
    shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_returns_global_runtime() {
        let first = init();
        let second = init();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, FiberRuntime::global()));
        shutdown();
    }
}
