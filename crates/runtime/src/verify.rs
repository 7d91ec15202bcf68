//! Switch verification
//!
//! Handle blocks and scratch arenas belong to the OS thread, not to the
//! fiber running on it. A fiber that yields while still holding some would
//! leave them to the next fiber on the thread. When verification is on:
//!
//! - entering a heap fiber records a bookmark of the thread's scratch state
//!   on that fiber;
//! - leaving a heap fiber compares the bookmark with the current state,
//!   requires that no monitor chunks are held and, on termination, that the
//!   native-call depth is exactly the entry call.
//!
//! Any mismatch is fatal.

use crate::fiber::Fiber;
use fiber_core::scratch::{ScratchSnapshot, ThreadScratch};
use fiber_core::{fatal, guarantee};
use tracing::trace;

/// Which scratch resource leaked across a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LeakKind {
    #[error("active handle block changed from {saved} to {observed}")]
    HandleBlock { saved: u64, observed: u64 },

    #[error("live handle count changed from {saved} to {observed}")]
    HandleCount { saved: usize, observed: usize },

    #[error("handle area leak: high-water mark {saved:#x} became {observed:#x}")]
    HandleArea { saved: usize, observed: usize },

    #[error("resource area leak: high-water mark {saved:#x} became {observed:#x}")]
    ResourceArea { saved: usize, observed: usize },

    #[error("{0} monitor chunk(s) still held")]
    MonitorChunks(usize),

    #[error("native call depth is {0} at termination, expected 1")]
    NativeCallDepth(usize),
}

/// Compare a bookmark with the observed state, field by field.
pub fn check_bookmark(saved: &ScratchSnapshot, observed: &ScratchSnapshot) -> Result<(), LeakKind> {
    if saved.handle_block != observed.handle_block {
        return Err(LeakKind::HandleBlock {
            saved: saved.handle_block,
            observed: observed.handle_block,
        });
    }
    if saved.live_handles != observed.live_handles {
        return Err(LeakKind::HandleCount {
            saved: saved.live_handles,
            observed: observed.live_handles,
        });
    }
    if saved.handle_area_hwm != observed.handle_area_hwm {
        return Err(LeakKind::HandleArea {
            saved: saved.handle_area_hwm,
            observed: observed.handle_area_hwm,
        });
    }
    if saved.resource_area_hwm != observed.resource_area_hwm {
        return Err(LeakKind::ResourceArea {
            saved: saved.resource_area_hwm,
            observed: observed.resource_area_hwm,
        });
    }
    Ok(())
}

/// Check the thread's scratch state on a switch from `from` to `to`.
pub fn yield_verify(from: &Fiber, to: &Fiber, terminate: bool, scratch: &ThreadScratch) {
    trace!(from = %from.id(), to = %to.id(), terminate, "yield verify");

    if !from.is_thread_fiber() {
        let Some(saved) = from.bookmark() else {
            fatal!("fiber {} leaves without a verification bookmark", from.id());
        };
        if let Err(leak) = check_bookmark(&saved, &scratch.snapshot()) {
            fatal!("fiber {}: {}", from.id(), leak);
        }
        if scratch.monitor_chunks() != 0 {
            fatal!(
                "fiber {}: {}",
                from.id(),
                LeakKind::MonitorChunks(scratch.monitor_chunks())
            );
        }
        if terminate && scratch.native_call_depth() != 1 {
            fatal!(
                "fiber {}: {}",
                from.id(),
                LeakKind::NativeCallDepth(scratch.native_call_depth())
            );
        }
    }

    if !to.is_thread_fiber() {
        guarantee!(
            !terminate,
            "terminating switch from fiber {} into heap fiber {}",
            from.id(),
            to.id()
        );
        to.set_bookmark(scratch.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ScratchSnapshot {
        ScratchSnapshot {
            handle_block: 3,
            live_handles: 2,
            handle_area_hwm: 0x100,
            resource_area_hwm: 0x200,
        }
    }

    #[test]
    fn test_matching_bookmark_passes() {
        assert_eq!(check_bookmark(&snapshot(), &snapshot()), Ok(()));
    }

    #[test]
    fn test_each_field_is_checked() {
        let saved = snapshot();

        let observed = ScratchSnapshot {
            handle_block: 4,
            ..saved
        };
        assert_eq!(
            check_bookmark(&saved, &observed),
            Err(LeakKind::HandleBlock {
                saved: 3,
                observed: 4
            })
        );

        let observed = ScratchSnapshot {
            live_handles: 3,
            ..saved
        };
        assert!(matches!(
            check_bookmark(&saved, &observed),
            Err(LeakKind::HandleCount { .. })
        ));

        let observed = ScratchSnapshot {
            handle_area_hwm: 0x180,
            ..saved
        };
        assert!(matches!(
            check_bookmark(&saved, &observed),
            Err(LeakKind::HandleArea { .. })
        ));

        let observed = ScratchSnapshot {
            resource_area_hwm: 0x1f0,
            ..saved
        };
        assert!(matches!(
            check_bookmark(&saved, &observed),
            Err(LeakKind::ResourceArea { .. })
        ));
    }

    #[test]
    fn test_leak_messages() {
        assert_eq!(
            LeakKind::ResourceArea {
                saved: 0x10,
                observed: 0x20
            }
            .to_string(),
            "resource area leak: high-water mark 0x10 became 0x20"
        );
        assert_eq!(
            LeakKind::NativeCallDepth(2).to_string(),
            "native call depth is 2 at termination, expected 1"
        );
    }
}
