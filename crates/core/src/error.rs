//! Runtime Error Handling
//!
//! Two classes of failure exist in the fiber runtime:
//!
//! - **Recoverable** failures are returned as [`FiberError`]. They surface at
//!   the fiber-creation boundary (stack exhaustion, unsupported stack sizes)
//!   or at configuration time. The VM maps `AllocationExhausted` to its
//!   out-of-memory condition.
//! - **Invariant violations** (registry corruption, parity races that observe
//!   a foreign value, leaked scratch resources across a yield, a fiber
//!   terminated by a thread that does not own it) go through [`fatal!`] or
//!   [`guarantee!`]. These log at `error` level and panic; release builds
//!   abort on panic.
//!
//! # Usage
//!
//! ```ignore
//! guarantee!(
//!     fiber.owner() == self.token(),
//!     "fiber {} terminated by thread {} (owner {})",
//!     fiber.id(), self.token(), fiber.owner()
//! );
//! ```

use std::io;

/// Errors returned by fallible fiber runtime operations
#[derive(Debug, thiserror::Error)]
pub enum FiberError {
    /// The stack pool could not map more virtual memory.
    #[error("stack pool exhausted while reserving {requested} bytes: {source}")]
    AllocationExhausted {
        /// Bytes the pool tried to reserve.
        requested: usize,
        /// Underlying mapping failure.
        #[source]
        source: io::Error,
    },

    /// Only the pool's default stack size is supported.
    #[error("custom fiber stack size {requested} is not supported; request the default size")]
    UnsupportedStackSize {
        /// The size the caller asked for.
        requested: usize,
    },

    /// A configuration value breaks a runtime invariant.
    #[error("invalid fiber runtime configuration: {0}")]
    InvalidConfig(String),

    /// The OS thread's own stack bounds could not be queried.
    #[error("could not query the current thread's stack: {0}")]
    ThreadStackUnavailable(#[source] io::Error),
}

impl FiberError {
    /// Whether the VM should report this as an out-of-memory condition.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::AllocationExhausted { .. })
    }
}

/// Result alias used throughout the fiber runtime
pub type FiberResult<T> = Result<T, FiberError>;

/// Report a broken runtime invariant and stop.
///
/// Logs the message through `tracing` (target `fiber::fatal`) and panics.
/// Evaluates to `!`, so it can be used in any expression position.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        let message = ::std::format!($($arg)+);
        $crate::__tracing::error!(target: "fiber::fatal", "{}", message);
        ::std::panic!("fatal: {}", message)
    }};
}

/// Check a runtime invariant; on failure behave like [`fatal!`].
///
/// Unlike `debug_assert!`, the check is always compiled in.
#[macro_export]
macro_rules! guarantee {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_exhausted_is_oom() {
        let err = FiberError::AllocationExhausted {
            requested: 4096,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert!(err.is_out_of_memory());
        assert!(err.to_string().starts_with("stack pool exhausted while reserving 4096 bytes"));
    }

    #[test]
    fn test_unsupported_stack_size_display() {
        let err = FiberError::UnsupportedStackSize { requested: 8192 };
        assert!(!err.is_out_of_memory());
        assert_eq!(
            err.to_string(),
            "custom fiber stack size 8192 is not supported; request the default size"
        );
    }

    #[test]
    fn test_guarantee_passes_silently() {
        guarantee!(1 + 1 == 2, "arithmetic is broken");
    }

    #[test]
    #[should_panic(expected = "fatal: shard 3 count 2 != list length 1")]
    fn test_guarantee_failure_panics_with_message() {
        let (shard, count, len) = (3, 2, 1);
        guarantee!(count == len, "shard {} count {} != list length {}", shard, count, len);
    }

    #[test]
    #[should_panic(expected = "fatal: unreachable")]
    fn test_fatal_in_expression_position() {
        let value: Option<u32> = None;
        let _v: u32 = match value {
            Some(v) => v,
            None => fatal!("unreachable"),
        };
    }
}
