//! Fiber Core: foundation primitives for the cooperative fiber runtime
//!
//! This crate holds the pieces of the fiber runtime that know nothing about
//! fibers themselves: error types and invariant macros, configuration,
//! raw virtual-memory operations, per-thread scratch resources, and the
//! cross-thread statistics registry read by diagnostics.
//!
//! # Modules
//!
//! - `error`: `FiberError`, `fatal!` and `guarantee!`
//! - `config`: `FiberConfig` loaded from `FIBER_*` environment variables
//! - `vmem`: Page-granular reserve/protect/uncommit/release operations
//! - `scratch`: Thread scratch arenas, handle blocks and call counters
//! - `thread_stats`: Cross-thread fiber statistics registry

pub mod config;
pub mod error;
pub mod scratch;
pub mod thread_stats;
pub mod vmem;

// Used by the exported `fatal!` macro
#[doc(hidden)]
pub use tracing as __tracing;

pub use config::FiberConfig;
pub use error::{FiberError, FiberResult};
pub use scratch::{ArenaMark, ScratchArena, ScratchSnapshot, ThreadScratch};
pub use thread_stats::{
    AggregateFiberStats, ThreadFiberStats, current_thread_id, stats_registry,
};
pub use vmem::{OsPages, PageProvider, ThreadStackBounds, checked_align_up};
