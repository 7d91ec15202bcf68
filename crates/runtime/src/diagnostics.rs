//! Runtime diagnostics for production debugging
//!
//! Provides a SIGQUIT (kill -3) handler that dumps stack pool, registry and
//! per-thread fiber statistics to stderr, similar to JVM thread dumps. The
//! process keeps running.
//!
//! ```bash
//! kill -3 <pid>
//! ```
//!
//! ## Signal Safety
//!
//! Dumping takes locks and does I/O, neither of which is async-signal-safe.
//! A dedicated thread waits for the signal through signal-hook's iterator API
//! and does the dump outside signal context.

use crate::fiber::FiberKind;
use crate::runtime::FiberRuntime;
use fiber_core::thread_stats::stats_registry;
use std::io::{self, Write};
use std::sync::Once;
use std::sync::atomic::Ordering;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Maximum number of individual fibers listed in one dump
const FIBER_DISPLAY_LIMIT: usize = 20;

/// Install the SIGQUIT handler. Idempotent; called by `crate::init`.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            use signal_hook::consts::SIGQUIT;
            use signal_hook::iterator::Signals;

            let mut signals = match Signals::new([SIGQUIT]) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot register SIGQUIT diagnostics handler");
                    return;
                }
            };

            let spawned = std::thread::Builder::new()
                .name("fiber-diagnostics".to_string())
                .spawn(move || {
                    for sig in signals.forever() {
                        if sig == SIGQUIT {
                            dump_diagnostics();
                        }
                    }
                });
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "cannot spawn diagnostics thread");
            }
        }
    });
}

/// Dump diagnostics of the global runtime to stderr
///
/// Prints a note instead when no global runtime has been created.
pub fn dump_diagnostics() {
    let mut out = io::stderr().lock();
    let _ = match FiberRuntime::try_global() {
        Some(runtime) => write_diagnostics(runtime, &mut out),
        None => writeln!(out, "\n=== Fiber Runtime Diagnostics ===\n  (runtime not initialized)\n"),
    };
}

/// Write a diagnostics dump of `runtime` to `out`.
pub fn write_diagnostics(runtime: &FiberRuntime, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "\n=== Fiber Runtime Diagnostics ===")?;
    writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now())?;
    writeln!(out, "Uptime:    {:.3}s", runtime.elapsed().as_secs_f64())?;

    let pool = runtime.pool().stats();
    writeln!(out, "\n[Stack Pool]")?;
    writeln!(out, "  Stack size:  {}", format_bytes(pool.stack_size as u64))?;
    writeln!(
        out,
        "  Slabs:       {} ({} reserved)",
        pool.slabs,
        format_bytes(pool.reserved_bytes as u64)
    )?;
    writeln!(out, "  Capacity:    {} stacks", pool.capacity)?;
    writeln!(out, "  Carved:      {}", pool.carved)?;
    writeln!(out, "  In use:      {}", pool.in_use)?;
    writeln!(
        out,
        "  Free:        {} ({} uncommitted)",
        pool.free, pool.uncommitted
    )?;

    let registry = runtime.registry();
    let counts = registry.shard_counts();
    let total: usize = counts.iter().sum();
    let busiest = counts.iter().copied().max().unwrap_or(0);
    writeln!(out, "\n[Registry]")?;
    writeln!(out, "  Shards:        {}", counts.len())?;
    writeln!(out, "  Fibers:        {}", total)?;
    writeln!(out, "  Busiest shard: {} fibers", busiest)?;

    let mut fibers = Vec::new();
    registry.for_each(|fiber| fibers.push(std::sync::Arc::clone(fiber)));
    fibers.sort_by_key(|f| (f.kind() != FiberKind::Thread, f.owner().as_u64()));
    if fibers.is_empty() {
        writeln!(out, "  (no registered fibers)")?;
    } else {
        for (idx, fiber) in fibers.iter().take(FIBER_DISPLAY_LIMIT).enumerate() {
            let kind = match fiber.kind() {
                FiberKind::Thread => "thread",
                FiberKind::Heap => "heap",
            };
            writeln!(
                out,
                "    [{:2}] {} {:<6} {:?} owner {} ({})",
                idx + 1,
                fiber.id(),
                kind,
                fiber.state(),
                fiber.owner(),
                fiber.owner_name()
            )?;
        }
        if fibers.len() > FIBER_DISPLAY_LIMIT {
            writeln!(out, "    ... and {} more fibers", fibers.len() - FIBER_DISPLAY_LIMIT)?;
        }
    }

    let stats = stats_registry();
    let aggregate = stats.aggregate();
    writeln!(out, "\n[Fiber Threads]")?;
    writeln!(out, "  Tracked threads:   {}", aggregate.active_threads)?;
    writeln!(out, "  Fibers created:    {}", aggregate.fibers_created)?;
    writeln!(out, "  Fibers reused:     {}", aggregate.fibers_reused)?;
    writeln!(out, "  Fibers terminated: {}", aggregate.fibers_terminated)?;
    writeln!(out, "  Idle cached:       {}", aggregate.idle_cached)?;
    let overflow = stats.overflow_count.load(Ordering::Relaxed);
    if overflow > 0 {
        writeln!(
            out,
            "  WARNING: {} threads exceeded stats capacity of {} (not tracked)",
            overflow,
            stats.capacity()
        )?;
    }

    let config = runtime.config();
    writeln!(out, "\n[Config]")?;
    writeln!(out, "  Verify on yield:    {}", config.verify_on_yield)?;
    writeln!(out, "  Guard pages:        {}", config.guard_pages)?;
    writeln!(out, "  Idle cache size:    {}", config.idle_cache_size)?;
    writeln!(out, "  Physical cache max: {}", config.physical_cache_max)?;

    writeln!(out, "\n=== End Diagnostics ===\n")
}

/// Format bytes as human-readable string
pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
