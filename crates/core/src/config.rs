//! Fiber runtime configuration
//!
//! All knobs are read once from the environment when the process-wide
//! runtime is created. Hosts that embed the runtime explicitly (and tests)
//! build a [`FiberConfig`] directly and call [`FiberConfig::validate`].
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FIBER_STACK_SIZE` | `262144` | Usable bytes per fiber stack |
//! | `FIBER_STACK_SHADOW_PAGES` | `20` | Shadow zone pages below the usable region |
//! | `FIBER_STACK_YELLOW_PAGES` | `2` | Yellow (recoverable overflow) zone pages |
//! | `FIBER_STACK_RED_PAGES` | `1` | Red (fatal overflow) zone pages |
//! | `FIBER_GUARD_PAGES` | `true` | Protect yellow/red pages of fresh stacks |
//! | `FIBER_STACKS_PER_SLAB` | `64` | Stacks carved from one reserved slab |
//! | `FIBER_PHYSICAL_CACHE_MAX` | `32` | Free stacks allowed to keep physical pages |
//! | `FIBER_REGISTRY_SHARDS` | `256` | Registry shard count (power of two) |
//! | `FIBER_IDLE_CACHE_SIZE` | `20` | Terminated fibers parked per thread |
//! | `FIBER_VERIFY_ON_YIELD` | debug builds | Check scratch bookmarks on every switch |
//! | `FIBER_YIELD_WITH_MONITOR` | `false` | Call the compensation policy hooks |
//! | `FIBER_HEAVY_MONITORS` | `false` | Locks never live on fiber stacks |
//! | `FIBER_MAX_STACK_TRACE_DEPTH` | `1024` | Frames printed per fiber in dumps |
//!
//! Invalid values (non-numeric, zero where zero is meaningless, a shard count
//! that is not a power of two) are reported with a warning and replaced by
//! the default. Stack and slab sizes whose byte count overflows `usize`
//! fall back to the default stack geometry as a whole.

use crate::error::{FiberError, FiberResult};
use crate::vmem::{checked_align_up, os_page_size};
use std::fmt::Display;
use std::str::FromStr;
use tracing::warn;

/// Default usable stack size: 256KB
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
/// Default shadow zone: 20 pages
pub const DEFAULT_SHADOW_PAGES: usize = 20;
/// Default yellow zone: 2 pages
pub const DEFAULT_YELLOW_PAGES: usize = 2;
/// Default red zone: 1 page
pub const DEFAULT_RED_PAGES: usize = 1;
/// Default number of stacks per reserved slab
pub const DEFAULT_STACKS_PER_SLAB: usize = 64;
/// Default number of free stacks that keep their physical pages
pub const DEFAULT_PHYSICAL_CACHE_MAX: usize = 32;
/// Default registry shard count
pub const DEFAULT_REGISTRY_SHARDS: usize = 256;
/// Default per-thread idle fiber cache size
pub const DEFAULT_IDLE_CACHE_SIZE: usize = 20;
/// Default frame limit for stack dumps
pub const DEFAULT_MAX_STACK_TRACE_DEPTH: usize = 1024;

/// Fiber runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberConfig {
    /// Usable bytes per fiber stack (guard zones are added on top)
    pub stack_size: usize,
    /// Shadow zone pages
    pub shadow_pages: usize,
    /// Yellow zone pages
    pub yellow_pages: usize,
    /// Red zone pages
    pub red_pages: usize,
    /// Whether fresh stacks get their yellow/red pages protected
    pub guard_pages: bool,
    /// Stacks carved from one slab before a new slab is reserved
    pub stacks_per_slab: usize,
    /// Free stacks beyond this count get their physical pages released
    pub physical_cache_max: usize,
    /// Registry shard count; must be a power of two
    pub registry_shards: usize,
    /// Terminated fibers parked per thread for reuse
    pub idle_cache_size: usize,
    /// Verify scratch bookmarks on every switch
    pub verify_on_yield: bool,
    /// Invoke the compensation policy around blocking yields
    pub yield_with_monitor: bool,
    /// Locks are always inflated, never recorded on fiber stacks
    pub heavy_monitors: bool,
    /// Frame limit for human-readable stack dumps
    pub max_stack_trace_depth: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            shadow_pages: DEFAULT_SHADOW_PAGES,
            yellow_pages: DEFAULT_YELLOW_PAGES,
            red_pages: DEFAULT_RED_PAGES,
            guard_pages: true,
            stacks_per_slab: DEFAULT_STACKS_PER_SLAB,
            physical_cache_max: DEFAULT_PHYSICAL_CACHE_MAX,
            registry_shards: DEFAULT_REGISTRY_SHARDS,
            idle_cache_size: DEFAULT_IDLE_CACHE_SIZE,
            verify_on_yield: cfg!(debug_assertions),
            yield_with_monitor: false,
            heavy_monitors: false,
            max_stack_trace_depth: DEFAULT_MAX_STACK_TRACE_DEPTH,
        }
    }
}

impl FiberConfig {
    /// Load configuration from `FIBER_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// `from_env` is this with `std::env::var`; tests pass a map lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mut config = Self {
            stack_size: parse_positive(
                "FIBER_STACK_SIZE",
                lookup("FIBER_STACK_SIZE"),
                defaults.stack_size,
            ),
            shadow_pages: parse_value(
                "FIBER_STACK_SHADOW_PAGES",
                lookup("FIBER_STACK_SHADOW_PAGES"),
                defaults.shadow_pages,
            ),
            yellow_pages: parse_value(
                "FIBER_STACK_YELLOW_PAGES",
                lookup("FIBER_STACK_YELLOW_PAGES"),
                defaults.yellow_pages,
            ),
            red_pages: parse_value(
                "FIBER_STACK_RED_PAGES",
                lookup("FIBER_STACK_RED_PAGES"),
                defaults.red_pages,
            ),
            guard_pages: parse_flag(
                "FIBER_GUARD_PAGES",
                lookup("FIBER_GUARD_PAGES"),
                defaults.guard_pages,
            ),
            stacks_per_slab: parse_positive(
                "FIBER_STACKS_PER_SLAB",
                lookup("FIBER_STACKS_PER_SLAB"),
                defaults.stacks_per_slab,
            ),
            physical_cache_max: parse_value(
                "FIBER_PHYSICAL_CACHE_MAX",
                lookup("FIBER_PHYSICAL_CACHE_MAX"),
                defaults.physical_cache_max,
            ),
            registry_shards: parse_shard_count(lookup("FIBER_REGISTRY_SHARDS")),
            idle_cache_size: parse_value(
                "FIBER_IDLE_CACHE_SIZE",
                lookup("FIBER_IDLE_CACHE_SIZE"),
                defaults.idle_cache_size,
            ),
            verify_on_yield: parse_flag(
                "FIBER_VERIFY_ON_YIELD",
                lookup("FIBER_VERIFY_ON_YIELD"),
                defaults.verify_on_yield,
            ),
            yield_with_monitor: parse_flag(
                "FIBER_YIELD_WITH_MONITOR",
                lookup("FIBER_YIELD_WITH_MONITOR"),
                defaults.yield_with_monitor,
            ),
            heavy_monitors: parse_flag(
                "FIBER_HEAVY_MONITORS",
                lookup("FIBER_HEAVY_MONITORS"),
                defaults.heavy_monitors,
            ),
            max_stack_trace_depth: parse_positive(
                "FIBER_MAX_STACK_TRACE_DEPTH",
                lookup("FIBER_MAX_STACK_TRACE_DEPTH"),
                defaults.max_stack_trace_depth,
            ),
        };

        if config.slab_bytes(os_page_size()).is_none() {
            warn!(
                "FIBER_STACK_SIZE={} with FIBER_STACKS_PER_SLAB={} overflows the address space, using default stack geometry",
                config.stack_size, config.stacks_per_slab
            );
            config.stack_size = defaults.stack_size;
            config.shadow_pages = defaults.shadow_pages;
            config.yellow_pages = defaults.yellow_pages;
            config.red_pages = defaults.red_pages;
            config.stacks_per_slab = defaults.stacks_per_slab;
        }
        config
    }

    /// Reject configurations that would break allocator or registry invariants
    pub fn validate(&self) -> FiberResult<()> {
        if self.stack_size == 0 {
            return Err(FiberError::InvalidConfig("stack_size must be positive".into()));
        }
        if self.stacks_per_slab == 0 {
            return Err(FiberError::InvalidConfig(
                "stacks_per_slab must be positive".into(),
            ));
        }
        if self.slab_bytes(os_page_size()).is_none() {
            return Err(FiberError::InvalidConfig(format!(
                "stack_size {} with {} stacks per slab overflows the address space",
                self.stack_size, self.stacks_per_slab
            )));
        }
        if !self.registry_shards.is_power_of_two() {
            return Err(FiberError::InvalidConfig(format!(
                "registry_shards must be a power of two, got {}",
                self.registry_shards
            )));
        }
        if self.max_stack_trace_depth == 0 {
            return Err(FiberError::InvalidConfig(
                "max_stack_trace_depth must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Pages reserved below the usable stack (shadow + yellow + red)
    pub fn reserved_pages(&self) -> usize {
        self.shadow_pages + self.yellow_pages + self.red_pages
    }

    /// Full bytes of one stack with its zones, page aligned; `None` on overflow
    pub fn stack_bytes(&self, page_size: usize) -> Option<usize> {
        let pages = self
            .shadow_pages
            .checked_add(self.yellow_pages)?
            .checked_add(self.red_pages)?;
        let zones = pages.checked_mul(page_size)?;
        checked_align_up(self.stack_size.checked_add(zones)?, page_size)
    }

    /// Bytes reserved for one slab; `None` on overflow
    pub fn slab_bytes(&self, page_size: usize) -> Option<usize> {
        let slab = self.stack_bytes(page_size)?.checked_mul(self.stacks_per_slab)?;
        checked_align_up(slab, page_size)
    }

    /// Pages protected at the low end of every fresh stack (yellow + red)
    pub fn guard_zone_pages(&self) -> usize {
        self.yellow_pages + self.red_pages
    }
}

/// Parse a value, returning `default` (with a warning) if it does not parse.
fn parse_value<T>(name: &str, value: Option<String>, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match value {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("{}='{}' is not a valid value, using default {}", name, raw, default);
                default
            }
        },
        None => default,
    }
}

/// Like `parse_value`, but zero is rejected too.
fn parse_positive(name: &str, value: Option<String>, default: usize) -> usize {
    match parse_value(name, value, default) {
        0 => {
            warn!("{}=0 is invalid, using default {}", name, default);
            default
        }
        v => v,
    }
}

/// Parse a boolean flag. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
fn parse_flag(name: &str, value: Option<String>, default: bool) -> bool {
    match value {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            "" => default,
            _ => {
                warn!("{}='{}' is not a boolean, using default {}", name, raw, default);
                default
            }
        },
        None => default,
    }
}

fn parse_shard_count(value: Option<String>) -> usize {
    let shards = parse_positive("FIBER_REGISTRY_SHARDS", value, DEFAULT_REGISTRY_SHARDS);
    if shards.is_power_of_two() {
        shards
    } else {
        warn!(
            "FIBER_REGISTRY_SHARDS={} is not a power of two, using default {}",
            shards, DEFAULT_REGISTRY_SHARDS
        );
        DEFAULT_REGISTRY_SHARDS
    }
}
