//! Runtime context
//!
//! `FiberRuntime` owns the process-level state every fiber thread shares:
//! configuration, the stack pool, the registry and the compensation policy.
//! Hosts either build one explicitly and share it via `Arc` (tests do this
//! so each gets fresh state), or use the lazily created global instance
//! configured from `FIBER_*` environment variables.

use crate::fiber::Fiber;
use crate::linkage::{CompensationPolicy, NoCompensation};
use crate::registry::{ActiveUnits, FiberRegistry, find_lock_owner};
use crate::stack_pool::StackPool;
use fiber_core::vmem::{OsPages, PageProvider};
use fiber_core::{FiberConfig, FiberResult, fatal};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Shared state of the fiber runtime
pub struct FiberRuntime {
    config: FiberConfig,
    pool: Arc<StackPool>,
    registry: FiberRegistry,
    compensation: Box<dyn CompensationPolicy>,
    started: Instant,
}

/// Builder for runtimes with non-default collaborators
pub struct FiberRuntimeBuilder {
    config: FiberConfig,
    pages: Option<Box<dyn PageProvider>>,
    compensation: Option<Box<dyn CompensationPolicy>>,
}

impl FiberRuntimeBuilder {
    /// Page provider backing the stack pool
    pub fn pages(mut self, pages: Box<dyn PageProvider>) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn compensation(mut self, policy: Box<dyn CompensationPolicy>) -> Self {
        self.compensation = Some(policy);
        self
    }

    pub fn build(self) -> FiberResult<FiberRuntime> {
        self.config.validate()?;
        let pages = self.pages.unwrap_or_else(|| Box::new(OsPages));
        let pool = Arc::new(StackPool::with_pages(&self.config, pages));
        debug!(
            stack_size = pool.geometry().stack_size,
            shards = self.config.registry_shards,
            verify = self.config.verify_on_yield,
            "fiber runtime created"
        );
        Ok(FiberRuntime {
            registry: FiberRegistry::new(self.config.registry_shards),
            pool,
            compensation: self
                .compensation
                .unwrap_or_else(|| Box::new(NoCompensation)),
            config: self.config,
            started: Instant::now(),
        })
    }
}

static GLOBAL_RUNTIME: OnceLock<Arc<FiberRuntime>> = OnceLock::new();

impl FiberRuntime {
    pub fn new(config: FiberConfig) -> FiberResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: FiberConfig) -> FiberRuntimeBuilder {
        FiberRuntimeBuilder {
            config,
            pages: None,
            compensation: None,
        }
    }

    /// Process-wide runtime, created from the environment on first use
    pub fn global() -> &'static Arc<FiberRuntime> {
        GLOBAL_RUNTIME.get_or_init(|| {
            let runtime = FiberRuntime::new(FiberConfig::from_env())
                .unwrap_or_else(|e| fatal!("cannot create fiber runtime: {}", e));
            Arc::new(runtime)
        })
    }

    /// The process-wide runtime if something already created it
    pub fn try_global() -> Option<&'static Arc<FiberRuntime>> {
        GLOBAL_RUNTIME.get()
    }

    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<StackPool> {
        &self.pool
    }

    pub fn registry(&self) -> &FiberRegistry {
        &self.registry
    }

    pub fn compensation(&self) -> &dyn CompensationPolicy {
        self.compensation.as_ref()
    }

    /// Time since the runtime was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `find_lock_owner` with this runtime's registry and monitor mode
    pub fn find_lock_owner(
        &self,
        owner: usize,
        may_block: bool,
        units: &dyn ActiveUnits,
    ) -> Option<Arc<Fiber>> {
        find_lock_owner(
            &self.registry,
            owner,
            may_block,
            self.config.heavy_monitors,
            units,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiber_core::FiberError;
    use serial_test::serial;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = FiberConfig {
            registry_shards: 3,
            ..FiberConfig::default()
        };
        assert!(matches!(
            FiberRuntime::new(config),
            Err(FiberError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_rejects_overflowing_slab() {
        let config = FiberConfig {
            stacks_per_slab: usize::MAX / 1024,
            ..FiberConfig::default()
        };
        assert!(matches!(
            FiberRuntime::new(config),
            Err(FiberError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_runtime_is_empty() {
        let runtime = FiberRuntime::new(FiberConfig {
            registry_shards: 8,
            ..FiberConfig::default()
        })
        .unwrap();
        assert!(runtime.registry().is_empty());
        assert_eq!(runtime.registry().shard_count(), 8);
        assert_eq!(runtime.pool().stats().slabs, 0);
        assert!(runtime.compensation().try_compensate());
    }

    #[test]
    #[serial]
    fn test_global_is_shared() {
        let a = FiberRuntime::global();
        let b = FiberRuntime::global();
        assert!(Arc::ptr_eq(a, b));
        assert!(FiberRuntime::try_global().is_some());
    }
}
