//! Wasmtime engine configuration and creation.
//!
//! The [`Engine`] is the root of the handle hierarchy. Stores and modules
//! borrow it, so it cannot be dropped while either is alive. An engine is
//! configured for:
//! - Synchronous execution (no async support, no epoch thread)
//! - Fuel metering so every call has a bounded instruction budget
//! - Either the host allocator or the pooling allocator for linear memory

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;
use wasmtime::{Config, InstanceAllocationStrategy, Linker, OptLevel, PoolingAllocationConfig};

use dsp_wasm_common::{EngineConfig, RuntimeError};

use crate::allocator::AllocatorContext;
use crate::memory::HostMemoryCreator;
use crate::store::StoreContext;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// WebAssembly engine wrapper.
///
/// Holds the compiled-code context and the linker used for instantiation.
/// No host functions are defined on the linker: modules that import anything
/// fail to instantiate.
///
/// # Example
///
/// ```ignore
/// use dsp_wasm_common::EngineConfig;
/// use dsp_wasm_core::{AllocatorContext, Engine};
///
/// let engine = Engine::with_allocator(&EngineConfig::default(), AllocatorContext::system())?;
/// ```
pub struct Engine {
    engine: wasmtime::Engine,
    linker: Linker<StoreContext>,
    config: EngineConfig,
    allocator: Option<AllocatorContext>,
    id: u64,
}

impl Engine {
    /// Create an engine whose linear memories come from the default
    /// Wasmtime allocator (or the pooling allocator, if configured).
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        Self::build(config, None)
    }

    /// Create an engine whose linear memories are all drawn from `allocator`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pooling allocator is also requested, or if the
    /// Wasmtime configuration is invalid.
    pub fn with_allocator(
        config: &EngineConfig,
        allocator: AllocatorContext,
    ) -> Result<Self, RuntimeError> {
        Self::build(config, Some(allocator))
    }

    fn build(config: &EngineConfig, allocator: Option<AllocatorContext>) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.consume_fuel(config.fuel_metering);

        wasmtime_config.cranelift_opt_level(if config.optimize_for_speed {
            OptLevel::Speed
        } else {
            OptLevel::SpeedAndSize
        });

        if let Some(ref allocator) = allocator {
            if config.pooling_allocator {
                return Err(RuntimeError::invalid_config(
                    "pooling allocator cannot be combined with a host allocator",
                ));
            }

            // Memories are plain host blocks: no reservation, no guard
            // pages, explicit bounds checks, no copy-on-write images.
            wasmtime_config
                .with_host_memory(Arc::new(HostMemoryCreator::new(allocator.clone())))
                .memory_reservation(0)
                .memory_reservation_for_growth(0)
                .memory_guard_size(0)
                .guard_before_linear_memory(false)
                .memory_init_cow(false);

            info!("Host allocator installed for linear memory");
        } else if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = wasmtime::Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;
        let linker = Linker::new(&engine);
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);

        info!(
            engine_id = id,
            fuel_metering = config.fuel_metering,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine,
            linker,
            config: config.clone(),
            allocator,
            id,
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &wasmtime::Engine {
        &self.engine
    }

    pub(crate) fn linker(&self) -> &Linker<StoreContext> {
        &self.linker
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The allocator linear memories are drawn from, if one was installed.
    pub fn allocator(&self) -> Option<&AllocatorContext> {
        self.allocator.as_ref()
    }

    /// Process-unique identifier of this engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if calls run under a fuel budget.
    pub fn is_fuel_enabled(&self) -> bool {
        self.config.fuel_metering
    }

    /// Failed host allocations so far; zero without a host allocator.
    pub(crate) fn allocation_failures(&self) -> usize {
        self.allocator.as_ref().map_or(0, AllocatorContext::failures)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("fuel_metering", &self.config.fuel_metering)
            .field("host_allocator", &self.allocator.is_some())
            .field("pooling_allocator", &self.config.pooling_allocator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation_default() {
        let engine = Engine::new(&EngineConfig::default());

        assert!(engine.is_ok());
        let engine = engine.unwrap();
        assert!(engine.is_fuel_enabled());
        assert!(engine.allocator().is_none());
    }

    #[test]
    fn test_engine_creation_with_allocator() {
        let engine = Engine::with_allocator(&EngineConfig::default(), AllocatorContext::system());

        assert!(engine.is_ok());
        let engine = engine.unwrap();
        assert!(engine.allocator().is_some());
        assert_eq!(engine.allocation_failures(), 0);
    }

    #[test]
    fn test_engine_creation_pooling() {
        let config = EngineConfig {
            pooling_allocator: true,
            max_instances: 2,
            instance_memory_mb: 1,
            ..Default::default()
        };
        assert!(Engine::new(&config).is_ok());
    }

    #[test]
    fn test_pooling_with_host_allocator_rejected() {
        let config = EngineConfig {
            pooling_allocator: true,
            ..Default::default()
        };
        let result = Engine::with_allocator(&config, AllocatorContext::system());

        assert!(matches!(result, Err(RuntimeError::InvalidConfig { .. })));
    }

    #[test]
    fn test_engine_ids_are_unique() {
        let a = Engine::new(&EngineConfig::default()).unwrap();
        let b = Engine::new(&EngineConfig::default()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_engine_debug() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("Engine"));
        assert!(debug_str.contains("fuel_metering"));
    }
}
