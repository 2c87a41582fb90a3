//! Execution context and store management.
//!
//! This module provides:
//! - [`Store`]: the mutable runtime state (linear memory, globals, fuel) of
//!   every instance created in it, borrowed from one [`Engine`]
//! - [`StoreContext`]: per-store host data (limits, fuel budget, metrics)
//! - [`CallMetrics`]: counters updated by every guest call

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};
use wasmtime::{StoreLimits, StoreLimitsBuilder, Trap};

use dsp_wasm_common::{BridgeConfig, ExecutionConfig, RuntimeError};

use crate::Engine;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Host data attached to every Wasmtime store.
pub struct StoreContext {
    limits: StoreLimits,

    /// Fuel granted to each call.
    max_fuel: u64,

    /// Call counters.
    pub metrics: CallMetrics,
}

/// Counters for guest calls made through a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallMetrics {
    /// Calls attempted, including instantiation start functions.
    pub calls: u64,

    /// Calls that ended in a trap or fuel exhaustion.
    pub traps: u64,

    /// Fuel consumed by the most recent call.
    pub last_fuel_consumed: u64,

    /// Fuel consumed by all calls.
    pub total_fuel_consumed: u64,
}

impl StoreContext {
    fn new(config: &ExecutionConfig) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .build();

        Self {
            limits,
            max_fuel: config.max_fuel,
            metrics: CallMetrics::default(),
        }
    }
}

/// A WebAssembly store bound to one engine.
///
/// Every call requires `&mut Store`, so a store can never be entered from two
/// places at once. Instances and functions remember the id of the store they
/// were created in and refuse to run against any other.
pub struct Store<'e> {
    inner: wasmtime::Store<StoreContext>,
    engine: &'e Engine,
    bridge: BridgeConfig,
    max_memory_mb: u32,
    id: u64,
}

impl<'e> Store<'e> {
    /// Create a store with the default bridge configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the fuel budget cannot be installed.
    pub fn new(engine: &'e Engine, config: &ExecutionConfig) -> Result<Self, RuntimeError> {
        Self::with_bridge(engine, config, BridgeConfig::default())
    }

    /// Create a store whose instances reserve bridge regions per `bridge`.
    ///
    /// # Errors
    ///
    /// Returns an error if the fuel budget cannot be installed.
    pub fn with_bridge(
        engine: &'e Engine,
        config: &ExecutionConfig,
        bridge: BridgeConfig,
    ) -> Result<Self, RuntimeError> {
        let mut inner = wasmtime::Store::new(engine.inner(), StoreContext::new(config));
        inner.limiter(|ctx| &mut ctx.limits);

        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        let mut store = Self {
            inner,
            engine,
            bridge,
            max_memory_mb: config.max_memory_mb,
            id,
        };
        store.refuel()?;

        debug!(
            store_id = id,
            engine_id = engine.id(),
            max_fuel = config.max_fuel,
            max_memory_mb = config.max_memory_mb,
            "Store created"
        );

        Ok(store)
    }

    /// Process-unique identifier of this store.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The engine this store belongs to.
    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    /// Bridge configuration applied to new instances.
    pub fn bridge(&self) -> &BridgeConfig {
        &self.bridge
    }

    /// Configured linear memory cap in megabytes.
    pub fn max_memory_mb(&self) -> u32 {
        self.max_memory_mb
    }

    /// Counters of calls made through this store.
    pub fn metrics(&self) -> &CallMetrics {
        &self.inner.data().metrics
    }

    /// Fuel left from the current budget, if metering is enabled.
    pub fn remaining_fuel(&self) -> Option<u64> {
        if self.engine.is_fuel_enabled() {
            self.inner.get_fuel().ok()
        } else {
            None
        }
    }

    pub(crate) fn inner(&self) -> &wasmtime::Store<StoreContext> {
        &self.inner
    }

    pub(crate) fn inner_mut(&mut self) -> &mut wasmtime::Store<StoreContext> {
        &mut self.inner
    }

    /// Reset the fuel budget before a call.
    fn refuel(&mut self) -> Result<(), RuntimeError> {
        if !self.engine.is_fuel_enabled() {
            return Ok(());
        }
        let budget = self.inner.data().max_fuel;
        self.inner
            .set_fuel(budget)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))
    }

    /// Prepare for a guest call.
    pub(crate) fn begin_call(&mut self) -> Result<(), RuntimeError> {
        self.inner.data_mut().metrics.calls += 1;
        self.refuel()
    }

    /// Record metrics for a finished guest call and map its error.
    pub(crate) fn finish_call<R>(&mut self, result: wasmtime::Result<R>) -> Result<R, RuntimeError> {
        self.record_fuel();
        result.map_err(|error| self.record_trap(&error))
    }

    /// Account the fuel used since the last refuel.
    pub(crate) fn record_fuel(&mut self) {
        let consumed = self
            .remaining_fuel()
            .map_or(0, |left| self.inner.data().max_fuel.saturating_sub(left));

        let metrics = &mut self.inner.data_mut().metrics;
        metrics.last_fuel_consumed = consumed;
        metrics.total_fuel_consumed = metrics.total_fuel_consumed.saturating_add(consumed);
    }

    /// Count a failed call and classify its error.
    pub(crate) fn record_trap(&mut self, error: &wasmtime::Error) -> RuntimeError {
        self.inner.data_mut().metrics.traps += 1;
        let error = map_trap(error);
        warn!(store_id = self.id, error = %error, "Guest call failed");
        error
    }
}

/// Classify a Wasmtime call error.
pub(crate) fn map_trap(error: &wasmtime::Error) -> RuntimeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => RuntimeError::FuelExhausted,
        Some(trap) => RuntimeError::trap(format!("{trap}")),
        None => RuntimeError::trap(error.to_string()),
    }
}

impl std::fmt::Debug for Store<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("engine_id", &self.engine.id())
            .field("metrics", self.metrics())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsp_wasm_common::EngineConfig;

    #[test]
    fn test_store_creation() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let store = Store::new(&engine, &ExecutionConfig::default());

        assert!(store.is_ok());
        let store = store.unwrap();
        assert_eq!(store.engine().id(), engine.id());
        assert_eq!(*store.metrics(), CallMetrics::default());
    }

    #[test]
    fn test_store_fuel() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let config = ExecutionConfig {
            max_fuel: 1000,
            ..Default::default()
        };

        let store = Store::new(&engine, &config).unwrap();
        assert_eq!(store.remaining_fuel(), Some(1000));
    }

    #[test]
    fn test_store_without_fuel_metering() {
        let engine = Engine::new(&EngineConfig {
            fuel_metering: false,
            ..Default::default()
        })
        .unwrap();

        let store = Store::new(&engine, &ExecutionConfig::default()).unwrap();
        assert_eq!(store.remaining_fuel(), None);
    }

    #[test]
    fn test_store_ids_are_unique() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let a = Store::new(&engine, &ExecutionConfig::default()).unwrap();
        let b = Store::new(&engine, &ExecutionConfig::default()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_begin_call_resets_fuel() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let config = ExecutionConfig {
            max_fuel: 500,
            ..Default::default()
        };
        let mut store = Store::new(&engine, &config).unwrap();

        store.inner_mut().set_fuel(10).unwrap();
        store.begin_call().unwrap();

        assert_eq!(store.remaining_fuel(), Some(500));
        assert_eq!(store.metrics().calls, 1);
    }

    #[test]
    fn test_map_trap() {
        let err = map_trap(&wasmtime::Error::new(Trap::OutOfFuel));
        assert!(matches!(err, RuntimeError::FuelExhausted));

        let err = map_trap(&wasmtime::Error::new(Trap::UnreachableCodeReached));
        assert!(err.is_trap());

        let err = map_trap(&wasmtime::Error::msg("host failure"));
        assert!(matches!(err, RuntimeError::Trap { ref message } if message == "host failure"));
    }
}
