//! Instance lifecycle.
//!
//! Creating an [`Instance`] does three things:
//!
//! 1. Check that the module and store share an engine
//! 2. Instantiate through the engine's linker, running any start function
//!    under the store's fuel budget
//! 3. Reserve the buffer bridge region in the instance's memory
//!
//! The instance's runtime state lives in the store and is released with it.

use std::time::Instant;

use tracing::{info, instrument, warn};
use wasmtime::Trap;

use dsp_wasm_common::RuntimeError;

use crate::bridge::{self, BufferRegion, RegionState};
use crate::func::Func;
use crate::{Module, Store};

/// A module bound to a store.
pub struct Instance {
    instance: wasmtime::Instance,
    store_id: u64,
    region: RegionState,
}

impl Instance {
    /// Instantiate `module` into `store`.
    ///
    /// A failure to reserve the bridge region does not fail instantiation;
    /// it is reported by every later buffer call instead.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The module was compiled by a different engine
    /// - An import cannot be resolved (no host functions are linked)
    /// - The host allocator cannot back the instance's memory
    /// - The start function traps or runs out of fuel
    #[instrument(skip_all, fields(store_id = store.id(), module = %module.content_hash()))]
    pub fn new<'e>(store: &mut Store<'e>, module: &Module<'e>) -> Result<Self, RuntimeError> {
        let engine = store.engine();
        if engine.id() != module.engine().id() {
            return Err(RuntimeError::EngineMismatch);
        }

        let start = Instant::now();
        let failures_before = engine.allocation_failures();

        store.begin_call()?;
        let result = engine.linker().instantiate(store.inner_mut(), module.inner());

        let instance = match result {
            Ok(instance) => {
                store.record_fuel();
                instance
            }
            Err(e) if engine.allocation_failures() > failures_before => {
                warn!(error = %e, "Instantiation failed: host allocator exhausted");
                return Err(RuntimeError::allocation_failed(format!(
                    "Instance memory could not be allocated: {e}"
                )));
            }
            Err(e) if e.downcast_ref::<Trap>().is_some() => {
                store.record_fuel();
                return Err(store.record_trap(&e));
            }
            Err(e) => {
                warn!(error = %e, "Instantiation failed");
                return Err(RuntimeError::instantiation_failed(e.to_string()));
            }
        };

        let region = bridge::reserve(store, &instance);

        info!(
            duration_us = start.elapsed().as_micros(),
            bridge_frames = region.region().map_or(0, BufferRegion::capacity_frames),
            "Instance created"
        );

        Ok(Self {
            instance,
            store_id: store.id(),
            region,
        })
    }

    /// Look up an exported function by exact name.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ExportNotFound`] if no function export has
    /// exactly this name, or [`RuntimeError::StoreMismatch`] if `store` is not
    /// the store this instance lives in.
    pub fn get_func(&self, store: &mut Store<'_>, name: &[u8]) -> Result<Func, RuntimeError> {
        self.check_store(store)?;
        Func::resolve(store, &self.instance, name)
    }

    /// Run a buffer-processing function over `input`.
    ///
    /// See [`bridge::process`].
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be made or the guest traps.
    pub fn process(
        &self,
        store: &mut Store<'_>,
        func: &Func,
        input: &[f32],
        output: &mut [f32],
    ) -> Result<(), RuntimeError> {
        bridge::process(store, self, func, input, output)
    }

    /// Run a buffer-processing function over `buffer` in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be made or the guest traps.
    pub fn process_in_place(
        &self,
        store: &mut Store<'_>,
        func: &Func,
        buffer: &mut [f32],
    ) -> Result<(), RuntimeError> {
        bridge::process_in_place(store, self, func, buffer)
    }

    /// The reserved bridge region, if reservation succeeded.
    pub fn region(&self) -> Option<&BufferRegion> {
        self.region.region()
    }

    /// Id of the store this instance lives in.
    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    pub(crate) fn region_state(&self) -> &RegionState {
        &self.region
    }

    pub(crate) fn check_store(&self, store: &Store<'_>) -> Result<(), RuntimeError> {
        if self.store_id == store.id() {
            Ok(())
        } else {
            Err(RuntimeError::StoreMismatch)
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("store_id", &self.store_id)
            .field("region", &self.region())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use dsp_wasm_common::{EngineConfig, ExecutionConfig};

    #[test]
    fn test_engine_mismatch() {
        let engine_a = Engine::new(&EngineConfig::default()).unwrap();
        let engine_b = Engine::new(&EngineConfig::default()).unwrap();

        let module = Module::from_wat(&engine_a, "(module)").unwrap();
        let mut store = Store::new(&engine_b, &ExecutionConfig::default()).unwrap();

        let result = Instance::new(&mut store, &module);
        assert!(matches!(result, Err(RuntimeError::EngineMismatch)));
    }

    #[test]
    fn test_unresolved_import() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let module = Module::from_wat(
            &engine,
            r#"(module (import "env" "log" (func (param i32))))"#,
        )
        .unwrap();
        let mut store = Store::new(&engine, &ExecutionConfig::default()).unwrap();

        let result = Instance::new(&mut store, &module);
        assert!(matches!(result, Err(RuntimeError::InstantiationFailed { .. })));
    }

    #[test]
    fn test_start_function_trap() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let module = Module::from_wat(
            &engine,
            r#"(module (func $boom unreachable) (start $boom))"#,
        )
        .unwrap();
        let mut store = Store::new(&engine, &ExecutionConfig::default()).unwrap();

        let result = Instance::new(&mut store, &module);
        assert!(matches!(result, Err(RuntimeError::Trap { .. })));
        assert_eq!(store.metrics().traps, 1);
    }

    #[test]
    fn test_start_function_out_of_fuel() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let module = Module::from_wat(
            &engine,
            r#"(module (func $spin (loop $l (br $l))) (start $spin))"#,
        )
        .unwrap();
        let config = ExecutionConfig {
            max_fuel: 10_000,
            ..Default::default()
        };
        let mut store = Store::new(&engine, &config).unwrap();

        let result = Instance::new(&mut store, &module);
        assert!(matches!(result, Err(RuntimeError::FuelExhausted)));
    }

    #[test]
    fn test_same_module_into_two_stores() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let module = Module::from_wat(&engine, r#"(module (memory (export "memory") 1))"#).unwrap();

        let mut store_a = Store::new(&engine, &ExecutionConfig::default()).unwrap();
        let mut store_b = Store::new(&engine, &ExecutionConfig::default()).unwrap();

        let a = Instance::new(&mut store_a, &module).unwrap();
        let b = Instance::new(&mut store_b, &module).unwrap();

        assert_eq!(a.store_id(), store_a.id());
        assert_eq!(b.store_id(), store_b.id());
        assert!(a.region().is_some());
        assert!(b.region().is_some());
    }

    #[test]
    fn test_instance_debug() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let module = Module::from_wat(&engine, "(module)").unwrap();
        let mut store = Store::new(&engine, &ExecutionConfig::default()).unwrap();
        let instance = Instance::new(&mut store, &module).unwrap();

        let debug_str = format!("{instance:?}");
        assert!(debug_str.contains("Instance"));
        assert!(debug_str.contains("store_id"));
    }
}
