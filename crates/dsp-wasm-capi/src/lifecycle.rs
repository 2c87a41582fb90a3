//! Handle construction and destruction.
//!
//! Constructors return null on any failure; destructors ignore null, unknown,
//! and already-deleted handles. The typed error behind a null is logged.

use std::ptr;
use std::slice;

use dsp_wasm_common::{EngineConfig, ExecutionConfig};
use dsp_wasm_core::{AllocatorContext, Engine, Func, Instance, Module, Store};
use tracing::warn;

use crate::alloc::{DspWasmAllocatorHooks, HookAllocator};
use crate::guard::{guard, report};
use crate::registry::{self, Kind};

/// Opaque engine handle.
pub struct DspWasmEngine {
    pub(crate) engine: Engine,
}

/// Opaque store handle.
///
/// The `'static` borrow of the engine is upheld by the registry, which
/// refuses to delete an engine while any store still references it.
pub struct DspWasmStore {
    pub(crate) store: Store<'static>,
}

/// Opaque module handle. Borrows its engine like [`DspWasmStore`].
pub struct DspWasmModule {
    pub(crate) module: Module<'static>,
}

/// Opaque instance handle.
pub struct DspWasmInstance {
    pub(crate) instance: Instance,
}

/// Opaque function handle.
pub struct DspWasmFunc {
    pub(crate) func: Func,
}

fn engine_config() -> EngineConfig {
    EngineConfig::default()
}

/// Create an engine.
///
/// With the `host-alloc` feature, guest memory comes from the link-time
/// `dspwasm_host_alloc` hook; otherwise from the process heap.
///
/// # Safety
///
/// Always safe to call; `unsafe` for uniformity with the rest of the API.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_engine_new() -> *mut DspWasmEngine {
    guard("dspwasm_engine_new", ptr::null_mut(), || {
        #[cfg(feature = "host-alloc")]
        let result = Engine::with_allocator(
            &engine_config(),
            AllocatorContext::new(crate::alloc::LinkAllocator),
        );
        #[cfg(not(feature = "host-alloc"))]
        let result = Engine::new(&engine_config());

        report("dspwasm_engine_new", result).map_or(ptr::null_mut(), |engine| {
            registry::register(Box::new(DspWasmEngine { engine }), Kind::Engine, None)
        })
    })
}

/// Create an engine whose guest memory comes from `hooks`.
///
/// # Safety
///
/// `hooks` must be null or point to a valid [`DspWasmAllocatorHooks`]. The
/// callbacks and user data must stay valid until the engine and every store
/// created from it are deleted.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_engine_new_with_allocator(
    hooks: *const DspWasmAllocatorHooks,
) -> *mut DspWasmEngine {
    guard("dspwasm_engine_new_with_allocator", ptr::null_mut(), || {
        // SAFETY: null or valid per the contract.
        let Some(hooks) = (unsafe { hooks.as_ref() }) else {
            warn!("dspwasm_engine_new_with_allocator: null hooks");
            return ptr::null_mut();
        };
        let Some(allocator) = HookAllocator::from_hooks(hooks) else {
            warn!("dspwasm_engine_new_with_allocator: missing allocate or free hook");
            return ptr::null_mut();
        };

        let result = Engine::with_allocator(&engine_config(), AllocatorContext::new(allocator));
        report("dspwasm_engine_new_with_allocator", result).map_or(ptr::null_mut(), |engine| {
            registry::register(Box::new(DspWasmEngine { engine }), Kind::Engine, None)
        })
    })
}

/// Delete an engine. Refused (and logged) while stores or modules created
/// from it are still live.
///
/// # Safety
///
/// `engine` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_engine_delete(engine: *mut DspWasmEngine) {
    guard("dspwasm_engine_delete", (), || {
        drop(registry::release(engine, Kind::Engine));
    });
}

/// Create a store bound to `engine`.
///
/// # Safety
///
/// `engine` must not be deleted concurrently.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_store_new(engine: *const DspWasmEngine) -> *mut DspWasmStore {
    guard("dspwasm_store_new", ptr::null_mut(), || {
        // SAFETY: engines are only read after creation.
        let Some(handle): Option<&'static DspWasmEngine> =
            (unsafe { registry::get(engine, Kind::Engine) })
        else {
            warn!("dspwasm_store_new: invalid engine handle");
            return ptr::null_mut();
        };

        let result = Store::new(&handle.engine, &ExecutionConfig::default());
        report("dspwasm_store_new", result).map_or(ptr::null_mut(), |store| {
            registry::register(
                Box::new(DspWasmStore { store }),
                Kind::Store,
                Some(engine as usize),
            )
        })
    })
}

/// Delete a store, releasing every instance's memory inside it.
///
/// # Safety
///
/// `store` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_store_delete(store: *mut DspWasmStore) {
    guard("dspwasm_store_delete", (), || {
        drop(registry::release(store, Kind::Store));
    });
}

/// Validate and compile a binary module.
///
/// # Safety
///
/// `bytes` must be null or valid for reads of `len` bytes.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_module_new(
    engine: *const DspWasmEngine,
    bytes: *const u8,
    len: usize,
) -> *mut DspWasmModule {
    guard("dspwasm_module_new", ptr::null_mut(), || {
        // SAFETY: engines are only read after creation.
        let Some(handle): Option<&'static DspWasmEngine> =
            (unsafe { registry::get(engine, Kind::Engine) })
        else {
            warn!("dspwasm_module_new: invalid engine handle");
            return ptr::null_mut();
        };
        if bytes.is_null() {
            warn!("dspwasm_module_new: null bytes");
            return ptr::null_mut();
        }

        // SAFETY: non-null and valid for `len` bytes per the contract.
        let bytes = unsafe { slice::from_raw_parts(bytes, len) };
        let result = Module::from_bytes(&handle.engine, bytes);
        report("dspwasm_module_new", result).map_or(ptr::null_mut(), |module| {
            registry::register(
                Box::new(DspWasmModule { module }),
                Kind::Module,
                Some(engine as usize),
            )
        })
    })
}

/// Delete a module. Instances created from it stay usable.
///
/// # Safety
///
/// `module` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_module_delete(module: *mut DspWasmModule) {
    guard("dspwasm_module_delete", (), || {
        drop(registry::release(module, Kind::Module));
    });
}

/// Instantiate `module` into `store` and reserve its bridge region.
///
/// # Safety
///
/// `store` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_instance_new(
    store: *mut DspWasmStore,
    module: *const DspWasmModule,
) -> *mut DspWasmInstance {
    guard("dspwasm_instance_new", ptr::null_mut(), || {
        // SAFETY: distinct kinds, so the two handles never alias.
        let (Some(store), Some(module)) = (unsafe {
            (
                registry::get_mut(store, Kind::Store),
                registry::get(module, Kind::Module),
            )
        }) else {
            warn!("dspwasm_instance_new: invalid store or module handle");
            return ptr::null_mut();
        };

        let result = Instance::new(&mut store.store, &module.module);
        report("dspwasm_instance_new", result).map_or(ptr::null_mut(), |instance| {
            registry::register(Box::new(DspWasmInstance { instance }), Kind::Instance, None)
        })
    })
}

/// Delete an instance handle. Its state lives in the store until the store
/// is deleted.
///
/// # Safety
///
/// `instance` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_instance_delete(instance: *mut DspWasmInstance) {
    guard("dspwasm_instance_delete", (), || {
        drop(registry::release(instance, Kind::Instance));
    });
}

/// Look up an exported function by exact name.
///
/// # Safety
///
/// `name` must be null or valid for reads of `name_len` bytes.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_instance_get_func(
    store: *mut DspWasmStore,
    instance: *const DspWasmInstance,
    name: *const u8,
    name_len: usize,
) -> *mut DspWasmFunc {
    guard("dspwasm_instance_get_func", ptr::null_mut(), || {
        // SAFETY: distinct kinds, so the two handles never alias.
        let (Some(store), Some(instance)) = (unsafe {
            (
                registry::get_mut(store, Kind::Store),
                registry::get(instance, Kind::Instance),
            )
        }) else {
            warn!("dspwasm_instance_get_func: invalid store or instance handle");
            return ptr::null_mut();
        };
        if name.is_null() {
            warn!("dspwasm_instance_get_func: null name");
            return ptr::null_mut();
        }

        // SAFETY: non-null and valid for `name_len` bytes per the contract.
        let name = unsafe { slice::from_raw_parts(name, name_len) };
        let result = instance.instance.get_func(&mut store.store, name);
        report("dspwasm_instance_get_func", result).map_or(ptr::null_mut(), |func| {
            registry::register(Box::new(DspWasmFunc { func }), Kind::Func, None)
        })
    })
}

/// Delete a function handle. Only the reference is released.
///
/// # Safety
///
/// `func` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_func_delete(func: *mut DspWasmFunc) {
    guard("dspwasm_func_delete", (), || {
        drop(registry::release(func, Kind::Func));
    });
}
