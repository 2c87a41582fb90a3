//! C ABI for the dsp-wasm embedding layer.
//!
//! This crate exposes `extern "C"` functions over [`dsp_wasm_core`] for
//! firmware written in C or C++. The matching header is
//! `include/dsp_wasm.h`.
//!
//! # Symbol prefix
//!
//! - Functions: `dspwasm_*`
//! - Types: `DspWasm*`
//!
//! # Error contract
//!
//! No function aborts or unwinds. Constructors return null, the buffer call
//! returns -1, and the scalar adapters return 0 on failure. The typed error
//! behind every sentinel is logged through `tracing`.
//!
//! # Thread safety
//!
//! **NOT thread-safe.** All calls touching one store (including calls on
//! different instances in it) must be serialized by the caller, which is the
//! natural result of driving everything from the audio callback.
//!
//! # Example (C)
//!
//! ```c
//! DspWasmEngine *engine = dspwasm_engine_new();
//! DspWasmStore *store = dspwasm_store_new(engine);
//! DspWasmModule *module = dspwasm_module_new(engine, wasm, wasm_len);
//! DspWasmInstance *instance = dspwasm_instance_new(store, module);
//! DspWasmFunc *process = dspwasm_instance_get_func(store, instance, "process", 7);
//!
//! if (dspwasm_func_call_buffer_process(store, instance, process, in, out, 48) != 0) {
//!     /* fall back to bypass */
//! }
//!
//! dspwasm_func_delete(process);
//! dspwasm_instance_delete(instance);
//! dspwasm_module_delete(module);
//! dspwasm_store_delete(store);
//! dspwasm_engine_delete(engine);
//! ```

pub mod alloc;
pub mod call;
pub mod lifecycle;

mod guard;
mod registry;

pub use alloc::{DspWasmAllocFn, DspWasmAllocatorHooks, DspWasmFreeFn, HookAllocator};
pub use call::{
    dspwasm_func_call_buffer_process, dspwasm_func_call_f32_to_f32,
    dspwasm_func_call_i32_i32_to_i32,
};
pub use lifecycle::{
    DspWasmEngine, DspWasmFunc, DspWasmInstance, DspWasmModule, DspWasmStore, dspwasm_engine_delete,
    dspwasm_engine_new, dspwasm_engine_new_with_allocator, dspwasm_func_delete,
    dspwasm_instance_delete, dspwasm_instance_get_func, dspwasm_instance_new,
    dspwasm_module_delete, dspwasm_module_new, dspwasm_store_delete, dspwasm_store_new,
};
