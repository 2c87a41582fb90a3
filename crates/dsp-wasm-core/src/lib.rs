//! WebAssembly embedding layer for real-time DSP.
//!
//! This crate provides ownership-scoped wrappers over Wasmtime:
//! - [`AllocatorContext`]: the host allocator all guest memory comes from
//! - [`Engine`]: compilation context, optionally bound to an allocator
//! - [`Store`]: execution state with fuel and memory limits
//! - [`Module`]: a validated binary module
//! - [`Instance`]: a module bound to a store, with its bridge region
//! - [`Func`]: a resolved export with the scalar call adapters
//! - [`bridge`]: the buffer bridge that runs a guest over a block of samples
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  AllocatorContext                       │
//! │  (Host pool, e.g. external SDRAM)                       │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Engine                            │
//! │  - Host memory creator, no guard pages                  │
//! │  - Fuel metering                                        │
//! └─────────────────────────────────────────────────────────┘
//!                 │ &'e Engine            │ &'e Engine
//!                 ▼                       ▼
//! ┌───────────────────────────┐ ┌───────────────────────────┐
//! │        Store<'e>          │ │        Module<'e>         │
//! │  - Linear memories        │ │  - Validated code         │
//! │  - Fuel, limits, metrics  │ │                           │
//! └───────────────────────────┘ └───────────────────────────┘
//!                 │                       │
//!                 └───────────┬───────────┘
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Instance  →  Func                       │
//! │  (Tagged with their store's id)                         │
//! │  - Bridge region: input | output                        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::with_allocator(&EngineConfig::default(), AllocatorContext::system())?;
//! let module = Module::from_bytes(&engine, &wasm)?;
//! let mut store = Store::new(&engine, &ExecutionConfig::default())?;
//! let instance = Instance::new(&mut store, &module)?;
//! let process = instance.get_func(&mut store, b"process")?;
//!
//! instance.process(&mut store, &process, &input, &mut output)?;
//! ```

pub mod allocator;
pub mod bridge;
pub mod engine;
pub mod func;
pub mod instance;
pub mod memory;
pub mod module;
pub mod store;

pub use allocator::{AllocatorContext, AllocatorStats, HostAllocator, LimitedAllocator, SystemAllocator};
pub use bridge::BufferRegion;
pub use engine::Engine;
pub use func::{CallShape, Func};
pub use instance::Instance;
pub use module::Module;
pub use store::{CallMetrics, Store, StoreContext};
