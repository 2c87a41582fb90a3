//! Common types, errors, and configuration for dsp-wasm.
//!
//! This crate provides shared functionality used across the dsp-wasm workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine, stores, and the buffer bridge
//! - TOML configuration file loading for the host harness

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{BridgeConfig, EngineConfig, ExecutionConfig, RuntimeConfig, WASM_PAGE_SIZE};
pub use config_file::{ConfigFile, ConfigFileError, HarnessConfig};
pub use error::RuntimeError;
