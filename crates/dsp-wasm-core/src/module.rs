//! WebAssembly module compilation.
//!
//! This module provides [`Module`], a validated, immutable WebAssembly binary
//! bound to one [`Engine`]. Modules hold no execution state and may be
//! instantiated into any number of stores of the same engine.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};

use dsp_wasm_common::RuntimeError;

use crate::Engine;

/// Binary format version accepted by [`Module::from_bytes`].
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// A compiled WebAssembly module.
pub struct Module<'e> {
    module: wasmtime::Module,
    engine: &'e Engine,

    /// 64-bit hash of the original bytes, for logs.
    content_hash: String,
}

impl<'e> Module<'e> {
    /// Validate and compile a binary WebAssembly module.
    ///
    /// The text format is rejected here even though the engine could parse
    /// it; only binary modules cross the embedding boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is not a WebAssembly binary header, or
    /// if validation or compilation fails.
    #[instrument(skip(engine, bytes), fields(engine_id = engine.id(), bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &'e Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        validate_wasm_header(bytes)?;
        Self::compile(engine, bytes)
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is for tests and the host harness.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or compilation fails.
    #[instrument(skip(engine, wat), fields(engine_id = engine.id()))]
    pub fn from_wat(engine: &'e Engine, wat: &str) -> Result<Self, RuntimeError> {
        Self::compile(engine, wat.as_bytes())
    }

    fn compile(engine: &'e Engine, source: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = wasmtime::Module::new(engine.inner(), source).map_err(|e| {
            RuntimeError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(source);

        info!(
            content_hash = %content_hash,
            exports = module.exports().len(),
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Self {
            module,
            engine,
            content_hash,
        })
    }

    /// Get the content hash of the original bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// The engine this module was compiled by.
    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    /// Names of every export, in declaration order.
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.module.exports().map(|export| export.name())
    }

    pub(crate) fn inner(&self) -> &wasmtime::Module {
        &self.module
    }
}

impl std::fmt::Debug for Module<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("content_hash", &self.content_hash)
            .field("engine_id", &self.engine.id())
            .finish_non_exhaustive()
    }
}

/// Validate the WebAssembly binary header (magic number and version).
fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
    if bytes.len() < 8 {
        return Err(RuntimeError::compilation_failed(
            "Invalid Wasm: file too small",
        ));
    }

    if &bytes[0..4] != b"\0asm" {
        return Err(RuntimeError::compilation_failed(
            "Invalid Wasm: bad magic number",
        ));
    }

    if bytes[4..8] != WASM_VERSION {
        return Err(RuntimeError::compilation_failed(
            "Invalid Wasm: unsupported binary version",
        ));
    }

    Ok(())
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
