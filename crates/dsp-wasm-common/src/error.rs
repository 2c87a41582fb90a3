//! Error types for dsp-wasm.
//!
//! [`RuntimeError`] is the single error type of the embedding layer. Each
//! variant is one failure kind a caller can act on: allocation failure,
//! validation failure, trap, signature mismatch, and so on. The C surface
//! collapses all of them into its null / -1 sentinels.

use std::io;

use thiserror::Error;

/// Top-level embedding errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The host allocator could not satisfy a request.
    #[error("Allocation failed: {reason}")]
    AllocationFailed {
        /// What was being allocated.
        reason: String,
    },

    /// WebAssembly validation or compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Binding a module to a store failed (unresolved imports, bad segments).
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// No callable export with the given name exists.
    #[error("Export not found: {name}")]
    ExportNotFound {
        /// The requested export name, lossily decoded.
        name: String,
    },

    /// The function does not have the signature the call shape requires.
    #[error("Signature mismatch: expected {expected}, found {found}")]
    SignatureMismatch {
        /// The signature the call adapter needs.
        expected: &'static str,
        /// The signature the export actually has.
        found: String,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Execution exhausted the per-call fuel budget.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Linear memory growth exceeded the configured limit.
    #[error("Memory limit exceeded: {limit_mb}MB")]
    MemoryLimitExceeded {
        /// The memory limit in megabytes.
        limit_mb: u32,
    },

    /// The instance has no exported linear memory under the expected name.
    #[error("Instance exports no memory named '{name}'")]
    MissingMemory {
        /// The memory export name that was looked up.
        name: String,
    },

    /// The buffer bridge has no reserved region for this instance.
    #[error("Bridge region unavailable: {reason}")]
    RegionUnavailable {
        /// Why the region could not be reserved or used.
        reason: String,
    },

    /// The requested frame count does not fit the reserved region.
    #[error("Buffer of {requested} frames exceeds bridge capacity of {capacity} frames")]
    BufferTooLarge {
        /// Frames requested by the caller.
        requested: usize,
        /// Frames the region can hold.
        capacity: usize,
    },

    /// A call argument was rejected before reaching the guest.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Which argument was rejected and why.
        reason: String,
    },

    /// A handle was used with a store it does not belong to.
    #[error("Handle belongs to a different store")]
    StoreMismatch,

    /// A module was instantiated into a store of a different engine.
    #[error("Module and store belong to different engines")]
    EngineMismatch,

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// Create a new `AllocationFailed` error.
    pub fn allocation_failed(reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `ExportNotFound` error from raw name bytes.
    pub fn export_not_found(name: &[u8]) -> Self {
        Self::ExportNotFound {
            name: String::from_utf8_lossy(name).into_owned(),
        }
    }

    /// Create a new `SignatureMismatch` error.
    pub fn signature_mismatch(expected: &'static str, found: impl Into<String>) -> Self {
        Self::SignatureMismatch {
            expected,
            found: found.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `RegionUnavailable` error.
    pub fn region_unavailable(reason: impl Into<String>) -> Self {
        Self::RegionUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the host allocator ran out of memory.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::FuelExhausted
                | Self::MemoryLimitExceeded { .. }
                | Self::BufferTooLarge { .. }
                | Self::AllocationFailed { .. }
        )
    }

    /// Returns `true` if guest execution terminated abnormally.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Trap { .. } | Self::FuelExhausted)
    }
}
