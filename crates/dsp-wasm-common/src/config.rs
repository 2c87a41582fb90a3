//! Configuration structures for dsp-wasm.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (fuel, pooling, optimization)
//! - [`ExecutionConfig`]: Per-store limits (fuel budget per call, memory cap)
//! - [`BridgeConfig`]: Buffer bridge region sizing

use serde::{Deserialize, Serialize};

/// Size of one WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Top-level runtime configuration.
///
/// It can be loaded from files (TOML, JSON) or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-store execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Buffer bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect code generation and how instance memory is obtained.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable fuel metering.
    ///
    /// When enabled, every call runs with the `max_fuel` budget from
    /// [`ExecutionConfig`], which bounds guest execution time.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Enable the pooling allocator.
    ///
    /// Pre-reserves `max_instances` slots of `instance_memory_mb` each.
    /// Cannot be combined with a host allocator, which must see every
    /// linear memory allocation itself.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Optimize generated code for speed rather than size.
    #[serde(default = "defaults::optimize_for_speed")]
    pub optimize_for_speed: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fuel_metering: defaults::fuel_metering(),
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            optimize_for_speed: defaults::optimize_for_speed(),
        }
    }
}

/// Per-store execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Fuel budget granted to every call.
    ///
    /// The budget is reset before each scalar or buffer call, so one audio
    /// block can never starve the next. Ignored when the engine has fuel
    /// metering disabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Maximum linear memory per store in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            max_memory_mb: defaults::max_memory_mb(),
        }
    }
}

impl ExecutionConfig {
    /// Get the memory cap in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Buffer bridge configuration.
///
/// The bridge reserves one region per instance, right after instantiation,
/// holding `max_frames` input floats followed by `max_frames` output floats.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Largest block, in frames, a single process call may carry.
    ///
    /// Zero disables the region entirely.
    #[serde(default = "defaults::max_frames")]
    pub max_frames: u32,

    /// Name of the memory export the region is reserved in.
    #[serde(default = "defaults::memory_export")]
    pub memory_export: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_frames: defaults::max_frames(),
            memory_export: defaults::memory_export(),
        }
    }
}

impl BridgeConfig {
    /// Bytes needed for the input and output areas together.
    pub fn region_bytes(&self) -> usize {
        2 * self.max_frames as usize * size_of::<f32>()
    }

    /// Whole WebAssembly pages needed to hold the region.
    pub fn region_pages(&self) -> u64 {
        self.region_bytes().div_ceil(WASM_PAGE_SIZE) as u64
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        16
    }

    pub const fn instance_memory_mb() -> u32 {
        4
    }

    pub const fn optimize_for_speed() -> bool {
        true
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn max_memory_mb() -> u32 {
        16
    }

    pub const fn max_frames() -> u32 {
        4096
    }

    pub fn memory_export() -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.fuel_metering);
        assert!(!config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 16);
        assert_eq!(config.engine.instance_memory_mb, 4);
        assert!(config.engine.optimize_for_speed);

        assert_eq!(config.execution.max_fuel, 10_000_000);
        assert_eq!(config.execution.max_memory_mb, 16);

        assert_eq!(config.bridge.max_frames, 4096);
        assert_eq!(config.bridge.memory_export, "memory");
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.bridge.max_frames, deserialized.bridge.max_frames);
        assert_eq!(config.execution.max_fuel, deserialized.execution.max_fuel);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"bridge": {"max_frames": 48}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.bridge.max_frames, 48);
        // Default values for unspecified fields
        assert_eq!(config.bridge.memory_export, "memory");
        assert!(config.engine.fuel_metering);
        assert_eq!(config.execution.max_fuel, 10_000_000);
    }

    #[test]
    fn test_region_sizing() {
        let bridge = BridgeConfig {
            max_frames: 48,
            ..Default::default()
        };
        assert_eq!(bridge.region_bytes(), 384);
        assert_eq!(bridge.region_pages(), 1);

        // 8192 frames * 2 * 4 bytes = 64 KiB, exactly one page
        let bridge = BridgeConfig {
            max_frames: 8192,
            ..Default::default()
        };
        assert_eq!(bridge.region_pages(), 1);

        let bridge = BridgeConfig {
            max_frames: 8193,
            ..Default::default()
        };
        assert_eq!(bridge.region_pages(), 2);

        let bridge = BridgeConfig {
            max_frames: 0,
            ..Default::default()
        };
        assert_eq!(bridge.region_bytes(), 0);
        assert_eq!(bridge.region_pages(), 0);
    }

    #[test]
    fn test_max_memory_bytes() {
        let config = ExecutionConfig {
            max_memory_mb: 2,
            ..Default::default()
        };
        assert_eq!(config.max_memory_bytes(), 2 * 1024 * 1024);
    }
}
