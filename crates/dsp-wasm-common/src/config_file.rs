//! Configuration file structures for dsp-wasm.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`HarnessConfig`]: Settings for the host-side processing harness

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// fuel_metering = true
///
/// [runtime.execution]
/// max_fuel = 1_000_000
/// max_memory_mb = 8
///
/// [runtime.bridge]
/// max_frames = 256
///
/// [harness]
/// export = "process"
/// block_size = 48
/// blocks = 1000
/// sample_rate = 48000
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution, bridge settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Harness configuration.
    #[serde(default)]
    pub harness: HarnessConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "Configuration file loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error if the harness block size does not fit the bridge.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        if self.harness.block_size > self.runtime.bridge.max_frames {
            return Err(ConfigFileError::Invalid {
                message: format!(
                    "harness.block_size ({}) exceeds runtime.bridge.max_frames ({})",
                    self.harness.block_size, self.runtime.bridge.max_frames
                ),
            });
        }
        if self.harness.sample_rate == 0 {
            return Err(ConfigFileError::Invalid {
                message: "harness.sample_rate must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Host harness settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Export name of the buffer-processing function.
    #[serde(default = "defaults::export")]
    pub export: String,

    /// Frames per processed block.
    #[serde(default = "defaults::block_size")]
    pub block_size: u32,

    /// Number of blocks to process.
    #[serde(default = "defaults::blocks")]
    pub blocks: u32,

    /// Sample rate used to derive the real-time deadline per block.
    #[serde(default = "defaults::sample_rate")]
    pub sample_rate: u32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            export: defaults::export(),
            block_size: defaults::block_size(),
            blocks: defaults::blocks(),
            sample_rate: defaults::sample_rate(),
        }
    }
}

impl HarnessConfig {
    /// Wall-clock budget of one block in microseconds.
    pub fn block_deadline_us(&self) -> u64 {
        u64::from(self.block_size) * 1_000_000 / u64::from(self.sample_rate.max(1))
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// The file parsed but its values are inconsistent.
    #[error("Invalid config file: {message}")]
    Invalid { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn export() -> String {
        "process".to_string()
    }

    pub const fn block_size() -> u32 {
        48
    }

    pub const fn blocks() -> u32 {
        1000
    }

    pub const fn sample_rate() -> u32 {
        48_000
    }
}
