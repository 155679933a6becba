//! Configuration file structures for the contract runtime.
//!
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`LoggingConfig`]: Tracing subscriber settings
//! - [`ModuleEntry`]: Module precompiled at startup

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = false
/// cache_size = 50
///
/// [runtime.execution]
/// default_fee_limit = 1_000_000
///
/// [runtime.security]
/// denied_host_functions = ["block_height"]
///
/// [runtime.security.side_effect_policies.emit_event]
/// allowed = true
///
/// [logging]
/// filter = "info,contract_runtime=debug"
/// json = false
///
/// [[modules]]
/// id = "token"
/// path = "./contracts/token.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution, pool, lifecycle, security).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Modules to precompile at startup.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let file: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;

        file.runtime
            .validate()
            .map_err(|e| ConfigFileError::Invalid {
                message: e.to_string(),
            })?;

        Ok(file)
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "defaults::filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: defaults::filter(),
            json: false,
        }
    }
}

/// A module entry to compile at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Human-readable name used in logs.
    pub id: String,

    /// Path to the WebAssembly binary.
    pub path: String,
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

    /// Parsed values are out of range.
    #[error("Invalid config file: {message}")]
    Invalid { message: String },
}

mod defaults {
    pub fn filter() -> String {
        "info,contract_runtime=debug".to_string()
    }
}
