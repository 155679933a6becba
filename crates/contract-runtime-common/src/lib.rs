//! Common types, errors, and configuration for contract-runtime.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error taxonomy using `thiserror`, plus per-component error statistics
//! - Configuration structures and the TOML configuration file
//! - The closed [`Value`] type exchanged with contracts
//! - [`ExecutionParams`], the external description of one call

pub mod config;
pub mod config_file;
pub mod error;
pub mod params;
pub mod value;

pub use config::{
    EngineConfig, ExecutionConfig, LifecycleConfig, MarshalConfig, ParamRule, PoolConfig,
    RuntimeConfig, SecurityConfig, SideEffectPolicy, WASM_PAGE_SIZE,
};
pub use config_file::{ConfigFile, ConfigFileError, LoggingConfig, ModuleEntry};
pub use error::{ErrorKind, ErrorStats, ErrorTracker, RuntimeError, Severity};
pub use params::ExecutionParams;
pub use value::{Value, ValueType};
