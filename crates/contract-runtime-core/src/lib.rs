//! Sandboxed contract execution engine built on Wasmtime.
//!
//! This crate provides:
//! - [`Vm`]: Compile cache, instantiation and metered calls
//! - [`ContractInstance`]: An isolated live instance with scratch memory
//! - [`Marshaller`] and [`ExecutionContext`]: Host values to native words
//! - [`SecurityManager`]: Module validation, host-call gate, limit checks and
//!   threat scoring
//! - [`InstancePool`]: Warm instances per module
//! - [`ContractExecutor`]: The end-to-end call pipeline
//! - [`PerformancePredictor`]: Rolling execution history and estimates
//! - [`LifecycleManager`]: Start/stop state machine and background tasks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   LifecycleManager                      │
//! │  - start/stop/restart/recover, hooks, health            │
//! │  - health, stats, pool cleanup and epoch tasks          │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ContractExecutor                       │
//! │  ExecutionContext → limits → compile → validate →       │
//! │  pool/instantiate → bind → call → limits → decode →     │
//! │  threat scan → warnings/metadata → predictor sample     │
//! └─────────────────────────────────────────────────────────┘
//!            │                    │                  │
//!            ▼                    ▼                  ▼
//! ┌───────────────────┐ ┌──────────────────┐ ┌───────────────────┐
//! │        Vm         │ │  InstancePool    │ │  SecurityManager  │
//! │  - WasmEngine     │ │  - LIFO per      │ │  - rules          │
//! │  - Linker         │ │    module hash   │ │  - host-call gate │
//! │  - compile cache  │ │  - idle cleanup  │ │  - limit checkers │
//! └───────────────────┘ └──────────────────┘ └───────────────────┘
//!            │
//!            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          ContractInstance (Store<InstanceState>)        │
//! │  - fuel metering (resource fee)                         │
//! │  - bounded linear memory, scratch heap cursor           │
//! │  - guest logs and events                                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod engine;
pub mod executor;
pub mod instance;
pub mod lifecycle;
pub mod marshal;
pub mod meter;
pub mod module;
pub mod pool;
pub mod predictor;
pub mod security;
pub mod store;
pub mod vm;

pub use context::{ExecutionContext, ResourceUsage};
pub use engine::WasmEngine;
pub use executor::{ContractExecutor, ExecutionOutcome, ExecutorStats};
pub use instance::ContractInstance;
pub use lifecycle::{
    HealthCheckResult, HealthChecker, HealthSignal, HealthReport, LifecycleManager,
    LifecycleState, LifecycleStats, StartHook, StopHook,
};
pub use marshal::{EncodedArgs, Marshaller, MemoryMappingPlan, MemorySegment};
pub use meter::ResourceMeter;
pub use module::{CompiledModule, ImportName, MemoryDecl};
pub use pool::{InstancePool, PoolStats};
pub use predictor::{ExecutionSample, PerformancePredictor, Prediction};
pub use security::{
    LimitChecker, LimitPhase, SecurityEvent, SecurityManager, SecurityStats, ThreatPattern,
    ThreatScan, ValidationReport, ValidationRule,
};
pub use store::{CallEnv, ContractEvent, InstanceState, LogEntry, LogLevel};
pub use vm::{CallLimits, CallOutcome, InstanceConfig, Vm};
