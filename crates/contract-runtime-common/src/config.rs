//! Configuration structures for the contract runtime.
//!
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, compile cache, limits)
//! - [`ExecutionConfig`]: Per-call defaults (fee limit, timeout, host call fee)
//! - [`MarshalConfig`]: Argument and result marshalling ceilings
//! - [`PoolConfig`]: Warm instance pool sizing and idle eviction
//! - [`LifecycleConfig`]: Start/stop timeouts and background task intervals
//! - [`SecurityConfig`]: Module validation and host-call policy

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{RuntimeError, ValueType};

/// Size of one WebAssembly linear memory page.
pub const WASM_PAGE_SIZE: u64 = 65_536;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub marshal: MarshalConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub security: SecurityConfig,
}

impl RuntimeConfig {
    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let engine = &self.engine;
        if engine.max_memory_pages == 0 {
            return Err(RuntimeError::invalid_config(
                "engine.max_memory_pages must be greater than 0",
            ));
        }
        if engine.max_memory_pages > 65_536 {
            return Err(RuntimeError::invalid_config(
                "engine.max_memory_pages cannot exceed 65536 (4GiB)",
            ));
        }
        if engine.cache_size == 0 {
            return Err(RuntimeError::invalid_config(
                "engine.cache_size must be greater than 0",
            ));
        }
        if engine.max_module_size == 0 {
            return Err(RuntimeError::invalid_config(
                "engine.max_module_size must be greater than 0",
            ));
        }
        if self.execution.default_fee_limit == 0 {
            return Err(RuntimeError::invalid_config(
                "execution.default_fee_limit must be greater than 0",
            ));
        }
        if self.execution.timeout_ms == 0 {
            return Err(RuntimeError::invalid_config(
                "execution.timeout_ms must be greater than 0",
            ));
        }
        if self.marshal.max_params == 0 || self.marshal.max_results == 0 {
            return Err(RuntimeError::invalid_config(
                "marshal.max_params and marshal.max_results must be greater than 0",
            ));
        }
        if self.pool.max_per_module == 0 {
            return Err(RuntimeError::invalid_config(
                "pool.max_per_module must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.security.alert_threshold) {
            return Err(RuntimeError::invalid_config(
                "security.alert_threshold must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator for fast instance creation.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pooling allocator.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Hard ceiling on linear memory pages any instance may grow to.
    #[serde(default = "defaults::max_memory_pages")]
    pub max_memory_pages: u32,

    /// Number of compiled modules kept in the in-memory compile cache.
    #[serde(default = "defaults::cache_size")]
    pub cache_size: usize,

    /// Largest accepted bytecode blob in bytes.
    #[serde(default = "defaults::max_module_size")]
    pub max_module_size: usize,

    /// Enable epoch-based interruption.
    ///
    /// Long-running calls are interrupted once their timeout (in epoch
    /// ticks of one millisecond) has elapsed.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            max_memory_pages: defaults::max_memory_pages(),
            cache_size: defaults::cache_size(),
            max_module_size: defaults::max_module_size(),
            epoch_interruption: defaults::epoch_interruption(),
        }
    }
}

impl EngineConfig {
    /// Largest linear memory an instance may use, in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        u64::from(self.max_memory_pages) * WASM_PAGE_SIZE
    }
}

/// Per-call execution defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Fee limit used when none is supplied (and for instantiation).
    #[serde(default = "defaults::default_fee_limit")]
    pub default_fee_limit: u64,

    /// Execution timeout in milliseconds when the caller passes none.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Fee charged against the budget for every host call.
    #[serde(default = "defaults::host_call_fee")]
    pub host_call_fee: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_fee_limit: defaults::default_fee_limit(),
            timeout_ms: defaults::timeout_ms(),
            host_call_fee: defaults::host_call_fee(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Marshalling ceilings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarshalConfig {
    /// Maximum number of argument values per call.
    #[serde(default = "defaults::max_params")]
    pub max_params: usize,

    /// Maximum size in bytes of one string or byte-buffer argument.
    #[serde(default = "defaults::max_param_size")]
    pub max_param_size: usize,

    /// Maximum number of result values per call.
    #[serde(default = "defaults::max_results")]
    pub max_results: usize,
}

impl Default for MarshalConfig {
    fn default() -> Self {
        Self {
            max_params: defaults::max_params(),
            max_param_size: defaults::max_param_size(),
            max_results: defaults::max_results(),
        }
    }
}

/// Warm instance pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum idle instances kept per module.
    #[serde(default = "defaults::max_per_module")]
    pub max_per_module: usize,

    /// Idle time after which a pooled instance is destroyed, in milliseconds.
    #[serde(default = "defaults::max_idle_ms")]
    pub max_idle_ms: u64,

    /// Interval of the background cleanup sweep, in milliseconds.
    #[serde(default = "defaults::cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_module: defaults::max_per_module(),
            max_idle_ms: defaults::max_idle_ms(),
            cleanup_interval_ms: defaults::cleanup_interval_ms(),
        }
    }
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    #[serde(default = "defaults::start_timeout_ms")]
    pub start_timeout_ms: u64,

    #[serde(default = "defaults::stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Run registered health checks periodically while running.
    #[serde(default = "defaults::auto_health_check")]
    pub auto_health_check: bool,

    #[serde(default = "defaults::health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "defaults::stats_interval_ms")]
    pub stats_interval_ms: u64,

    /// Epoch tick period when epoch interruption is enabled.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: defaults::start_timeout_ms(),
            stop_timeout_ms: defaults::stop_timeout_ms(),
            auto_health_check: defaults::auto_health_check(),
            health_check_interval_ms: defaults::health_check_interval_ms(),
            stats_interval_ms: defaults::stats_interval_ms(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Expected shape of one host-call argument.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ParamRule {
    #[serde(rename = "type")]
    pub value_type: ValueType,

    #[serde(default = "defaults::required")]
    pub required: bool,

    /// Size ceiling in bytes for strings and byte buffers. `0` means none.
    #[serde(default)]
    pub max_size: usize,
}

impl ParamRule {
    pub fn required(value_type: ValueType) -> Self {
        Self {
            value_type,
            required: true,
            max_size: 0,
        }
    }

    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

/// Whether a host function may produce side effects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SideEffectPolicy {
    pub allowed: bool,

    #[serde(default)]
    pub notes: String,
}

/// Security policy applied to modules and host calls.
///
/// Replaced at runtime only through `SecurityManager::update_config`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Run the module validation rules.
    #[serde(default = "defaults::enable_validation")]
    pub enable_validation: bool,

    /// Run threat scoring on scan requests.
    #[serde(default = "defaults::enable_threat_detection")]
    pub enable_threat_detection: bool,

    /// Abort module validation on the first failing rule.
    #[serde(default = "defaults::strict_mode")]
    pub strict_mode: bool,

    /// Wall-clock ceiling for a single call, in milliseconds.
    #[serde(default = "defaults::max_execution_time_ms")]
    pub max_execution_time_ms: u64,

    /// Linear memory a call may end with, in bytes.
    #[serde(default = "defaults::max_memory_usage")]
    pub max_memory_usage: u64,

    /// Declared memory pages a module may ask for.
    #[serde(default = "defaults::max_memory_pages")]
    pub max_module_memory_pages: u32,

    /// Import namespaces a module may reference.
    #[serde(default = "defaults::allowed_imports")]
    pub allowed_imports: Vec<String>,

    /// When non-empty, only these host functions may be called.
    #[serde(default)]
    pub allowed_host_functions: Vec<String>,

    /// Host functions that may never be called. Wins over the allow-list.
    #[serde(default)]
    pub denied_host_functions: Vec<String>,

    /// Per-function argument schemas.
    #[serde(default)]
    pub host_param_schemas: BTreeMap<String, Vec<ParamRule>>,

    /// Require write calls to target a declared idempotent function.
    #[serde(default)]
    pub enforce_idempotency: bool,

    #[serde(default)]
    pub idempotent_functions: Vec<String>,

    /// Require write calls to have an explicit allowing side-effect policy.
    #[serde(default = "defaults::enforce_side_effects")]
    pub enforce_side_effects: bool,

    #[serde(default)]
    pub side_effect_policies: BTreeMap<String, SideEffectPolicy>,

    /// Threat score above which a pattern alerts and a scan is blocked.
    #[serde(default = "defaults::alert_threshold")]
    pub alert_threshold: f64,

    /// Number of recent security events retained for inspection.
    #[serde(default = "defaults::max_recent_events")]
    pub max_recent_events: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_validation: defaults::enable_validation(),
            enable_threat_detection: defaults::enable_threat_detection(),
            strict_mode: defaults::strict_mode(),
            max_execution_time_ms: defaults::max_execution_time_ms(),
            max_memory_usage: defaults::max_memory_usage(),
            max_module_memory_pages: defaults::max_memory_pages(),
            allowed_imports: defaults::allowed_imports(),
            allowed_host_functions: Vec::new(),
            denied_host_functions: Vec::new(),
            host_param_schemas: BTreeMap::new(),
            enforce_idempotency: false,
            idempotent_functions: Vec::new(),
            enforce_side_effects: defaults::enforce_side_effects(),
            side_effect_policies: BTreeMap::new(),
            alert_threshold: defaults::alert_threshold(),
            max_recent_events: defaults::max_recent_events(),
        }
    }
}

impl SecurityConfig {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    /// Allow `function` to produce side effects.
    #[must_use]
    pub fn allow_side_effects(mut self, function: impl Into<String>) -> Self {
        self.side_effect_policies.insert(
            function.into(),
            SideEffectPolicy {
                allowed: true,
                notes: String::new(),
            },
        );
        self
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn max_memory_pages() -> u32 {
        1024
    }

    pub const fn cache_size() -> usize {
        100
    }

    pub const fn max_module_size() -> usize {
        10 * 1024 * 1024
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn default_fee_limit() -> u64 {
        5_000_000
    }

    pub const fn timeout_ms() -> u64 {
        30_000
    }

    pub const fn host_call_fee() -> u64 {
        10
    }

    pub const fn max_params() -> usize {
        16
    }

    pub const fn max_param_size() -> usize {
        1024 * 1024
    }

    pub const fn max_results() -> usize {
        16
    }

    pub const fn max_per_module() -> usize {
        32
    }

    pub const fn max_idle_ms() -> u64 {
        5 * 60 * 1000
    }

    pub const fn cleanup_interval_ms() -> u64 {
        60 * 1000
    }

    pub const fn start_timeout_ms() -> u64 {
        30_000
    }

    pub const fn stop_timeout_ms() -> u64 {
        10_000
    }

    pub const fn auto_health_check() -> bool {
        true
    }

    pub const fn health_check_interval_ms() -> u64 {
        30_000
    }

    pub const fn stats_interval_ms() -> u64 {
        60_000
    }

    pub const fn epoch_tick_ms() -> u64 {
        1
    }

    pub const fn required() -> bool {
        true
    }

    pub const fn enable_validation() -> bool {
        true
    }

    pub const fn enable_threat_detection() -> bool {
        true
    }

    pub const fn strict_mode() -> bool {
        true
    }

    pub const fn max_execution_time_ms() -> u64 {
        30_000
    }

    pub const fn max_memory_usage() -> u64 {
        64 * 1024 * 1024
    }

    pub fn allowed_imports() -> Vec<String> {
        vec!["env".to_string()]
    }

    pub const fn enforce_side_effects() -> bool {
        true
    }

    pub const fn alert_threshold() -> f64 {
        0.7
    }

    pub const fn max_recent_events() -> usize {
        100
    }
}
