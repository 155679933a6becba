//! End-to-end contract execution.
//!
//! [`ContractExecutor::execute`] runs one call through the full pipeline:
//!
//! 1. Build the [`ExecutionContext`] (validate params, encode args)
//! 2. Pre-execution limit checks
//! 3. Compile the payload (cached by content hash)
//! 4. Module validation
//! 5. Take a warm instance from the pool, or instantiate a new one
//! 6. Bind buffer arguments into the instance's scratch memory
//! 7. Call the entry point under the fee budget and deadline
//! 8. Post-execution limit checks
//! 9. Decode results
//! 10. Threat scan over the call's usage indicators
//! 11. Usage warnings, result metadata and a predictor sample
//!
//! An instance goes back to the pool only after a successful call; any
//! failure destroys it, since a trapped store may hold partial state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};

use contract_runtime_common::{ErrorTracker, ExecutionParams, RuntimeError, Value};

use crate::context::ExecutionContext;
use crate::instance::ContractInstance;
use crate::marshal::Marshaller;
use crate::pool::InstancePool;
use crate::predictor::{ExecutionSample, PerformancePredictor, Prediction};
use crate::security::{SecurityManager, ThreatScan, ValidationReport};
use crate::store::{CallEnv, ContractEvent, LogEntry};
use crate::vm::{CallLimits, InstanceConfig, Vm};
use crate::CompiledModule;

/// Usage ratio at which a call gets a warning.
const WARN_RATIO: f64 = 0.9;

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub values: Vec<Value>,
    pub resource_used: u64,
    /// Linear memory size in bytes when the call returned.
    pub memory_used: u64,
    pub logs: Vec<LogEntry>,
    pub events: Vec<ContractEvent>,
    pub duration: Duration,
    pub instance_id: String,
    pub module_id: String,
    /// Limits the call came close to, tolerated validation failures and
    /// threat alerts.
    pub warnings: Vec<String>,
    /// Utilization ratios, host-call count, pool reuse and threat score.
    pub metadata: BTreeMap<String, String>,
}

/// What a finished call used.
struct CallReport {
    values: Vec<Value>,
    resource_used: u64,
    duration: Duration,
    timeout: Duration,
    memory_before: usize,
    host_calls: u64,
}

/// Executor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_resource_used: u64,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_resource_used: AtomicU64,
}

/// Runs contract calls on a shared [`Vm`] and [`InstancePool`].
pub struct ContractExecutor {
    vm: Arc<Vm>,
    pool: Arc<InstancePool>,
    marshaller: Marshaller,
    errors: Arc<ErrorTracker>,
    counters: Counters,
    predictor: PerformancePredictor,
    closed: AtomicBool,
}

impl ContractExecutor {
    pub fn new(vm: Arc<Vm>, pool: Arc<InstancePool>, marshaller: Marshaller) -> Self {
        Self {
            vm,
            pool,
            marshaller,
            errors: Arc::new(ErrorTracker::new()),
            counters: Counters::default(),
            predictor: PerformancePredictor::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        self.vm.security()
    }

    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    pub fn predictor(&self) -> &PerformancePredictor {
        &self.predictor
    }

    /// Estimate for the next execution from recent history.
    pub fn predict(&self) -> Prediction {
        self.predictor.predict()
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            executions: self.counters.executions.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            total_resource_used: self.counters.total_resource_used.load(Ordering::Relaxed),
        }
    }

    /// Execute `params.entry` of the module in `params.payload`.
    #[instrument(skip(self, params), fields(entry = %params.entry))]
    pub async fn execute(&self, params: &ExecutionParams) -> Result<ExecutionOutcome, RuntimeError> {
        let start = Instant::now();
        let result = self.run(params, None).await;
        self.finish(result, start)
    }

    /// Execute against an already compiled module; `params.payload` is
    /// ignored.
    #[instrument(skip(self, module, params), fields(entry = %params.entry))]
    pub async fn execute_module(
        &self,
        module: Arc<CompiledModule>,
        params: &ExecutionParams,
    ) -> Result<ExecutionOutcome, RuntimeError> {
        let start = Instant::now();
        let result = self.run(params, Some(module)).await;
        self.finish(result, start)
    }

    async fn run(
        &self,
        params: &ExecutionParams,
        module: Option<Arc<CompiledModule>>,
    ) -> Result<ExecutionOutcome, RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::closed("executor"));
        }
        self.counters.executions.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let security = self.vm.security();
        let mut ctx = ExecutionContext::build(params, &self.marshaller, self.vm.execution_config())?;
        security.check_execution_limits(&ctx)?;

        let module = match module {
            Some(module) => module,
            None => self.vm.compile(&params.payload)?,
        };
        for hash in self.vm.take_evicted() {
            self.pool.evict(&hash);
        }

        let validation = security.validate_module(&module)?;
        if !validation.passed() {
            warn!(
                module_id = %module.content_hash(),
                failures = validation.failures.len(),
                "Module validation failures tolerated in permissive mode"
            );
        }

        let pooled = self.pool.get(module.content_hash(), ctx.memory_pages());
        let reused = pooled.is_some();
        let mut instance = match pooled {
            Some(instance) => instance,
            None => {
                let config = InstanceConfig {
                    memory_limit_pages: ctx.memory_pages(),
                    table_limit: None,
                };
                self.vm.instantiate(&module, &config).await?
            }
        };

        instance.reset_scratch();
        if let Some(state) = instance.state_mut() {
            state.reset_call_output();
            state.env = CallEnv {
                caller: ctx.caller().to_string(),
                contract_address: ctx.contract_address().to_string(),
                block_height: params.block_height,
            };
        }

        let report = match self.call(&mut ctx, &mut instance).await {
            Ok(report) => report,
            Err(err) => {
                instance.close();
                return Err(err.with_context("module_id", module.content_hash()));
            }
        };

        let indicators = threat_indicators(&ctx, &validation, &report, instance.memory_size());
        let scan = security.detect_threats(module.content_hash(), &indicators);
        if let Some(scan) = scan.as_ref().filter(|scan| scan.blocked) {
            instance.close();
            return Err(threat_blocked(scan).with_context("module_id", module.content_hash()));
        }

        let mut warnings = usage_warnings(&ctx, &report);
        if !validation.passed() {
            warnings.push(format!(
                "{} module validation failures tolerated",
                validation.failures.len()
            ));
        }
        if let Some(scan) = &scan {
            warnings.extend(
                scan.alerts
                    .iter()
                    .map(|pattern| format!("threat pattern {pattern} alerted")),
            );
        }

        let mut metadata = usage_metadata(&ctx, &report);
        metadata.insert("pooled".into(), reused.to_string());
        metadata.insert("instance_calls".into(), instance.calls().to_string());
        if let Some(scan) = &scan {
            metadata.insert("threat_score".into(), format!("{:.4}", scan.score));
        }

        let (logs, events) = instance
            .state_mut()
            .map(|state| (std::mem::take(&mut state.logs), std::mem::take(&mut state.events)))
            .unwrap_or_default();
        let outcome = ExecutionOutcome {
            values: report.values,
            resource_used: report.resource_used,
            memory_used: ctx.usage().memory_used,
            logs,
            events,
            duration: start.elapsed(),
            instance_id: instance.id().to_string(),
            module_id: module.content_hash().to_string(),
            warnings,
            metadata,
        };
        self.pool.put(instance);
        Ok(outcome)
    }

    async fn call(
        &self,
        ctx: &mut ExecutionContext,
        instance: &mut ContractInstance,
    ) -> Result<CallReport, RuntimeError> {
        let security = self.vm.security();
        ctx.bind_to_instance(instance)?;

        let memory_before = instance.memory_size();
        let limits = CallLimits {
            fee_limit: ctx.resource_fee_limit(),
            timeout: ctx.remaining().min(security.config().max_execution_time()),
        };
        let outcome = self.vm.call(instance, ctx.entry(), ctx.words(), &limits).await?;

        ctx.record_usage(outcome.resource_used, instance.memory_size() as u64);
        security.check_post_execution_limits(ctx)?;

        let values = if ctx.return_types().is_empty() {
            self.marshaller.decode_results(&outcome.words, &outcome.native_types)?
        } else {
            self.marshaller
                .decode_results_from(&outcome.words, ctx.return_types(), instance)?
        };

        Ok(CallReport {
            values,
            resource_used: outcome.resource_used,
            duration: outcome.duration,
            timeout: limits.timeout,
            memory_before,
            host_calls: instance
                .state()
                .map_or(0, |state| state.meter().host_calls()),
        })
    }

    fn finish(
        &self,
        result: Result<ExecutionOutcome, RuntimeError>,
        start: Instant,
    ) -> Result<ExecutionOutcome, RuntimeError> {
        match &result {
            Ok(outcome) => {
                self.predictor.record(ExecutionSample {
                    duration: outcome.duration,
                    resource_used: outcome.resource_used,
                    memory_used: outcome.memory_used,
                    success: true,
                });
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .total_resource_used
                    .fetch_add(outcome.resource_used, Ordering::Relaxed);
                info!(
                    module_id = %outcome.module_id,
                    instance_id = %outcome.instance_id,
                    resource_used = outcome.resource_used,
                    duration_ms = outcome.duration.as_millis(),
                    warnings = outcome.warnings.len(),
                    "Execution completed"
                );
            }
            Err(err) => {
                self.predictor.record(ExecutionSample {
                    duration: start.elapsed(),
                    resource_used: 0,
                    memory_used: 0,
                    success: false,
                });
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.errors.record(err);
                warn!(error = %err, "Execution failed");
            }
        }
        result
    }

    /// Drop a module from the compile cache along with its pooled instances.
    pub fn evict_module(&self, module_id: &str) -> bool {
        let evicted = self.vm.evict_module(module_id);
        self.pool.evict(module_id);
        evicted
    }

    /// Accept executions again after [`close`](Self::close).
    pub fn open(&self) {
        self.closed.store(false, Ordering::Release);
        self.pool.reopen();
    }

    /// Refuse new executions and destroy pooled instances. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pool.close();
            info!("Executor closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64
    }
}

fn time_ratio(report: &CallReport) -> f64 {
    if report.timeout.is_zero() {
        0.0
    } else {
        report.duration.as_secs_f64() / report.timeout.as_secs_f64()
    }
}

/// Scan data for [`SecurityManager::detect_threats`]. Keys match the
/// indicators of the default threat patterns, plus `host_calls`.
#[allow(clippy::cast_precision_loss)]
fn threat_indicators(
    ctx: &ExecutionContext,
    validation: &ValidationReport,
    report: &CallReport,
    memory_after: usize,
) -> BTreeMap<String, Value> {
    let unauthorized = validation
        .failures
        .iter()
        .any(|failure| failure.rule == "import_validation");
    let scratch = if memory_after == 0 {
        0.0
    } else {
        ctx.plan().total_size() as f64 / memory_after as f64
    };

    let mut indicators = BTreeMap::new();
    indicators.insert(
        "high_cpu_usage".to_string(),
        Value::F64(ratio(report.resource_used, ctx.resource_fee_limit())),
    );
    indicators.insert(
        "long_execution_time".to_string(),
        Value::F64(time_ratio(report)),
    );
    indicators.insert(
        "rapid_memory_growth".to_string(),
        Value::Bool(memory_after > report.memory_before),
    );
    indicators.insert("large_allocations".to_string(), Value::F64(scratch));
    indicators.insert("unauthorized_imports".to_string(), Value::Bool(unauthorized));
    indicators.insert("host_calls".to_string(), Value::U64(report.host_calls));
    indicators
}

fn threat_blocked(scan: &ThreatScan) -> RuntimeError {
    RuntimeError::validation(
        "THREAT_BLOCKED",
        format!("Threat score {:.2} over the alert threshold", scan.score),
    )
    .with_details(format!("alerts: {}", scan.alerts.join(", ")))
    .with_context("scan_id", scan.id.clone())
    .with_hint("Review the contract's resource and memory behaviour")
}

fn usage_warnings(ctx: &ExecutionContext, report: &CallReport) -> Vec<String> {
    let mut warnings = Vec::new();
    let usage = ctx.usage();

    let fee = ratio(report.resource_used, ctx.resource_fee_limit());
    if fee >= WARN_RATIO {
        warnings.push(format!(
            "resource fee at {:.0}% of limit ({}/{})",
            fee * 100.0,
            report.resource_used,
            ctx.resource_fee_limit()
        ));
    }
    let memory = ratio(usage.memory_used, u64::from(ctx.memory_limit()));
    if memory >= WARN_RATIO {
        warnings.push(format!(
            "memory at {:.0}% of limit ({}/{})",
            memory * 100.0,
            usage.memory_used,
            ctx.memory_limit()
        ));
    }
    let time = time_ratio(report);
    if time >= WARN_RATIO {
        warnings.push(format!(
            "execution took {:.0}% of its time budget ({}ms)",
            time * 100.0,
            report.duration.as_millis()
        ));
    }
    warnings
}

fn usage_metadata(ctx: &ExecutionContext, report: &CallReport) -> BTreeMap<String, String> {
    let usage = ctx.usage();
    let mut metadata = BTreeMap::new();
    metadata.insert(
        "fee_utilization".into(),
        format!("{:.4}", ratio(report.resource_used, ctx.resource_fee_limit())),
    );
    metadata.insert(
        "memory_utilization".into(),
        format!("{:.4}", ratio(usage.memory_used, u64::from(ctx.memory_limit()))),
    );
    metadata.insert("fee_limit".into(), ctx.resource_fee_limit().to_string());
    metadata.insert("memory_limit".into(), ctx.memory_limit().to_string());
    metadata.insert("host_calls".into(), report.host_calls.to_string());
    metadata.insert("call_duration_us".into(), report.duration.as_micros().to_string());
    metadata
}

impl std::fmt::Debug for ContractExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractExecutor")
            .field("vm", &self.vm)
            .field("pool", &self.pool)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contract_runtime_common::{
        EngineConfig, ErrorKind, MarshalConfig, PoolConfig, RuntimeConfig, SecurityConfig,
        ValueType,
    };

    const MATH: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
            (func (export "len") (param i32 i32) (result i32)
                local.get 1)
            (func (export "echo") (param i32 i32) (result i32 i32)
                local.get 0
                local.get 1)
            (func (export "grow") (result i32)
                i32.const 1
                memory.grow))
    "#;

    fn executor() -> ContractExecutor {
        executor_with(SecurityConfig::default())
    }

    fn executor_with(security: SecurityConfig) -> ContractExecutor {
        let config = RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                epoch_interruption: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let security = Arc::new(SecurityManager::new(security));
        let vm = Arc::new(Vm::new(&config, security).unwrap());
        let pool = Arc::new(InstancePool::new(PoolConfig::default()));
        ContractExecutor::new(vm, pool, Marshaller::new(MarshalConfig::default()))
    }

    fn module(executor: &ContractExecutor) -> Arc<CompiledModule> {
        executor.vm().compile_wat(MATH).unwrap()
    }

    #[tokio::test]
    async fn test_execute_add() {
        let executor = executor();
        let params = ExecutionParams::new("add", 1000, 65_536)
            .with_args(vec![Value::I32(2), Value::I32(3)])
            .with_return_types(vec![ValueType::I32]);

        let outcome = executor.execute_module(module(&executor), &params).await.unwrap();

        assert_eq!(outcome.values, vec![Value::I32(5)]);
        assert!(outcome.resource_used > 0 && outcome.resource_used <= 1000);
        assert_eq!(outcome.memory_used, 65_536);

        let stats = executor.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.total_resource_used, outcome.resource_used);
    }

    #[tokio::test]
    async fn test_native_result_types_when_undeclared() {
        let executor = executor();
        let params = ExecutionParams::new("add", 1000, 65_536)
            .with_args(vec![Value::I32(-4), Value::I32(1)]);

        let outcome = executor.execute_module(module(&executor), &params).await.unwrap();
        assert_eq!(outcome.values, vec![Value::I32(-3)]);
    }

    #[tokio::test]
    async fn test_string_arguments_round_trip() {
        let executor = executor();
        let params = ExecutionParams::new("echo", 1000, 65_536)
            .with_args(vec![Value::String("hello".into())])
            .with_return_types(vec![ValueType::String]);

        let outcome = executor.execute_module(module(&executor), &params).await.unwrap();
        assert_eq!(outcome.values, vec![Value::String("hello".into())]);

        let params = ExecutionParams::new("len", 1000, 65_536)
            .with_args(vec![Value::Bytes(vec![1, 2, 3, 4])]);
        let outcome = executor.execute_module(module(&executor), &params).await.unwrap();
        assert_eq!(outcome.values, vec![Value::I32(4)]);
    }

    #[tokio::test]
    async fn test_instance_reused_after_success() {
        let executor = executor();
        let module = module(&executor);
        let params = ExecutionParams::new("add", 1000, 65_536)
            .with_args(vec![Value::I32(1), Value::I32(1)]);

        let first = executor.execute_module(Arc::clone(&module), &params).await.unwrap();
        let second = executor.execute_module(Arc::clone(&module), &params).await.unwrap();

        assert_eq!(first.instance_id, second.instance_id);
        assert_eq!(executor.pool().idle_count(module.content_hash()), 1);

        assert!(executor.evict_module(module.content_hash()));
        assert_eq!(executor.pool().idle_count(module.content_hash()), 0);
    }

    #[tokio::test]
    async fn test_buffer_arguments_across_pooled_reuse() {
        let executor = executor();
        let module = module(&executor);
        let params = ExecutionParams::new("len", 1000, 65_536)
            .with_args(vec![Value::Bytes(vec![7; 12_000])]);

        let mut instance_ids = Vec::new();
        for _ in 0..4 {
            let outcome = executor.execute_module(Arc::clone(&module), &params).await.unwrap();
            assert_eq!(outcome.values, vec![Value::I32(12_000)]);
            instance_ids.push(outcome.instance_id);
        }

        assert!(instance_ids.iter().all(|id| *id == instance_ids[0]));
        assert_eq!(executor.pool().stats().hits, 3);
    }

    #[tokio::test]
    async fn test_bytes_result_decoded_from_memory() {
        let executor = executor();
        let module = module(&executor);
        let params = ExecutionParams::new("echo", 1000, 65_536)
            .with_args(vec![Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])])
            .with_return_types(vec![ValueType::Bytes]);

        for _ in 0..2 {
            let outcome = executor.execute_module(Arc::clone(&module), &params).await.unwrap();
            assert_eq!(outcome.values, vec![Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])]);
        }
    }

    #[tokio::test]
    async fn test_memory_ceiling_selects_pooled_instance() {
        let executor = executor();
        let module = module(&executor);
        let one_page = ExecutionParams::new("add", 1000, 65_536)
            .with_args(vec![Value::I32(1), Value::I32(1)]);
        let two_pages = ExecutionParams::new("add", 1000, 131_072)
            .with_args(vec![Value::I32(1), Value::I32(1)]);

        let small = executor.execute_module(Arc::clone(&module), &one_page).await.unwrap();
        let large = executor.execute_module(Arc::clone(&module), &two_pages).await.unwrap();
        assert_ne!(small.instance_id, large.instance_id);
        assert_eq!(large.metadata["pooled"], "false");

        let again = executor.execute_module(Arc::clone(&module), &one_page).await.unwrap();
        assert_eq!(again.instance_id, small.instance_id);
        assert_eq!(again.metadata["pooled"], "true");
        assert_eq!(executor.pool().idle_count(module.content_hash()), 2);
    }

    #[tokio::test]
    async fn test_usage_warnings_and_metadata() {
        let executor = executor();
        let module = module(&executor);
        let params = ExecutionParams::new("add", 1000, 65_536)
            .with_args(vec![Value::I32(2), Value::I32(2)]);

        // One page of memory against a one-page limit
        let outcome = executor.execute_module(Arc::clone(&module), &params).await.unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("memory at 100%"));
        assert_eq!(outcome.metadata["memory_utilization"], "1.0000");
        assert_eq!(outcome.metadata["fee_limit"], "1000");
        assert_eq!(outcome.metadata["host_calls"], "0");
        assert_eq!(outcome.metadata["pooled"], "false");
        assert!(outcome.metadata.contains_key("fee_utilization"));
        assert!(outcome.metadata.contains_key("threat_score"));

        let params = ExecutionParams::new("add", 1000, 655_360)
            .with_args(vec![Value::I32(2), Value::I32(2)]);
        let outcome = executor.execute_module(module, &params).await.unwrap();
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.metadata["memory_utilization"], "0.1000");
    }

    #[tokio::test]
    async fn test_threat_scan_runs_after_each_call() {
        let executor = executor();
        let params = ExecutionParams::new("add", 1000, 65_536)
            .with_args(vec![Value::I32(1), Value::I32(2)]);

        executor.execute_module(module(&executor), &params).await.unwrap();

        let scans = executor.security().recent_scans();
        assert_eq!(scans.len(), 1);
        assert!(!scans[0].blocked);
        assert_eq!(executor.security().stats().threats_blocked, 0);
    }

    #[tokio::test]
    async fn test_threat_over_threshold_blocks_result() {
        let executor = executor_with(SecurityConfig {
            alert_threshold: 0.02,
            ..Default::default()
        });
        let module = module(&executor);
        // Scratch bytes cover almost a third of linear memory
        let params = ExecutionParams::new("len", 1000, 65_536)
            .with_args(vec![Value::Bytes(vec![7; 20_000])]);

        let err = executor.execute_module(Arc::clone(&module), &params).await.unwrap_err();

        assert_eq!(err.code(), "THREAT_BLOCKED");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.details().unwrap().contains("memory_bomb"));
        assert_eq!(executor.security().stats().threats_blocked, 1);
        assert_eq!(executor.pool().idle_count(module.content_hash()), 0);
        assert_eq!(executor.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_predictor_records_executions() {
        let executor = executor();
        let module = module(&executor);
        let ok = ExecutionParams::new("add", 1000, 65_536)
            .with_args(vec![Value::I32(1), Value::I32(1)]);
        let missing = ExecutionParams::new("missing", 1000, 65_536);

        let first = executor.execute_module(Arc::clone(&module), &ok).await.unwrap();
        executor.execute_module(Arc::clone(&module), &ok).await.unwrap();
        executor.execute_module(module, &missing).await.unwrap_err();

        assert_eq!(executor.predictor().len(), 3);
        let prediction = executor.predict();
        assert_eq!(prediction.samples, 2);
        assert_eq!(prediction.expected_resource_used, first.resource_used);
        assert!((prediction.failure_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_call_destroys_instance() {
        let executor = executor();
        let module = module(&executor);

        let params = ExecutionParams::new("missing", 1000, 65_536);
        let err = executor.execute_module(Arc::clone(&module), &params).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FunctionNotFound);
        assert_eq!(executor.pool().idle_count(module.content_hash()), 0);
        assert_eq!(executor.stats().failed, 1);
        assert_eq!(executor.errors().stats().total_errors, 1);
    }

    #[tokio::test]
    async fn test_invalid_params_fail_before_compile() {
        let executor = executor();
        let params = ExecutionParams::new("", 1000, 65_536).with_payload(b"garbage".to_vec());

        let err = executor.execute(&params).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        assert_eq!(executor.vm().cache_len(), 0);
    }

    #[tokio::test]
    async fn test_bad_payload() {
        let executor = executor();
        let params = ExecutionParams::new("add", 1000, 65_536).with_payload(b"garbage!".to_vec());

        let err = executor.execute(&params).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_BYTECODE");
    }

    #[tokio::test]
    async fn test_result_count_mismatch() {
        let executor = executor();
        let params = ExecutionParams::new("add", 1000, 65_536)
            .with_args(vec![Value::I32(1), Value::I32(1)])
            .with_return_types(vec![ValueType::I32, ValueType::I32]);

        let err = executor.execute_module(module(&executor), &params).await.unwrap_err();
        assert_eq!(err.code(), "RESULT_COUNT_MISMATCH");
    }

    #[tokio::test]
    async fn test_memory_growth_past_limit_fails_post_check() {
        let executor = executor();
        // Two pages allowed by the instance, one by the caller's limit
        let params = ExecutionParams::new("grow", 1000, 65_536 + 1);

        let err = executor.execute_module(module(&executor), &params).await.unwrap_err();
        assert_eq!(err.code(), "MEMORY_LIMIT_EXCEEDED");
        assert_eq!(executor.security().stats().limit_violations, 1);
    }

    #[tokio::test]
    async fn test_closed_executor_rejects() {
        let executor = executor();
        executor.close();
        executor.close();

        let params = ExecutionParams::new("add", 1000, 65_536);
        let err = executor.execute_module(module(&executor), &params).await.unwrap_err();
        assert_eq!(err.code(), "CLOSED");

        executor.open();
        let params = params.with_args(vec![Value::I32(1), Value::I32(2)]);
        assert!(executor.execute_module(module(&executor), &params).await.is_ok());
    }
}
