//! Security manager: module validation, host-call gating, execution limits
//! and threat scoring.
//!
//! The [`SecurityManager`] holds a policy snapshot ([`SecurityConfig`]) plus
//! running counters ([`SecurityStats`]). It is shared by the executor and by
//! every instance store, so host functions can reach the gate.
//!
//! # Host-call gate
//!
//! [`SecurityManager::validate_host_call`] runs before any host-side effect:
//!
//! 1. allow-list membership, when an allow-list is configured
//! 2. deny-list membership, always (deny wins over allow)
//! 3. the function's parameter schema, if any
//! 4. for writes only: idempotency and side-effect policy
//!
//! # Module validation
//!
//! Ordered [`ValidationRule`]s run against a [`CompiledModule`]. Strict mode
//! stops at the first failure; permissive mode records every failure in the
//! returned [`ValidationReport`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use contract_runtime_common::{ParamRule, RuntimeError, SecurityConfig, Severity, Value};

use crate::CompiledModule;
use crate::context::ExecutionContext;

/// Check run by a [`ValidationRule`]. Returns a failure message on violation.
pub type RuleCheck =
    Arc<dyn Fn(&CompiledModule, &SecurityConfig) -> Result<(), String> + Send + Sync>;

/// Check run by a [`LimitChecker`].
pub type LimitCheck =
    Arc<dyn Fn(&ExecutionContext, &SecurityConfig) -> Result<(), RuntimeError> + Send + Sync>;

/// A named static check over a compiled module.
#[derive(Clone)]
pub struct ValidationRule {
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub enabled: bool,
    check: RuleCheck,
}

impl ValidationRule {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        check: impl Fn(&CompiledModule, &SecurityConfig) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            severity,
            enabled: true,
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// When a [`LimitChecker`] runs relative to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPhase {
    PreExecution,
    PostExecution,
}

/// A named limit check run before or after a call.
#[derive(Clone)]
pub struct LimitChecker {
    pub name: String,
    pub phase: LimitPhase,
    pub enabled: bool,
    check: LimitCheck,
}

impl LimitChecker {
    pub fn new(
        name: impl Into<String>,
        phase: LimitPhase,
        check: impl Fn(&ExecutionContext, &SecurityConfig) -> Result<(), RuntimeError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            phase,
            enabled: true,
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for LimitChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitChecker")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Indicator keys scored together, weighted by `severity` (1..=10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatPattern {
    pub name: String,
    pub description: String,
    pub indicators: Vec<String>,
    pub severity: u8,
}

/// Outcome of one threat scan.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatScan {
    pub id: String,
    pub module_id: String,
    pub score: f64,
    /// Patterns whose individual score crossed the alert threshold.
    pub alerts: Vec<String>,
    pub blocked: bool,
    pub scanned_at: SystemTime,
}

/// A recorded security event. `severity` ranges over 1..=10.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub id: String,
    pub kind: String,
    pub severity: u8,
    pub message: String,
    pub timestamp: SystemTime,
}

/// A failed validation rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleFailure {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
}

/// Result of [`SecurityManager::validate_module`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub module_id: String,
    pub rules_run: usize,
    pub failures: Vec<RuleFailure>,
    /// Validation is disabled in the current policy.
    pub skipped: bool,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Running security counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityStats {
    pub total_validations: u64,
    pub failed_validations: u64,
    pub threats_detected: u64,
    pub threats_blocked: u64,
    pub limit_violations: u64,
    pub last_validation: Option<SystemTime>,
    pub host_calls_validated: u64,
    pub host_call_violations: u64,
    pub last_host_violation: Option<SystemTime>,
}

const MAX_RECENT_SCANS: usize = 64;

/// Validates modules and gates host calls against a [`SecurityConfig`].
pub struct SecurityManager {
    config: RwLock<SecurityConfig>,
    rules: RwLock<Vec<ValidationRule>>,
    checkers: RwLock<Vec<LimitChecker>>,
    patterns: RwLock<Vec<ThreatPattern>>,
    stats: Mutex<SecurityStats>,
    events: Mutex<VecDeque<SecurityEvent>>,
    scans: Mutex<VecDeque<ThreatScan>>,
}

impl SecurityManager {
    /// Create a manager with the default rules, limit checkers and threat
    /// patterns.
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config: RwLock::new(config),
            rules: RwLock::new(default_rules()),
            checkers: RwLock::new(default_limit_checkers()),
            patterns: RwLock::new(default_threat_patterns()),
            stats: Mutex::new(SecurityStats::default()),
            events: Mutex::new(VecDeque::new()),
            scans: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of the current policy.
    pub fn config(&self) -> SecurityConfig {
        self.config.read().clone()
    }

    /// Replace the policy. Rules and checkers see the new policy on their
    /// next run.
    pub fn update_config(&self, config: SecurityConfig) {
        *self.config.write() = config;
        info!("Security configuration updated");
    }

    /// Append a validation rule after the existing ones.
    pub fn add_validation_rule(&self, rule: ValidationRule) {
        debug!(rule = %rule.name, "Validation rule added");
        self.rules.write().push(rule);
    }

    pub fn add_limit_checker(&self, checker: LimitChecker) {
        debug!(checker = %checker.name, "Limit checker added");
        self.checkers.write().push(checker);
    }

    pub fn add_threat_pattern(&self, pattern: ThreatPattern) {
        self.patterns.write().push(pattern);
    }

    /// Enable or disable a rule by name. Returns `false` if no rule matched.
    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        let mut found = false;
        for rule in rules.iter_mut().filter(|r| r.name == name) {
            rule.enabled = enabled;
            found = true;
        }
        found
    }

    pub fn stats(&self) -> SecurityStats {
        self.stats.lock().clone()
    }

    /// Most recent security events, oldest first.
    pub fn recent_events(&self) -> Vec<SecurityEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn recent_scans(&self) -> Vec<ThreatScan> {
        self.scans.lock().iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Module validation
    // ------------------------------------------------------------------

    /// Run the validation rules against `module`, in order.
    ///
    /// # Errors
    ///
    /// In strict mode, returns a validation error carrying the severity of
    /// the first failing rule. Permissive mode never fails.
    pub fn validate_module(&self, module: &CompiledModule) -> Result<ValidationReport, RuntimeError> {
        let config = self.config();
        let mut report = ValidationReport {
            module_id: module.content_hash().to_string(),
            ..Default::default()
        };

        if !config.enable_validation {
            report.skipped = true;
            return Ok(report);
        }

        let start = Instant::now();
        let rules = self.rules.read().clone();

        for rule in rules.iter().filter(|r| r.enabled) {
            report.rules_run += 1;

            let Err(message) = (rule.check)(module, &config) else {
                continue;
            };

            if config.strict_mode {
                self.finish_validation(&report, true);
                self.record_event(
                    "module_validation_failed",
                    severity_score(rule.severity),
                    format!("{}: {message}", rule.name),
                );
                return Err(RuntimeError::validation(
                    "MODULE_VALIDATION_FAILED",
                    "Module failed validation",
                )
                .with_severity(rule.severity)
                .with_details(format!("{}: {message}", rule.name))
                .with_context("rule", rule.name.clone())
                .with_context("module_id", report.module_id.clone()));
            }

            report.failures.push(RuleFailure {
                rule: rule.name.clone(),
                severity: rule.severity,
                message,
            });
        }

        let failed = !report.passed();
        self.finish_validation(&report, failed);
        for failure in &report.failures {
            self.record_event(
                "module_validation_warning",
                severity_score(failure.severity),
                format!("{}: {}", failure.rule, failure.message),
            );
        }

        debug!(
            module_id = %report.module_id,
            rules_run = report.rules_run,
            failures = report.failures.len(),
            duration_us = start.elapsed().as_micros(),
            "Module validated"
        );

        Ok(report)
    }

    fn finish_validation(&self, report: &ValidationReport, failed: bool) {
        let mut stats = self.stats.lock();
        stats.total_validations += 1;
        stats.last_validation = Some(SystemTime::now());
        if failed {
            stats.failed_validations += 1;
        }
        drop(stats);

        if failed {
            warn!(module_id = %report.module_id, "Module validation failed");
        }
    }

    // ------------------------------------------------------------------
    // Host-call gate
    // ------------------------------------------------------------------

    /// Gate one host call. Must pass before the call has any effect.
    ///
    /// # Errors
    ///
    /// `HOST_PERMISSION_DENIED` for allow/deny-list, idempotency and
    /// side-effect violations; a host-function error for schema violations.
    pub fn validate_host_call(
        &self,
        function: &str,
        args: &[Value],
        is_write: bool,
    ) -> Result<(), RuntimeError> {
        let config = self.config.read();

        if !config.allowed_host_functions.is_empty()
            && !config.allowed_host_functions.iter().any(|f| f == function)
        {
            drop(config);
            return Err(self.host_violation(
                "host_call_denied",
                8,
                RuntimeError::host_permission(function, "not in the allow-list"),
            ));
        }

        if config.denied_host_functions.iter().any(|f| f == function) {
            drop(config);
            return Err(self.host_violation(
                "host_call_blacklist",
                9,
                RuntimeError::host_permission(function, "in the deny-list"),
            ));
        }

        if let Some(schema) = config.host_param_schemas.get(function) {
            if let Err(reason) = check_schema(schema, args) {
                drop(config);
                return Err(self.host_violation(
                    "host_param_schema_violation",
                    7,
                    RuntimeError::host_function(function, "HOST_PARAM_INVALID", reason),
                ));
            }
        }

        if is_write {
            if config.enforce_idempotency
                && !config.idempotent_functions.iter().any(|f| f == function)
            {
                drop(config);
                return Err(self.host_violation(
                    "host_idempotency_violation",
                    8,
                    RuntimeError::host_permission(function, "write is not declared idempotent"),
                ));
            }

            if config.enforce_side_effects {
                let allowed = config
                    .side_effect_policies
                    .get(function)
                    .is_some_and(|policy| policy.allowed);
                if !allowed {
                    let notes = config
                        .side_effect_policies
                        .get(function)
                        .map(|policy| policy.notes.clone())
                        .filter(|notes| !notes.is_empty())
                        .unwrap_or_else(|| "side effects not allowed".to_string());
                    drop(config);
                    return Err(self.host_violation(
                        "host_side_effect_violation",
                        8,
                        RuntimeError::host_permission(function, notes),
                    ));
                }
            }
        }
        drop(config);

        self.stats.lock().host_calls_validated += 1;
        Ok(())
    }

    fn host_violation(&self, kind: &str, severity: u8, err: RuntimeError) -> RuntimeError {
        {
            let mut stats = self.stats.lock();
            stats.host_call_violations += 1;
            stats.last_host_violation = Some(SystemTime::now());
        }
        self.record_event(kind, severity, err.details().unwrap_or_default().to_string());
        err
    }

    // ------------------------------------------------------------------
    // Execution limits
    // ------------------------------------------------------------------

    /// Run the pre-execution limit checkers.
    pub fn check_execution_limits(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        self.run_checkers(LimitPhase::PreExecution, ctx)
    }

    /// Run the post-execution limit checkers against the recorded usage.
    pub fn check_post_execution_limits(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        self.run_checkers(LimitPhase::PostExecution, ctx)
    }

    fn run_checkers(&self, phase: LimitPhase, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        let config = self.config();
        let checkers = self.checkers.read().clone();

        for checker in checkers.iter().filter(|c| c.enabled && c.phase == phase) {
            if let Err(err) = (checker.check)(ctx, &config) {
                self.stats.lock().limit_violations += 1;
                self.record_event(
                    "limit_violation",
                    6,
                    format!("{}: {err}", checker.name),
                );
                return Err(err.with_context("checker", checker.name.clone()));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Threat detection
    // ------------------------------------------------------------------

    /// Score `scan_data` against the threat patterns.
    ///
    /// Returns `None` when threat detection is disabled. A scan whose total
    /// score exceeds the alert threshold is marked blocked.
    pub fn detect_threats(
        &self,
        module_id: &str,
        scan_data: &BTreeMap<String, Value>,
    ) -> Option<ThreatScan> {
        let config = self.config();
        if !config.enable_threat_detection {
            return None;
        }
        let threshold = config.alert_threshold;

        let mut scan = ThreatScan {
            id: Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
            score: 0.0,
            alerts: Vec::new(),
            blocked: false,
            scanned_at: SystemTime::now(),
        };

        let patterns = self.patterns.read().clone();
        for pattern in &patterns {
            let score = pattern_score(pattern, scan_data);
            scan.score += score;

            if score > threshold {
                scan.alerts.push(pattern.name.clone());
                self.stats.lock().threats_detected += 1;
                self.record_event(
                    "threat_detected",
                    pattern.severity,
                    format!("pattern {} scored {score:.2}", pattern.name),
                );
            }
        }

        if scan.score > threshold {
            scan.blocked = true;
            self.stats.lock().threats_blocked += 1;
            self.record_event(
                "threat_blocked",
                9,
                format!("module {module_id} scored {:.2}", scan.score),
            );
        }

        let mut scans = self.scans.lock();
        if scans.len() >= MAX_RECENT_SCANS {
            scans.pop_front();
        }
        scans.push_back(scan.clone());

        Some(scan)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn record_event(&self, kind: &str, severity: u8, message: String) {
        if severity >= 8 {
            error!(event = kind, severity, message = %message, "Security event");
        } else {
            warn!(event = kind, severity, message = %message, "Security event");
        }

        let capacity = self.config.read().max_recent_events;
        if capacity == 0 {
            return;
        }

        let mut events = self.events.lock();
        while events.len() >= capacity {
            events.pop_front();
        }
        events.push_back(SecurityEvent {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            severity,
            message,
            timestamp: SystemTime::now(),
        });
    }
}

impl fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityManager")
            .field("rules", &self.rules.read().len())
            .field("checkers", &self.checkers.read().len())
            .field("patterns", &self.patterns.read().len())
            .finish_non_exhaustive()
    }
}

fn severity_score(severity: Severity) -> u8 {
    match severity {
        Severity::Low => 3,
        Severity::Medium => 5,
        Severity::High => 7,
        Severity::Critical => 9,
    }
}

fn check_schema(schema: &[ParamRule], args: &[Value]) -> Result<(), String> {
    let required = schema.iter().filter(|rule| rule.required).count();
    if args.len() < required {
        return Err(format!(
            "expected at least {required} arguments, got {}",
            args.len()
        ));
    }

    // Arguments past the end of the schema are not checked
    for (index, (rule, arg)) in schema.iter().zip(args).enumerate() {
        if arg.value_type() != rule.value_type {
            return Err(format!(
                "arg[{index}] expected {}, got {}",
                rule.value_type,
                arg.value_type()
            ));
        }
        if let Some(bytes) = arg.as_bytes() {
            if rule.max_size > 0 && bytes.len() > rule.max_size {
                return Err(format!(
                    "arg[{index}] is {} bytes, limit is {}",
                    bytes.len(),
                    rule.max_size
                ));
            }
        }
    }
    Ok(())
}

fn pattern_score(pattern: &ThreatPattern, scan_data: &BTreeMap<String, Value>) -> f64 {
    let raw: f64 = pattern
        .indicators
        .iter()
        .filter_map(|key| scan_data.get(key))
        .map(|value| match value {
            Value::Bool(true) => 0.2,
            other => other.as_f64().map_or(0.0, |v| v * 0.1),
        })
        .sum();
    raw * f64::from(pattern.severity) / 10.0
}

fn default_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule::new(
            "module_structure",
            "Module must export at least one function",
            Severity::Critical,
            |module, _| {
                if module.exports().is_empty() {
                    Err("module exports no functions".to_string())
                } else {
                    Ok(())
                }
            },
        ),
        ValidationRule::new(
            "import_validation",
            "Imports must come from allowed namespaces",
            Severity::High,
            |module, config| {
                match module
                    .imports()
                    .iter()
                    .find(|i| !config.allowed_imports.iter().any(|a| *a == i.module))
                {
                    Some(import) => Err(format!("import {import} is not allowed")),
                    None => Ok(()),
                }
            },
        ),
        ValidationRule::new(
            "memory_limits",
            "Declared memory must fit the page ceiling",
            Severity::Medium,
            |module, config| {
                let Some(memory) = module.memory() else {
                    return Ok(());
                };
                let ceiling = u64::from(config.max_module_memory_pages);
                if memory.minimum > ceiling {
                    return Err(format!(
                        "minimum of {} pages exceeds {ceiling}",
                        memory.minimum
                    ));
                }
                match memory.maximum {
                    Some(max) if max > ceiling => {
                        Err(format!("maximum of {max} pages exceeds {ceiling}"))
                    }
                    _ => Ok(()),
                }
            },
        ),
    ]
}

fn default_limit_checkers() -> Vec<LimitChecker> {
    vec![
        LimitChecker::new("execution_time", LimitPhase::PreExecution, |ctx, _| {
            if ctx.is_expired() {
                Err(RuntimeError::timeout(ctx.timeout()))
            } else {
                Ok(())
            }
        }),
        LimitChecker::new("memory_usage", LimitPhase::PostExecution, |ctx, config| {
            let limit = config.max_memory_usage.min(u64::from(ctx.memory_limit()));
            let used = ctx.usage().memory_used;
            if used > limit {
                Err(RuntimeError::memory_limit_exceeded(used, limit))
            } else {
                Ok(())
            }
        }),
        LimitChecker::new("resource_fee", LimitPhase::PostExecution, |ctx, _| {
            let used = ctx.usage().resource_used;
            if used > ctx.resource_fee_limit() {
                Err(RuntimeError::resource_exhausted(used, ctx.resource_fee_limit()))
            } else {
                Ok(())
            }
        }),
    ]
}

fn default_threat_patterns() -> Vec<ThreatPattern> {
    vec![
        ThreatPattern {
            name: "infinite_loop".into(),
            description: "Sustained CPU use without progress".into(),
            indicators: vec!["high_cpu_usage".into(), "long_execution_time".into()],
            severity: 8,
        },
        ThreatPattern {
            name: "memory_bomb".into(),
            description: "Rapid or very large memory growth".into(),
            indicators: vec!["rapid_memory_growth".into(), "large_allocations".into()],
            severity: 9,
        },
        ThreatPattern {
            name: "malicious_imports".into(),
            description: "Imports outside the allowed surface".into(),
            indicators: vec!["unauthorized_imports".into(), "suspicious_functions".into()],
            severity: 7,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use contract_runtime_common::{EngineConfig, ErrorKind, ExecutionParams, ValueType};

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn module(wat: &str) -> CompiledModule {
        CompiledModule::from_wat(engine().inner(), wat).unwrap()
    }

    const GOOD: &str = r#"
        (module
            (import "env" "log" (func (param i32 i32 i32)))
            (memory (export "memory") 1)
            (func (export "run")))
    "#;

    const BAD_IMPORT: &str = r#"
        (module
            (import "wasi" "fd_write" (func (param i32)))
            (memory (export "memory") 2000)
            (func (export "run")))
    "#;

    #[test]
    fn test_validate_module_passes() {
        let sm = SecurityManager::new(SecurityConfig::default());
        let report = sm.validate_module(&module(GOOD)).unwrap();

        assert!(report.passed());
        assert_eq!(report.rules_run, 3);
        assert_eq!(sm.stats().total_validations, 1);
        assert_eq!(sm.stats().failed_validations, 0);
    }

    #[test]
    fn test_strict_mode_stops_at_first_failure() {
        let sm = SecurityManager::new(SecurityConfig::default());
        let err = sm.validate_module(&module(BAD_IMPORT)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.severity(), Severity::High);
        assert!(err.details().unwrap().starts_with("import_validation"));
        assert_eq!(sm.stats().failed_validations, 1);
    }

    #[test]
    fn test_permissive_mode_records_all_failures() {
        let sm = SecurityManager::new(SecurityConfig {
            strict_mode: false,
            ..Default::default()
        });
        let report = sm.validate_module(&module(BAD_IMPORT)).unwrap();

        assert!(!report.passed());
        let rules: Vec<_> = report.failures.iter().map(|f| f.rule.as_str()).collect();
        assert_eq!(rules, vec!["import_validation", "memory_limits"]);
        assert_eq!(sm.stats().failed_validations, 1);
    }

    #[test]
    fn test_no_exports_fails_structure_rule() {
        let sm = SecurityManager::new(SecurityConfig::default());
        let err = sm.validate_module(&module("(module)")).unwrap_err();
        assert_eq!(err.severity(), Severity::Critical);
    }

    #[test]
    fn test_disabled_validation_and_rules() {
        let sm = SecurityManager::new(SecurityConfig {
            enable_validation: false,
            ..Default::default()
        });
        assert!(sm.validate_module(&module(BAD_IMPORT)).unwrap().skipped);

        let sm = SecurityManager::new(SecurityConfig::default());
        assert!(sm.set_rule_enabled("import_validation", false));
        assert!(sm.set_rule_enabled("memory_limits", false));
        assert!(!sm.set_rule_enabled("missing", false));
        assert!(sm.validate_module(&module(BAD_IMPORT)).unwrap().passed());
    }

    #[test]
    fn test_custom_rule_runs_after_defaults() {
        let sm = SecurityManager::new(SecurityConfig::default());
        sm.add_validation_rule(ValidationRule::new(
            "needs_run",
            "Module must export run",
            Severity::Low,
            |m, _| {
                if m.exports_function("main") {
                    Ok(())
                } else {
                    Err("missing main".into())
                }
            },
        ));

        let err = sm.validate_module(&module(GOOD)).unwrap_err();
        assert_eq!(err.context()["rule"], "needs_run");
    }

    #[test]
    fn test_update_config_applies_to_rules() {
        let sm = SecurityManager::new(SecurityConfig::default());
        assert!(sm.validate_module(&module(BAD_IMPORT)).is_err());

        sm.update_config(SecurityConfig {
            allowed_imports: vec!["wasi".into()],
            max_module_memory_pages: 4096,
            ..Default::default()
        });
        assert!(sm.validate_module(&module(BAD_IMPORT)).unwrap().passed());
    }

    #[test]
    fn test_deny_list_wins_over_allow_list() {
        let sm = SecurityManager::new(SecurityConfig {
            allowed_host_functions: vec!["transfer".into()],
            denied_host_functions: vec!["transfer".into()],
            ..Default::default()
        });

        let err = sm.validate_host_call("transfer", &[], false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostPermission);
        assert_eq!(sm.stats().host_call_violations, 1);
        assert!(sm.stats().last_host_violation.is_some());
        assert_eq!(sm.recent_events()[0].kind, "host_call_blacklist");
    }

    #[test]
    fn test_allow_list_rejects_unlisted() {
        let sm = SecurityManager::new(SecurityConfig {
            allowed_host_functions: vec!["log".into()],
            ..Default::default()
        });

        assert!(sm.validate_host_call("log", &[], false).is_ok());
        let err = sm.validate_host_call("block_height", &[], false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostPermission);

        let stats = sm.stats();
        assert_eq!(stats.host_calls_validated, 1);
        assert_eq!(stats.host_call_violations, 1);
    }

    #[test]
    fn test_param_schema() {
        let mut schemas = BTreeMap::new();
        schemas.insert(
            "emit_event".to_string(),
            vec![
                ParamRule::required(ValueType::String).with_max_size(4),
                ParamRule {
                    value_type: ValueType::Bytes,
                    required: false,
                    max_size: 0,
                },
            ],
        );
        let sm = SecurityManager::new(SecurityConfig {
            host_param_schemas: schemas,
            enforce_side_effects: false,
            ..Default::default()
        });

        assert!(
            sm.validate_host_call("emit_event", &[Value::String("ok".into())], true)
                .is_ok()
        );
        assert!(
            sm.validate_host_call(
                "emit_event",
                &[Value::String("ok".into()), Value::Bytes(vec![1; 64])],
                true
            )
            .is_ok()
        );

        let cases: [&[Value]; 4] = [
            &[],
            &[Value::I32(1)],
            &[Value::String("too long".into())],
            &[Value::String("a".into()), Value::I32(0)],
        ];
        for args in cases {
            let err = sm.validate_host_call("emit_event", args, true).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::HostFunction);
            assert_eq!(err.code(), "HOST_PARAM_INVALID");
        }
        assert_eq!(sm.stats().host_call_violations, 4);
    }

    #[test]
    fn test_param_schema_ignores_extra_arguments() {
        let mut schemas = BTreeMap::new();
        schemas.insert(
            "log".to_string(),
            vec![ParamRule::required(ValueType::I32)],
        );
        let sm = SecurityManager::new(SecurityConfig {
            host_param_schemas: schemas,
            ..Default::default()
        });

        let args = [
            Value::I32(1),
            Value::String("not in the schema".into()),
            Value::Bytes(vec![0; 128]),
        ];
        assert!(sm.validate_host_call("log", &args, false).is_ok());
        assert_eq!(sm.stats().host_call_violations, 0);

        let err = sm
            .validate_host_call("log", &[Value::String("wrong".into()), Value::I32(1)], false)
            .unwrap_err();
        assert_eq!(err.code(), "HOST_PARAM_INVALID");
    }

    #[test]
    fn test_idempotency_only_applies_to_writes() {
        let sm = SecurityManager::new(SecurityConfig {
            enforce_idempotency: true,
            idempotent_functions: vec!["set_value".into()],
            enforce_side_effects: false,
            ..Default::default()
        });

        assert!(sm.validate_host_call("append", &[], false).is_ok());
        assert!(sm.validate_host_call("set_value", &[], true).is_ok());
        let err = sm.validate_host_call("append", &[], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostPermission);
    }

    #[test]
    fn test_side_effects_need_explicit_policy() {
        let mut config = SecurityConfig::default().allow_side_effects("emit_event");
        config.side_effect_policies.insert(
            "burn".into(),
            contract_runtime_common::SideEffectPolicy {
                allowed: false,
                notes: "burning is disabled".into(),
            },
        );
        let sm = SecurityManager::new(config);

        assert!(sm.validate_host_call("emit_event", &[], true).is_ok());
        assert!(sm.validate_host_call("unlisted", &[], true).is_err());
        let err = sm.validate_host_call("burn", &[], true).unwrap_err();
        assert!(err.details().unwrap().contains("burning is disabled"));

        // Reads are never subject to side-effect policy
        assert!(sm.validate_host_call("unlisted", &[], false).is_ok());
    }

    #[test]
    fn test_limit_checkers() {
        let sm = SecurityManager::new(SecurityConfig::default());
        let params = ExecutionParams::new("run", 1000, 65_536).with_timeout_ms(60_000);
        let mut ctx = ExecutionContext::build(&params, &Default::default(), &Default::default())
            .unwrap();

        assert!(sm.check_execution_limits(&ctx).is_ok());

        ctx.record_usage(500, 65_536);
        assert!(sm.check_post_execution_limits(&ctx).is_ok());

        ctx.record_usage(500, 2 * 65_536);
        let err = sm.check_post_execution_limits(&ctx).unwrap_err();
        assert_eq!(err.code(), "MEMORY_LIMIT_EXCEEDED");
        assert_eq!(err.context()["checker"], "memory_usage");
        assert_eq!(sm.stats().limit_violations, 1);
    }

    #[test]
    fn test_expired_deadline_fails_pre_check() {
        let sm = SecurityManager::new(SecurityConfig::default());
        let params = ExecutionParams::new("run", 1000, 65_536).with_timeout_ms(1);
        let ctx = ExecutionContext::build(&params, &Default::default(), &Default::default())
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let err = sm.check_execution_limits(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_custom_limit_checker() {
        let sm = SecurityManager::new(SecurityConfig::default());
        sm.add_limit_checker(LimitChecker::new(
            "no_caller",
            LimitPhase::PreExecution,
            |ctx, _| {
                if ctx.caller().is_empty() {
                    Err(RuntimeError::invalid_params("caller required"))
                } else {
                    Ok(())
                }
            },
        ));

        let params = ExecutionParams::new("run", 1000, 65_536);
        let ctx =
            ExecutionContext::build(&params, &Default::default(), &Default::default()).unwrap();
        assert!(sm.check_execution_limits(&ctx).is_err());
    }

    #[test]
    fn test_threat_detection_scoring() {
        let sm = SecurityManager::new(SecurityConfig::default());

        let mut quiet = BTreeMap::new();
        quiet.insert("high_cpu_usage".to_string(), Value::Bool(true));
        let scan = sm.detect_threats("m1", &quiet).unwrap();
        assert!((scan.score - 0.16).abs() < 1e-9);
        assert!(!scan.blocked);
        assert!(scan.alerts.is_empty());

        let mut loud = BTreeMap::new();
        loud.insert("rapid_memory_growth".to_string(), Value::F64(9.0));
        let scan = sm.detect_threats("m2", &loud).unwrap();
        // 9.0 * 0.1 * 9 / 10
        assert!((scan.score - 0.81).abs() < 1e-9);
        assert!(scan.blocked);
        assert_eq!(scan.alerts, vec!["memory_bomb".to_string()]);

        let stats = sm.stats();
        assert_eq!(stats.threats_detected, 1);
        assert_eq!(stats.threats_blocked, 1);
        assert_eq!(sm.recent_scans().len(), 2);
    }

    #[test]
    fn test_threat_detection_disabled() {
        let sm = SecurityManager::new(SecurityConfig {
            enable_threat_detection: false,
            ..Default::default()
        });
        assert!(sm.detect_threats("m", &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_event_ring_is_bounded() {
        let sm = SecurityManager::new(SecurityConfig {
            denied_host_functions: vec!["x".into()],
            max_recent_events: 2,
            ..Default::default()
        });
        for _ in 0..5 {
            let _ = sm.validate_host_call("x", &[], false);
        }
        assert_eq!(sm.recent_events().len(), 2);
        assert_eq!(sm.stats().host_call_violations, 5);
    }
}
