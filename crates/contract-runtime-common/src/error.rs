//! Error taxonomy for the contract runtime.
//!
//! Every failure the runtime can anticipate is reported as a [`RuntimeError`]:
//! - [`ErrorKind`]: what went wrong (execution, memory, host permission, ...)
//! - [`Severity`]: how bad it is, from `Low` to `Critical`
//! - a stable `code` (e.g. `FUNCTION_NOT_FOUND`) plus a human message
//! - optional root cause, structured context, and recovery hints
//!
//! [`ErrorTracker`] aggregates errors per component (by kind, by severity,
//! recoverable count) and fans them out to registered callbacks.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Boxed root cause attached to a [`RuntimeError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Execution,
    Memory,
    Timeout,
    ResourceExhausted,
    StackOverflow,
    Compilation,
    Validation,
    Optimization,
    ModuleNotFound,
    FunctionNotFound,
    ImportError,
    ExportError,
    HostFunction,
    HostPermission,
    HostResource,
    System,
    Configuration,
    Internal,
}

impl ErrorKind {
    /// Stable snake-case name of this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Memory => "memory",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::StackOverflow => "stack_overflow",
            Self::Compilation => "compilation",
            Self::Validation => "validation",
            Self::Optimization => "optimization",
            Self::ModuleNotFound => "module_not_found",
            Self::FunctionNotFound => "function_not_found",
            Self::ImportError => "import_error",
            Self::ExportError => "export_error",
            Self::HostFunction => "host_function",
            Self::HostPermission => "host_permission",
            Self::HostResource => "host_resource",
            Self::System => "system",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// Severity assigned when the error is built without an explicit one.
    pub const fn default_severity(self) -> Severity {
        match self {
            Self::Timeout | Self::ResourceExhausted => Severity::Medium,
            Self::Memory | Self::StackOverflow => Severity::High,
            Self::System | Self::Internal => Severity::Critical,
            _ => Severity::Low,
        }
    }

    fn default_recovery_hints(self) -> &'static [&'static str] {
        match self {
            Self::Timeout => &[
                "increase the execution timeout",
                "reduce the work done by the entry point",
            ],
            Self::ResourceExhausted => &[
                "raise the resource fee limit",
                "optimize the contract's resource usage",
            ],
            Self::Memory => &["raise the memory limit", "reduce memory usage"],
            Self::Compilation => &[
                "check the bytecode format",
                "verify the module's imports and exports",
            ],
            Self::HostFunction => &[
                "check host function permissions",
                "verify the argument types",
            ],
            _ => &[],
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a runtime failure, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A classified runtime error.
///
/// Build one with [`RuntimeError::new`] and the `with_*` methods, or use one
/// of the helper constructors (`function_not_found`, `timeout`, ...), which
/// carry the stable codes used across the runtime.
#[derive(Error, Debug)]
#[error("[{kind}] ({code}) {message}{}", details_suffix(.details))]
pub struct RuntimeError {
    kind: ErrorKind,
    severity: Severity,
    code: String,
    message: String,
    details: Option<String>,
    #[source]
    source: Option<BoxError>,
    context: BTreeMap<String, serde_json::Value>,
    recovery_hints: Vec<String>,
    timestamp: SystemTime,
}

#[allow(clippy::ref_option)]
fn details_suffix(details: &Option<String>) -> String {
    details
        .as_deref()
        .map(|d| format!(" - {d}"))
        .unwrap_or_default()
}

impl RuntimeError {
    /// Create an error with the default severity and recovery hints of `kind`.
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            code: code.into(),
            message: message.into(),
            details: None,
            source: None,
            context: BTreeMap::new(),
            recovery_hints: kind
                .default_recovery_hints()
                .iter()
                .map(|h| (*h).to_string())
                .collect(),
            timestamp: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Replace the default recovery hints with explicit ones.
    #[must_use]
    pub fn with_hints<I, S>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recovery_hints = hints.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hints.push(hint.into());
        self
    }

    // ------------------------------------------------------------------
    // Helper constructors
    // ------------------------------------------------------------------

    /// Bytecode was rejected before or during parsing.
    pub fn invalid_bytecode(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Compilation, "INVALID_BYTECODE", "Invalid bytecode")
            .with_severity(Severity::High)
            .with_details(reason)
    }

    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Compilation, "COMPILATION_FAILED", "Compilation failed")
            .with_severity(Severity::High)
            .with_details(reason)
    }

    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Execution,
            "INSTANTIATION_FAILED",
            "Instantiation failed",
        )
        .with_severity(Severity::High)
        .with_details(reason)
        .with_hints(["check the module's imports", "verify the memory limit"])
    }

    pub fn module_not_found(module_id: impl Into<String>) -> Self {
        let module_id = module_id.into();
        Self::new(ErrorKind::ModuleNotFound, "MODULE_NOT_FOUND", "Module not found")
            .with_severity(Severity::Medium)
            .with_details(module_id.clone())
            .with_context("module_id", module_id)
    }

    pub fn function_not_found(function: impl Into<String>) -> Self {
        let function = function.into();
        Self::new(
            ErrorKind::FunctionNotFound,
            "FUNCTION_NOT_FOUND",
            "Function not found",
        )
        .with_severity(Severity::Medium)
        .with_details(function.clone())
        .with_context("function", function)
        .with_hints([
            "check the function name",
            "verify the module's exported functions",
        ])
    }

    pub fn execution_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, "EXECUTION_FAILED", "Execution failed")
            .with_severity(Severity::High)
            .with_details(reason)
    }

    pub fn timeout(after: Duration) -> Self {
        let ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        Self::new(ErrorKind::Timeout, "EXECUTION_TIMEOUT", "Execution timed out")
            .with_details(format!("deadline of {ms}ms exceeded"))
            .with_context("timeout_ms", ms)
    }

    pub fn resource_exhausted(used: u64, limit: u64) -> Self {
        Self::new(
            ErrorKind::ResourceExhausted,
            "RESOURCE_EXHAUSTED",
            "Resource fee limit exhausted",
        )
        .with_details(format!("used {used} of {limit}"))
        .with_context("resource_used", used)
        .with_context("resource_fee_limit", limit)
    }

    /// A scratch allocation did not fit in the remaining linear memory.
    pub fn out_of_memory(requested: usize, available: usize) -> Self {
        Self::new(ErrorKind::Memory, "OUT_OF_MEMORY", "Out of linear memory")
            .with_details(format!("requested {requested} bytes, {available} available"))
            .with_context("requested", requested)
            .with_context("available", available)
    }

    pub fn memory_limit_exceeded(used: u64, limit: u64) -> Self {
        Self::new(
            ErrorKind::Memory,
            "MEMORY_LIMIT_EXCEEDED",
            "Memory limit exceeded",
        )
        .with_details(format!("used {used} bytes, limit {limit}"))
        .with_context("memory_used", used)
        .with_context("memory_limit", limit)
    }

    pub fn stack_overflow() -> Self {
        Self::new(ErrorKind::StackOverflow, "STACK_OVERFLOW", "Call stack exhausted")
            .with_hint("reduce recursion depth")
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message).with_severity(Severity::Medium)
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::validation("INVALID_PARAMS", "Invalid execution parameters").with_details(reason)
    }

    pub fn host_permission(function: impl Into<String>, reason: impl Into<String>) -> Self {
        let function = function.into();
        Self::new(
            ErrorKind::HostPermission,
            "HOST_PERMISSION_DENIED",
            "Host call denied",
        )
        .with_severity(Severity::Medium)
        .with_details(format!("{function}: {}", reason.into()))
        .with_context("function", function)
        .with_hints(["check the host call policy", "verify the security configuration"])
    }

    pub fn host_function(
        function: impl Into<String>,
        code: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let function = function.into();
        Self::new(ErrorKind::HostFunction, code, "Host function error")
            .with_severity(Severity::Medium)
            .with_details(format!("{function}: {}", reason.into()))
            .with_context("function", function)
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Configuration,
            "INVALID_CONFIG",
            "Invalid configuration",
        )
        .with_severity(Severity::High)
        .with_details(reason)
        .with_hints(["check the configuration file", "verify value ranges"])
    }

    /// An operation was attempted on an instance or engine that is closed.
    pub fn closed(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, "CLOSED", "Handle already closed")
            .with_severity(Severity::Medium)
            .with_details(what)
    }

    pub fn lifecycle(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, code, message).with_severity(Severity::Medium)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "INTERNAL", "Internal error").with_details(reason)
    }

    /// Join several errors into the most severe one, attaching the rest as
    /// `related_error_N` context entries. Returns `None` for an empty input.
    pub fn merge(errors: Vec<RuntimeError>) -> Option<RuntimeError> {
        let main_index = errors
            .iter()
            .enumerate()
            .fold(None::<(usize, Severity)>, |best, (i, e)| match best {
                Some((_, s)) if s >= e.severity => best,
                _ => Some((i, e.severity)),
            })?
            .0;

        let mut related = Vec::new();
        let mut main = None;
        for (i, err) in errors.into_iter().enumerate() {
            if i == main_index {
                main = Some(err);
            } else {
                related.push((i, err.to_string()));
            }
        }

        main.map(|mut main| {
            for (i, text) in related {
                main.context.insert(format!("related_error_{i}"), text.into());
            }
            main
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn context(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.context
    }

    pub fn recovery_hints(&self) -> &[String] {
        &self.recovery_hints
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Whether a caller may retry, possibly with a larger budget.
    ///
    /// Timeouts and exhausted fees are always recoverable; memory and stack
    /// overflow only at low or medium severity; everything else is not.
    pub fn is_recoverable(&self) -> bool {
        match self.kind {
            ErrorKind::Timeout | ErrorKind::ResourceExhausted => true,
            ErrorKind::Memory | ErrorKind::StackOverflow => self.severity <= Severity::Medium,
            _ => false,
        }
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ResourceExhausted | ErrorKind::Memory | ErrorKind::Timeout
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ModuleNotFound | ErrorKind::FunctionNotFound
        )
    }
}

/// Aggregated error counters owned by one component.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub by_kind: BTreeMap<ErrorKind, u64>,
    pub by_severity: BTreeMap<Severity, u64>,
    pub recoverable_errors: u64,
    pub last_error_at: Option<SystemTime>,
}

/// Callback invoked for every tracked error.
pub type ErrorCallback = Box<dyn Fn(&RuntimeError) + Send + Sync>;

/// Records errors and notifies registered callbacks.
#[derive(Default)]
pub struct ErrorTracker {
    stats: Mutex<ErrorStats>,
    callbacks: RwLock<Vec<ErrorCallback>>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `err` and pass it to every callback in registration order.
    pub fn record(&self, err: &RuntimeError) {
        debug!(
            kind = %err.kind(),
            severity = %err.severity(),
            code = err.code(),
            recoverable = err.is_recoverable(),
            "Runtime error recorded"
        );

        {
            let mut stats = self.stats.lock();
            stats.total_errors += 1;
            *stats.by_kind.entry(err.kind()).or_default() += 1;
            *stats.by_severity.entry(err.severity()).or_default() += 1;
            if err.is_recoverable() {
                stats.recoverable_errors += 1;
            }
            stats.last_error_at = Some(err.timestamp());
        }

        for callback in self.callbacks.read().iter() {
            callback(err);
        }
    }

    pub fn register_callback(&self, callback: ErrorCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn stats(&self) -> ErrorStats {
        self.stats.lock().clone()
    }

    pub fn reset(&self) {
        *self.stats.lock() = ErrorStats::default();
    }
}

impl fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("total_errors", &self.stats.lock().total_errors)
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::function_not_found("transfer");
        assert_eq!(
            err.to_string(),
            "[function_not_found] (FUNCTION_NOT_FOUND) Function not found - transfer"
        );

        let err = RuntimeError::new(ErrorKind::Internal, "X", "boom");
        assert_eq!(err.to_string(), "[internal] (X) boom");
    }

    #[test]
    fn test_default_severity_and_hints() {
        let err = RuntimeError::new(ErrorKind::Timeout, "T", "slow");
        assert_eq!(err.severity(), Severity::Medium);
        assert_eq!(err.recovery_hints().len(), 2);

        let err = RuntimeError::new(ErrorKind::System, "S", "down");
        assert_eq!(err.severity(), Severity::Critical);
        assert!(err.recovery_hints().is_empty());

        let err = RuntimeError::new(ErrorKind::Validation, "V", "bad");
        assert_eq!(err.severity(), Severity::Low);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(RuntimeError::timeout(Duration::from_millis(5)).is_recoverable());
        assert!(RuntimeError::resource_exhausted(10, 5).is_recoverable());

        let high = RuntimeError::out_of_memory(10, 0);
        assert_eq!(high.severity(), Severity::High);
        assert!(!high.is_recoverable());
        assert!(high.with_severity(Severity::Medium).is_recoverable());

        assert!(!RuntimeError::stack_overflow().is_recoverable());
        assert!(
            RuntimeError::stack_overflow()
                .with_severity(Severity::Low)
                .is_recoverable()
        );

        assert!(!RuntimeError::host_permission("f", "denied").is_recoverable());
        assert!(!RuntimeError::invalid_bytecode("empty").is_recoverable());
        assert!(!RuntimeError::internal("x").is_recoverable());
    }

    #[test]
    fn test_is_resource_limit() {
        assert!(RuntimeError::resource_exhausted(1, 1).is_resource_limit());
        assert!(RuntimeError::memory_limit_exceeded(2, 1).is_resource_limit());
        assert!(RuntimeError::timeout(Duration::from_millis(1)).is_resource_limit());
        assert!(!RuntimeError::module_not_found("m").is_resource_limit());
    }

    #[test]
    fn test_context_and_source() {
        let io = std::io::Error::other("disk");
        let err = RuntimeError::internal("wrapped")
            .with_source(io)
            .with_context("attempt", 3);

        assert_eq!(err.context()["attempt"], serde_json::json!(3));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_merge_keeps_most_severe() {
        let merged = RuntimeError::merge(vec![
            RuntimeError::validation("A", "first"),
            RuntimeError::internal("second"),
            RuntimeError::timeout(Duration::from_millis(1)),
        ])
        .unwrap();

        assert_eq!(merged.kind(), ErrorKind::Internal);
        assert!(merged.context().contains_key("related_error_0"));
        assert!(merged.context().contains_key("related_error_2"));

        assert!(RuntimeError::merge(Vec::new()).is_none());
    }

    #[test]
    fn test_error_tracker() {
        let tracker = ErrorTracker::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        tracker.register_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tracker.record(&RuntimeError::timeout(Duration::from_millis(1)));
        tracker.record(&RuntimeError::function_not_found("f"));

        let stats = tracker.stats();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.recoverable_errors, 1);
        assert_eq!(stats.by_kind[&ErrorKind::Timeout], 1);
        assert_eq!(stats.by_severity[&Severity::Medium], 2);
        assert!(stats.last_error_at.is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        tracker.reset();
        assert_eq!(tracker.stats().total_errors, 0);
    }
}
