//! Runtime lifecycle: start/stop state machine, hooks, health and background
//! maintenance.
//!
//! ```text
//! Uninitialized ──start──▶ Initializing ──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                               │                                │           │
//!                               ▼                                ▼           │
//!                             Error ◀────────────────────────────┘           │
//!                               │                                            │
//!                               └──recover──▶ Stopped ◀──────────────────────┘
//! ```
//!
//! Transitions are serialized by an async mutex; the current state lives in
//! a separate lock so readers never wait on a transition in progress.
//! Background tasks (health loop, stats loop, pool cleanup, epoch ticker)
//! share one `watch` cancellation signal and are joined by `stop`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use contract_runtime_common::{LifecycleConfig, RuntimeError};

use crate::executor::ContractExecutor;

/// Lifecycle state of a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Runs during `start`, in registration order. A failure aborts the start.
#[async_trait]
pub trait StartHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_start(&self, executor: &ContractExecutor) -> Result<(), RuntimeError>;
}

/// Runs during `stop`, in registration order. Failures are logged only.
#[async_trait]
pub trait StopHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_stop(&self) -> Result<(), RuntimeError>;
}

/// A named health signal.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthSignal;
}

/// What a [`HealthChecker`] reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSignal {
    pub healthy: bool,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl HealthSignal {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One entry of a [`HealthReport`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    pub message: String,
    pub latency: Duration,
    pub timestamp: SystemTime,
    pub metadata: BTreeMap<String, String>,
}

/// Aggregated health: healthy only when running and every check passes.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub state: LifecycleState,
    pub checks: Vec<HealthCheckResult>,
    pub checked_at: SystemTime,
}

/// Lifecycle counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleStats {
    pub state: LifecycleState,
    pub starts: u64,
    pub stops: u64,
    pub restarts: u64,
    pub health_checks: u64,
    pub failures: u64,
    pub last_start: Option<SystemTime>,
    pub last_stop: Option<SystemTime>,
    /// Time spent running across every start, including the current run.
    pub total_uptime: Duration,
    pub current_uptime: Duration,
}

#[derive(Default)]
struct StatsInner {
    stats: LifecycleStats,
    running_since: Option<Instant>,
}

/// State reachable from background tasks.
struct Shared {
    executor: Arc<ContractExecutor>,
    state: RwLock<LifecycleState>,
    checkers: RwLock<Vec<Arc<dyn HealthChecker>>>,
    stats: Mutex<StatsInner>,
    last_health: RwLock<Option<HealthReport>>,
}

impl Shared {
    fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    fn set_state(&self, next: LifecycleState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        self.stats.lock().stats.state = next;
        debug!(from = %previous, to = %next, "Lifecycle transition");
    }

    fn record_failure(&self) {
        self.stats.lock().stats.failures += 1;
    }

    async fn check_health(&self) -> HealthReport {
        let state = self.state();
        let checkers = self.checkers.read().clone();

        let mut checks = Vec::with_capacity(checkers.len() + 1);
        checks.push(HealthCheckResult {
            name: "lifecycle".to_string(),
            healthy: state == LifecycleState::Running,
            message: format!("state is {state}"),
            latency: Duration::ZERO,
            timestamp: SystemTime::now(),
            metadata: BTreeMap::new(),
        });

        for checker in &checkers {
            let start = Instant::now();
            let signal = checker.check().await;
            checks.push(HealthCheckResult {
                name: checker.name().to_string(),
                healthy: signal.healthy,
                message: signal.message,
                latency: start.elapsed(),
                timestamp: SystemTime::now(),
                metadata: signal.metadata,
            });
        }

        let report = HealthReport {
            healthy: checks.iter().all(|check| check.healthy),
            state,
            checks,
            checked_at: SystemTime::now(),
        };

        self.stats.lock().stats.health_checks += 1;
        *self.last_health.write() = Some(report.clone());
        report
    }
}

/// Owns the runtime's start/stop state machine and background tasks.
pub struct LifecycleManager {
    config: LifecycleConfig,
    shared: Arc<Shared>,
    transition: tokio::sync::Mutex<()>,
    start_hooks: RwLock<Vec<Arc<dyn StartHook>>>,
    stop_hooks: RwLock<Vec<Arc<dyn StopHook>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig, executor: Arc<ContractExecutor>) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                executor,
                state: RwLock::new(LifecycleState::Uninitialized),
                checkers: RwLock::new(Vec::new()),
                stats: Mutex::new(StatsInner::default()),
                last_health: RwLock::new(None),
            }),
            transition: tokio::sync::Mutex::new(()),
            start_hooks: RwLock::new(Vec::new()),
            stop_hooks: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }
    }

    pub fn executor(&self) -> &Arc<ContractExecutor> {
        &self.shared.executor
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn register_start_hook(&self, hook: Arc<dyn StartHook>) {
        self.start_hooks.write().push(hook);
    }

    pub fn register_stop_hook(&self, hook: Arc<dyn StopHook>) {
        self.stop_hooks.write().push(hook);
    }

    pub fn register_health_checker(&self, checker: Arc<dyn HealthChecker>) {
        self.shared.checkers.write().push(checker);
    }

    /// Start the runtime.
    ///
    /// # Errors
    ///
    /// `ALREADY_RUNNING` / `INVALID_STATE` leave the state unchanged. A failing
    /// start hook or `START_TIMEOUT` moves the runtime to `Error`.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let _transition = self.transition.lock().await;

        match self.state() {
            LifecycleState::Running => {
                return Err(RuntimeError::lifecycle(
                    "ALREADY_RUNNING",
                    "Runtime is already running",
                ));
            }
            state @ (LifecycleState::Stopping | LifecycleState::Initializing) => {
                return Err(RuntimeError::lifecycle("INVALID_STATE", "Cannot start now")
                    .with_context("state", state.to_string()));
            }
            _ => {}
        }

        self.shared.set_state(LifecycleState::Initializing);
        info!("Starting runtime");

        let hooks = self.start_hooks.read().clone();
        let executor = Arc::clone(&self.shared.executor);
        let init = async {
            executor.open();
            for hook in &hooks {
                debug!(hook = hook.name(), "Running start hook");
                hook.on_start(&executor)
                    .await
                    .map_err(|e| e.with_context("hook", hook.name()))?;
            }
            Ok::<(), RuntimeError>(())
        };

        let timeout = self.config.start_timeout();
        let result = match tokio::time::timeout(timeout, init).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::lifecycle(
                "START_TIMEOUT",
                "Start did not finish in time",
            )
            .with_details(format!("timeout {}ms", timeout.as_millis()))),
        };

        if let Err(err) = result {
            error!(error = %err, "Runtime failed to start");
            self.shared.executor.close();
            self.shared.record_failure();
            self.shared.set_state(LifecycleState::Error);
            return Err(err);
        }

        self.shared.set_state(LifecycleState::Running);
        {
            let mut inner = self.shared.stats.lock();
            inner.stats.starts += 1;
            inner.stats.last_start = Some(SystemTime::now());
            inner.running_since = Some(Instant::now());
        }
        self.spawn_background();

        info!("Runtime started");
        Ok(())
    }

    /// Stop the runtime, waiting up to `timeout` for background tasks.
    ///
    /// # Errors
    ///
    /// `NOT_RUNNING` leaves the state unchanged. `STOP_TIMEOUT` aborts the
    /// remaining tasks and moves the runtime to `Error`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), RuntimeError> {
        let _transition = self.transition.lock().await;

        let state = self.state();
        if state != LifecycleState::Running {
            return Err(RuntimeError::lifecycle("NOT_RUNNING", "Runtime is not running")
                .with_context("state", state.to_string()));
        }

        self.shared.set_state(LifecycleState::Stopping);
        info!("Stopping runtime");

        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }

        let hooks = self.stop_hooks.read().clone();
        for hook in &hooks {
            if let Err(err) = hook.on_stop().await {
                warn!(hook = hook.name(), error = %err, "Stop hook failed");
                self.shared.record_failure();
            }
        }

        self.shared.executor.close();

        let handles = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(timeout, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        {
            let mut inner = self.shared.stats.lock();
            if let Some(since) = inner.running_since.take() {
                inner.stats.total_uptime += since.elapsed();
            }
            inner.stats.last_stop = Some(SystemTime::now());
        }

        if joined.is_err() {
            for abort in aborts {
                abort.abort();
            }
            self.shared.record_failure();
            self.shared.set_state(LifecycleState::Error);
            error!("Background tasks did not stop in time");
            return Err(RuntimeError::lifecycle(
                "STOP_TIMEOUT",
                "Background tasks did not stop in time",
            ));
        }

        self.shared.stats.lock().stats.stops += 1;
        self.shared.set_state(LifecycleState::Stopped);
        info!("Runtime stopped");
        Ok(())
    }

    /// Stop (when running) and start again.
    ///
    /// # Errors
    ///
    /// `RESTART_STOP_FAILED` or `RESTART_START_FAILED`, with the underlying
    /// error as the source.
    pub async fn restart(&self) -> Result<(), RuntimeError> {
        if self.state() != LifecycleState::Stopped {
            self.stop(self.config.stop_timeout()).await.map_err(|e| {
                RuntimeError::lifecycle("RESTART_STOP_FAILED", "Restart failed while stopping")
                    .with_source(e)
            })?;
        }

        self.start().await.map_err(|e| {
            RuntimeError::lifecycle("RESTART_START_FAILED", "Restart failed while starting")
                .with_source(e)
        })?;

        self.shared.stats.lock().stats.restarts += 1;
        Ok(())
    }

    /// Move from `Error` back to `Stopped`.
    ///
    /// # Errors
    ///
    /// `INVALID_STATE` from any other state.
    pub async fn recover(&self) -> Result<(), RuntimeError> {
        let _transition = self.transition.lock().await;

        let state = self.state();
        if state != LifecycleState::Error {
            return Err(RuntimeError::lifecycle("INVALID_STATE", "Only an errored runtime can recover")
                .with_context("state", state.to_string()));
        }

        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        for task in std::mem::take(&mut *self.tasks.lock()) {
            task.abort();
        }
        self.shared.executor.close();
        self.shared.set_state(LifecycleState::Stopped);
        info!("Runtime recovered");
        Ok(())
    }

    /// Run every health check now.
    pub async fn check_health(&self) -> HealthReport {
        self.shared.check_health().await
    }

    /// Most recent health report, if any check has run.
    pub fn last_health(&self) -> Option<HealthReport> {
        self.shared.last_health.read().clone()
    }

    pub fn stats(&self) -> LifecycleStats {
        let inner = self.shared.stats.lock();
        let mut stats = inner.stats.clone();
        if let Some(since) = inner.running_since {
            stats.current_uptime = since.elapsed();
            stats.total_uptime += stats.current_uptime;
        }
        stats
    }

    fn spawn_background(&self) {
        let (tx, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if self.config.auto_health_check {
            let shared = Arc::clone(&self.shared);
            tasks.push(tokio::spawn(run_every(
                self.config.health_check_interval(),
                rx.clone(),
                move || {
                    let shared = Arc::clone(&shared);
                    async move {
                        let report = shared.check_health().await;
                        if !report.healthy {
                            let failing: Vec<_> = report
                                .checks
                                .iter()
                                .filter(|c| !c.healthy)
                                .map(|c| c.name.clone())
                                .collect();
                            warn!(?failing, "Health check failed");
                        }
                    }
                },
            )));
        }

        let executor = Arc::clone(&self.shared.executor);
        tasks.push(tokio::spawn(run_every(
            self.config.stats_interval(),
            rx.clone(),
            move || {
                let executor = Arc::clone(&executor);
                async move {
                    let stats = executor.stats();
                    let pool = executor.pool().stats();
                    let security = executor.security().stats();
                    info!(
                        executions = stats.executions,
                        failed = stats.failed,
                        resource_used = stats.total_resource_used,
                        pooled = pool.resident,
                        pool_hits = pool.hits,
                        host_call_violations = security.host_call_violations,
                        "Runtime stats"
                    );
                }
            },
        )));

        let pool = Arc::clone(self.shared.executor.pool());
        let cleanup_interval = pool.config().cleanup_interval();
        tasks.push(tokio::spawn(pool.cleanup_loop(cleanup_interval, rx.clone())));

        let vm = Arc::clone(self.shared.executor.vm());
        if vm.engine().is_epoch_enabled() {
            tasks.push(tokio::spawn(run_every(
                self.config.epoch_tick(),
                rx,
                move || {
                    vm.engine().increment_epoch();
                    std::future::ready(())
                },
            )));
        }

        debug!(tasks = tasks.len(), "Background tasks spawned");
        *self.tasks.lock() = tasks;
        *self.shutdown.lock() = Some(tx);
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.get_mut().take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Call `tick` every `interval` until `shutdown` turns true.
async fn run_every<F, Fut>(interval: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
