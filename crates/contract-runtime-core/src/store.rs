//! Per-instance store data.
//!
//! This module provides:
//! - [`InstanceState`]: State reachable from host functions through
//!   [`wasmtime::Caller`]
//! - [`LogEntry`] and [`LogLevel`]: Logs emitted by guest code
//! - [`ContractEvent`]: Events emitted by guest code
//! - [`CallEnv`]: Read-only call environment exposed to host functions

use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use wasmtime::{Store, StoreLimits};

use crate::meter::ResourceMeter;
use crate::security::SecurityManager;

/// Data stored inside every instance's [`Store`].
///
/// Guest logs and events accumulate per call and are drained by the caller
/// once the call finishes.
pub struct InstanceState {
    /// Identifier of the owning instance, used in traces.
    pub instance_id: String,

    /// Logs collected from guest code during the current call.
    pub logs: Vec<LogEntry>,

    /// Events emitted by guest code during the current call.
    pub events: Vec<ContractEvent>,

    /// Environment of the current call.
    pub env: CallEnv,

    limits: StoreLimits,
    meter: ResourceMeter,
    security: Arc<SecurityManager>,
}

/// Call environment visible to host functions.
#[derive(Debug, Clone, Default)]
pub struct CallEnv {
    pub caller: String,
    pub contract_address: String,
    pub block_height: u64,
}

/// A single log entry from guest code.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: SystemTime,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// An event emitted by guest code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractEvent {
    pub topic: String,
    pub data: Vec<u8>,
}

impl InstanceState {
    pub fn new(
        instance_id: String,
        limits: StoreLimits,
        security: Arc<SecurityManager>,
        host_call_fee: u64,
    ) -> Self {
        Self {
            instance_id,
            logs: Vec::new(),
            events: Vec::new(),
            env: CallEnv::default(),
            limits,
            meter: ResourceMeter::new(host_call_fee),
            security,
        }
    }

    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: SystemTime::now(),
        });
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn meter(&self) -> &ResourceMeter {
        &self.meter
    }

    pub fn meter_mut(&mut self) -> &mut ResourceMeter {
        &mut self.meter
    }

    /// Clear per-call output before the next call.
    pub fn reset_call_output(&mut self) {
        self.logs.clear();
        self.events.clear();
    }
}

impl std::fmt::Debug for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceState")
            .field("instance_id", &self.instance_id)
            .field("logs", &self.logs.len())
            .field("events", &self.events.len())
            .field("meter", &self.meter)
            .finish_non_exhaustive()
    }
}

/// Create a store whose memory and table growth is bounded by `limits`.
pub fn create_store(
    engine: &wasmtime::Engine,
    state: InstanceState,
) -> Store<InstanceState> {
    let mut store = Store::new(engine, state);
    store.limiter(|state| &mut state.limits);
    store
}
