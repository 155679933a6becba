//! Guest logging.
//!
//! Guest logs are both kept on the instance (returned with the execution
//! outcome) and re-emitted through `tracing` with `guest_log = true`.

use contract_runtime_core::store::{InstanceState, LogLevel};
use tracing::{debug, error, info, warn};

/// Host side of `env.log`.
pub struct LoggingHost;

impl LoggingHost {
    /// Record `message` on the instance and emit it via `tracing`.
    pub fn log(state: &mut InstanceState, level: LogLevel, message: &str) {
        state.log(level, message.to_string());

        let instance_id = &state.instance_id;
        match level {
            LogLevel::Debug => debug!(instance_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(instance_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(instance_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(instance_id, guest_log = true, "{}", message),
        }
    }
}

/// Map a guest log level (0=debug, 1=info, 2=warn, 3=error). Unknown values
/// log at info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}
