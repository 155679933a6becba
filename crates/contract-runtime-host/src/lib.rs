//! Host functions exposed to contracts.
//!
//! Contracts import these from the `env` namespace. Every call passes the
//! [`SecurityManager`] host-call gate and pays the host-call fee before its
//! effect is applied.
//!
//! # Interfaces
//!
//! - [`logging`]: `env.log`, guest logging captured on the outcome
//! - [`chain`]: `env.emit_event` and `env.block_height`
//! - [`linker`]: Registration on a `Linker<InstanceState>`

pub mod chain;
pub mod linker;
pub mod logging;

use std::sync::Arc;

use contract_runtime_common::{RuntimeConfig, RuntimeError};
use contract_runtime_core::{SecurityManager, Vm};

pub use chain::ChainHost;
pub use linker::register_all;
pub use logging::LoggingHost;

/// Build a [`Vm`] with every standard host function registered.
///
/// # Errors
///
/// Returns an error if the engine cannot be created or registration fails.
pub fn create_vm(
    config: &RuntimeConfig,
    security: Arc<SecurityManager>,
) -> Result<Vm, RuntimeError> {
    let mut vm = Vm::new(config, security)?;
    register_all(vm.linker_mut())?;
    Ok(vm)
}
