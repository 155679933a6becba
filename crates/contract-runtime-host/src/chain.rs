//! Contract environment host functions: events and chain state.

use contract_runtime_core::store::{ContractEvent, InstanceState};
use tracing::debug;

/// Host side of `env.emit_event` and `env.block_height`.
pub struct ChainHost;

impl ChainHost {
    /// Append an event to the current call's output.
    pub fn emit_event(state: &mut InstanceState, topic: String, data: Vec<u8>) {
        debug!(
            instance_id = %state.instance_id,
            topic = %topic,
            data_len = data.len(),
            "Contract event emitted"
        );
        state.events.push(ContractEvent { topic, data });
    }

    /// Block height of the current call, saturated to `i64`.
    pub fn block_height(state: &InstanceState) -> i64 {
        i64::try_from(state.env.block_height).unwrap_or(i64::MAX)
    }
}
