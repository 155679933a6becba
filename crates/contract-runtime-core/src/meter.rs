//! Resource metering.
//!
//! The resource fee of a call is Wasmtime fuel: the store is armed with the
//! call's fee limit before the call and the consumed amount is
//! `limit - remaining` afterwards. Host calls are charged a fixed fee on top
//! of the instructions they cost, taken from the same fuel so a contract can
//! never spend more than its limit. Fuel is always enabled on the engine, so
//! metering cannot be bypassed.

use std::time::Duration;

use wasmtime::{Caller, Store};

use contract_runtime_common::RuntimeError;

use crate::store::InstanceState;

/// Per-instance meter state for the current call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceMeter {
    fee_limit: u64,
    host_call_fee: u64,
    host_calls: u64,
}

impl ResourceMeter {
    pub fn new(host_call_fee: u64) -> Self {
        Self {
            fee_limit: 0,
            host_call_fee,
            host_calls: 0,
        }
    }

    pub fn fee_limit(&self) -> u64 {
        self.fee_limit
    }

    pub fn host_call_fee(&self) -> u64 {
        self.host_call_fee
    }

    /// Host calls charged during the current call.
    pub fn host_calls(&self) -> u64 {
        self.host_calls
    }
}

/// Arm `store` for a call: fuel set to `fee_limit` and, when epoch
/// interruption is on, a deadline `timeout` ticks (milliseconds) away.
pub fn arm(
    store: &mut Store<InstanceState>,
    fee_limit: u64,
    timeout: Option<Duration>,
) -> Result<(), RuntimeError> {
    store
        .set_fuel(fee_limit)
        .map_err(|e| RuntimeError::internal(format!("Failed to set fuel: {e}")))?;

    if let Some(timeout) = timeout {
        let ticks = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        store.set_epoch_deadline(ticks);
    }

    let meter = store.data_mut().meter_mut();
    meter.fee_limit = fee_limit;
    meter.host_calls = 0;
    Ok(())
}

/// Fee consumed since the store was last armed.
pub fn consumed(store: &Store<InstanceState>) -> u64 {
    let limit = store.data().meter().fee_limit;
    let remaining = store.get_fuel().unwrap_or(0);
    limit.saturating_sub(remaining)
}

/// Charge the fixed host-call fee against the running call's budget.
///
/// # Errors
///
/// Returns `RESOURCE_EXHAUSTED` (and drains the remaining fuel) when the
/// budget cannot cover the fee.
pub fn charge_host_call(caller: &mut Caller<'_, InstanceState>) -> Result<(), RuntimeError> {
    let fee = caller.data().meter().host_call_fee;
    let limit = caller.data().meter().fee_limit;
    let remaining = caller
        .get_fuel()
        .map_err(|e| RuntimeError::internal(format!("Failed to read fuel: {e}")))?;

    if remaining < fee {
        caller
            .set_fuel(0)
            .map_err(|e| RuntimeError::internal(format!("Failed to set fuel: {e}")))?;
        return Err(RuntimeError::resource_exhausted(limit, limit));
    }

    caller
        .set_fuel(remaining - fee)
        .map_err(|e| RuntimeError::internal(format!("Failed to set fuel: {e}")))?;
    caller.data_mut().meter_mut().host_calls += 1;
    Ok(())
}
