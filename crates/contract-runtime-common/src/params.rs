//! External execution parameters.
//!
//! [`ExecutionParams`] is what a higher-level coordinator hands the runtime
//! for one call: the module bytecode, the entry point, the budgets, and the
//! typed arguments and expected return types.

use serde::{Deserialize, Serialize};

use crate::{RuntimeError, Value, ValueType};

/// Parameters of a single contract call.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutionParams {
    /// Exported function to call. Must be non-empty.
    pub entry: String,

    /// Fee budget for the call. Must be greater than zero.
    pub resource_fee_limit: u64,

    /// Linear memory ceiling in bytes. Must be greater than zero.
    pub memory_limit: u32,

    /// Wall-clock timeout in milliseconds. Non-positive values use the
    /// runtime default.
    #[serde(default)]
    pub timeout_ms: i64,

    #[serde(default)]
    pub caller: String,

    #[serde(default)]
    pub contract_address: String,

    /// Chain height visible to the contract through `env.block_height`.
    #[serde(default)]
    pub block_height: u64,

    /// Module bytecode.
    #[serde(default, skip_serializing)]
    pub payload: Vec<u8>,

    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub return_types: Vec<ValueType>,
}

impl ExecutionParams {
    pub fn new(entry: impl Into<String>, resource_fee_limit: u64, memory_limit: u32) -> Self {
        Self {
            entry: entry.into(),
            resource_fee_limit,
            memory_limit,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_return_types(mut self, return_types: Vec<ValueType>) -> Self {
        self.return_types = return_types;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller: impl Into<String>, contract_address: impl Into<String>) -> Self {
        self.caller = caller.into();
        self.contract_address = contract_address.into();
        self
    }

    #[must_use]
    pub fn with_block_height(mut self, block_height: u64) -> Self {
        self.block_height = block_height;
        self
    }

    /// Check the required fields.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.entry.trim().is_empty() {
            return Err(RuntimeError::invalid_params("entry must not be empty"));
        }
        if self.resource_fee_limit == 0 {
            return Err(RuntimeError::invalid_params(
                "resource_fee_limit must be greater than 0",
            ));
        }
        if self.memory_limit == 0 {
            return Err(RuntimeError::invalid_params(
                "memory_limit must be greater than 0",
            ));
        }
        Ok(())
    }
}
