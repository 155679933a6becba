//! Per-call execution context.
//!
//! An [`ExecutionContext`] is built from [`ExecutionParams`] before anything
//! is compiled or instantiated. Building validates the params and runs phase
//! one of argument encoding; [`ExecutionContext::bind_to_instance`] runs
//! phase two once a live instance is chosen, writing string and buffer
//! arguments into scratch memory and backpatching their pointer words.

use std::time::{Duration, Instant};

use serde::Serialize;

use contract_runtime_common::{
    ExecutionConfig, ExecutionParams, RuntimeError, ValueType, WASM_PAGE_SIZE,
};

use crate::instance::ContractInstance;
use crate::marshal::{Marshaller, MemoryMappingPlan};

/// Resources a call actually used, filled in after the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub resource_used: u64,
    /// Linear memory size in bytes when the call returned.
    pub memory_used: u64,
}

/// Everything the engine needs for one call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    entry: String,
    resource_fee_limit: u64,
    memory_limit: u32,
    timeout: Duration,
    deadline: Instant,
    caller: String,
    contract_address: String,
    words: Vec<u64>,
    arg_types: Vec<ValueType>,
    return_types: Vec<ValueType>,
    plan: MemoryMappingPlan,
    usage: ResourceUsage,
}

impl ExecutionContext {
    /// Validate `params` and encode the arguments.
    ///
    /// The deadline starts now. A non-positive `timeout_ms` uses
    /// `defaults.timeout_ms`.
    pub fn build(
        params: &ExecutionParams,
        marshaller: &Marshaller,
        defaults: &ExecutionConfig,
    ) -> Result<Self, RuntimeError> {
        params.validate()?;
        let encoded = marshaller.encode_args(&params.args)?;

        let timeout = u64::try_from(params.timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map_or_else(|| defaults.timeout(), Duration::from_millis);

        Ok(Self {
            entry: params.entry.clone(),
            resource_fee_limit: params.resource_fee_limit,
            memory_limit: params.memory_limit,
            timeout,
            deadline: Instant::now() + timeout,
            caller: params.caller.clone(),
            contract_address: params.contract_address.clone(),
            words: encoded.words,
            arg_types: encoded.types,
            return_types: params.return_types.clone(),
            plan: encoded.plan,
            usage: ResourceUsage::default(),
        })
    }

    /// Phase two: write buffer arguments into `instance` and backpatch their
    /// pointer words.
    ///
    /// # Errors
    ///
    /// Fails with `OUT_OF_MEMORY` when a segment does not fit the remaining
    /// scratch space. Segments written before the failing one stay written.
    pub fn bind_to_instance(&mut self, instance: &mut ContractInstance) -> Result<(), RuntimeError> {
        for segment in self.plan.segments_mut() {
            if segment.is_bound() {
                continue;
            }
            let (ptr, _) = instance
                .allocate_and_write_bytes(segment.bytes())
                .map_err(|e| e.with_context("segment", segment.name.clone()))?;
            segment.address = Some(ptr);
            self.words[segment.word_index] = u64::from(ptr);
        }
        Ok(())
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn resource_fee_limit(&self) -> u64 {
        self.resource_fee_limit
    }

    /// Linear memory ceiling in bytes.
    pub fn memory_limit(&self) -> u32 {
        self.memory_limit
    }

    /// Memory ceiling rounded up to whole pages.
    pub fn memory_pages(&self) -> u32 {
        let pages = u64::from(self.memory_limit).div_ceil(WASM_PAGE_SIZE);
        u32::try_from(pages).unwrap_or(u32::MAX)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    /// Native argument words. Pointer words are `0` until bound.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn arg_types(&self) -> &[ValueType] {
        &self.arg_types
    }

    pub fn return_types(&self) -> &[ValueType] {
        &self.return_types
    }

    pub fn plan(&self) -> &MemoryMappingPlan {
        &self.plan
    }

    pub fn usage(&self) -> ResourceUsage {
        self.usage
    }

    pub fn record_usage(&mut self, resource_used: u64, memory_used: u64) {
        self.usage = ResourceUsage {
            resource_used,
            memory_used,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contract_runtime_common::{ErrorKind, MarshalConfig, Value};

    fn build(params: &ExecutionParams) -> Result<ExecutionContext, RuntimeError> {
        ExecutionContext::build(params, &Marshaller::default(), &ExecutionConfig::default())
    }

    #[test]
    fn test_build_encodes_args() {
        let params = ExecutionParams::new("greet", 1000, 65_536)
            .with_args(vec![Value::String("bob".into()), Value::I32(-2)])
            .with_return_types(vec![ValueType::I32]);
        let ctx = build(&params).unwrap();

        assert_eq!(ctx.entry(), "greet");
        assert_eq!(ctx.words(), &[0, 3, u64::MAX - 1]);
        assert_eq!(ctx.arg_types(), &[ValueType::String, ValueType::I32]);
        assert_eq!(ctx.return_types(), &[ValueType::I32]);
        assert_eq!(ctx.plan().segments.len(), 1);
        assert!(!ctx.plan().is_bound());
    }

    #[test]
    fn test_build_rejects_invalid_params() {
        let err = build(&ExecutionParams::new(" ", 1000, 65_536)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = build(&ExecutionParams::new("run", 0, 65_536)).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
    }

    #[test]
    fn test_build_rejects_oversized_args() {
        let marshaller = Marshaller::new(MarshalConfig {
            max_param_size: 2,
            ..Default::default()
        });
        let params =
            ExecutionParams::new("run", 1000, 65_536).with_args(vec![Value::Bytes(vec![0; 3])]);

        let err =
            ExecutionContext::build(&params, &marshaller, &ExecutionConfig::default()).unwrap_err();
        assert_eq!(err.code(), "PARAM_TOO_LARGE");
    }

    #[test]
    fn test_timeout_defaults() {
        let defaults = ExecutionConfig {
            timeout_ms: 1234,
            ..Default::default()
        };
        let marshaller = Marshaller::default();

        for ms in [0, -5] {
            let params = ExecutionParams::new("run", 1, 1).with_timeout_ms(ms);
            let ctx = ExecutionContext::build(&params, &marshaller, &defaults).unwrap();
            assert_eq!(ctx.timeout(), Duration::from_millis(1234));
        }

        let params = ExecutionParams::new("run", 1, 1).with_timeout_ms(50);
        let ctx = ExecutionContext::build(&params, &marshaller, &defaults).unwrap();
        assert_eq!(ctx.timeout(), Duration::from_millis(50));
        assert!(!ctx.is_expired());
        assert!(ctx.remaining() <= Duration::from_millis(50));
    }

    #[test]
    fn test_memory_pages_round_up() {
        let pages = |bytes| build(&ExecutionParams::new("run", 1, bytes)).unwrap().memory_pages();

        assert_eq!(pages(1), 1);
        assert_eq!(pages(65_536), 1);
        assert_eq!(pages(65_537), 2);
        assert_eq!(pages(u32::MAX), 65_536);
    }

    #[test]
    fn test_record_usage() {
        let mut ctx = build(&ExecutionParams::new("run", 10, 10)).unwrap();
        assert_eq!(ctx.usage(), ResourceUsage::default());

        ctx.record_usage(7, 65_536);
        assert_eq!(ctx.usage().resource_used, 7);
        assert_eq!(ctx.usage().memory_used, 65_536);
    }
}
