//! Integration tests for contract-runtime-core.
//!
//! These tests drive the complete execution pipeline with the standard host
//! functions linked in:
//! - Parameter validation and argument marshalling
//! - Compilation and module validation
//! - Pooled instantiation and metered calls
//! - Host-call gating (allow/deny lists, side-effect policy)
//! - Threat scoring of finished calls
//! - Lifecycle transitions

use std::sync::Arc;
use std::time::Duration;

use contract_runtime_common::{
    EngineConfig, ErrorKind, ExecutionParams, LifecycleConfig, MarshalConfig, PoolConfig,
    RuntimeConfig, SecurityConfig, Value, ValueType,
};
use contract_runtime_core::store::LogLevel;
use contract_runtime_core::{
    CompiledModule, ContractExecutor, InstanceConfig, InstancePool, LifecycleManager,
    LifecycleState, Marshaller, SecurityManager, ThreatPattern,
};
use contract_runtime_host::create_vm;

const CONTRACT: &str = r#"
    (module
        (import "env" "log" (func $log (param i32 i32 i32)))
        (import "env" "emit_event" (func $emit (param i32 i32 i32 i32)))
        (import "env" "block_height" (func $height (result i64)))
        (memory (export "memory") 1)
        (data (i32.const 0) "hello")
        (data (i32.const 16) "transfer")
        (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add)
        (func (export "greet")
            (call $log (i32.const 2) (i32.const 0) (i32.const 5)))
        (func (export "emit")
            (call $emit (i32.const 16) (i32.const 8) (i32.const 0) (i32.const 5)))
        (func (export "height") (result i64)
            call $height)
        (func (export "echo") (param i32 i32) (result i32 i32)
            local.get 0
            local.get 1)
        (func (export "spin")
            (loop $l (br $l))))
"#;

/// Binary encoding of `(func (export "add") (param i32 i32) (result i32))`.
const ADD_WASM: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
    0x01, 0x07, 0x01, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f, // type
    0x03, 0x02, 0x01, 0x00, // function
    0x07, 0x07, 0x01, 0x03, b'a', b'd', b'd', 0x00, 0x00, // export
    0x0a, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b, // code
];

fn runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        engine: EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn executor_with(security: SecurityConfig, pool: PoolConfig) -> ContractExecutor {
    let config = runtime_config();
    let security = Arc::new(SecurityManager::new(security));
    let vm = Arc::new(create_vm(&config, security).unwrap());
    let pool = Arc::new(InstancePool::new(pool));
    ContractExecutor::new(vm, pool, Marshaller::new(MarshalConfig::default()))
}

fn executor() -> ContractExecutor {
    executor_with(SecurityConfig::default(), PoolConfig::default())
}

fn contract(executor: &ContractExecutor) -> Arc<CompiledModule> {
    executor.vm().compile_wat(CONTRACT).unwrap()
}

// ============================================================================
// Test: Basic Execution
// ============================================================================

#[tokio::test]
async fn test_add_within_budget() {
    let executor = executor();
    let params = ExecutionParams::new("add", 1000, 65_536)
        .with_args(vec![Value::I32(2), Value::I32(3)])
        .with_return_types(vec![ValueType::I32]);

    let outcome = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap();

    assert_eq!(outcome.values, vec![Value::I32(5)]);
    assert!(outcome.resource_used > 0);
    assert!(outcome.resource_used <= 1000);
}

#[tokio::test]
async fn test_execute_from_payload() {
    let executor = executor();
    let params = ExecutionParams::new("add", 1000, 65_536)
        .with_payload(ADD_WASM.to_vec())
        .with_args(vec![Value::I32(40), Value::I32(2)]);

    let outcome = executor.execute(&params).await.unwrap();
    assert_eq!(outcome.values, vec![Value::I32(42)]);
    assert_eq!(executor.vm().cache_len(), 1);
}

#[tokio::test]
async fn test_string_argument_round_trip() {
    let executor = executor();
    let params = ExecutionParams::new("echo", 1000, 65_536)
        .with_args(vec![Value::String("contract".into())])
        .with_return_types(vec![ValueType::String]);

    let outcome = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap();
    assert_eq!(outcome.values, vec![Value::String("contract".into())]);
}

// ============================================================================
// Test: Resource Limits
// ============================================================================

#[tokio::test]
async fn test_fee_exhaustion() {
    let executor = executor();
    let params = ExecutionParams::new("spin", 10_000, 65_536);

    let err = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert!(err.is_resource_limit());
}

#[tokio::test]
async fn test_oversized_argument_is_out_of_memory() {
    let executor = executor();
    let module = contract(&executor);
    // Scratch space starts at the midpoint of a single page
    let params = ExecutionParams::new("echo", 1000, 65_536)
        .with_args(vec![Value::Bytes(vec![7; 40_000])]);

    let err = executor
        .execute_module(Arc::clone(&module), &params)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "OUT_OF_MEMORY");
    assert_eq!(executor.pool().idle_count(module.content_hash()), 0);
}

// ============================================================================
// Test: Host Functions
// ============================================================================

#[tokio::test]
async fn test_guest_log_captured() {
    let executor = executor();
    let params = ExecutionParams::new("greet", 10_000, 65_536);

    let outcome = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap();

    assert_eq!(outcome.logs.len(), 1);
    assert_eq!(outcome.logs[0].level, LogLevel::Warn);
    assert_eq!(outcome.logs[0].message, "hello");
    assert_eq!(executor.security().stats().host_calls_validated, 1);
}

#[tokio::test]
async fn test_block_height_from_params() {
    let executor = executor();
    let params = ExecutionParams::new("height", 10_000, 65_536)
        .with_block_height(1_234)
        .with_return_types(vec![ValueType::I64]);

    let outcome = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap();
    assert_eq!(outcome.values, vec![Value::I64(1_234)]);
}

#[tokio::test]
async fn test_denied_host_call() {
    let executor = executor_with(
        SecurityConfig {
            denied_host_functions: vec!["block_height".into()],
            ..Default::default()
        },
        PoolConfig::default(),
    );
    let before = executor.security().stats().host_call_violations;

    let params = ExecutionParams::new("height", 10_000, 65_536);
    let err = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HostPermission);
    assert_eq!(
        executor.security().stats().host_call_violations,
        before + 1
    );
}

#[tokio::test]
async fn test_emit_event_requires_policy() {
    let executor = executor();
    let params = ExecutionParams::new("emit", 10_000, 65_536);

    let err = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HostPermission);
}

#[tokio::test]
async fn test_emit_event_allowed() {
    let executor = executor_with(
        SecurityConfig::default().allow_side_effects("emit_event"),
        PoolConfig::default(),
    );
    let params = ExecutionParams::new("emit", 10_000, 65_536);

    let outcome = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap();

    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].topic, "transfer");
    assert_eq!(outcome.events[0].data, b"hello".to_vec());
}

// ============================================================================
// Test: Instance Pool
// ============================================================================

#[tokio::test]
async fn test_pool_identity_and_capacity() {
    let executor = executor_with(
        SecurityConfig::default(),
        PoolConfig {
            max_per_module: 1,
            ..Default::default()
        },
    );
    let module = contract(&executor);
    let config = InstanceConfig::default();

    let first = executor.vm().instantiate(&module, &config).await.unwrap();
    let second = executor.vm().instantiate(&module, &config).await.unwrap();
    let first_id = first.id().to_string();
    assert_ne!(first_id, second.id());

    assert!(executor.pool().put(first));
    assert!(!executor.pool().put(second));

    let pages = config.memory_limit_pages;
    let reused = executor.pool().get(module.content_hash(), pages).unwrap();
    assert_eq!(reused.id(), first_id);
    assert!(executor.pool().get(module.content_hash(), pages).is_none());

    let stats = executor.pool().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.rejected, 1);
}

#[tokio::test]
async fn test_pooled_instance_reclaims_scratch_between_calls() {
    let executor = executor();
    let module = contract(&executor);
    let payload = "x".repeat(10_000);
    let params = ExecutionParams::new("echo", 10_000, 65_536)
        .with_args(vec![Value::String(payload.clone())])
        .with_return_types(vec![ValueType::String]);

    let mut first_instance = None;
    for _ in 0..5 {
        let outcome = executor
            .execute_module(Arc::clone(&module), &params)
            .await
            .unwrap();
        assert_eq!(outcome.values, vec![Value::String(payload.clone())]);
        let id = first_instance.get_or_insert_with(|| outcome.instance_id.clone());
        assert_eq!(*id, outcome.instance_id);
    }
    assert_eq!(executor.pool().stats().hits, 4);
}

// ============================================================================
// Test: Threat Detection
// ============================================================================

#[tokio::test]
async fn test_threat_pattern_blocks_call() {
    let executor = executor_with(
        SecurityConfig {
            alert_threshold: 0.05,
            ..Default::default()
        },
        PoolConfig::default(),
    );
    executor.security().add_threat_pattern(ThreatPattern {
        name: "chatty_guest".into(),
        description: "Calls the host on every invocation".into(),
        indicators: vec!["host_calls".into()],
        severity: 10,
    });
    let params = ExecutionParams::new("greet", 10_000, 65_536);

    let err = executor
        .execute_module(contract(&executor), &params)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "THREAT_BLOCKED");
    assert!(err.details().unwrap().contains("chatty_guest"));
    assert_eq!(executor.security().stats().threats_blocked, 1);
}

// ============================================================================
// Test: Lifecycle
// ============================================================================

#[tokio::test]
async fn test_lifecycle_transitions() {
    let executor = Arc::new(executor());
    let lifecycle = LifecycleManager::new(
        LifecycleConfig {
            auto_health_check: false,
            ..Default::default()
        },
        Arc::clone(&executor),
    );

    let err = lifecycle.stop(Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err.code(), "NOT_RUNNING");
    assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

    lifecycle.start().await.unwrap();
    assert!(lifecycle.is_running());

    let err = lifecycle.start().await.unwrap_err();
    assert_eq!(err.code(), "ALREADY_RUNNING");
    assert_eq!(lifecycle.state(), LifecycleState::Running);

    let params = ExecutionParams::new("add", 1000, 65_536)
        .with_args(vec![Value::I32(1), Value::I32(1)]);
    let module = contract(&executor);
    assert!(executor.execute_module(Arc::clone(&module), &params).await.is_ok());

    lifecycle.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);

    let err = executor.execute_module(module, &params).await.unwrap_err();
    assert_eq!(err.code(), "CLOSED");

    lifecycle.restart().await.unwrap();
    assert!(lifecycle.is_running());
    assert_eq!(lifecycle.stats().restarts, 1);
    lifecycle.stop(Duration::from_secs(1)).await.unwrap();
}
