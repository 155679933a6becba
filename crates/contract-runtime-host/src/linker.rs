//! Host function registration for Wasmtime linkers.
//!
//! Every host function follows the same order:
//!
//! 1. Read its inputs from guest memory (no side effects)
//! 2. Pass the security gate ([`SecurityManager::validate_host_call`])
//! 3. Pay the host-call fee ([`meter::charge_host_call`])
//! 4. Apply its effect
//!
//! A failure at any step traps the guest with the [`RuntimeError`], which the
//! Vm hands back to the caller unchanged.
//!
//! [`SecurityManager::validate_host_call`]: contract_runtime_core::SecurityManager::validate_host_call

use std::sync::Arc;

use contract_runtime_common::{ErrorKind, RuntimeError, Value};
use contract_runtime_core::meter;
use contract_runtime_core::store::InstanceState;
use wasmtime::{Caller, Extern, Linker};

use crate::chain::ChainHost;
use crate::logging::{LoggingHost, level_from_i32};

/// Register every standard host function:
/// - `env::log(level, ptr, len)`
/// - `env::emit_event(topic_ptr, topic_len, data_ptr, data_len)`
/// - `env::block_height() -> i64`
///
/// # Errors
///
/// Returns an error if a name is already defined on `linker`.
pub fn register_all(linker: &mut Linker<InstanceState>) -> Result<(), RuntimeError> {
    register_logging(linker)?;
    register_events(linker)?;
    register_block_height(linker)?;
    Ok(())
}

/// Register `env::log(level: i32, ptr: i32, len: i32)`.
///
/// Levels are 0=debug, 1=info, 2=warn, 3=error. The message must be UTF-8.
pub fn register_logging(linker: &mut Linker<InstanceState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, InstanceState>,
             level: i32,
             ptr: i32,
             len: i32|
             -> wasmtime::Result<()> {
                log(&mut caller, level, ptr, len).map_err(wasmtime::Error::new)
            },
        )
        .map_err(|e| registration_failed("log", &e))?;

    Ok(())
}

/// Register `env::emit_event(topic_ptr, topic_len, data_ptr, data_len)`.
///
/// Events are writes: side-effect and idempotency policy apply.
pub fn register_events(linker: &mut Linker<InstanceState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "emit_event",
            |mut caller: Caller<'_, InstanceState>,
             topic_ptr: i32,
             topic_len: i32,
             data_ptr: i32,
             data_len: i32|
             -> wasmtime::Result<()> {
                emit_event(&mut caller, (topic_ptr, topic_len), (data_ptr, data_len))
                    .map_err(wasmtime::Error::new)
            },
        )
        .map_err(|e| registration_failed("emit_event", &e))?;

    Ok(())
}

/// Register `env::block_height() -> i64`.
pub fn register_block_height(linker: &mut Linker<InstanceState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "block_height",
            |mut caller: Caller<'_, InstanceState>| -> wasmtime::Result<i64> {
                block_height(&mut caller).map_err(wasmtime::Error::new)
            },
        )
        .map_err(|e| registration_failed("block_height", &e))?;

    Ok(())
}

fn log(
    caller: &mut Caller<'_, InstanceState>,
    level: i32,
    ptr: i32,
    len: i32,
) -> Result<(), RuntimeError> {
    let message = utf8("log", read_guest(caller, "log", ptr, len)?)?;
    gate(
        caller,
        "log",
        &[Value::I32(level), Value::String(message.clone())],
        false,
    )?;
    LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
    Ok(())
}

fn emit_event(
    caller: &mut Caller<'_, InstanceState>,
    (topic_ptr, topic_len): (i32, i32),
    (data_ptr, data_len): (i32, i32),
) -> Result<(), RuntimeError> {
    let topic = utf8(
        "emit_event",
        read_guest(caller, "emit_event", topic_ptr, topic_len)?,
    )?;
    let data = read_guest(caller, "emit_event", data_ptr, data_len)?;
    gate(
        caller,
        "emit_event",
        &[Value::String(topic.clone()), Value::Bytes(data.clone())],
        true,
    )?;
    ChainHost::emit_event(caller.data_mut(), topic, data);
    Ok(())
}

fn block_height(caller: &mut Caller<'_, InstanceState>) -> Result<i64, RuntimeError> {
    gate(caller, "block_height", &[], false)?;
    Ok(ChainHost::block_height(caller.data()))
}

/// Security gate, then the host-call fee.
fn gate(
    caller: &mut Caller<'_, InstanceState>,
    function: &str,
    args: &[Value],
    is_write: bool,
) -> Result<(), RuntimeError> {
    let security = Arc::clone(caller.data().security());
    security.validate_host_call(function, args, is_write)?;
    meter::charge_host_call(caller)
}

#[allow(clippy::cast_sign_loss)]
fn read_guest(
    caller: &mut Caller<'_, InstanceState>,
    function: &str,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, RuntimeError> {
    if ptr < 0 || len < 0 {
        return Err(RuntimeError::host_function(
            function,
            "INVALID_GUEST_POINTER",
            format!("negative pointer or length ({ptr}, {len})"),
        ));
    }

    let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
        return Err(RuntimeError::host_function(
            function,
            "NO_MEMORY",
            "guest exports no memory",
        ));
    };

    let data = memory.data(&*caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize).filter(|end| *end <= data.len());
    match end {
        Some(end) => Ok(data[start..end].to_vec()),
        None => Err(RuntimeError::new(
            ErrorKind::Memory,
            "MEMORY_OUT_OF_BOUNDS",
            "Host read outside guest memory",
        )
        .with_details(format!("{function}: ptr {ptr}, len {len}, memory {}", data.len()))),
    }
}

fn utf8(function: &str, bytes: Vec<u8>) -> Result<String, RuntimeError> {
    String::from_utf8(bytes).map_err(|e| {
        RuntimeError::host_function(function, "INVALID_UTF8", "argument is not UTF-8").with_source(e)
    })
}

fn registration_failed(function: &str, err: &wasmtime::Error) -> RuntimeError {
    RuntimeError::invalid_config(format!("Failed to register {function} function: {err}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use contract_runtime_common::{EngineConfig, RuntimeConfig, SecurityConfig};
    use contract_runtime_core::{CallLimits, InstanceConfig, SecurityManager, Vm, WasmEngine};

    const LOGGER: &str = r#"
        (module
            (import "env" "log" (func $log (param i32 i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "ready")
            (func (export "run")
                (call $log (i32.const 1) (i32.const 0) (i32.const 5)))
            (func (export "wild")
                (call $log (i32.const 1) (i32.const 65530) (i32.const 64))))
    "#;

    fn linker() -> Linker<InstanceState> {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap();
        Linker::new(engine.inner())
    }

    fn vm(security: SecurityConfig) -> (Vm, Arc<SecurityManager>) {
        let config = RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                epoch_interruption: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let security = Arc::new(SecurityManager::new(security));
        let vm = crate::create_vm(&config, Arc::clone(&security)).unwrap();
        (vm, security)
    }

    fn limits() -> CallLimits {
        CallLimits {
            fee_limit: 10_000,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_register_all() {
        let mut linker = linker();
        assert!(register_all(&mut linker).is_ok());
    }

    #[test]
    fn test_register_twice_fails() {
        let mut linker = linker();
        register_logging(&mut linker).unwrap();

        let err = register_logging(&mut linker).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_allowed_log_is_recorded() {
        tokio_test::block_on(async {
            let (vm, security) = vm(SecurityConfig::default());
            let module = vm.compile_wat(LOGGER).unwrap();
            let mut instance = vm.instantiate(&module, &InstanceConfig::default()).await.unwrap();

            vm.call(&mut instance, "run", &[], &limits()).await.unwrap();

            let logs = &instance.state().unwrap().logs;
            assert_eq!(logs.len(), 1);
            assert_eq!(logs[0].message, "ready");
            assert_eq!(security.stats().host_calls_validated, 1);
        });
    }

    #[test]
    fn test_denied_log_has_no_effect() {
        tokio_test::block_on(async {
            let (vm, security) = vm(SecurityConfig {
                denied_host_functions: vec!["log".into()],
                ..Default::default()
            });
            let module = vm.compile_wat(LOGGER).unwrap();
            let mut instance = vm.instantiate(&module, &InstanceConfig::default()).await.unwrap();

            let err = vm.call(&mut instance, "run", &[], &limits()).await.unwrap_err();

            assert_eq!(err.kind(), ErrorKind::HostPermission);
            assert!(instance.state().unwrap().logs.is_empty());
            assert_eq!(security.stats().host_call_violations, 1);
        });
    }

    #[test]
    fn test_bad_pointer_fails_before_gate() {
        tokio_test::block_on(async {
            let (vm, security) = vm(SecurityConfig::default());
            let module = vm.compile_wat(LOGGER).unwrap();
            let mut instance = vm.instantiate(&module, &InstanceConfig::default()).await.unwrap();

            let err = vm.call(&mut instance, "wild", &[], &limits()).await.unwrap_err();

            assert_eq!(err.code(), "MEMORY_OUT_OF_BOUNDS");
            assert_eq!(security.stats().host_calls_validated, 0);
        });
    }
}
