//! The execution engine.
//!
//! [`Vm`] owns the configured [`WasmEngine`], the host-function [`Linker`]
//! and a content-addressed compile cache. It compiles bytecode, creates
//! isolated [`ContractInstance`]s and runs exported functions under a fee
//! budget and deadline, mapping every guest failure onto the error taxonomy.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use wasmtime::{Linker, StoreLimitsBuilder, Trap, Val, ValType};

use contract_runtime_common::{
    ErrorKind, ExecutionConfig, RuntimeConfig, RuntimeError, ValueType, WASM_PAGE_SIZE,
};

use crate::instance::{ContractInstance, LiveInstance};
use crate::module::content_hash;
use crate::security::SecurityManager;
use crate::store::{InstanceState, create_store};
use crate::{CompiledModule, WasmEngine, meter};

/// Per-instance resource ceilings applied at instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Linear memory ceiling in 64 KiB pages.
    pub memory_limit_pages: u32,
    /// Table element ceiling, unbounded when `None`.
    pub table_limit: Option<u32>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            memory_limit_pages: 16,
            table_limit: None,
        }
    }
}

/// Budget for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLimits {
    pub fee_limit: u64,
    pub timeout: Duration,
}

/// Raw result of [`Vm::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub words: Vec<u64>,
    /// Native result types, one per word.
    pub native_types: Vec<ValueType>,
    pub resource_used: u64,
    pub duration: Duration,
}

/// Compiles, instantiates and runs contract modules.
pub struct Vm {
    engine: WasmEngine,
    linker: Linker<InstanceState>,
    security: Arc<SecurityManager>,
    execution: ExecutionConfig,
    cache: DashMap<String, Arc<CompiledModule>>,
    cache_order: Mutex<VecDeque<String>>,
    evicted: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl Vm {
    pub fn new(config: &RuntimeConfig, security: Arc<SecurityManager>) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(&config.engine)?;
        let linker = Linker::new(engine.inner());

        info!(
            cache_size = config.engine.cache_size,
            host_call_fee = config.execution.host_call_fee,
            "Vm created"
        );

        Ok(Self {
            engine,
            linker,
            security,
            execution: config.execution.clone(),
            cache: DashMap::new(),
            cache_order: Mutex::new(VecDeque::new()),
            evicted: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Linker used for every instantiation. Register host functions here
    /// before the first instance is created.
    pub fn linker_mut(&mut self) -> &mut Linker<InstanceState> {
        &mut self.linker
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn execution_config(&self) -> &ExecutionConfig {
        &self.execution
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::closed("vm"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    /// Compile `bytes`, returning the cached module when the same bytes were
    /// compiled before.
    pub fn compile(&self, bytes: &[u8]) -> Result<Arc<CompiledModule>, RuntimeError> {
        self.ensure_open()?;

        let hash = content_hash(bytes);
        if let Some(module) = self.cached(&hash) {
            debug!(content_hash = %hash, "Compile cache hit");
            return Ok(module);
        }

        let module = CompiledModule::from_bytes(
            self.engine.inner(),
            bytes,
            self.engine.config().max_module_size,
        )?;
        Ok(self.insert_cached(module))
    }

    /// Compile WebAssembly text. Shares the cache with [`Vm::compile`].
    pub fn compile_wat(&self, wat: &str) -> Result<Arc<CompiledModule>, RuntimeError> {
        self.ensure_open()?;

        let hash = content_hash(wat.as_bytes());
        if let Some(module) = self.cached(&hash) {
            return Ok(module);
        }

        let module = CompiledModule::from_wat(self.engine.inner(), wat)?;
        Ok(self.insert_cached(module))
    }

    pub fn cached(&self, hash: &str) -> Option<Arc<CompiledModule>> {
        self.cache.get(hash).map(|entry| Arc::clone(entry.value()))
    }

    fn insert_cached(&self, module: CompiledModule) -> Arc<CompiledModule> {
        let module = Arc::new(module);
        let hash = module.content_hash().to_string();
        let capacity = self.engine.config().cache_size;
        if capacity == 0 {
            return module;
        }

        let mut order = self.cache_order.lock();
        if self.cache.insert(hash.clone(), Arc::clone(&module)).is_none() {
            order.push_back(hash);
        }
        while order.len() > capacity {
            if let Some(oldest) = order.pop_front() {
                self.cache.remove(&oldest);
                debug!(content_hash = %oldest, "Evicted module from compile cache");
                self.evicted.lock().push(oldest);
            }
        }

        module
    }

    /// Drop a module from the compile cache. Live instances keep it alive.
    pub fn evict_module(&self, hash: &str) -> bool {
        let removed = self.cache.remove(hash).is_some();
        if removed {
            self.cache_order.lock().retain(|h| h != hash);
        }
        removed
    }

    /// Hashes pushed out of the cache by capacity since the last call.
    pub fn take_evicted(&self) -> Vec<String> {
        std::mem::take(&mut *self.evicted.lock())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    // ------------------------------------------------------------------
    // Instantiation
    // ------------------------------------------------------------------

    /// Create a fresh, isolated instance of `module`.
    ///
    /// Start functions run under the default fee limit and timeout.
    #[instrument(skip(self, module), fields(module_id = %module.content_hash()))]
    pub async fn instantiate(
        &self,
        module: &Arc<CompiledModule>,
        config: &InstanceConfig,
    ) -> Result<ContractInstance, RuntimeError> {
        self.ensure_open()?;

        let memory_bytes = (u64::from(config.memory_limit_pages) * WASM_PAGE_SIZE)
            .min(self.engine.config().max_memory_bytes());
        let mut limits = StoreLimitsBuilder::new()
            .memory_size(usize::try_from(memory_bytes).unwrap_or(usize::MAX))
            .instances(1);
        if let Some(table_limit) = config.table_limit {
            limits = limits.table_elements(table_limit.try_into().unwrap_or_default());
        }

        let id = Uuid::new_v4().to_string();
        let state = InstanceState::new(
            id.clone(),
            limits.build(),
            Arc::clone(&self.security),
            self.execution.host_call_fee,
        );
        let mut store = create_store(self.engine.inner(), state);
        meter::arm(
            &mut store,
            self.execution.default_fee_limit,
            self.engine
                .is_epoch_enabled()
                .then(|| self.execution.timeout()),
        )?;

        let instance = self
            .linker
            .instantiate_async(&mut store, module.inner())
            .await
            .map_err(|e| {
                RuntimeError::instantiation_failed(format!("{e:#}"))
                    .with_context("module_id", module.content_hash())
            })?;
        let memory = instance.get_memory(&mut store, "memory");

        let contract = ContractInstance::new(
            id,
            Arc::clone(module),
            LiveInstance {
                store,
                instance,
                memory,
            },
            config.memory_limit_pages,
        );

        debug!(
            instance_id = %contract.id(),
            memory_size = contract.memory_size(),
            "Instance created"
        );

        Ok(contract)
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Call `function` with native argument words.
    ///
    /// # Errors
    ///
    /// - `FUNCTION_NOT_FOUND` when the export is missing or not a function
    /// - `ARG_COUNT_MISMATCH` when `args` does not fit the signature
    /// - `RESOURCE_EXHAUSTED` when the fee budget runs out
    /// - `EXECUTION_TIMEOUT` when the deadline passes
    /// - `STACK_OVERFLOW`, `MEMORY_OUT_OF_BOUNDS` or `EXECUTION_FAILED` for
    ///   other traps
    /// - any error raised by a host function, unchanged
    #[instrument(skip(self, instance, args, limits), fields(instance_id = %instance.id()))]
    pub async fn call(
        &self,
        instance: &mut ContractInstance,
        function: &str,
        args: &[u64],
        limits: &CallLimits,
    ) -> Result<CallOutcome, RuntimeError> {
        self.ensure_open()?;

        let epoch = self.engine.is_epoch_enabled();
        let live = instance.live_mut()?;

        let func = live
            .instance
            .get_func(&mut live.store, function)
            .ok_or_else(|| RuntimeError::function_not_found(function))?;
        let ty = func.ty(&live.store);

        if ty.params().len() != args.len() {
            return Err(RuntimeError::validation(
                "ARG_COUNT_MISMATCH",
                "Argument count does not match the function signature",
            )
            .with_details(format!(
                "{function} takes {} words, got {}",
                ty.params().len(),
                args.len()
            )));
        }

        let params = ty
            .params()
            .zip(args)
            .map(|(ty, word)| word_to_val(*word, &ty))
            .collect::<Result<Vec<_>, _>>()?;
        let mut results = ty
            .results()
            .map(|ty| word_to_val(0, &ty))
            .collect::<Result<Vec<_>, _>>()?;

        meter::arm(&mut live.store, limits.fee_limit, epoch.then_some(limits.timeout))?;

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            limits.timeout,
            func.call_async(&mut live.store, &params, &mut results),
        )
        .await;
        let duration = start.elapsed();
        let resource_used = meter::consumed(&live.store);
        let host_calls = live.store.data().meter().host_calls();

        instance.record_call(resource_used);

        match outcome {
            Ok(Ok(())) => {
                debug!(
                    function,
                    duration_ms = duration.as_millis(),
                    resource_used,
                    host_calls,
                    "Call completed"
                );
                Ok(CallOutcome {
                    words: results.iter().map(val_to_word).collect(),
                    native_types: results.iter().map(native_type).collect(),
                    resource_used,
                    duration,
                })
            }
            Ok(Err(err)) => {
                let err = map_call_error(err, limits)
                    .with_context("function", function)
                    .with_context("resource_used", resource_used);
                if err.is_resource_limit() {
                    warn!(function, resource_used, error = %err, "Call stopped by limit");
                } else {
                    error!(function, resource_used, error = %err, "Call failed");
                }
                Err(err)
            }
            Err(_) => {
                warn!(function, duration_ms = duration.as_millis(), "Call timed out");
                Err(RuntimeError::timeout(limits.timeout).with_context("function", function))
            }
        }
    }

    /// Close the Vm. Later compile, instantiate and call requests fail with
    /// `CLOSED`. Closing twice does nothing.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cache.clear();
            self.cache_order.lock().clear();
            info!("Vm closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("engine", &self.engine)
            .field("cached_modules", &self.cache.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn word_to_val(word: u64, ty: &ValType) -> Result<Val, RuntimeError> {
    Ok(match ty {
        ValType::I32 => Val::I32(word as u32 as i32),
        ValType::I64 => Val::I64(word as i64),
        ValType::F32 => Val::F32(word as u32),
        ValType::F64 => Val::F64(word),
        other => {
            return Err(RuntimeError::validation(
                "UNSUPPORTED_SIGNATURE",
                "Only numeric parameters and results are supported",
            )
            .with_details(format!("{other:?}")));
        }
    })
}

#[allow(clippy::cast_sign_loss)]
fn val_to_word(val: &Val) -> u64 {
    match val {
        Val::I32(v) => i64::from(*v) as u64,
        Val::I64(v) => *v as u64,
        Val::F32(bits) => u64::from(*bits),
        Val::F64(bits) => *bits,
        _ => 0,
    }
}

fn native_type(val: &Val) -> ValueType {
    match val {
        Val::I64(_) => ValueType::I64,
        Val::F32(_) => ValueType::F32,
        Val::F64(_) => ValueType::F64,
        _ => ValueType::I32,
    }
}

fn map_call_error(err: wasmtime::Error, limits: &CallLimits) -> RuntimeError {
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return match trap {
            Trap::OutOfFuel => RuntimeError::resource_exhausted(limits.fee_limit, limits.fee_limit),
            Trap::Interrupt => RuntimeError::timeout(limits.timeout),
            Trap::StackOverflow => RuntimeError::stack_overflow(),
            Trap::MemoryOutOfBounds => RuntimeError::new(
                ErrorKind::Memory,
                "MEMORY_OUT_OF_BOUNDS",
                "Guest accessed memory out of bounds",
            ),
            other => RuntimeError::execution_failed(other.to_string()),
        };
    }

    match err.downcast::<RuntimeError>() {
        Ok(host_error) => host_error,
        Err(err) => RuntimeError::execution_failed(format!("{err:#}")),
    }
}
