//! Contract Runtime CLI entry point.
//!
//! Runs one contract call through the full runtime (security manager, Vm,
//! instance pool, executor and lifecycle) and prints the outcome as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use contract_runtime_common::{
    ConfigFile, ExecutionParams, LoggingConfig, ModuleEntry, RuntimeError, Value, ValueType,
};
use contract_runtime_core::{
    CompiledModule, ContractExecutor, InstancePool, LifecycleManager, Marshaller,
    SecurityManager, StartHook, Vm,
};
use contract_runtime_host::create_vm;

#[derive(Debug, Parser)]
#[command(name = "contract-runtime", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "CONTRACT_RUNTIME_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute one exported function of a module.
    Run(RunArgs),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Module to execute (`.wasm` binary or `.wat` text).
    module: PathBuf,

    /// Exported function to call.
    #[arg(short, long)]
    entry: String,

    /// Typed arguments such as `i32:2`, `string:hello` or `bytes:beef`.
    #[arg(short, long = "arg")]
    args: Vec<Value>,

    /// Expected return types. Native result types are used when omitted.
    #[arg(short, long = "returns")]
    returns: Vec<ValueType>,

    /// Resource fee budget.
    #[arg(long, default_value_t = 1_000_000)]
    fee: u64,

    /// Linear memory ceiling in bytes.
    #[arg(long, default_value_t = 1_048_576)]
    memory: u32,

    /// Wall-clock timeout in milliseconds; the configured default when unset.
    #[arg(long, default_value_t = 0)]
    timeout_ms: i64,

    #[arg(long, default_value_t = 0)]
    block_height: u64,

    #[arg(long, default_value = "")]
    caller: String,
}

/// Precompiles the configured modules so the first call hits the cache.
struct WarmupHook {
    modules: Vec<ModuleEntry>,
}

#[async_trait]
impl StartHook for WarmupHook {
    fn name(&self) -> &str {
        "module-warmup"
    }

    async fn on_start(&self, executor: &ContractExecutor) -> Result<(), RuntimeError> {
        for entry in &self.modules {
            let module = load_module(executor.vm(), Path::new(&entry.path))?;
            info!(
                id = %entry.id,
                module_id = %module.content_hash(),
                "Module precompiled"
            );
        }
        Ok(())
    }
}

fn load_module(vm: &Vm, path: &Path) -> Result<Arc<CompiledModule>, RuntimeError> {
    let bytes = std::fs::read(path).map_err(|e| {
        RuntimeError::module_not_found(path.display().to_string()).with_source(e)
    })?;

    if path.extension().is_some_and(|ext| ext == "wat") {
        let text = String::from_utf8(bytes).map_err(|e| {
            RuntimeError::invalid_bytecode("module text is not UTF-8").with_source(e)
        })?;
        vm.compile_wat(&text)
    } else {
        vm.compile(&bytes)
    }
}

fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.filter.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    init_tracing(&config.logging);
    info!("Starting Contract Runtime");

    let Command::Run(args) = cli.command;

    let security = Arc::new(SecurityManager::new(config.runtime.security.clone()));
    let vm = Arc::new(create_vm(&config.runtime, security).context("Failed to create Vm")?);
    let pool = Arc::new(InstancePool::new(config.runtime.pool.clone()));
    let executor = Arc::new(ContractExecutor::new(
        Arc::clone(&vm),
        pool,
        Marshaller::new(config.runtime.marshal.clone()),
    ));

    let lifecycle = LifecycleManager::new(config.runtime.lifecycle.clone(), Arc::clone(&executor));
    lifecycle.register_start_hook(Arc::new(WarmupHook {
        modules: config.modules.clone(),
    }));
    lifecycle.start().await.context("Failed to start runtime")?;

    let params = ExecutionParams::new(args.entry, args.fee, args.memory)
        .with_args(args.args)
        .with_return_types(args.returns)
        .with_timeout_ms(args.timeout_ms)
        .with_block_height(args.block_height)
        .with_caller(args.caller, String::new());

    let result = match load_module(&vm, &args.module) {
        Ok(module) => executor.execute_module(module, &params).await,
        Err(err) => Err(err),
    };

    if let Err(err) = lifecycle.stop(config.runtime.lifecycle.stop_timeout()).await {
        warn!(error = %err, "Runtime did not stop cleanly");
    }

    match result {
        Ok(outcome) => {
            let output = serde_json::json!({
                "values": outcome.values,
                "resource_used": outcome.resource_used,
                "memory_used": outcome.memory_used,
                "duration_ms": outcome.duration.as_millis(),
                "logs": outcome.logs,
                "events": outcome.events,
                "instance_id": outcome.instance_id,
                "module_id": outcome.module_id,
                "warnings": outcome.warnings,
                "metadata": outcome.metadata,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(err) => {
            let output = serde_json::json!({
                "error": {
                    "kind": err.kind(),
                    "code": err.code(),
                    "message": err.message(),
                    "details": err.details(),
                    "recovery_hints": err.recovery_hints(),
                },
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Err(anyhow::Error::new(err).context("Execution failed"))
        }
    }
}
