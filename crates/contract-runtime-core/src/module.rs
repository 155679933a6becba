//! Contract module compilation.
//!
//! [`CompiledModule`] wraps a Wasmtime [`Module`] with the metadata the rest
//! of the runtime keys on: a BLAKE3 content hash (cache and pool identity),
//! the compile timestamp, declared imports, exported functions, and the
//! declared linear memory.
//!
//! Compilation never executes guest code.

use std::time::{Instant, SystemTime};

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module};

use contract_runtime_common::RuntimeError;

/// One `(module, name)` import declared by a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportName {
    pub module: String,
    pub name: String,
}

impl std::fmt::Display for ImportName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

/// Linear memory limits declared by a contract, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDecl {
    pub minimum: u64,
    pub maximum: Option<u64>,
}

/// An immutable compiled contract module.
///
/// Cheap to share behind an `Arc`; every instance holds one so a module
/// always outlives its instances.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,
    content_hash: String,
    compiled_at: SystemTime,
    imports: Vec<ImportName>,
    exports: Vec<String>,
    memory: Option<MemoryDecl>,
    size: usize,
}

impl CompiledModule {
    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_BYTECODE` for empty, oversized or malformed input and
    /// `COMPILATION_FAILED` when Wasmtime rejects the module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(
        engine: &Engine,
        bytes: &[u8],
        max_size: usize,
    ) -> Result<Self, RuntimeError> {
        if bytes.is_empty() {
            return Err(RuntimeError::invalid_bytecode("bytecode is empty"));
        }
        if bytes.len() > max_size {
            return Err(RuntimeError::invalid_bytecode(format!(
                "bytecode is {} bytes, limit is {max_size}",
                bytes.len()
            )));
        }
        Self::validate_wasm_header(bytes)?;

        let start = Instant::now();
        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let compiled = Self::from_module(module, content_hash(bytes), bytes.len());

        info!(
            content_hash = %compiled.content_hash,
            duration_ms = start.elapsed().as_millis(),
            exports = compiled.exports.len(),
            "Module compiled"
        );

        Ok(compiled)
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// Used by tests and tooling; the hash covers the WAT source.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        if wat.trim().is_empty() {
            return Err(RuntimeError::invalid_bytecode("source is empty"));
        }

        let start = Instant::now();
        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let compiled = Self::from_module(module, content_hash(wat.as_bytes()), wat.len());

        info!(
            content_hash = %compiled.content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(compiled)
    }

    fn from_module(module: Module, content_hash: String, size: usize) -> Self {
        let mut memory = None;

        let imports = module
            .imports()
            .map(|import| {
                if let ExternType::Memory(ty) = import.ty() {
                    memory = Some(MemoryDecl {
                        minimum: ty.minimum(),
                        maximum: ty.maximum(),
                    });
                }
                ImportName {
                    module: import.module().to_string(),
                    name: import.name().to_string(),
                }
            })
            .collect();

        let mut exports = Vec::new();
        for export in module.exports() {
            match export.ty() {
                ExternType::Func(_) => exports.push(export.name().to_string()),
                ExternType::Memory(ty) if memory.is_none() => {
                    memory = Some(MemoryDecl {
                        minimum: ty.minimum(),
                        maximum: ty.maximum(),
                    });
                }
                _ => {}
            }
        }

        Self {
            inner: module,
            content_hash,
            compiled_at: SystemTime::now(),
            imports,
            exports,
            memory,
            size,
        }
    }

    /// Validate WebAssembly header (magic number and version).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::invalid_bytecode("file too small"));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::invalid_bytecode("bad magic number"));
        }

        Ok(())
    }

    /// Hex BLAKE3 hash of the source bytes. Identity for caching and pooling.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn compiled_at(&self) -> SystemTime {
        self.compiled_at
    }

    pub fn imports(&self) -> &[ImportName] {
        &self.imports
    }

    /// Distinct import namespaces, in declaration order.
    pub fn import_modules(&self) -> Vec<&str> {
        let mut modules: Vec<&str> = Vec::new();
        for import in &self.imports {
            if !modules.contains(&import.module.as_str()) {
                modules.push(&import.module);
            }
        }
        modules
    }

    /// Exported function names.
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn exports_function(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e == name)
    }

    pub fn memory(&self) -> Option<MemoryDecl> {
        self.memory
    }

    /// Size of the source the module was compiled from, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("imports", &self.imports.len())
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

/// Compute the content hash of the given bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
