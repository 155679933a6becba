//! Live contract instances.
//!
//! A [`ContractInstance`] owns one Wasmtime store and instance plus:
//! - a bump cursor for scratch allocations, seeded at the midpoint of linear
//!   memory and rewound by [`ContractInstance::reset_scratch`] before each
//!   pooled reuse
//! - the memory ceiling it was instantiated with
//! - a cumulative resource-used counter and a call counter
//! - a free-form metadata map
//!
//! Every operation takes `&mut self`, so an instance can never run two calls
//! at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use wasmtime::{Instance, Memory, Store};

use contract_runtime_common::RuntimeError;

use crate::CompiledModule;
use crate::store::InstanceState;

/// Alignment of each scratch allocation.
const ALLOC_ALIGN: usize = 8;

pub(crate) struct LiveInstance {
    pub(crate) store: Store<InstanceState>,
    pub(crate) instance: Instance,
    pub(crate) memory: Option<Memory>,
}

/// A live instantiation of a [`CompiledModule`].
pub struct ContractInstance {
    id: String,
    module: Arc<CompiledModule>,
    live: Option<LiveInstance>,
    heap_cursor: usize,
    memory_limit_pages: u32,
    resource_used: u64,
    calls: u64,
    metadata: HashMap<String, String>,
    created_at: Instant,
}

impl ContractInstance {
    pub(crate) fn new(
        id: String,
        module: Arc<CompiledModule>,
        live: LiveInstance,
        memory_limit_pages: u32,
    ) -> Self {
        let mut instance = Self {
            id,
            module,
            live: Some(live),
            heap_cursor: 0,
            memory_limit_pages,
            resource_used: 0,
            calls: 0,
            metadata: HashMap::new(),
            created_at: Instant::now(),
        };
        instance.reset_scratch();
        instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.module
    }

    /// Content hash of the owning module; the pool key.
    pub fn module_id(&self) -> &str {
        self.module.content_hash()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.live.is_none()
    }

    pub fn heap_cursor(&self) -> usize {
        self.heap_cursor
    }

    /// Page ceiling of the store limits this instance was created with.
    pub fn memory_limit_pages(&self) -> u32 {
        self.memory_limit_pages
    }

    /// Rewind the scratch cursor to the midpoint of current linear memory.
    ///
    /// Buffers written by earlier calls become free space again; the
    /// executor calls this before every call on a pooled instance.
    pub fn reset_scratch(&mut self) {
        self.heap_cursor = self.memory_size() / 2;
    }

    /// Resource fee consumed across every call on this instance.
    pub fn resource_used(&self) -> u64 {
        self.resource_used
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub(crate) fn record_call(&mut self, consumed: u64) {
        self.resource_used = self.resource_used.saturating_add(consumed);
        self.calls += 1;
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Current linear memory size in bytes, `0` when closed or memoryless.
    pub fn memory_size(&self) -> usize {
        match &self.live {
            Some(LiveInstance {
                store,
                memory: Some(memory),
                ..
            }) => memory.data_size(store),
            _ => 0,
        }
    }

    /// Store data, `None` once closed.
    pub fn state(&self) -> Option<&InstanceState> {
        self.live.as_ref().map(|live| live.store.data())
    }

    pub fn state_mut(&mut self) -> Option<&mut InstanceState> {
        self.live.as_mut().map(|live| live.store.data_mut())
    }

    pub(crate) fn live_mut(&mut self) -> Result<&mut LiveInstance, RuntimeError> {
        let id = &self.id;
        self.live
            .as_mut()
            .ok_or_else(|| RuntimeError::closed(format!("instance {id}")))
    }

    /// Copy `bytes` into scratch memory and return `(ptr, len)`.
    ///
    /// # Errors
    ///
    /// Returns `OUT_OF_MEMORY` without writing anything when
    /// `bytes.len() > memory_size - cursor`.
    pub fn allocate_and_write_bytes(&mut self, bytes: &[u8]) -> Result<(u32, u32), RuntimeError> {
        let size = self.memory_size();
        let cursor = self.heap_cursor;
        let available = size.saturating_sub(cursor);
        if bytes.len() > available {
            return Err(RuntimeError::out_of_memory(bytes.len(), available));
        }

        let ptr = u32::try_from(cursor)
            .map_err(|_| RuntimeError::out_of_memory(bytes.len(), available))?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| RuntimeError::out_of_memory(bytes.len(), available))?;

        let live = self.live_mut()?;
        let memory = live
            .memory
            .ok_or_else(|| RuntimeError::out_of_memory(bytes.len(), 0))?;
        memory
            .write(&mut live.store, cursor, bytes)
            .map_err(|e| RuntimeError::out_of_memory(bytes.len(), available).with_source(e))?;

        let end = cursor + bytes.len();
        self.heap_cursor = end.next_multiple_of(ALLOC_ALIGN).min(size);

        debug!(
            instance_id = %self.id,
            ptr,
            len,
            heap_cursor = self.heap_cursor,
            "Scratch bytes written"
        );

        Ok((ptr, len))
    }

    /// Read `len` bytes at `ptr` from linear memory.
    pub fn read_bytes(&self, ptr: u64, len: u64) -> Result<Vec<u8>, RuntimeError> {
        let Some(live) = &self.live else {
            return Err(RuntimeError::closed(format!("instance {}", self.id)));
        };
        let Some(memory) = live.memory else {
            return Err(RuntimeError::new(
                contract_runtime_common::ErrorKind::Memory,
                "NO_MEMORY",
                "Instance exports no linear memory",
            ));
        };

        let data = memory.data(&live.store);
        let out_of_bounds = || {
            RuntimeError::new(
                contract_runtime_common::ErrorKind::Memory,
                "MEMORY_OUT_OF_BOUNDS",
                "Read outside linear memory",
            )
            .with_details(format!("ptr {ptr}, len {len}, memory {}", data.len()))
        };
        let start = usize::try_from(ptr).map_err(|_| out_of_bounds())?;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .filter(|end| *end <= data.len())
            .ok_or_else(out_of_bounds)?;

        Ok(data[start..end].to_vec())
    }

    /// Release the store. Closing an already-closed instance does nothing.
    pub fn close(&mut self) {
        if self.live.take().is_some() {
            debug!(
                instance_id = %self.id,
                module_id = %self.module.content_hash(),
                calls = self.calls,
                "Instance closed"
            );
        }
    }
}

impl Drop for ContractInstance {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ContractInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractInstance")
            .field("id", &self.id)
            .field("module_id", &self.module.content_hash())
            .field("closed", &self.is_closed())
            .field("heap_cursor", &self.heap_cursor)
            .field("memory_limit_pages", &self.memory_limit_pages)
            .field("resource_used", &self.resource_used)
            .finish_non_exhaustive()
    }
}
