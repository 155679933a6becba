//! Warm instance pool.
//!
//! Idle [`ContractInstance`]s are kept per module hash and handed out LIFO,
//! so the most recently used (and most likely cache-warm) instance is reused
//! first. Only an instance created with the requested memory ceiling is
//! handed out, so a call never runs under another call's store limits. An instance is in the pool or checked out, never both: [`get`]
//! moves it out and [`put`] moves it back in.
//!
//! [`get`]: InstancePool::get
//! [`put`]: InstancePool::put

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use contract_runtime_common::PoolConfig;

use crate::instance::ContractInstance;

struct PoolEntry {
    instance: ContractInstance,
    returned_at: Instant,
}

#[derive(Default)]
struct PoolInner {
    idle: HashMap<String, Vec<PoolEntry>>,
    closed: bool,
    hits: u64,
    misses: u64,
    puts: u64,
    rejected: u64,
    evicted: u64,
    expired: u64,
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    /// Instances accepted back by `put`.
    pub puts: u64,
    /// Instances destroyed by `put` instead of pooled.
    pub rejected: u64,
    /// Instances destroyed by `evict` or `close`.
    pub evicted: u64,
    /// Instances destroyed by idle cleanup.
    pub expired: u64,
    /// Idle instances currently held.
    pub resident: usize,
    pub modules: usize,
    pub closed: bool,
}

/// Per-module pool of idle instances.
pub struct InstancePool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl InstancePool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take the most recently returned idle instance of `module_id` that was
    /// created with `memory_limit_pages`.
    pub fn get(&self, module_id: &str, memory_limit_pages: u32) -> Option<ContractInstance> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }

        let entry = inner.idle.get_mut(module_id).and_then(|entries| {
            entries
                .iter()
                .rposition(|entry| entry.instance.memory_limit_pages() == memory_limit_pages)
                .map(|index| entries.remove(index))
        });
        if entry.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        if inner.idle.get(module_id).is_some_and(Vec::is_empty) {
            inner.idle.remove(module_id);
        }

        entry.map(|entry| entry.instance)
    }

    /// Return an instance for reuse.
    ///
    /// The instance is destroyed instead when it is already closed, when the
    /// pool is closed, or when its module already has `max_per_module` idle
    /// instances. Returns whether the instance was kept.
    pub fn put(&self, mut instance: ContractInstance) -> bool {
        let mut inner = self.inner.lock();

        let module_id = instance.module_id().to_string();
        let full = inner
            .idle
            .get(&module_id)
            .is_some_and(|entries| entries.len() >= self.config.max_per_module);

        if instance.is_closed() || inner.closed || full || self.config.max_per_module == 0 {
            inner.rejected += 1;
            drop(inner);
            debug!(instance_id = %instance.id(), module_id = %module_id, "Instance not pooled");
            instance.close();
            return false;
        }

        inner.puts += 1;
        inner.idle.entry(module_id).or_default().push(PoolEntry {
            instance,
            returned_at: Instant::now(),
        });
        true
    }

    /// Destroy every idle instance of `module_id`.
    pub fn evict(&self, module_id: &str) -> usize {
        let entries = {
            let mut inner = self.inner.lock();
            let entries = inner.idle.remove(module_id).unwrap_or_default();
            inner.evicted += entries.len() as u64;
            entries
        };
        let count = entries.len();
        destroy(entries);
        count
    }

    /// Destroy instances idle longer than `max_idle`. Returns how many.
    pub fn cleanup(&self) -> usize {
        let max_idle = self.config.max_idle();
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock();
            for entries in inner.idle.values_mut() {
                let (old, fresh): (Vec<_>, Vec<_>) = entries
                    .drain(..)
                    .partition(|entry| entry.returned_at.elapsed() >= max_idle);
                *entries = fresh;
                expired.extend(old);
            }
            inner.idle.retain(|_, entries| !entries.is_empty());
            inner.expired += expired.len() as u64;
        }

        let count = expired.len();
        destroy(expired);
        if count > 0 {
            debug!(count, "Expired idle instances destroyed");
        }
        count
    }

    /// Destroy every idle instance and refuse new ones until [`reopen`].
    ///
    /// [`reopen`]: InstancePool::reopen
    pub fn close(&self) {
        let entries: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let entries: Vec<_> = inner.idle.drain().flat_map(|(_, e)| e).collect();
            inner.evicted += entries.len() as u64;
            entries
        };

        let count = entries.len();
        destroy(entries);
        info!(destroyed = count, "Instance pool closed");
    }

    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Idle instances held for `module_id`.
    pub fn idle_count(&self, module_id: &str) -> usize {
        self.inner.lock().idle.get(module_id).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            hits: inner.hits,
            misses: inner.misses,
            puts: inner.puts,
            rejected: inner.rejected,
            evicted: inner.evicted,
            expired: inner.expired,
            resident: inner.idle.values().map(Vec::len).sum(),
            modules: inner.idle.len(),
            closed: inner.closed,
        }
    }

    /// Run [`cleanup`] every `interval` until `shutdown` turns true.
    ///
    /// [`cleanup`]: InstancePool::cleanup
    pub async fn cleanup_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cleanup();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Pool cleanup loop stopped");
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn destroy(entries: Vec<PoolEntry>) {
    for mut entry in entries {
        entry.instance.close();
    }
}
