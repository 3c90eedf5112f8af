//! Adapter registry
//!
//! Keeps every live adapter by id. Lookups are lock-free via `ArcSwap`;
//! create and remove are serialized so names stay unique.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::adapter::{Adapter, AdapterId, NetworkStack};
use crate::config::AdapterConfig;
use crate::error::{AdapterError, Result};
use crate::lifecycle::AdapterState;

/// Prefix for generated adapter names
pub const ADAPTER_NAME_PREFIX: &str = "mvirt-tun";

type AdapterMap = HashMap<AdapterId, Arc<Adapter>>;

/// Registry of adapters.
pub struct AdapterRegistry {
    adapters: ArcSwap<AdapterMap>,
    /// Serializes updates to `adapters`
    update: Mutex<()>,
    next_index: AtomicU64,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: ArcSwap::from_pointee(HashMap::new()),
            update: Mutex::new(()),
            next_index: AtomicU64::new(0),
        }
    }

    /// Create, initialize and register an adapter.
    ///
    /// The adapter is left paused; call [`Adapter::restart`] once a consumer
    /// is attached.
    pub fn create(
        &self,
        config: &AdapterConfig,
        stack: Arc<dyn NetworkStack>,
    ) -> Result<Arc<Adapter>> {
        let _update = self.update.lock();
        let current = self.adapters.load();

        let name = match &config.name {
            Some(name) => {
                if current.values().any(|a| a.name() == name) {
                    return Err(AdapterError::NameInUse(name.clone()));
                }
                name.clone()
            }
            None => loop {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                let name = format!("{ADAPTER_NAME_PREFIX}{index}");
                if !current.values().any(|a| a.name() == name) {
                    break name;
                }
            },
        };

        let adapter = Adapter::new(name, config.max_queued_batches, stack);
        adapter.initialize()?;

        let mut new_map = (**current).clone();
        new_map.insert(adapter.id(), Arc::clone(&adapter));
        self.adapters.store(Arc::new(new_map));

        info!(
            adapter = %adapter.id(),
            name = %adapter.name(),
            max_queued_batches = config.max_queued_batches,
            "Adapter registered"
        );
        Ok(adapter)
    }

    pub fn get(&self, id: AdapterId) -> Option<Arc<Adapter>> {
        self.adapters.load().get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Adapter>> {
        self.adapters
            .load()
            .values()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// Halt and unregister an adapter.
    pub fn remove(&self, id: AdapterId) -> Result<Arc<Adapter>> {
        let adapter = {
            let _update = self.update.lock();
            let current = self.adapters.load();
            let Some(adapter) = current.get(&id).cloned() else {
                return Err(AdapterError::NotFound(id.to_string()));
            };
            let mut new_map = (**current).clone();
            new_map.remove(&id);
            self.adapters.store(Arc::new(new_map));
            adapter
        };

        halt_if_live(&adapter);
        info!(adapter = %id, name = %adapter.name(), "Adapter removed");
        Ok(adapter)
    }

    /// Halt and unregister every adapter.
    pub fn halt_all(&self) {
        let drained = {
            let _update = self.update.lock();
            self.adapters.swap(Arc::new(HashMap::new()))
        };
        for adapter in drained.values() {
            halt_if_live(adapter);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "All adapters halted");
        }
    }

    pub fn ids(&self) -> Vec<AdapterId> {
        self.adapters.load().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.load().is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn halt_if_live(adapter: &Adapter) {
    if matches!(adapter.state(), AdapterState::Halted | AdapterState::Shutdown) {
        return;
    }
    if let Err(e) = adapter.halt() {
        warn!(adapter = %adapter.id(), error = %e, "Failed to halt adapter");
    }
}
