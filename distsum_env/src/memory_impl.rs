//! In-memory replicated store used by tests and the simulator.

use crate::error::EnvError;
use crate::store::{ReplicatedStore, StoreController};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A store whose clones are replicas of the same data.
///
/// Every clone shares one ordered map, so a write through any clone is
/// visible through all of them once `put` returns. This models a
/// synchronously replicated cluster where each participant holds its own
/// replica handle.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,

    /// Cleared to simulate an outage
    available: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Creates an empty, reachable store.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Creates an Arc-wrapped store for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_available(&self) -> Result<(), EnvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EnvError::unavailable("memory store is offline"))
        }
    }
}

impl ReplicatedStore for MemoryStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EnvError> {
        self.check_available()?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EnvError> {
        self.check_available()?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, EnvError> {
        self.check_available()?;
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn remove(&self, key: &str) -> Result<(), EnvError> {
        self.check_available()?;
        self.entries.write().remove(key);
        Ok(())
    }
}

impl StoreController for MemoryStore {
    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
