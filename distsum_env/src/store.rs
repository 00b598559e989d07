//! Replicated key-value store abstraction for the distsum channel.

use crate::error::EnvError;

/// Abstraction over the strongly-consistent keyed store shared by all
/// participants.
///
/// # Implementations
///
/// - **Production**: `SledStore` - embedded database, flushed on every write
/// - **Simulation**: `MemoryStore` - shared map with an availability switch
///
/// # Visibility
///
/// ```text
/// Slave                      Store                      Master
///   |                          |                           |
///   |-- put(key, bytes) ------>|                           |
///   |<------------ Ok(()) -----|                           |
///   |                          |<-- scan_prefix(inbox) ----|
///   |                          |---- [(key, bytes)] ------>|
/// ```
///
/// A successful `put` is visible to every reader as soon as it returns.
/// Writes to a single key are linearizable; nothing is promised across keys.
pub trait ReplicatedStore: Send + Sync + 'static {
    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// # Returns
    /// * `Ok(())` - The write is visible to all replicas
    /// * `Err(EnvError::StoreUnavailable)` - The store cannot be reached
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EnvError>;

    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EnvError>;

    /// Returns every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, EnvError>;

    /// Removes `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), EnvError>;
}

/// Fault-injection handle for stores used in simulation.
pub trait StoreController: Send + Sync {
    /// Makes the store reachable (`true`) or unreachable (`false`).
    fn set_available(&self, available: bool);

    /// Returns whether the store is currently reachable.
    fn is_available(&self) -> bool;
}
