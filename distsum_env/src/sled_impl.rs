//! Sled-backed implementation of the replicated store.

use crate::error::EnvError;
use crate::store::ReplicatedStore;
use std::path::Path;

/// Store backed by an embedded sled database.
///
/// Every write is flushed before `put` returns so that a successful write is
/// durable and visible to every handle opened on the same database.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EnvError> {
        let db = sled::open(path)
            .map_err(|e| EnvError::unavailable(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a temporary store, removed when the last handle is dropped
    pub fn open_temp() -> Result<Self, EnvError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| EnvError::unavailable(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }
}

fn map_sled(op: &str, e: sled::Error) -> EnvError {
    match e {
        sled::Error::Io(io) => EnvError::unavailable(format!("{} failed: {}", op, io)),
        other => EnvError::storage(format!("{} failed: {}", op, other)),
    }
}

impl ReplicatedStore for SledStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EnvError> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| map_sled("Insert", e))?;
        self.db.flush().map_err(|e| map_sled("Flush", e))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EnvError> {
        let value = self.db.get(key.as_bytes()).map_err(|e| map_sled("Get", e))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, EnvError> {
        let mut entries = Vec::new();
        for result in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = result.map_err(|e| map_sled("Iteration", e))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| EnvError::storage(format!("Non UTF-8 key: {}", e)))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn remove(&self, key: &str) -> Result<(), EnvError> {
        self.db.remove(key.as_bytes()).map_err(|e| map_sled("Remove", e))?;
        Ok(())
    }
}
