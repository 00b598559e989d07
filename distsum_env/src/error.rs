//! Error types for the distsum environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// The replicated store cannot be reached (outage, closed handle, etc.)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store answered but the operation failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// A participant identity cannot be used as a store key segment
    #[error("Invalid participant id: {0:?}")]
    InvalidParticipantId(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),
}

impl EnvError {
    /// Creates an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Creates a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageError(msg.into())
    }
}
