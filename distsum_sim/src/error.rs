//! Error types for the simulation harness.

use distsum_core::ProtocolError;
use distsum_env::EnvError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Export error: {0}")]
    Export(#[from] std::io::Error),
}
