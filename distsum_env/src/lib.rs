//! distsum Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seams that let the distsum protocol run
//! against a real replicated store in production and a controlled one in
//! simulation.
//!
//! # Core Concept: The Shared Store
//!
//! Participants never talk to each other directly. Every message is a write
//! into a strongly-consistent keyed store that all participants can read:
//! - Storage (`put()`, `get()`, `scan_prefix()`, `remove()`)
//! - Time (`now()`, `sleep()`)
//! - Tasks (`spawn()`)
//!
//! # Example
//!
//! ```ignore
//! use distsum_env::{MemoryStore, ReplicatedStore};
//!
//! let store = MemoryStore::new();
//! let replica = store.clone();
//!
//! store.put("distsum/inbox/master/1/00000000000000000000", b"{}".to_vec())?;
//! assert!(replica.get("distsum/inbox/master/1/00000000000000000000")?.is_some());
//! ```

mod context;
mod error;
mod memory_impl;
mod sled_impl;
mod store;
mod tokio_impl;
mod types;

pub use context::DistSumContext;
pub use error::EnvError;
pub use memory_impl::MemoryStore;
pub use sled_impl::SledStore;
pub use store::{ReplicatedStore, StoreController};
pub use tokio_impl::TokioContext;
pub use types::ParticipantId;
