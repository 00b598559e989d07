//! distsum Core - Approximate Distributed Sum Protocol
//!
//! A set of slaves, each holding one integer bounded by a [`Constraint`],
//! reports every local change to a master that keeps a continuously
//! refreshed estimate of the global sum. Participants never talk directly:
//! every [`Message`] is a write into a shared replicated store, multiplexed
//! by the [`Channel`].
//!
//! The estimate is approximate by construction. Slaves keep mutating while
//! their reports are in flight, so the master's view lags the truth; the
//! protocol keeps that lag bounded rather than eliminating it.
//!
//! ```text
//!  Slave "1"            Channel / store             Master
//!  update(+1) ──REPLY──► inbox/master/1/… ──drain──► local_values["1"] = 11
//!  update(+1) ──VIOL.──► inbox/master/1/… ──drain──► violations["1"] += 1
//!                       inbox/1/master/… ◄──GET──── request_values()
//! ```

pub mod channel;
pub mod config;
pub mod constraint;
pub mod error;
pub mod master;
pub mod message;
pub mod runtime;
pub mod slave;

// Re-export key types for convenience
pub use channel::{Channel, Participant};
pub use config::{ProtocolConfig, RetryPolicy};
pub use constraint::Constraint;
pub use error::ProtocolError;
pub use master::{saturating_sum, AggregateSnapshot, Master, ViolationRecord};
pub use message::{Message, MessageBody, MessageType};
pub use runtime::{retry, spawn_with_result, MasterRuntime, RuntimeStats, SlaveRuntime};
pub use slave::{Slave, UpdateOutcome};

pub use distsum_env::ParticipantId;
