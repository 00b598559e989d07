//! distsum Deterministic Simulation Harness
//!
//! This crate drives complete distsum sessions, one master and many slaves
//! over one shared store, under controlled conditions:
//! - **Time**: a virtual clock that advances on every sleep
//! - **Updates**: drawn from a fixed update set by a seeded RNG
//! - **Store faults**: outages injected per round from a separate seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌─────────┐  ┌─────────┐          ┌──────────────────┐     │
//! │  │ Slave 1 │  │ Slave 2 │   ...    │      Master      │     │
//! │  └────┬────┘  └────┬────┘          └────────┬─────────┘     │
//! │       │ Channel    │ Channel                │ Channel       │
//! │  ┌────▼────────────▼────────────────────────▼──────────┐    │
//! │  │        Replicated store (memory or sled)             │    │
//! │  └──────────────────────────▲──────────────────────────┘    │
//! │                             │ FaultInjector                 │
//! │  ┌──────────────────────────┴──────────────────────────┐    │
//! │  │  UpdateOracle (update draws + true sum)              │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use distsum_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 8).with_rounds(20).run(ScenarioId::Baseline);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod exporter;
mod faults;
mod oracle;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use error::SimError;
pub use exporter::{RoundFrame, SimExport, SlaveFrame};
pub use faults::FaultInjector;
pub use oracle::{relative_error, within_tolerance, UpdateOracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{DynStore, SimConfig, SimWorld, StoreBackend};
