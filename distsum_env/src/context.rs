//! Core environment context trait for distsum participants.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for time and task interaction.
///
/// This trait abstracts the "real world" so that the master and slave loops
/// can run both in production (tokio) and in the deterministic simulator.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - virtual clock, seeded RNG
#[async_trait]
pub trait DistSumContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
