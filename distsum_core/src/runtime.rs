//! Runtime loops that drive the master and slaves over a context.
//!
//! This module provides the integration layer between the protocol state
//! machines (`Master`, `Slave`) and the environment abstraction
//! (`DistSumContext`).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐     ┌──────────────────────────────┐
//! │        MasterRuntime         │     │        SlaveRuntime          │
//! │  every poll_interval:        │     │  every poll_interval:        │
//! │    drain() inbox             │     │    poll() inbox, answer GET  │
//! │  every reconcile_every ticks:│     │                              │
//! │    request_values() (GET)    │     │                              │
//! └──────────────┬───────────────┘     └──────────────┬───────────────┘
//!                │        Context: DistSumContext     │
//!                └──── sleep(), now(), spawn() ───────┘
//! ```
//!
//! Channel outages are logged and counted, and the loop carries on; the next
//! tick retries naturally.

use crate::config::{ProtocolConfig, RetryPolicy};
use crate::error::ProtocolError;
use crate::master::Master;
use crate::slave::Slave;
use distsum_env::{DistSumContext, ReplicatedStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Counters reported when a runtime loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Loop iterations executed
    pub ticks: u64,

    /// Messages drained (master) or handled (slave)
    pub messages: u64,

    /// GET rounds issued by the master
    pub reconciliations: u64,

    /// Ticks that hit `ChannelUnavailable`
    pub channel_failures: u64,

    /// Context time between loop start and stop
    pub elapsed: Duration,
}

/// Spawns `future` on the context and hands its output back.
///
/// The receiver errors if the task is dropped before it finishes.
pub fn spawn_with_result<Ctx, F>(context: &Ctx, name: &str, future: F) -> oneshot::Receiver<F::Output>
where
    Ctx: DistSumContext,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (done, result) = oneshot::channel();
    let task = name.to_string();
    context.spawn(name, async move {
        if done.send(future.await).is_err() {
            debug!(task = %task, "task result dropped");
        }
    });
    result
}

/// Runs `op` until it succeeds, retrying transient failures with backoff.
///
/// Non-transient errors return immediately. Do not wrap `Slave::update`
/// here: its local transition happens even when the report fails, so a
/// retry would apply the delta twice. Retry `Slave::report` instead.
pub async fn retry<Ctx, T, F>(context: &Ctx, policy: &RetryPolicy, mut op: F) -> Result<T, ProtocolError>
where
    Ctx: DistSumContext,
    F: FnMut() -> Result<T, ProtocolError>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(attempt, ?delay, error = %e, "transient failure, backing off");
                context.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn record_failure(stats: &mut RuntimeStats, what: &str, e: ProtocolError) -> Result<(), ProtocolError> {
    if e.is_transient() {
        stats.channel_failures += 1;
        warn!(error = %e, "{} failed, will retry next tick", what);
        Ok(())
    } else {
        error!(error = %e, "{} failed", what);
        Err(e)
    }
}

/// Periodic receive-and-aggregate loop for the master.
pub struct MasterRuntime<Ctx, S>
where
    Ctx: DistSumContext,
    S: ReplicatedStore + ?Sized,
{
    context: Arc<Ctx>,
    master: Arc<Master<S>>,
    config: ProtocolConfig,
}

impl<Ctx, S> MasterRuntime<Ctx, S>
where
    Ctx: DistSumContext,
    S: ReplicatedStore + ?Sized,
{
    pub fn new(context: Arc<Ctx>, master: Arc<Master<S>>, config: ProtocolConfig) -> Self {
        Self {
            context,
            master,
            config,
        }
    }

    pub fn master(&self) -> &Arc<Master<S>> {
        &self.master
    }

    /// One loop iteration: drain, and reconcile when due.
    pub fn tick(&self, stats: &mut RuntimeStats) -> Result<(), ProtocolError> {
        stats.ticks += 1;

        match self.master.drain() {
            Ok(drained) => stats.messages += drained as u64,
            Err(e) => record_failure(stats, "drain", e)?,
        }

        let every = self.config.reconcile_every;
        if every > 0 && stats.ticks % every == 0 {
            match self.master.request_values() {
                Ok(_) => stats.reconciliations += 1,
                Err(e) => record_failure(stats, "reconciliation", e)?,
            }
        }
        Ok(())
    }

    /// Ticks every `poll_interval` until `shutdown` becomes true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<RuntimeStats, ProtocolError> {
        let mut stats = RuntimeStats::default();
        let started = self.context.now();
        info!(poll = ?self.config.poll_interval, seed = self.context.seed(), "master loop started");

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }

            self.tick(&mut stats)?;

            tokio::select! {
                _ = self.context.sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        stats.elapsed = self.context.now().saturating_sub(started);
        info!(
            ticks = stats.ticks,
            elapsed = ?stats.elapsed,
            messages = stats.messages,
            failures = stats.channel_failures,
            global_sum = self.master.global_sum(),
            "master loop stopped"
        );
        Ok(stats)
    }

    /// Runs the loop as a context task until `shutdown` becomes true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> oneshot::Receiver<Result<RuntimeStats, ProtocolError>> {
        let context = self.context.clone();
        spawn_with_result(context.as_ref(), "master-runtime", async move { self.run(shutdown).await })
    }
}

/// Inbox loop for one slave; answers the master's GET requests.
pub struct SlaveRuntime<Ctx, S>
where
    Ctx: DistSumContext,
    S: ReplicatedStore + ?Sized,
{
    context: Arc<Ctx>,
    slave: Arc<Slave<S>>,
    config: ProtocolConfig,
}

impl<Ctx, S> SlaveRuntime<Ctx, S>
where
    Ctx: DistSumContext,
    S: ReplicatedStore + ?Sized,
{
    pub fn new(context: Arc<Ctx>, slave: Arc<Slave<S>>, config: ProtocolConfig) -> Self {
        Self {
            context,
            slave,
            config,
        }
    }

    pub fn slave(&self) -> &Arc<Slave<S>> {
        &self.slave
    }

    pub fn tick(&self, stats: &mut RuntimeStats) -> Result<(), ProtocolError> {
        stats.ticks += 1;
        match self.slave.poll() {
            Ok(handled) => stats.messages += handled as u64,
            Err(e) => record_failure(stats, "slave poll", e)?,
        }
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<RuntimeStats, ProtocolError> {
        let mut stats = RuntimeStats::default();
        let started = self.context.now();
        debug!(slave = %self.slave.id(), seed = self.context.seed(), "slave loop started");

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }

            self.tick(&mut stats)?;

            tokio::select! {
                _ = self.context.sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        stats.elapsed = self.context.now().saturating_sub(started);
        debug!(slave = %self.slave.id(), ticks = stats.ticks, elapsed = ?stats.elapsed, "slave loop stopped");
        Ok(stats)
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> oneshot::Receiver<Result<RuntimeStats, ProtocolError>> {
        let context = self.context.clone();
        let name = format!("slave-runtime-{}", self.slave.id());
        spawn_with_result(context.as_ref(), &name, async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::constraint::Constraint;
    use distsum_env::{MemoryStore, ParticipantId, StoreController, TokioContext};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let ctx = TokioContext::new();
        let calls = AtomicU32::new(0);

        let result = retry(&ctx, &fast_policy(5), || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProtocolError::ChannelUnavailable(distsum_env::EnvError::unavailable("down")))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let ctx = TokioContext::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry(&ctx, &fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProtocolError::ChannelUnavailable(distsum_env::EnvError::unavailable("down")))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_fatal_errors() {
        let ctx = TokioContext::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry(&ctx, &fast_policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProtocolError::DuplicateRegistration(ParticipantId::master()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_master_tick_counts_outages() {
        let store = MemoryStore::shared();
        let master = Arc::new(Master::new(Arc::new(Channel::new(store.clone()))));
        let runtime = MasterRuntime::new(
            TokioContext::shared(),
            master,
            ProtocolConfig::default().with_reconcile_every(2),
        );
        let mut stats = RuntimeStats::default();

        store.set_available(false);
        runtime.tick(&mut stats).unwrap();
        runtime.tick(&mut stats).unwrap();
        assert_eq!(stats.channel_failures, 3);

        store.set_available(true);
        runtime.tick(&mut stats).unwrap();
        runtime.tick(&mut stats).unwrap();
        assert_eq!(stats.ticks, 4);
        assert_eq!(stats.reconciliations, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loops_reconcile_a_stale_master() {
        let store = MemoryStore::shared();
        let ctx = TokioContext::shared();
        let config = ProtocolConfig::default()
            .with_poll_interval(Duration::from_millis(2))
            .with_reconcile_every(3);

        let master = Arc::new(Master::new(Arc::new(Channel::new(store.clone()))));
        let slave_id = ParticipantId::new("1").unwrap();
        let slave_channel = Arc::new(Channel::new(store.clone()));
        let slave = Arc::new(
            Slave::new(slave_id.clone(), 10, Constraint::new(0, 20).unwrap(), slave_channel.clone())
                .unwrap(),
        );
        slave_channel.register(slave_id.clone(), slave.clone()).unwrap();

        // Master starts out believing the slave holds 0
        master.set_local_values(HashMap::from([(slave_id.clone(), 0)]));

        let (tx, rx) = watch::channel(false);
        let master_rt = MasterRuntime::new(ctx.clone(), master.clone(), config.clone());
        let slave_rt = SlaveRuntime::new(ctx.clone(), slave.clone(), config);
        let slave_task = slave_rt.spawn(rx.clone());
        let master_task = master_rt.spawn(rx);

        for _ in 0..500 {
            if master.global_sum() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tx.send(true).unwrap();

        let master_stats = master_task.await.unwrap().unwrap();
        let slave_stats = slave_task.await.unwrap().unwrap();
        assert_eq!(master.global_sum(), 10);
        assert!(master_stats.reconciliations >= 1);
        assert!(slave_stats.messages >= 1);
        // At least three poll intervals pass before the first reconcile
        assert!(master_stats.elapsed >= Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_spawn_with_result_returns_task_output() {
        let ctx = TokioContext::new();
        let result = spawn_with_result(&ctx, "answer", async { 6 * 7 });
        assert_eq!(result.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_stopped_loop_reports_zero_ticks() {
        let store = MemoryStore::shared();
        let master = Arc::new(Master::new(Arc::new(Channel::new(store))));
        let runtime = MasterRuntime::new(TokioContext::shared(), master, ProtocolConfig::default());

        let (_tx, rx) = watch::channel(true);
        let stats = runtime.spawn(rx).await.unwrap().unwrap();
        assert_eq!(stats.ticks, 0);
        assert_eq!(stats.messages, 0);
    }
}
