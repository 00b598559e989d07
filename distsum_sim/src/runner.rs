//! Scenario runner - executes distsum sessions and judges the estimate.

use crate::error::SimError;
use crate::exporter::{RoundFrame, SimExport, SlaveFrame};
use crate::oracle::{relative_error, within_tolerance};
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld, StoreBackend};

use distsum_core::{
    retry, spawn_with_result, MasterRuntime, ProtocolConfig, RuntimeStats, SlaveRuntime, UpdateOutcome,
};
use distsum_env::{DistSumContext, ParticipantId, TokioContext};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Accepted relative error of the master's estimate after each round.
///
/// `0.5 × truth <= estimate <= 1.5 × truth` for a positive truth.
pub const TOLERANCE: f64 = 0.5;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Rounds executed
    pub rounds: u64,

    /// Exact sum of the slaves' values at the end
    pub final_true_sum: i64,

    /// The master's estimate at the end
    pub final_global_sum: i64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Per-round trace, when recording was requested
    pub export: Option<SimExport>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioMetrics {
    /// Updates the slaves accepted
    pub updates_applied: u64,

    /// Updates the slaves rejected
    pub violations: u64,

    /// Messages the master applied
    pub messages_drained: u64,

    /// Operations that hit an unreachable store
    pub channel_failures: u64,

    /// Report attempts beyond the first
    pub retries: u64,

    /// Rounds that ran with the store offline
    pub outage_rounds: u64,

    /// GET rounds issued by the master
    pub reconciliations: u64,

    /// Worst relative error observed after any round
    pub max_relative_error: f64,
}

impl ScenarioMetrics {
    fn record(&mut self, outcome: &UpdateOutcome) {
        match outcome {
            UpdateOutcome::Applied { .. } => self.updates_applied += 1,
            UpdateOutcome::Rejected { .. } => self.violations += 1,
        }
    }
}

/// Runs distsum scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of slaves
    num_slaves: usize,

    /// Update rounds per scenario
    rounds: u64,

    /// Store implementation
    store: StoreBackend,

    /// Keep a per-round export in the result
    record: bool,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_slaves: usize) -> Self {
        Self {
            seed,
            num_slaves,
            rounds: 20,
            store: StoreBackend::Memory,
            record: false,
        }
    }

    /// Sets the number of update rounds.
    pub fn with_rounds(mut self, rounds: u64) -> Self {
        self.rounds = rounds;
        self
    }

    /// Sets the store backend.
    pub fn with_store(mut self, store: StoreBackend) -> Self {
        self.store = store;
        self
    }

    /// Records a per-round [`SimExport`] in each result.
    pub fn with_recording(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => return self.aborted(scenario, SimError::Runtime(e.to_string())),
        };

        let outcome = runtime.block_on(async {
            match scenario {
                ScenarioId::Baseline => self.run_baseline(),
                ScenarioId::Outage => self.run_outage().await,
                ScenarioId::Reconcile => self.run_reconcile(),
                ScenarioId::TightBounds => self.run_tight_bounds(),
                ScenarioId::Concurrent => self.run_concurrent().await,
            }
        });

        match outcome {
            Ok(session) => session.finish(scenario, self.seed, self.rounds),
            Err(e) => {
                warn!(scenario = scenario.name(), error = %e, "scenario aborted");
                self.aborted(scenario, e)
            }
        }
    }

    fn aborted(&self, scenario: ScenarioId, error: SimError) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            rounds: 0,
            final_true_sum: 0,
            final_global_sum: 0,
            failure_reason: Some(format!("aborted: {}", error)),
            metrics: ScenarioMetrics::default(),
            export: None,
        }
    }

    fn base_config(&self, scenario: ScenarioId) -> SimConfig {
        SimConfig {
            seed: self.seed,
            num_slaves: self.num_slaves,
            store: self.store,
            outage_rate: scenario.outage_rate(),
            ..SimConfig::default()
        }
    }

    fn session(&self, scenario: ScenarioId, config: SimConfig) -> Result<Session, SimError> {
        let mut world = SimWorld::new(config)?;
        world.spawn_slaves()?;

        Ok(Session {
            world,
            metrics: ScenarioMetrics::default(),
            export: self.record.then(|| SimExport::new(scenario.name(), self.seed)),
            failure: None,
        })
    }

    /// SUM-001: Baseline - the reference session.
    ///
    /// Every slave starts at 10 with constraint [9, 11] and draws from the
    /// default update set each round. All reports are drained before the
    /// check, so the estimate must be exact.
    ///
    /// **Assertion**: estimate within tolerance and equal to the true sum
    /// after every round; master violation counts match slave rejections.
    fn run_baseline(&self) -> Result<Session, SimError> {
        info!("SUM-001: Baseline - reference session");

        let mut session = self.session(ScenarioId::Baseline, self.base_config(ScenarioId::Baseline))?;

        for round in 0..self.rounds {
            session.update_all()?;
            session.drain()?;
            session.observe(round);
            session.expect_exact(&format!("round {}", round));

            debug!(
                "  round={} | true={} | estimate={}",
                round,
                session.world.true_sum(),
                session.world.master.global_sum()
            );
        }

        session.check_violations();
        Ok(session)
    }

    /// SUM-002: Outage - reports retried across store outages.
    ///
    /// Each round the store may be offline. Updates still change local
    /// state; their failed reports are retried with backoff and stay
    /// pending until the store comes back.
    ///
    /// **Assertion**: estimate within tolerance every round; exact once the
    /// store has healed and pending reports are flushed.
    async fn run_outage(&self) -> Result<Session, SimError> {
        info!("SUM-002: Outage - store outages with retried reports");

        let mut session = self.session(ScenarioId::Outage, self.base_config(ScenarioId::Outage))?;
        let mut pending = BTreeSet::new();

        for round in 0..self.rounds {
            if !session.world.faults.roll() {
                session.metrics.outage_rounds += 1;
            }

            let deltas = session.world.oracle.next_round(session.world.slaves.len());
            for (index, delta) in deltas.into_iter().enumerate() {
                match session.world.slaves[index].update(delta) {
                    Ok(outcome) => session.metrics.record(&outcome),
                    Err(e) if e.is_transient() => {
                        session.metrics.channel_failures += 1;
                        pending.insert(index);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            session.flush_reports(&mut pending).await?;
            match session.world.master.drain() {
                Ok(drained) => session.metrics.messages_drained += drained as u64,
                Err(e) if e.is_transient() => session.metrics.channel_failures += 1,
                Err(e) => return Err(e.into()),
            }

            session.observe(round);
            debug!(
                "  round={} | available={} | pending={}",
                round,
                session.world.faults.is_available(),
                pending.len()
            );
        }

        session.world.faults.heal();
        session.flush_reports(&mut pending).await?;
        session.drain()?;

        if !pending.is_empty() {
            session.fail(format!("{} reports still pending after healing", pending.len()));
        }
        session.expect_exact("after healing");
        Ok(session)
    }

    /// SUM-003: Reconcile - master restarts with a stale view.
    ///
    /// Every other round the master is replaced by a fresh instance seeded
    /// with the constraint minimum for every slave. Slaves whose update was
    /// rejected send no new value, so only a GET round can repair them.
    ///
    /// **Assertion**: estimate exact after each reconciliation.
    fn run_reconcile(&self) -> Result<Session, SimError> {
        info!("SUM-003: Reconcile - stale master refreshed by GET");

        let config = self.base_config(ScenarioId::Reconcile);
        let stale_value = config.constraint_min;
        let mut session = self.session(ScenarioId::Reconcile, config)?;

        for round in 0..self.rounds {
            let restarted = round % 2 == 1;
            if restarted {
                let stale: HashMap<ParticipantId, i64> = session
                    .world
                    .slaves
                    .iter()
                    .map(|s| (s.id().clone(), stale_value))
                    .collect();
                session.world.restart_master(stale)?;
                debug!("  round={} | master restarted with stale view", round);
            }

            session.update_all()?;
            session.drain()?;

            if restarted {
                let requested = session.world.master.request_values()?;
                let answered = session.world.pump_slaves()?;
                if answered != requested {
                    session.fail(format!(
                        "round {}: {} GET requests but {} answers",
                        round, requested, answered
                    ));
                }
                session.drain()?;
                session.metrics.reconciliations += 1;
            }

            session.observe(round);
            session.expect_exact(&format!("round {}", round));
        }

        Ok(session)
    }

    /// SUM-004: TightBounds - most updates violate the constraint.
    ///
    /// Slaves start at 1 in [0, 3] and draw from {2, -2, 1, -1, 3}.
    ///
    /// **Assertion**: estimate exact every round; the master counted
    /// exactly as many violations as the slaves rejected.
    fn run_tight_bounds(&self) -> Result<Session, SimError> {
        info!("SUM-004: TightBounds - constraint [0, 3]");

        let config = SimConfig {
            initial_value: 1,
            constraint_min: 0,
            constraint_max: 3,
            update_set: vec![2, -2, 1, -1, 3],
            ..self.base_config(ScenarioId::TightBounds)
        };
        let mut session = self.session(ScenarioId::TightBounds, config)?;

        for round in 0..self.rounds {
            session.update_all()?;
            session.drain()?;
            session.observe(round);
            session.expect_exact(&format!("round {}", round));
        }

        session.check_violations();
        info!(
            applied = session.metrics.updates_applied,
            rejected = session.metrics.violations,
            "tight bounds finished"
        );
        Ok(session)
    }

    /// SUM-005: Concurrent - runtime loops on the tokio scheduler.
    ///
    /// The master and every slave run their poll loops as tasks on a real
    /// clock while updates are issued from parallel tasks. The master sees
    /// whatever its loop has drained so far.
    ///
    /// **Assertion**: estimate within tolerance every round; exact after
    /// shutdown and a final drain.
    async fn run_concurrent(&self) -> Result<Session, SimError> {
        info!("SUM-005: Concurrent - runtime loops with parallel updates");

        let protocol = ProtocolConfig::default()
            .with_poll_interval(Duration::from_millis(1))
            .with_reconcile_every(5);
        let config = SimConfig {
            protocol: protocol.clone(),
            ..self.base_config(ScenarioId::Concurrent)
        };
        let mut session = self.session(ScenarioId::Concurrent, config)?;

        let context = TokioContext::shared();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let master_task = MasterRuntime::new(context.clone(), session.world.master.clone(), protocol.clone())
            .spawn(shutdown_rx.clone());

        let slave_tasks: Vec<_> = session
            .world
            .slaves
            .iter()
            .map(|slave| {
                SlaveRuntime::new(context.clone(), slave.clone(), protocol.clone()).spawn(shutdown_rx.clone())
            })
            .collect();

        for round in 0..self.rounds {
            let deltas = session.world.oracle.next_round(session.world.slaves.len());
            let updates: Vec<_> = session
                .world
                .slaves
                .iter()
                .zip(deltas)
                .map(|(slave, delta)| {
                    let slave = slave.clone();
                    let name = format!("update-{}", slave.id());
                    spawn_with_result(context.as_ref(), &name, async move { slave.update(delta) })
                })
                .collect();

            for update in updates {
                let outcome = update.await.map_err(|e| SimError::Runtime(e.to_string()))??;
                session.metrics.record(&outcome);
            }

            context.sleep(protocol.poll_interval * 2).await;
            session.observe(round);
        }

        if shutdown_tx.send(true).is_err() {
            warn!("all runtime loops already stopped");
        }

        let master_stats = master_task.await.map_err(|e| SimError::Runtime(e.to_string()))??;
        session.absorb(&master_stats);
        session.metrics.reconciliations += master_stats.reconciliations;

        for task in slave_tasks {
            let stats = task.await.map_err(|e| SimError::Runtime(e.to_string()))??;
            session.metrics.channel_failures += stats.channel_failures;
        }

        session.drain()?;
        session.expect_exact("after shutdown");
        Ok(session)
    }
}

/// Mutable state of one scenario run.
struct Session {
    world: SimWorld,
    metrics: ScenarioMetrics,
    export: Option<SimExport>,
    failure: Option<String>,
}

impl Session {
    fn absorb(&mut self, stats: &RuntimeStats) {
        self.metrics.messages_drained += stats.messages;
        self.metrics.channel_failures += stats.channel_failures;
    }

    /// Applies one drawn delta to every slave; any channel error aborts.
    fn update_all(&mut self) -> Result<(), SimError> {
        let deltas = self.world.oracle.next_round(self.world.slaves.len());
        for (slave, delta) in self.world.slaves.iter().zip(deltas) {
            let outcome = slave.update(delta)?;
            self.metrics.record(&outcome);
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), SimError> {
        self.metrics.messages_drained += self.world.master.drain()? as u64;
        Ok(())
    }

    /// Re-sends the current value of every slave whose report was lost.
    ///
    /// Slaves that still cannot reach the store stay pending.
    async fn flush_reports(&mut self, pending: &mut BTreeSet<usize>) -> Result<(), SimError> {
        let policy = self.world.config.protocol.retry.clone();
        let context = self.world.context.clone();
        let mut still_pending = BTreeSet::new();

        for &index in pending.iter() {
            let slave = &self.world.slaves[index];
            let mut attempts = 0u64;
            let result = retry(context.as_ref(), &policy, || {
                attempts += 1;
                slave.report()
            })
            .await;
            self.metrics.retries += attempts.saturating_sub(1);

            match result {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    self.metrics.channel_failures += 1;
                    still_pending.insert(index);
                }
                Err(e) => return Err(e.into()),
            }
        }

        *pending = still_pending;
        Ok(())
    }

    /// Records the round and checks the tolerance band.
    fn observe(&mut self, round: u64) {
        let truth = self.world.true_sum();
        let estimate = self.world.master.global_sum();
        let error = relative_error(truth, estimate);
        if error > self.metrics.max_relative_error {
            self.metrics.max_relative_error = error;
        }

        if let Some(export) = &mut self.export {
            let master = &self.world.master;
            let slaves = self
                .world
                .slaves
                .iter()
                .map(|s| SlaveFrame {
                    id: s.id().to_string(),
                    value: s.local_value(),
                    reported: master.local_value(s.id()),
                })
                .collect();
            export.add_round(RoundFrame {
                round,
                true_sum: truth,
                global_sum: estimate,
                relative_error: error,
                store_available: self.world.faults.is_available(),
                slaves,
            });
        }

        if !within_tolerance(truth, estimate, TOLERANCE) {
            self.fail(format!(
                "round {}: estimate {} outside tolerance of true sum {}",
                round, estimate, truth
            ));
        }
    }

    fn expect_exact(&mut self, label: &str) {
        let truth = self.world.true_sum();
        let estimate = self.world.master.global_sum();
        if truth != estimate {
            self.fail(format!("{}: estimate {} != true sum {}", label, estimate, truth));
        }
    }

    fn check_violations(&mut self) {
        let master = &self.world.master;
        let counted: u64 = self
            .world
            .slaves
            .iter()
            .filter_map(|s| master.violations(s.id()))
            .map(|record| record.count)
            .sum();
        if counted != self.metrics.violations {
            self.fail(format!(
                "master counted {} violations, slaves rejected {}",
                counted, self.metrics.violations
            ));
        }
    }

    /// Keeps the first failure.
    fn fail(&mut self, reason: String) {
        if self.failure.is_none() {
            warn!("{}", reason);
            self.failure = Some(reason);
        }
    }

    fn finish(mut self, scenario: ScenarioId, seed: u64, rounds: u64) -> ScenarioResult {
        let final_true_sum = self.world.true_sum();
        let final_global_sum = self.world.master.global_sum();
        let passed = self.failure.is_none();

        if let Some(export) = &mut self.export {
            export.finalize(passed, Some(relative_error(final_true_sum, final_global_sum)));
        }

        ScenarioResult {
            scenario,
            seed,
            passed,
            rounds,
            final_true_sum,
            final_global_sum,
            failure_reason: self.failure,
            metrics: self.metrics,
            export: self.export,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_passes() {
        let result = ScenarioRunner::new(42, 4).with_rounds(10).run(ScenarioId::Baseline);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_true_sum, result.final_global_sum);
        assert_eq!(result.metrics.updates_applied + result.metrics.violations, 40);
        assert_eq!(result.metrics.messages_drained, 40);
    }

    #[test]
    fn test_reference_session_single_slave() {
        let result = ScenarioRunner::new(7, 1).with_rounds(3).run(ScenarioId::Baseline);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!((9..=11).contains(&result.final_true_sum));
    }

    #[test]
    fn test_runner_is_deterministic() {
        let runner = ScenarioRunner::new(1234, 5).with_rounds(15);
        let a = runner.run(ScenarioId::Baseline);
        let b = runner.run(ScenarioId::Baseline);

        assert_eq!(a.final_true_sum, b.final_true_sum);
        assert_eq!(a.metrics, b.metrics);
    }

    #[test]
    fn test_outage_converges_after_healing() {
        let result = ScenarioRunner::new(42, 4).with_rounds(20).run(ScenarioId::Outage);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.outage_rounds == 0 || result.metrics.channel_failures > 0);
    }

    #[test]
    fn test_reconcile_restores_exact_sum() {
        let result = ScenarioRunner::new(42, 4).with_rounds(10).run(ScenarioId::Reconcile);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.reconciliations, 5);
    }

    #[test]
    fn test_tight_bounds_counts_violations() {
        let result = ScenarioRunner::new(42, 3).with_rounds(20).run(ScenarioId::TightBounds);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!((0..=9).contains(&result.final_true_sum));
    }

    #[test]
    fn test_concurrent_loops_converge() {
        let result = ScenarioRunner::new(42, 4).with_rounds(5).run(ScenarioId::Concurrent);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_true_sum, result.final_global_sum);
    }

    #[test]
    fn test_recording_exports_every_round() {
        let result = ScenarioRunner::new(42, 2)
            .with_rounds(6)
            .with_recording(true)
            .run(ScenarioId::Baseline);

        let export = result.export.expect("recording was requested");
        assert_eq!(export.rounds.len(), 6);
        assert!(export.passed);
        assert_eq!(export.final_relative_error, Some(0.0));
        assert!(export.rounds.iter().all(|r| r.slaves.len() == 2));
    }

    #[test]
    fn test_sled_backend_baseline() {
        let result = ScenarioRunner::new(42, 2)
            .with_rounds(5)
            .with_store(StoreBackend::Sled)
            .run(ScenarioId::Baseline);
        assert!(result.passed, "{:?}", result.failure_reason);
    }
}
