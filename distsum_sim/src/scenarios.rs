//! Simulation scenarios for distsum sessions.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SUM-001: reference session, every update reported and drained
    Baseline,

    /// SUM-002: store outages, reports retried until the store heals
    Outage,

    /// SUM-003: master restarts with a stale view, GET reconciliation
    Reconcile,

    /// SUM-004: narrow constraint, most updates rejected
    TightBounds,

    /// SUM-005: runtime loops on the tokio scheduler, concurrent updates
    Concurrent,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Baseline,
            ScenarioId::Outage,
            ScenarioId::Reconcile,
            ScenarioId::TightBounds,
            ScenarioId::Concurrent,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "baseline",
            ScenarioId::Outage => "outage",
            ScenarioId::Reconcile => "reconcile",
            ScenarioId::TightBounds => "tight_bounds",
            ScenarioId::Concurrent => "concurrent",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "Start at 10 in [9, 11], draw updates, estimate within 50% every round",
            ScenarioId::Outage => "30% of rounds with the store offline, retried reports converge after healing",
            ScenarioId::Reconcile => "Master restarts every other round with stale values, GET restores the sum",
            ScenarioId::TightBounds => "Constraint [0, 3] with large deltas, violations counted on both sides",
            ScenarioId::Concurrent => "Master and slave loops on tokio tasks, updates issued in parallel",
        }
    }

    /// Outage rate the scenario runs with.
    pub fn outage_rate(&self) -> f64 {
        match self {
            ScenarioId::Outage => 0.3,
            _ => 0.0,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "baseline" | "sum-001" => Ok(ScenarioId::Baseline),
            "outage" | "sum-002" => Ok(ScenarioId::Outage),
            "reconcile" | "sum-003" => Ok(ScenarioId::Reconcile),
            "tight_bounds" | "tightbounds" | "sum-004" => Ok(ScenarioId::TightBounds),
            "concurrent" | "sum-005" => Ok(ScenarioId::Concurrent),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
