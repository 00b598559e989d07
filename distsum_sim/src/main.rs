//! distsum Simulator CLI
//!
//! Run deterministic distsum sessions and check the master's estimate.

use clap::Parser;
use distsum_sim::scenarios::ScenarioId;
use distsum_sim::{ScenarioResult, ScenarioRunner, StoreBackend};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// distsum Deterministic Simulation CLI
#[derive(Parser, Debug)]
#[command(name = "distsum-sim")]
#[command(about = "Run deterministic simulation sessions for distsum", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of slaves
    #[arg(short = 'n', long, default_value = "4")]
    slaves: usize,

    /// Scenario to run (baseline, outage, reconcile, tight_bounds, concurrent, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Update rounds per scenario
    #[arg(short, long, default_value = "20")]
    rounds: u64,

    /// Store backend (memory, sled)
    #[arg(long, default_value = "memory")]
    store: StoreBackend,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the per-round trace of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// A zero seed is replaced by the wall clock in nanoseconds, clamped to
/// `u64::MAX`; a clock before the epoch falls back to 42.
fn resolve_seed(seed: u64, now: std::time::SystemTime) -> u64 {
    if seed != 0 {
        return seed;
    }
    now.duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(42)
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED | sum={} | max_err={:.3}",
            result.scenario.name(),
            result.seed,
            result.final_global_sum,
            result.metrics.max_relative_error
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if !args.json {
        info!("distsum Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Available scenarios: baseline, outage, reconcile, tight_bounds, concurrent, all");
                std::process::exit(2);
            }
        }
    };

    let base_seed = resolve_seed(args.seed, std::time::SystemTime::now());

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(2);
        }

        info!("Running with export to: {}", export_path);
        let result = ScenarioRunner::new(base_seed, args.slaves)
            .with_rounds(args.rounds)
            .with_store(args.store)
            .with_recording(true)
            .run(scenarios[0]);
        report(&result);

        match &result.export {
            Some(export) => match export.write_to_file(export_path) {
                Ok(()) => info!("Exported {} rounds to {}", export.rounds.len(), export_path),
                Err(e) => {
                    error!("Failed to write export: {}", e);
                    std::process::exit(1);
                }
            },
            None => error!("Scenario aborted before producing an export"),
        }

        if !result.passed {
            std::process::exit(1);
        }
        return;
    }

    // Run simulations
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed, args.slaves)
            .with_rounds(args.rounds)
            .with_store(args.store);

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed: Vec<&ScenarioResult> = all_results.iter().filter(|r| !r.passed).collect();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed.len(),
            "failed": failed.len(),
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "rounds": r.rounds,
                    "true_sum": r.final_true_sum,
                    "global_sum": r.final_global_sum,
                    "max_relative_error": r.metrics.max_relative_error,
                    "updates_applied": r.metrics.updates_applied,
                    "violations": r.metrics.violations,
                    "channel_failures": r.metrics.channel_failures,
                    "retries": r.metrics.retries,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed.is_empty() {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed.len(), total);
            for result in &failed {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if !failed.is_empty() {
        std::process::exit(1);
    }
}
