//! Parasim CLI
//!
//! Runs the phase protocol either inside one process (`local`) or across
//! processes over TCP (`coordinator` + one `worker` per rank).

use clap::{Parser, Subcommand, ValueEnum};
use parasim_core::{Coordinator, FailurePolicy, ModelConfig, RunIdentity, UnknownCodePolicy, Worker};
use parasim_env::{Rank, Tag, TcpTransport};
use parasim_sim::scenarios::ScenarioId;
use parasim_sim::{ScenarioResult, ScenarioRunner, SimError};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Parasim phase-dispatch simulation CLI
#[derive(Parser, Debug)]
#[command(name = "parasim")]
#[command(about = "Coordinator-driven parallel agent simulation", long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run scenarios on an in-process cluster
    Local {
        /// Placement seed (0 = random from time)
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Ranks in the group, coordinator included
        #[arg(short, long, default_value = "4")]
        world_size: usize,

        /// Population size
        #[arg(short, long, default_value = "10")]
        agents: usize,

        /// Ticks after the build
        #[arg(short, long, default_value = "5")]
        ticks: u64,

        /// Scenario to run (baseline, uneven_split, single_worker, heartbeat, severed_link, all)
        #[arg(short = 'S', long, default_value = "all")]
        scenario: String,

        /// JSON output for CI parsing
        #[arg(long)]
        json: bool,

        /// Export gathered populations to a JSON file
        #[arg(long)]
        export: Option<String>,
    },

    /// Run rank 0 and wait for every worker to connect
    Coordinator {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        listen: String,

        /// Ranks in the group, coordinator included
        #[arg(short, long)]
        world_size: usize,

        /// Population size
        #[arg(short, long, default_value = "10")]
        agents: usize,

        /// Ticks after the build
        #[arg(short, long, default_value = "5")]
        ticks: u64,

        /// Placement seed
        #[arg(short, long, default_value = "42")]
        seed: u64,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Run one worker rank against a remote coordinator
    Worker {
        /// Coordinator address
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        connect: String,

        /// This worker's rank (1..world_size)
        #[arg(short, long)]
        rank: u32,

        /// Ranks in the group, coordinator included
        #[arg(short, long)]
        world_size: usize,

        #[command(flatten)]
        model: ModelArgs,
    },
}

/// Failure handling for sends and receives that fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum FailurePolicyArg {
    LogAndContinue,
    SkipTick,
    Retry,
    Abort,
}

/// Handling of phase codes a worker does not know.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum UnknownCodeArg {
    Ignore,
    Reject,
}

/// Protocol settings shared by the coordinator and every worker. All ranks
/// of a run must be started with the same values.
#[derive(clap::Args, Debug)]
struct ModelArgs {
    /// Torus width in cells
    #[arg(long, default_value = "300")]
    width: i32,

    /// Torus height in cells
    #[arg(long, default_value = "300")]
    height: i32,

    /// What to do when an exchange with a rank fails
    #[arg(long, value_enum, default_value = "log-and-continue")]
    failure_policy: FailurePolicyArg,

    /// Extra attempts under `--failure-policy retry`
    #[arg(long, default_value = "3")]
    retry_attempts: u32,

    /// What a worker does with an unknown phase code
    #[arg(long, value_enum, default_value = "ignore")]
    unknown_codes: UnknownCodeArg,

    /// Tag carrying phase codes
    #[arg(long, default_value = "50")]
    command_tag: u16,

    /// Tag carrying assignments and agent batches
    #[arg(long, default_value = "51")]
    data_tag: u16,
}

impl ModelArgs {
    fn config(&self) -> ModelConfig {
        let failure_policy = match self.failure_policy {
            FailurePolicyArg::LogAndContinue => FailurePolicy::LogAndContinue,
            FailurePolicyArg::SkipTick => FailurePolicy::SkipTick,
            FailurePolicyArg::Retry => FailurePolicy::Retry {
                attempts: self.retry_attempts,
            },
            FailurePolicyArg::Abort => FailurePolicy::Abort,
        };
        let unknown_code_policy = match self.unknown_codes {
            UnknownCodeArg::Ignore => UnknownCodePolicy::Ignore,
            UnknownCodeArg::Reject => UnknownCodePolicy::Reject,
        };

        ModelConfig::default()
            .with_space(self.width, self.height)
            .with_tags(Tag(self.command_tag), Tag(self.data_tag))
            .with_failure_policy(failure_policy)
            .with_unknown_code_policy(unknown_code_policy)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let outcome = match args.mode {
        Mode::Local {
            seed,
            world_size,
            agents,
            ticks,
            scenario,
            json,
            export,
        } => run_local(seed, world_size, agents, ticks, &scenario, json, export.as_deref()).await,
        Mode::Coordinator {
            listen,
            world_size,
            agents,
            ticks,
            seed,
            model,
        } => {
            let config = model.config().with_agents(agents).with_seed(seed);
            run_coordinator(&listen, world_size, ticks, config).await
        }
        Mode::Worker {
            connect,
            rank,
            world_size,
            model,
        } => run_worker(&connect, Rank(rank), world_size, model.config()).await,
    };

    // Exit with proper code for CI
    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Runs scenarios on a local cluster. Returns whether all of them passed.
async fn run_local(
    seed: u64,
    world_size: usize,
    agents: usize,
    ticks: u64,
    scenario: &str,
    json: bool,
    export: Option<&str>,
) -> Result<bool, SimError> {
    if !json {
        info!("Parasim v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if scenario == "all" {
        ScenarioId::all()
    } else {
        match scenario.parse() {
            Ok(id) => vec![id],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Available scenarios: baseline, uneven_split, single_worker, heartbeat, severed_link, all");
                return Ok(false);
            }
        }
    };

    let seed = if seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        seed
    };

    let runner = ScenarioRunner::new(seed, world_size)
        .with_agents(agents)
        .with_ticks(ticks);

    // Handle --export mode for the display collaborator
    if let Some(path) = export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            return Ok(false);
        }
        let (result, export) = runner.run_with_export(scenarios[0]).await;
        export.write_to_file(path)?;
        info!("Exported {} frames to {}", export.frames.len(), path);
        report(&[result.clone()], json)?;
        return Ok(result.passed);
    }

    let mut results = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let result = runner.run(scenario).await;
        if !json {
            if result.passed {
                info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    scenario.name(),
                    seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        results.push(result);
    }

    report(&results, json)?;
    Ok(results.iter().all(|r| r.passed))
}

/// Prints the run summary.
fn report(results: &[ScenarioResult], json: bool) -> Result<(), SimError> {
    let total = results.len();
    let failed = results.iter().filter(|r| !r.passed).count();

    if json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed,
            "failed": failed,
            "results": results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "world_size": r.world_size,
                    "ticks": r.ticks,
                    "degraded_ticks": r.degraded_ticks,
                    "chunk_sizes": r.metrics.chunk_sizes,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if failed == 0 {
        info!("✅ All {} scenario runs passed!", total);
    } else {
        error!("❌ {}/{} scenario runs failed!", failed, total);
        for result in results.iter().filter(|r| !r.passed) {
            error!(
                "  - {} seed={}: {}",
                result.scenario.name(),
                result.seed,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }
    Ok(())
}

/// Rank 0 over TCP: waits for all workers, builds, ticks, ends.
async fn run_coordinator(listen: &str, world_size: usize, ticks: u64, config: ModelConfig) -> Result<bool, SimError> {
    let identity = RunIdentity::new(Rank::COORDINATOR, world_size)?;
    let transport = Arc::new(TcpTransport::coordinator(listen, identity.world_size).await?);
    info!("All {} workers connected", identity.worker_count());

    let mut coordinator = Coordinator::new(transport, config)?;
    let mut degraded = coordinator.build().await?.is_degraded();
    for _ in 0..ticks {
        degraded |= coordinator.tick().await?.is_degraded();
    }
    degraded |= coordinator.at_end().await?.is_degraded();

    let sum: i64 = coordinator.population().iter().map(|a| a.value).sum();
    info!(
        "Finished {} iterations over {} agents (value sum {})",
        coordinator.model_iteration(),
        coordinator.population().len(),
        sum
    );
    if degraded {
        error!("Run completed with failures; see the log above");
    }
    Ok(!degraded)
}

/// One worker rank over TCP: runs the command loop until end.
async fn run_worker(connect: &str, rank: Rank, world_size: usize, config: ModelConfig) -> Result<bool, SimError> {
    let identity = RunIdentity::new(rank, world_size)?;
    let transport = Arc::new(TcpTransport::worker(connect.to_string(), identity.rank, identity.world_size).await?);
    info!("{} connected to {}", rank, connect);

    let mut worker = Worker::new(transport, config)?;
    let summary = worker.run().await?;
    info!(
        "{} terminated after {} iterations holding {} agents",
        summary.rank, summary.iterations, summary.chunk_len
    );
    Ok(summary.failures.is_empty())
}
