//! Scenario runner - drives protocol scenarios on a local cluster and checks
//! the resulting population.

use crate::cluster::{LocalCluster, RunReport, ShutdownReport};
use crate::error::SimError;
use crate::exporter::{ExportObserver, RunExport};
use crate::scenarios::ScenarioId;

use parasim_core::{Agent, ModelConfig, PartitionPlan, PhaseCode};
use parasim_env::Rank;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Ranks in the group, coordinator included
    pub world_size: usize,

    /// Total ticks executed
    pub ticks: u64,

    /// Ticks whose report recorded a failure
    pub degraded_ticks: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Population size
    pub total_agents: usize,

    /// Chunk length each worker reported at shutdown, ascending by rank
    pub chunk_sizes: Vec<usize>,

    /// Rank failures across build and all ticks
    pub rank_failures: usize,

    /// Unknown phase codes the workers ignored
    pub ignored_codes: u64,
}

/// Everything a scenario produced, kept until the checks run.
struct Outcome {
    plan: PartitionPlan,
    population: Vec<Agent>,
    report: RunReport,
    shutdown: ShutdownReport,
}

/// Runs protocol scenarios.
pub struct ScenarioRunner {
    /// Placement seed
    seed: u64,

    /// Ranks in the group, coordinator included
    world_size: usize,

    /// Population size
    total_agents: usize,

    /// Ticks after the build
    ticks: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, world_size: usize) -> Self {
        Self {
            seed,
            world_size,
            total_agents: 10,
            ticks: 5,
        }
    }

    /// Sets the number of ticks.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    /// Sets the population size.
    pub fn with_agents(mut self, total_agents: usize) -> Self {
        self.total_agents = total_agents;
        self
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None).await
    }

    /// Runs a scenario while recording every gathered population.
    pub async fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, RunExport) {
        let (world_size, config) = self.setup(scenario);
        let export = Arc::new(Mutex::new(RunExport::new(config, world_size)));
        let result = self.execute(scenario, Some(Arc::clone(&export))).await;

        let export = match export.lock() {
            Ok(export) => export.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        (result, export)
    }

    /// Group shape and model config for `scenario`.
    fn setup(&self, scenario: ScenarioId) -> (usize, ModelConfig) {
        let config = ModelConfig::default()
            .with_seed(self.seed)
            .with_agents(self.total_agents);

        match scenario {
            ScenarioId::UnevenSplit => (4, config.with_agents(10)),
            ScenarioId::SingleWorker => (2, config),
            _ => (self.world_size, config),
        }
    }

    fn ticks_for(&self, scenario: ScenarioId) -> u64 {
        match scenario {
            // The fault needs at least one tick to land in
            ScenarioId::SeveredLink => self.ticks.max(1),
            _ => self.ticks,
        }
    }

    async fn execute(&self, scenario: ScenarioId, export: Option<Arc<Mutex<RunExport>>>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        let (world_size, config) = self.setup(scenario);
        let ticks = self.ticks_for(scenario);
        let total_agents = config.total_agents;

        let outcome = match self.drive(scenario, world_size, ticks, config, export.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{} stopped early: {}", scenario.name(), e);
                return ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    world_size,
                    ticks,
                    degraded_ticks: 0,
                    failure_reason: Some(e.to_string()),
                    metrics: ScenarioMetrics {
                        total_agents,
                        ..Default::default()
                    },
                };
            }
        };

        if let Some(export) = export {
            if let Ok(mut export) = export.lock() {
                for tick in outcome.report.ticks.iter().filter(|t| t.is_degraded()) {
                    export.mark_degraded(tick.iteration);
                }
            }
        }

        let metrics = ScenarioMetrics {
            total_agents,
            chunk_sizes: outcome.shutdown.workers.iter().map(|w| w.chunk_len).collect(),
            rank_failures: outcome.report.build.degraded.len()
                + outcome.report.ticks.iter().map(|t| t.degraded.len()).sum::<usize>(),
            ignored_codes: outcome.shutdown.workers.iter().map(|w| w.ignored_codes).sum(),
        };

        let failure_reason = self.check(scenario, world_size, ticks, &outcome);
        let passed = failure_reason.is_none();
        if passed {
            info!(
                "✓ {} complete: {} agents, {} ticks, chunks {:?}",
                scenario.name(),
                total_agents,
                ticks,
                metrics.chunk_sizes
            );
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            world_size,
            ticks,
            degraded_ticks: outcome.report.degraded_ticks(),
            failure_reason,
            metrics,
        }
    }

    async fn drive(
        &self,
        scenario: ScenarioId,
        world_size: usize,
        ticks: u64,
        config: ModelConfig,
        export: Option<Arc<Mutex<RunExport>>>,
    ) -> Result<Outcome, SimError> {
        let mut cluster = LocalCluster::launch(config, world_size)?;
        if let Some(export) = export {
            cluster
                .coordinator_mut()
                .add_observer(Box::new(ExportObserver::new(export)));
        }

        let report = match scenario {
            ScenarioId::Heartbeat => Self::run_heartbeat(&mut cluster, ticks).await?,
            ScenarioId::SeveredLink => Self::run_severed_link(&mut cluster, ticks).await?,
            _ => cluster.run(ticks).await?,
        };

        let plan = *cluster.coordinator().plan();
        let population = cluster.coordinator().population().to_vec();
        let shutdown = cluster.shutdown().await?;

        Ok(Outcome {
            plan,
            population,
            report,
            shutdown,
        })
    }

    /// PS-004: a continue command before and after every tick.
    async fn run_heartbeat(cluster: &mut LocalCluster, ticks: u64) -> Result<RunReport, SimError> {
        info!("PS-004: Heartbeat - continue between ticks");
        let coordinator = cluster.coordinator_mut();
        let build = coordinator.build().await?;

        let mut report = RunReport {
            build,
            ticks: Vec::new(),
        };
        for _ in 0..ticks {
            coordinator.broadcast(PhaseCode::Continue).await?;
            let mut tick = coordinator.tick().await?;
            coordinator.broadcast(PhaseCode::Continue).await?;
            // Failures from the trailing continue belong to this tick
            tick.degraded.extend(coordinator.take_report().degraded);
            report.ticks.push(tick);
        }
        Ok(report)
    }

    /// PS-005: the coordinator -> last worker link is down while step is sent
    /// in the first tick, then healed before post-step.
    async fn run_severed_link(cluster: &mut LocalCluster, ticks: u64) -> Result<RunReport, SimError> {
        info!("PS-005: SeveredLink - step lost on one link");
        let victim = Rank((cluster.world_size() - 1) as u32);
        let build = cluster.coordinator_mut().build().await?;
        let mut report = RunReport {
            build,
            ticks: Vec::new(),
        };

        cluster.coordinator_mut().pre_step().await?;
        info!("  ⚡ Severing {} -> {}", Rank::COORDINATOR, victim);
        cluster.controller().sever(Rank::COORDINATOR, victim);
        cluster.coordinator_mut().step().await?;
        info!("  ✓ Healing links");
        cluster.controller().heal_all();
        cluster.coordinator_mut().post_step().await?;
        report.ticks.push(cluster.coordinator_mut().take_report());

        for _ in 1..ticks {
            report.ticks.push(cluster.coordinator_mut().tick().await?);
        }
        Ok(report)
    }

    /// Checks the run against the scenario's expectations. Returns the first
    /// violated expectation.
    fn check(&self, scenario: ScenarioId, world_size: usize, ticks: u64, outcome: &Outcome) -> Option<String> {
        let worker_count = world_size - 1;
        let population = &outcome.population;
        let shutdown = &outcome.shutdown;

        let ids: Vec<u64> = population.iter().map(|a| a.id).collect();
        let expected_ids: Vec<u64> = (0..outcome.plan.total() as u64).collect();
        if ids != expected_ids {
            return Some(format!("population ids out of canonical order: {:?}", ids));
        }

        if let Some((rank, error)) = shutdown.worker_errors.first() {
            return Some(format!("{} stopped with error: {}", rank, error));
        }
        if shutdown.workers.len() != worker_count {
            return Some(format!(
                "{} of {} workers terminated",
                shutdown.workers.len(),
                worker_count
            ));
        }
        if let Some(w) = shutdown.workers.iter().find(|w| w.iterations != ticks) {
            return Some(format!("{} ran {} iterations, expected {}", w.rank, w.iterations, ticks));
        }

        // Agents whose step was lost stay one value behind
        let lagging = match scenario {
            ScenarioId::SeveredLink => {
                let victim = Rank(worker_count as u32);
                let failed = outcome.report.ticks.first().map(|t| t.failed_ranks());
                if failed != Some(vec![victim]) {
                    return Some(format!("expected first tick degraded on {}, got {:?}", victim, failed));
                }
                if outcome.report.degraded_ticks() != 1 {
                    return Some(format!("{} degraded ticks, expected 1", outcome.report.degraded_ticks()));
                }
                outcome.plan.assignment(victim).map(|a| a.range())
            }
            _ => {
                if outcome.report.is_degraded() {
                    return Some(format!("{} degraded ticks on a healthy network", outcome.report.degraded_ticks()));
                }
                None
            }
        };

        for (i, agent) in population.iter().enumerate() {
            let lag = match &lagging {
                Some(range) if range.contains(&i) => 1,
                _ => 0,
            };
            let expected = 1 + ticks as i64 - lag;
            if agent.value != expected {
                return Some(format!(
                    "agent {} has value {}, expected {}",
                    agent.id, agent.value, expected
                ));
            }
        }

        let chunk_sizes: Vec<usize> = shutdown.workers.iter().map(|w| w.chunk_len).collect();
        debug!("  chunk sizes {:?}", chunk_sizes);
        match scenario {
            ScenarioId::UnevenSplit if chunk_sizes != [3, 3, 4] => {
                return Some(format!("chunks {:?}, expected [3, 3, 4]", chunk_sizes));
            }
            ScenarioId::SingleWorker if chunk_sizes != [population.len()] => {
                return Some(format!("single worker holds {:?} of {}", chunk_sizes, population.len()));
            }
            ScenarioId::Heartbeat => {
                let ignored: u64 = shutdown.workers.iter().map(|w| w.ignored_codes).sum();
                if ignored != 0 {
                    return Some(format!("{} continue commands treated as unknown", ignored));
                }
            }
            _ => {}
        }

        None
    }
}
