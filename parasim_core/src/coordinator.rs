//! Coordinator - rank 0's driver for the whole run.
//!
//! The coordinator owns the authoritative population and never mutates
//! agents itself. Each tick it broadcasts phase codes, then gathers every
//! worker's chunk back into the slice it was scattered from.
//!
//! ```text
//! build:      BUILD ─► rank1..n   assignment+batch ─► rank1..n
//! tick:       PRE_STEP ─► all     STEP ─► all     POST_STEP ─► all
//!             gather rank1, rank2, ... rank n (ascending) ─► population
//! end:        END ─► all, close transport
//! ```
//!
//! Broadcasts are a sequence of independent sends, not an atomic operation:
//! a failure part way through leaves some workers one phase behind.

use crate::agent::{spawn_population, Agent, IdCounter, Space};
use crate::config::{FailurePolicy, ModelConfig};
use crate::error::CoreError;
use crate::partition::PartitionPlan;
use crate::policy::{run_with_policy, RankFailure, TickReport};
use crate::protocol::{PhaseCode, PhaseTransport};
use parasim_env::{NetworkTransport, Rank};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Receives a read-only view of the population after every gather.
///
/// This is the hook for display and export. Observers run synchronously
/// and cannot fail the tick.
pub trait PopulationObserver: Send {
    fn on_post_step(&mut self, iteration: u64, population: &[Agent]);
}

/// Rank 0's orchestrator.
pub struct Coordinator<Net: NetworkTransport> {
    network: Arc<Net>,
    config: ModelConfig,
    space: Space,
    plan: PartitionPlan,
    counter: IdCounter,
    rng: ChaCha8Rng,
    population: Vec<Agent>,
    built: bool,
    ended: bool,
    model_iteration: u64,
    /// Failures since the last report
    pending: Vec<RankFailure>,
    /// Ranks excluded for the rest of the current tick
    skipped: HashSet<Rank>,
    observers: Vec<Box<dyn PopulationObserver>>,
}

impl<Net: NetworkTransport> Coordinator<Net> {
    /// Creates the coordinator. The endpoint must be rank 0 of a group with
    /// at least one worker.
    pub fn new(network: Arc<Net>, config: ModelConfig) -> Result<Self, CoreError> {
        if !network.local_rank().is_coordinator() {
            return Err(CoreError::protocol(format!(
                "{} cannot coordinate",
                network.local_rank()
            )));
        }
        let plan = PartitionPlan::for_world(config.total_agents, network.world_size())?;
        let space = Space::new(config.width, config.height)?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Ok(Self {
            network,
            config,
            space,
            plan,
            counter: IdCounter::new(),
            rng,
            population: Vec::new(),
            built: false,
            ended: false,
            model_iteration: 0,
            pending: Vec::new(),
            skipped: HashSet::new(),
            observers: Vec::new(),
        })
    }

    /// Registers a display/export hook.
    pub fn add_observer(&mut self, observer: Box<dyn PopulationObserver>) {
        self.observers.push(observer);
    }

    /// The authoritative population, in canonical order.
    pub fn population(&self) -> &[Agent] {
        &self.population
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn model_iteration(&self) -> u64 {
        self.model_iteration
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Drains the failures recorded since the last report.
    pub fn take_report(&mut self) -> TickReport {
        TickReport {
            iteration: self.model_iteration,
            degraded: std::mem::take(&mut self.pending),
        }
    }

    /// Sends `phase` to every worker in ascending rank order.
    ///
    /// Returns the ranks the command did not reach.
    pub async fn broadcast(&mut self, phase: PhaseCode) -> Result<Vec<Rank>, CoreError> {
        let tag = self.config.command_tag;
        let policy = self.config.failure_policy;
        let network = Arc::clone(&self.network);
        let mut missed = Vec::new();

        for rank in Rank::workers(network.world_size()) {
            if self.skipped.contains(&rank) {
                missed.push(rank);
                continue;
            }
            let sent = run_with_policy(policy, || network.send_int(rank, tag, phase.code())).await;
            if let Err(e) = sent {
                missed.push(rank);
                self.handle_failure(rank, phase, e)?;
            }
        }

        debug!("Broadcast {} (missed {:?})", phase, missed);
        Ok(missed)
    }

    /// Builds the population and scatters one chunk to each worker.
    pub async fn build(&mut self) -> Result<TickReport, CoreError> {
        if self.built {
            return Err(CoreError::protocol("model already built"));
        }
        self.skipped.clear();
        self.broadcast(PhaseCode::Build).await?;

        self.population = spawn_population(
            self.config.total_agents,
            &self.space,
            &mut self.rng,
            &mut self.counter,
        );
        self.built = true;
        info!(
            "Built {} agents on a {}x{} torus for {} workers",
            self.population.len(),
            self.space.width(),
            self.space.height(),
            self.plan.worker_count()
        );

        self.scatter().await?;
        Ok(self.take_report())
    }

    /// Sends each worker its assignment followed by its slice of the population.
    async fn scatter(&mut self) -> Result<(), CoreError> {
        let tag = self.config.data_tag;
        let policy = self.config.failure_policy;
        let network = Arc::clone(&self.network);
        let assignments: Vec<_> = self.plan.assignments().collect();

        for assignment in assignments {
            let rank = assignment.rank;
            if self.skipped.contains(&rank) {
                continue;
            }

            let result = {
                let slice = &self.population[assignment.range()];
                match run_with_policy(policy, || network.send_assignment(rank, tag, assignment)).await {
                    Ok(()) => run_with_policy(policy, || network.send_batch(rank, tag, slice)).await,
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {
                    for agent in &self.population[assignment.range()] {
                        debug!("{}: agent {} value {}", rank, agent.id, agent.value);
                    }
                    info!("Sent {} agents to {}", assignment.size, rank);
                }
                Err(e) => self.handle_failure(rank, PhaseCode::Build, e)?,
            }
        }
        Ok(())
    }

    /// Starts a tick: bumps `model_iteration` and broadcasts pre-step.
    pub async fn pre_step(&mut self) -> Result<(), CoreError> {
        self.ensure_built()?;
        self.skipped.clear();
        self.model_iteration += 1;
        self.broadcast(PhaseCode::PreStep).await?;
        debug!("Prestep done on coordinator for iteration {}", self.model_iteration);
        Ok(())
    }

    /// Broadcasts step. Workers mutate their chunks; rank 0 holds none.
    pub async fn step(&mut self) -> Result<(), CoreError> {
        self.ensure_built()?;
        self.broadcast(PhaseCode::Step).await?;
        Ok(())
    }

    /// Broadcasts post-step, gathers every chunk, then notifies observers.
    pub async fn post_step(&mut self) -> Result<(), CoreError> {
        self.ensure_built()?;
        let missed = self.broadcast(PhaseCode::PostStep).await?;
        self.gather(&missed).await?;

        for observer in self.observers.iter_mut() {
            observer.on_post_step(self.model_iteration, &self.population);
        }
        debug!("Poststep done on coordinator for iteration {}", self.model_iteration);
        Ok(())
    }

    /// Copies each worker's chunk back into the slice it was scattered from,
    /// wrapping any position that left the torus.
    ///
    /// Ranks in `missed` never got post-step and so will never answer;
    /// waiting on them would stall the run.
    async fn gather(&mut self, missed: &[Rank]) -> Result<(), CoreError> {
        let tag = self.config.data_tag;
        let policy = self.config.failure_policy;
        let network = Arc::clone(&self.network);
        let space = self.space;
        let assignments: Vec<_> = self.plan.assignments().collect();

        for assignment in assignments {
            let rank = assignment.rank;
            if missed.contains(&rank) || self.skipped.contains(&rank) {
                continue;
            }

            let received = run_with_policy(policy, || network.recv_batch(rank, tag, assignment.size)).await;
            let outcome = received.and_then(|agents| {
                let slot = &mut self.population[assignment.range()];
                if slot.iter().zip(&agents).any(|(old, new)| old.id != new.id) {
                    return Err(CoreError::protocol(format!(
                        "{} returned agents out of order",
                        rank
                    )));
                }
                slot.copy_from_slice(&agents);
                for agent in slot.iter_mut().filter(|a| !space.contains(a.x, a.y)) {
                    (agent.x, agent.y) = space.wrap(agent.x, agent.y);
                }
                Ok(())
            });

            if let Err(e) = outcome {
                self.handle_failure(rank, PhaseCode::PostStep, e)?;
            }
        }
        Ok(())
    }

    /// Runs pre-step, step and post-step.
    pub async fn tick(&mut self) -> Result<TickReport, CoreError> {
        self.pre_step().await?;
        self.step().await?;
        self.post_step().await?;

        let report = self.take_report();
        if report.is_degraded() {
            error!(
                "Iteration {} degraded: {} failures on {:?}",
                report.iteration,
                report.degraded.len(),
                report.failed_ranks()
            );
        } else {
            info!("Iteration {} complete", report.iteration);
        }
        Ok(report)
    }

    /// Tells every worker to shut down and releases the transport.
    ///
    /// Rank 0 itself keeps running.
    pub async fn at_end(&mut self) -> Result<TickReport, CoreError> {
        self.skipped.clear();
        self.broadcast(PhaseCode::End).await?;
        self.network.close().await;
        self.ended = true;
        info!("Run ended after {} iterations", self.model_iteration);
        Ok(self.take_report())
    }

    fn ensure_built(&self) -> Result<(), CoreError> {
        if self.built {
            Ok(())
        } else {
            Err(CoreError::NotBuilt)
        }
    }

    /// Logs and records a failure, then applies the failure policy.
    fn handle_failure(&mut self, rank: Rank, phase: PhaseCode, err: CoreError) -> Result<(), CoreError> {
        error!("{} with {} failed: {}", phase, rank, err);
        self.pending.push(RankFailure::new(rank, phase, &err));

        match self.config.failure_policy {
            FailurePolicy::Abort => Err(CoreError::Aborted {
                phase: phase.to_string(),
                reason: err.to_string(),
            }),
            FailurePolicy::SkipTick => {
                self.skipped.insert(rank);
                Ok(())
            }
            FailurePolicy::LogAndContinue | FailurePolicy::Retry { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnknownCodePolicy;
    use crate::protocol::Message;
    use crate::worker::Worker;
    use parasim_env::{ChannelMesh, NetworkController, Tag};

    fn coordinator(mesh: &ChannelMesh, config: ModelConfig) -> Coordinator<parasim_env::MeshEndpoint> {
        Coordinator::new(Arc::new(mesh.endpoint(Rank::COORDINATOR)), config).unwrap()
    }

    #[test]
    fn test_requires_at_least_one_worker() {
        let mesh = ChannelMesh::new(1);
        let result = Coordinator::new(Arc::new(mesh.endpoint(Rank::COORDINATOR)), ModelConfig::default());
        assert!(matches!(result, Err(CoreError::InvalidTopology { workers: 0 })));
    }

    #[test]
    fn test_rejects_worker_endpoint() {
        let mesh = ChannelMesh::new(3);
        let result = Coordinator::new(Arc::new(mesh.endpoint(Rank(1))), ModelConfig::default());
        assert!(matches!(result, Err(CoreError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_phases_before_build_fail() {
        let mesh = ChannelMesh::new(2);
        let mut coord = coordinator(&mesh, ModelConfig::default());
        assert!(matches!(coord.pre_step().await, Err(CoreError::NotBuilt)));
        assert!(matches!(coord.post_step().await, Err(CoreError::NotBuilt)));
        assert_eq!(coord.model_iteration(), 0);
    }

    #[tokio::test]
    async fn test_build_scatters_contiguous_slices() {
        let mesh = ChannelMesh::new(4);
        let mut coord = coordinator(&mesh, ModelConfig::default());
        let report = coord.build().await.unwrap();
        assert!(!report.is_degraded());

        let expected_sizes = [3usize, 3, 4];
        for (i, rank) in Rank::workers(4).enumerate() {
            let endpoint = mesh.endpoint(rank);
            let code = endpoint.recv_int(Rank::COORDINATOR, Tag::COMMAND).await.unwrap();
            assert_eq!(code, PhaseCode::Build.code());

            let assignment = endpoint.recv_assignment(Rank::COORDINATOR, Tag::DATA).await.unwrap();
            assert_eq!(assignment.size, expected_sizes[i]);

            let batch = endpoint
                .recv_batch(Rank::COORDINATOR, Tag::DATA, assignment.size)
                .await
                .unwrap();
            assert_eq!(batch, coord.population()[assignment.range()].to_vec());
        }
        assert!(coord.build().await.is_err());
    }

    #[tokio::test]
    async fn test_gather_restores_population_order() {
        let mesh = ChannelMesh::new(3);
        let mut coord = coordinator(&mesh, ModelConfig::default().with_agents(5));
        coord.build().await.unwrap();
        let original = coord.population().to_vec();

        // Workers answer in reverse rank order; placement must not care.
        for rank in [Rank(2), Rank(1)] {
            let endpoint = mesh.endpoint(rank);
            let assignment = coord.plan().assignment(rank).unwrap();
            let mut chunk = original[assignment.range()].to_vec();
            chunk.iter_mut().for_each(|a| a.value = 10 + rank.0 as i64);
            endpoint.send_batch(Rank::COORDINATOR, Tag::DATA, &chunk).await.unwrap();
        }
        coord.post_step().await.unwrap();

        let ids: Vec<u64> = coord.population().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        let values: Vec<i64> = coord.population().iter().map(|a| a.value).collect();
        assert_eq!(values, vec![11, 11, 12, 12, 12]);
    }

    #[tokio::test]
    async fn test_gather_wraps_positions_onto_torus() {
        let mesh = ChannelMesh::new(2);
        let config = ModelConfig::default().with_agents(2).with_space(10, 20);
        let mut coord = coordinator(&mesh, config);
        coord.build().await.unwrap();

        let mut chunk = coord.population().to_vec();
        (chunk[0].x, chunk[0].y) = (-1, 20);
        (chunk[1].x, chunk[1].y) = (13, 5);
        mesh.endpoint(Rank(1))
            .send_batch(Rank::COORDINATOR, Tag::DATA, &chunk)
            .await
            .unwrap();
        coord.post_step().await.unwrap();

        let positions: Vec<(i32, i32)> = coord.population().iter().map(|a| (a.x, a.y)).collect();
        assert_eq!(positions, vec![(9, 0), (3, 5)]);
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_is_rejected() {
        let mesh = ChannelMesh::new(2);
        let mut coord = coordinator(&mesh, ModelConfig::default().with_agents(3));
        coord.build().await.unwrap();
        let before = coord.population().to_vec();

        let mut reversed = before.clone();
        reversed.reverse();
        mesh.endpoint(Rank(1))
            .send_batch(Rank::COORDINATOR, Tag::DATA, &reversed)
            .await
            .unwrap();
        coord.post_step().await.unwrap();

        assert_eq!(coord.population(), before.as_slice());
        let report = coord.take_report();
        assert_eq!(report.failed_ranks(), vec![Rank(1)]);
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_failed_rank() {
        let mesh = ChannelMesh::new(4);
        let mut coord = coordinator(&mesh, ModelConfig::default());
        mesh.sever(Rank::COORDINATOR, Rank(2));

        let missed = coord.broadcast(PhaseCode::Continue).await.unwrap();
        assert_eq!(missed, vec![Rank(2)]);

        for rank in [Rank(1), Rank(3)] {
            let env = mesh.endpoint(rank).recv(Rank::COORDINATOR, Tag::COMMAND).await.unwrap();
            assert_eq!(Message::decode(&env).unwrap(), Message::Command(0));
        }
        assert_eq!(coord.take_report().failed_ranks(), vec![Rank(2)]);
    }

    #[tokio::test]
    async fn test_broadcast_to_stopped_worker_is_recorded() {
        let mesh = ChannelMesh::new(2);
        let config = ModelConfig::default().with_unknown_code_policy(UnknownCodePolicy::Reject);
        let endpoint = Arc::new(mesh.endpoint(Rank(1)));
        let worker = tokio::spawn(async move {
            let mut worker = Worker::new(endpoint, config).unwrap();
            worker.run().await
        });

        let mut coord = coordinator(&mesh, ModelConfig::default());
        coord.network.send_int(Rank(1), Tag::COMMAND, 7).await.unwrap();
        assert!(worker.await.unwrap().is_err());

        // More sends than a link buffers; none may block or vanish.
        for _ in 0..100 {
            let missed = coord.broadcast(PhaseCode::Continue).await.unwrap();
            assert_eq!(missed, vec![Rank(1)]);
        }
        let report = coord.take_report();
        assert_eq!(report.degraded.len(), 100);
        assert!(report.degraded[0].error.contains("Channel closed"));
    }

    #[tokio::test]
    async fn test_abort_policy_stops_broadcast() {
        let mesh = ChannelMesh::new(3);
        let config = ModelConfig::default().with_failure_policy(FailurePolicy::Abort);
        let mut coord = coordinator(&mesh, config);
        mesh.sever(Rank::COORDINATOR, Rank(1));

        let result = coord.broadcast(PhaseCode::Step).await;
        assert!(matches!(result, Err(CoreError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_skip_tick_excludes_rank_until_next_tick() {
        let mesh = ChannelMesh::new(3);
        let config = ModelConfig::default().with_failure_policy(FailurePolicy::SkipTick);
        let mut coord = coordinator(&mesh, config);

        mesh.sever(Rank::COORDINATOR, Rank(1));
        coord.broadcast(PhaseCode::Step).await.unwrap();
        mesh.heal_all();

        // Still skipped within the same tick even though the link is back
        let missed = coord.broadcast(PhaseCode::PostStep).await.unwrap();
        assert_eq!(missed, vec![Rank(1)]);
    }
}
