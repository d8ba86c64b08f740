//! Worker side of the phase protocol.
//!
//! A worker cannot be called into by the coordinator. Instead it sits in
//! [`Worker::run`], blocked on the command channel, and turns each phase
//! code it receives into a local handler call:
//!
//! ```text
//!                 recv_int(0, command)
//!   AwaitingCommand ───────────────────► Executing(phase)
//!         ▲                                   │
//!         └──────── handler returns ──────────┤
//!                                             │ phase == End
//!                                             ▼
//!                                        Terminated
//! ```

use crate::agent::Agent;
use crate::config::{FailurePolicy, ModelConfig, UnknownCodePolicy};
use crate::error::CoreError;
use crate::partition::ChunkAssignment;
use crate::policy::{run_with_policy, RankFailure};
use crate::protocol::{PhaseCode, PhaseTransport};
use parasim_env::{EnvError, NetworkTransport, Rank};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Command loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Loop not running: stopped on an error before `End`
    Idle,
    AwaitingCommand,
    Executing(PhaseCode),
    Terminated,
}

/// What a worker reports when its loop exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub rank: Rank,
    pub iterations: u64,
    pub chunk_len: usize,
    pub ignored_codes: u64,
    pub failures: Vec<RankFailure>,
}

/// One worker rank: owns its chunk exclusively between build and end.
pub struct Worker<Net: NetworkTransport> {
    network: Arc<Net>,
    config: ModelConfig,
    state: WorkerState,
    assignment: Option<ChunkAssignment>,
    chunk: Vec<Agent>,
    model_iteration: u64,
    ignored_codes: u64,
    failures: Vec<RankFailure>,
}

impl<Net: NetworkTransport> Worker<Net> {
    /// Creates a worker over `network`. Fails if the endpoint is rank 0.
    pub fn new(network: Arc<Net>, config: ModelConfig) -> Result<Self, CoreError> {
        if network.local_rank().is_coordinator() {
            return Err(CoreError::protocol("rank 0 cannot run a worker loop"));
        }
        Ok(Self {
            network,
            config,
            state: WorkerState::AwaitingCommand,
            assignment: None,
            chunk: Vec::new(),
            model_iteration: 0,
            ignored_codes: 0,
            failures: Vec::new(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.network.local_rank()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn model_iteration(&self) -> u64 {
        self.model_iteration
    }

    /// The locally owned agents.
    pub fn chunk(&self) -> &[Agent] {
        &self.chunk
    }

    pub fn assignment(&self) -> Option<ChunkAssignment> {
        self.assignment
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            rank: self.rank(),
            iterations: self.model_iteration,
            chunk_len: self.chunk.len(),
            ignored_codes: self.ignored_codes,
            failures: self.failures.clone(),
        }
    }

    /// Waits for commands until `End` arrives.
    pub async fn run(&mut self) -> Result<WorkerSummary, CoreError> {
        info!("{} waiting for commands", self.rank());

        while self.state != WorkerState::Terminated {
            if let Err(e) = self.poll_command().await {
                error!("{} command loop stopped: {}", self.rank(), e);
                // Peers must see a dead rank as closed, not as a silent sink.
                self.network.close().await;
                self.state = WorkerState::Idle;
                return Err(e);
            }
        }

        Ok(self.summary())
    }

    /// Receives one phase code and runs it.
    pub async fn poll_command(&mut self) -> Result<(), CoreError> {
        let tag = self.config.command_tag;
        let code = match self.network.recv_int(Rank::COORDINATOR, tag).await {
            Ok(code) => code,
            // Nothing can arrive on a closed channel, so waiting again would spin.
            Err(e @ CoreError::Transport { source: EnvError::ChannelClosed(_), .. }) => return Err(e),
            Err(e) => {
                self.record_failure(PhaseCode::Continue, e)?;
                PhaseCode::Continue.code()
            }
        };
        self.dispatch(code).await
    }

    /// Maps a raw phase code to its handler.
    pub async fn dispatch(&mut self, code: i32) -> Result<(), CoreError> {
        let phase = match PhaseCode::try_from(code) {
            Ok(phase) => phase,
            Err(e) => {
                return match self.config.unknown_code_policy {
                    UnknownCodePolicy::Ignore => {
                        warn!("{} ignoring phase code {}", self.rank(), code);
                        self.ignored_codes += 1;
                        Ok(())
                    }
                    UnknownCodePolicy::Reject => Err(e),
                };
            }
        };

        if phase == PhaseCode::Continue {
            return Ok(());
        }

        self.state = WorkerState::Executing(phase);
        let result = match phase {
            PhaseCode::Build => self.build().await,
            PhaseCode::PreStep => {
                self.pre_step();
                Ok(())
            }
            PhaseCode::Step => {
                self.step();
                Ok(())
            }
            PhaseCode::PostStep => self.post_step().await,
            PhaseCode::End => {
                self.at_end().await;
                Ok(())
            }
            PhaseCode::Continue => Ok(()),
        };

        if let Err(e) = result {
            self.record_failure(phase, e)?;
        }
        if self.state != WorkerState::Terminated {
            self.state = WorkerState::AwaitingCommand;
        }
        Ok(())
    }

    /// Receives the assignment, then exactly that many agents.
    async fn build(&mut self) -> Result<(), CoreError> {
        let rank = self.rank();
        let tag = self.config.data_tag;
        let policy = self.config.failure_policy;
        let network = Arc::clone(&self.network);

        let assignment = run_with_policy(policy, || network.recv_assignment(Rank::COORDINATOR, tag)).await?;
        if assignment.rank != rank {
            return Err(CoreError::protocol(format!(
                "{} received assignment for {}",
                rank, assignment.rank
            )));
        }
        self.assignment = Some(assignment);

        self.chunk = run_with_policy(policy, || {
            network.recv_batch(Rank::COORDINATOR, tag, assignment.size)
        })
        .await?;

        for agent in &self.chunk {
            debug!("{}: agent {} value={} RECEIVED", rank, agent.id, agent.value);
        }
        info!(
            "{} built with {} agents at offset {}",
            rank,
            self.chunk.len(),
            assignment.offset
        );
        Ok(())
    }

    fn pre_step(&mut self) {
        self.model_iteration += 1;
        debug!("Prestep done on {} for iteration {}", self.rank(), self.model_iteration);
    }

    fn step(&mut self) {
        for agent in self.chunk.iter_mut() {
            agent.increment_value();
        }
        debug!(
            "Step done on {} for iteration {} ({} agents)",
            self.rank(),
            self.model_iteration,
            self.chunk.len()
        );
    }

    /// Returns the chunk to the coordinator.
    async fn post_step(&mut self) -> Result<(), CoreError> {
        let tag = self.config.data_tag;
        let network = Arc::clone(&self.network);
        let chunk = &self.chunk;

        run_with_policy(self.config.failure_policy, || {
            network.send_batch(Rank::COORDINATOR, tag, chunk)
        })
        .await?;

        debug!("{} sent {} agents to coordinator", self.rank(), self.chunk.len());
        Ok(())
    }

    async fn at_end(&mut self) {
        self.network.close().await;
        self.state = WorkerState::Terminated;
        info!(
            "{} terminated after {} iterations",
            self.rank(),
            self.model_iteration
        );
    }

    /// Logs and records a failure; only `Abort` turns it into an error.
    fn record_failure(&mut self, phase: PhaseCode, err: CoreError) -> Result<(), CoreError> {
        error!("{} failed during {}: {}", self.rank(), phase, err);
        self.failures.push(RankFailure::new(Rank::COORDINATOR, phase, &err));

        match self.config.failure_policy {
            FailurePolicy::Abort => Err(CoreError::Aborted {
                phase: phase.to_string(),
                reason: err.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
