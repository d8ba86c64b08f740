//! LocalCluster - a whole process group inside one tokio runtime.

use crate::error::SimError;
use parasim_core::{Coordinator, CoreError, ModelConfig, TickReport, Worker, WorkerSummary};
use parasim_env::{ChannelMesh, MeshEndpoint, NetworkController, Rank};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Reports from a build followed by a number of ticks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub build: TickReport,
    pub ticks: Vec<TickReport>,
}

impl RunReport {
    /// Number of ticks that recorded at least one failure.
    pub fn degraded_ticks(&self) -> usize {
        self.ticks.iter().filter(|t| t.is_degraded()).count()
    }

    /// True when the build or any tick saw a failure.
    pub fn is_degraded(&self) -> bool {
        self.build.is_degraded() || self.degraded_ticks() > 0
    }
}

/// What the group looked like after shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub end: TickReport,
    /// Summaries of workers that terminated cleanly, ascending by rank
    pub workers: Vec<WorkerSummary>,
    /// Workers whose loop stopped with an error
    pub worker_errors: Vec<(Rank, String)>,
}

/// One coordinator plus one tokio task per worker rank, wired by a
/// [`ChannelMesh`].
pub struct LocalCluster {
    mesh: Arc<ChannelMesh>,
    coordinator: Coordinator<MeshEndpoint>,
    workers: Vec<(Rank, JoinHandle<Result<WorkerSummary, CoreError>>)>,
}

impl LocalCluster {
    /// Validates the topology, then starts every worker's command loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(config: ModelConfig, world_size: usize) -> Result<Self, SimError> {
        let mesh = Arc::new(ChannelMesh::new(world_size));
        let coordinator = Coordinator::new(Arc::new(mesh.endpoint(Rank::COORDINATOR)), config.clone())?;

        let workers = Rank::workers(world_size)
            .map(|rank| {
                let endpoint = Arc::new(mesh.endpoint(rank));
                let config = config.clone();
                let handle = tokio::spawn(async move {
                    let mut worker = Worker::new(endpoint, config)?;
                    worker.run().await
                });
                (rank, handle)
            })
            .collect();

        info!("Launched local cluster with {} ranks", world_size);
        Ok(Self {
            mesh,
            coordinator,
            workers,
        })
    }

    pub fn coordinator(&self) -> &Coordinator<MeshEndpoint> {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut Coordinator<MeshEndpoint> {
        &mut self.coordinator
    }

    /// Fault injection for the mesh.
    pub fn controller(&self) -> &dyn NetworkController {
        self.mesh.as_ref()
    }

    pub fn world_size(&self) -> usize {
        self.mesh.world_size()
    }

    /// Builds the model and runs `ticks` ticks.
    pub async fn run(&mut self, ticks: u64) -> Result<RunReport, SimError> {
        let build = self.coordinator.build().await?;
        let mut report = RunReport {
            build,
            ticks: Vec::with_capacity(ticks as usize),
        };
        for _ in 0..ticks {
            report.ticks.push(self.coordinator.tick().await?);
        }
        Ok(report)
    }

    /// Broadcasts end and waits for every worker task to finish.
    pub async fn shutdown(mut self) -> Result<ShutdownReport, SimError> {
        let end = self.coordinator.at_end().await?;

        let mut workers = Vec::new();
        let mut worker_errors = Vec::new();
        for (rank, handle) in self.workers {
            match handle.await {
                Ok(Ok(summary)) => workers.push(summary),
                Ok(Err(e)) => {
                    warn!("{} stopped with error: {}", rank, e);
                    worker_errors.push((rank, e.to_string()));
                }
                Err(e) => return Err(SimError::Join(format!("{}: {}", rank, e))),
            }
        }

        Ok(ShutdownReport {
            end,
            workers,
            worker_errors,
        })
    }
}
