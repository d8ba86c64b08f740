//! Parasim Simulation Harness
//!
//! Runs a whole process group inside one tokio runtime so the phase
//! protocol can be exercised end to end without launching processes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        LocalCluster                         │
//! │  ┌─────────────┐                                            │
//! │  │ Coordinator │ rank 0: population, broadcasts, gather     │
//! │  └──────┬──────┘                                            │
//! │         │ ChannelMesh (tagged, FIFO per link, severable)    │
//! │  ┌──────▼──┐   ┌─────────┐         ┌─────────┐              │
//! │  │ Worker  │   │ Worker  │   ...   │ Worker  │              │
//! │  │ rank 1  │   │ rank 2  │         │ rank n  │              │
//! │  └─────────┘   └─────────┘         └─────────┘              │
//! │   (one tokio task each, blocked on the command channel)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use parasim_core::ModelConfig;
//! use parasim_sim::LocalCluster;
//!
//! let mut cluster = LocalCluster::launch(ModelConfig::default(), 4)?;
//! let report = cluster.run(5).await?;
//! let shutdown = cluster.shutdown().await?;
//! ```

mod cluster;
mod error;
mod exporter;
mod runner;
pub mod scenarios;

pub use cluster::{LocalCluster, RunReport, ShutdownReport};
pub use error::SimError;
pub use exporter::{ExportFrame, ExportObserver, RunExport};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
