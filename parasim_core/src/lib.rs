//! Parasim Core - phase-dispatch protocol for coordinator-driven agent simulations
//!
//! One coordinator (rank 0) owns the population; a fixed set of worker ranks
//! each own one contiguous chunk of it. The coordinator cannot call worker
//! code, so everything a worker does is triggered by a phase code:
//! 1. **Partitioning**: [`PartitionPlan`] splits the population into chunks
//! 2. **Rendezvous**: [`Worker::run`] blocks on phase codes and dispatches them
//! 3. **Orchestration**: [`Coordinator`] broadcasts phases, scatters chunks and
//!    gathers them back in their original order

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod partition;
pub mod policy;
pub mod protocol;
pub mod worker;

// Re-export key types for convenience
pub use agent::{spawn_population, Agent, IdCounter, Space};
pub use config::{FailurePolicy, ModelConfig, RunIdentity, UnknownCodePolicy};
pub use coordinator::{Coordinator, PopulationObserver};
pub use error::CoreError;
pub use partition::{ChunkAssignment, PartitionPlan};
pub use policy::{RankFailure, TickReport};
pub use protocol::{Message, PhaseCode, PhaseTransport};
pub use worker::{Worker, WorkerState, WorkerSummary};
