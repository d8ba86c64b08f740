//! Error types for the phase protocol.

use parasim_env::{EnvError, Rank};
use thiserror::Error;

/// Errors raised by the partitioner, the codec, the worker loop and the
/// coordinator.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Partitioning needs at least one worker rank.
    #[error("Invalid topology: {workers} workers (need at least 1)")]
    InvalidTopology { workers: usize },

    /// The torus needs positive dimensions.
    #[error("Invalid space: {width}x{height}")]
    InvalidSpace { width: i32, height: i32 },

    /// A send or receive with `rank` failed.
    #[error("Transport failure with {rank}: {source}")]
    Transport {
        rank: Rank,
        #[source]
        source: EnvError,
    },

    /// An unknown phase code or an unexpected message variant arrived.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A batch arrived with a different number of agents than negotiated.
    #[error("Batch size mismatch from {rank}: expected {expected}, got {actual}")]
    BatchSizeMismatch {
        rank: Rank,
        expected: usize,
        actual: usize,
    },

    /// Message encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A phase that needs the population ran before `build`.
    #[error("Model has not been built")]
    NotBuilt,

    /// The failure policy stopped the run.
    #[error("Run aborted during {phase}: {reason}")]
    Aborted { phase: String, reason: String },
}

impl CoreError {
    /// Wraps a transport error with the peer it happened on.
    pub fn transport(rank: Rank, source: EnvError) -> Self {
        Self::Transport { rank, source }
    }

    /// Creates a protocol violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }
}
