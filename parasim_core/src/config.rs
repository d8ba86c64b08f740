//! Run configuration shared by coordinator and workers.

use crate::error::CoreError;
use parasim_env::{Rank, Tag};
use serde::{Deserialize, Serialize};

/// What to do when a send or receive with a rank fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log, record, carry on with whatever data is present
    #[default]
    LogAndContinue,

    /// Log, record, and stop talking to the failed rank for the rest of the
    /// current phase (its slice stays stale)
    SkipTick,

    /// Retry the failed operation up to `attempts` more times
    Retry { attempts: u32 },

    /// Stop the run with the error
    Abort,
}

/// What a worker does with a phase code it does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCodePolicy {
    /// Log a warning and keep waiting for commands
    #[default]
    Ignore,

    /// Stop the command loop with a protocol violation
    Reject,
}

/// Model parameters. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Population size
    pub total_agents: usize,

    /// Torus width in cells
    pub width: i32,

    /// Torus height in cells
    pub height: i32,

    /// Seed for agent placement
    pub seed: u64,

    /// Channel for phase codes
    pub command_tag: Tag,

    /// Channel for assignments and agent batches
    pub data_tag: Tag,

    pub failure_policy: FailurePolicy,

    pub unknown_code_policy: UnknownCodePolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            total_agents: 10,
            width: 300,
            height: 300,
            seed: 42,
            command_tag: Tag::COMMAND,
            data_tag: Tag::DATA,
            failure_policy: FailurePolicy::default(),
            unknown_code_policy: UnknownCodePolicy::default(),
        }
    }
}

impl ModelConfig {
    pub fn with_agents(mut self, total_agents: usize) -> Self {
        self.total_agents = total_agents;
        self
    }

    pub fn with_space(mut self, width: i32, height: i32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tags(mut self, command_tag: Tag, data_tag: Tag) -> Self {
        self.command_tag = command_tag;
        self.data_tag = data_tag;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_unknown_code_policy(mut self, policy: UnknownCodePolicy) -> Self {
        self.unknown_code_policy = policy;
        self
    }
}

/// Who this process is, as told by whatever launched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub rank: Rank,
    pub world_size: usize,
}

impl RunIdentity {
    /// Validates that `rank` belongs to a group of `world_size` ranks with
    /// at least one worker.
    pub fn new(rank: Rank, world_size: usize) -> Result<Self, CoreError> {
        if world_size < 2 {
            return Err(CoreError::InvalidTopology {
                workers: world_size.saturating_sub(1),
            });
        }
        if rank.index() >= world_size {
            return Err(CoreError::protocol(format!(
                "{} outside a group of {}",
                rank, world_size
            )));
        }
        Ok(Self { rank, world_size })
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank.is_coordinator()
    }

    pub fn worker_count(&self) -> usize {
        self.world_size - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.total_agents, 10);
        assert_eq!((config.width, config.height), (300, 300));
        assert_eq!(config.command_tag, Tag(50));
        assert_eq!(config.failure_policy, FailurePolicy::LogAndContinue);
        assert_eq!(config.unknown_code_policy, UnknownCodePolicy::Ignore);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ModelConfig::default()
            .with_agents(1000)
            .with_space(64, 32)
            .with_seed(7)
            .with_failure_policy(FailurePolicy::Retry { attempts: 3 });
        assert_eq!(config.total_agents, 1000);
        assert_eq!((config.width, config.height), (64, 32));
        assert_eq!(config.seed, 7);
        assert_eq!(config.failure_policy, FailurePolicy::Retry { attempts: 3 });
    }

    #[test]
    fn test_failure_policy_serialization() {
        let json = serde_json::to_string(&FailurePolicy::Retry { attempts: 2 }).unwrap();
        assert_eq!(json, r#"{"policy":"retry","attempts":2}"#);
        let back: FailurePolicy = serde_json::from_str(r#"{"policy":"skip_tick"}"#).unwrap();
        assert_eq!(back, FailurePolicy::SkipTick);
    }

    #[test]
    fn test_run_identity_validation() {
        assert!(RunIdentity::new(Rank(0), 1).is_err());
        assert!(RunIdentity::new(Rank(4), 4).is_err());

        let id = RunIdentity::new(Rank(0), 4).unwrap();
        assert!(id.is_coordinator());
        assert_eq!(id.worker_count(), 3);
    }
}
