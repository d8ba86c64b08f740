//! Failure bookkeeping and retry handling shared by both sides of the protocol.

use crate::config::FailurePolicy;
use crate::error::CoreError;
use crate::protocol::PhaseCode;
use parasim_env::Rank;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

/// A failed exchange with one rank during one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankFailure {
    pub rank: Rank,
    pub phase: PhaseCode,
    pub error: String,
}

impl RankFailure {
    pub fn new(rank: Rank, phase: PhaseCode, error: &CoreError) -> Self {
        Self {
            rank,
            phase,
            error: error.to_string(),
        }
    }
}

/// Outcome of one tick as seen by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// `model_iteration` after the tick
    pub iteration: u64,

    /// Every failure observed during the tick; empty means the gathered
    /// population is fully up to date
    pub degraded: Vec<RankFailure>,
}

impl TickReport {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Ranks that failed at least once, ascending and deduplicated.
    pub fn failed_ranks(&self) -> Vec<Rank> {
        let mut ranks: Vec<Rank> = self.degraded.iter().map(|f| f.rank).collect();
        ranks.sort();
        ranks.dedup();
        ranks
    }
}

/// Runs `op`, retrying transport failures as many times as `policy` allows.
///
/// Only [`CoreError::Transport`] is retried: every other error means a
/// message was already consumed, and a second receive would read the next one.
pub async fn run_with_policy<T, F, Fut>(policy: FailurePolicy, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let retries = match policy {
        FailurePolicy::Retry { attempts } => attempts,
        _ => 0,
    };

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ CoreError::Transport { .. }) if attempt < retries => {
                attempt += 1;
                warn!("Retry {}/{} after: {}", attempt, retries, err);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parasim_env::EnvError;
    use std::cell::Cell;

    fn transport_error() -> CoreError {
        CoreError::transport(Rank(1), EnvError::network("boom"))
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = Cell::new(0);
        let result = run_with_policy(FailurePolicy::Retry { attempts: 2 }, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(transport_error())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), CoreError> = run_with_policy(FailurePolicy::Retry { attempts: 1 }, || {
            calls.set(calls.get() + 1);
            async { Err(transport_error()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), CoreError> = run_with_policy(FailurePolicy::Retry { attempts: 5 }, || {
            calls.set(calls.get() + 1);
            async { Err(CoreError::protocol("bad")) }
        })
        .await;

        assert!(matches!(result, Err(CoreError::ProtocolViolation(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_other_policies_do_not_retry() {
        for policy in [FailurePolicy::LogAndContinue, FailurePolicy::SkipTick, FailurePolicy::Abort] {
            let calls = Cell::new(0);
            let _ = run_with_policy::<(), _, _>(policy, || {
                calls.set(calls.get() + 1);
                async { Err(transport_error()) }
            })
            .await;
            assert_eq!(calls.get(), 1);
        }
    }

    #[test]
    fn test_failed_ranks_are_deduplicated() {
        let err = transport_error();
        let report = TickReport {
            iteration: 1,
            degraded: vec![
                RankFailure::new(Rank(3), PhaseCode::Step, &err),
                RankFailure::new(Rank(1), PhaseCode::Step, &err),
                RankFailure::new(Rank(3), PhaseCode::PostStep, &err),
            ],
        };
        assert!(report.is_degraded());
        assert_eq!(report.failed_ranks(), vec![Rank(1), Rank(3)]);
        assert!(!TickReport::default().is_degraded());
    }
}
