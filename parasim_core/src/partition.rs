//! Partitioner - splits the population into one contiguous chunk per worker.
//!
//! Every worker gets `floor(total / workers)` agents; the last worker also
//! takes the whole remainder. Workers must agree on this exact split, so it
//! is not rebalanced.
//!
//! ```text
//! total = 10, workers = 3
//!
//! population: [0 1 2 | 3 4 5 | 6 7 8 9]
//!              rank1   rank2   rank3
//!              off 0   off 3   off 6
//! ```

use crate::error::CoreError;
use parasim_env::Rank;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The slice of the population owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAssignment {
    pub rank: Rank,
    pub offset: usize,
    pub size: usize,
}

impl ChunkAssignment {
    /// Population indices covered by this chunk.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Chunk sizes and offsets for a fixed population and worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    total_agents: usize,
    worker_count: usize,
    base_chunk_size: usize,
    remainder: usize,
}

impl PartitionPlan {
    /// Plans `total_agents` over `worker_count` workers.
    ///
    /// Fails with [`CoreError::InvalidTopology`] when there are no workers.
    pub fn plan(total_agents: usize, worker_count: usize) -> Result<Self, CoreError> {
        if worker_count == 0 {
            return Err(CoreError::InvalidTopology { workers: worker_count });
        }
        Ok(Self {
            total_agents,
            worker_count,
            base_chunk_size: total_agents / worker_count,
            remainder: total_agents % worker_count,
        })
    }

    /// Plans for a process group of `world_size` ranks (rank 0 holds no chunk).
    pub fn for_world(total_agents: usize, world_size: usize) -> Result<Self, CoreError> {
        Self::plan(total_agents, world_size.saturating_sub(1))
    }

    pub fn total(&self) -> usize {
        self.total_agents
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn base_chunk_size(&self) -> usize {
        self.base_chunk_size
    }

    pub fn remainder(&self) -> usize {
        self.remainder
    }

    pub fn last_chunk_size(&self) -> usize {
        self.base_chunk_size + self.remainder
    }

    /// Offset of worker `i` (1-based).
    pub fn offset(&self, i: usize) -> usize {
        self.base_chunk_size * i.saturating_sub(1)
    }

    /// Chunk size of worker `i` (1-based).
    pub fn size(&self, i: usize) -> usize {
        if i == self.worker_count {
            self.last_chunk_size()
        } else {
            self.base_chunk_size
        }
    }

    /// Population indices of worker `i` (1-based).
    pub fn range(&self, i: usize) -> Range<usize> {
        let offset = self.offset(i);
        offset..offset + self.size(i)
    }

    /// Assignment for a worker rank, `None` for the coordinator or ranks
    /// outside the group.
    pub fn assignment(&self, rank: Rank) -> Option<ChunkAssignment> {
        let i = rank.index();
        if i == 0 || i > self.worker_count {
            return None;
        }
        Some(ChunkAssignment {
            rank,
            offset: self.offset(i),
            size: self.size(i),
        })
    }

    /// All assignments in ascending rank order.
    pub fn assignments(&self) -> impl Iterator<Item = ChunkAssignment> + '_ {
        (1..=self.worker_count).map(move |i| ChunkAssignment {
            rank: Rank(i as u32),
            offset: self.offset(i),
            size: self.size(i),
        })
    }
}
