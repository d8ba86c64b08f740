//! Common types for the Parasim transport layer.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a process within the fixed process group.
///
/// Rank 0 is always the coordinator; ranks `1..world_size` are workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank(pub u32);

impl Rank {
    /// The coordinator rank.
    pub const COORDINATOR: Rank = Rank(0);

    /// Returns true for rank 0.
    pub fn is_coordinator(&self) -> bool {
        self.0 == 0
    }

    /// Worker ranks of a group of `world_size` processes, ascending.
    pub fn workers(world_size: usize) -> impl Iterator<Item = Rank> {
        (1..world_size as u32).map(Rank)
    }

    /// Index usable for slice addressing.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rank{}", self.0)
    }
}

/// Logical channel identifier carried next to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub u16);

impl Tag {
    /// Channel carrying phase codes.
    pub const COMMAND: Tag = Tag(50);

    /// Channel carrying chunk assignments and agent batches.
    pub const DATA: Tag = Tag(51);
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tag{}", self.0)
    }
}

/// Envelope for messages transmitted between ranks.
///
/// This is a transport-layer wrapper - the payload is opaque bytes that
/// the receiving engine decodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The encoded message
    pub payload: Vec<u8>,

    /// Sender wall-clock time in milliseconds since the Unix epoch
    pub sent_at_ms: u64,
}

impl Envelope {
    /// Creates an envelope stamped with the current wall-clock time.
    pub fn new(payload: Vec<u8>) -> Self {
        let sent_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { payload, sent_at_ms }
    }
}
