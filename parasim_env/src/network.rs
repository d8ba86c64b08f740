//! Network transport abstraction for Parasim ranks.

use crate::error::EnvError;
use crate::types::{Envelope, Rank, Tag};
use async_trait::async_trait;

/// Abstraction for point-to-point message passing between ranks.
///
/// # Implementations
///
/// - **In-process**: [`ChannelMesh`](crate::ChannelMesh) endpoints, one per rank
/// - **Multi-process**: [`TcpTransport`](crate::TcpTransport), star topology
///
/// # Message Flow
///
/// ```text
/// Coordinator (rank 0)          Link (0 -> 2, tag)           Worker (rank 2)
///   |                               |                            |
///   |-- send(2, tag, envelope) ---->|                            |
///   |                               |<--- recv(0, tag) ----------|
///   |                               |---- envelope ------------->|
/// ```
///
/// # Ordering
///
/// Envelopes on one `(sender, receiver, tag)` link are delivered in send
/// order. There is no ordering across different links.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends an envelope to `peer` on channel `tag`.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope queued on the link
    /// * `Err(EnvError)` - Link severed, peer closed, or I/O failure
    ///
    /// # Blocking
    /// Suspends while the link's queue is full.
    async fn send(&self, peer: Rank, tag: Tag, envelope: Envelope) -> Result<(), EnvError>;

    /// Receives the next envelope sent by `peer` on channel `tag`.
    ///
    /// # Blocking
    /// Suspends until a matching envelope arrives. There is no timeout: an
    /// unresponsive peer stalls the caller indefinitely.
    async fn recv(&self, peer: Rank, tag: Tag) -> Result<Envelope, EnvError>;

    /// Returns this endpoint's rank.
    fn local_rank(&self) -> Rank;

    /// Returns the number of ranks in the group (coordinator included).
    fn world_size(&self) -> usize;

    /// Releases transport resources. Later sends from this endpoint fail.
    async fn close(&self);
}

/// Fault injection for transports that support it.
pub trait NetworkController: Send + Sync {
    /// Makes every send from `from` to `to` fail.
    fn sever(&self, from: Rank, to: Rank);

    /// Restores all severed links.
    fn heal_all(&self);

    /// Checks whether the directed link is severed.
    fn is_severed(&self, from: Rank, to: Rank) -> bool;
}
