//! In-process transport: every rank is a task, every link a bounded queue.

use crate::error::EnvError;
use crate::network::{NetworkController, NetworkTransport};
use crate::types::{Envelope, Rank, Tag};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Default queue depth of a single `(from, to, tag)` link.
const DEFAULT_LINK_CAPACITY: usize = 64;

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>;

/// A directed, tagged link between two ranks.
struct Link {
    tx: mpsc::Sender<Envelope>,
    /// Receiver half (behind tokio mutex for async)
    rx: SharedReceiver,
}

/// Router state shared by every endpoint of one mesh.
#[derive(Default)]
struct MeshState {
    links: HashMap<(Rank, Rank, Tag), Link>,
    severed: HashSet<(Rank, Rank)>,
    closed: HashSet<Rank>,
}

#[derive(Clone)]
struct SharedState {
    inner: Arc<Mutex<MeshState>>,
    capacity: usize,
}

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, MeshState> {
        // State is plain bookkeeping, so a panicked holder leaves nothing half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the link for `(from, to, tag)`, creating it on first use.
    fn link(&self, from: Rank, to: Rank, tag: Tag) -> (mpsc::Sender<Envelope>, SharedReceiver) {
        let mut state = self.lock();
        let link = state.links.entry((from, to, tag)).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            Link {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        (link.tx.clone(), Arc::clone(&link.rx))
    }
}

/// A fully connected in-memory process group.
///
/// Links are created lazily, so a mesh of any size costs nothing until
/// ranks start talking. The mesh doubles as the fault-injection controller
/// for all of its endpoints.
pub struct ChannelMesh {
    world_size: usize,
    state: SharedState,
}

impl ChannelMesh {
    /// Creates a mesh for `world_size` ranks with the default link capacity.
    pub fn new(world_size: usize) -> Self {
        Self::with_capacity(world_size, DEFAULT_LINK_CAPACITY)
    }

    /// Creates a mesh whose links buffer at most `capacity` envelopes.
    pub fn with_capacity(world_size: usize, capacity: usize) -> Self {
        Self {
            world_size,
            state: SharedState {
                inner: Arc::new(Mutex::new(MeshState::default())),
                capacity: capacity.max(1),
            },
        }
    }

    /// Returns the endpoint for `rank`.
    pub fn endpoint(&self, rank: Rank) -> MeshEndpoint {
        MeshEndpoint {
            rank,
            world_size: self.world_size,
            state: self.state.clone(),
        }
    }

    /// Returns one endpoint per rank, indexed by rank.
    pub fn endpoints(&self) -> Vec<MeshEndpoint> {
        (0..self.world_size as u32).map(|r| self.endpoint(Rank(r))).collect()
    }

    /// Returns the number of ranks.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Returns true once `rank` has closed its endpoint.
    pub fn is_closed(&self, rank: Rank) -> bool {
        self.state.lock().closed.contains(&rank)
    }
}

impl NetworkController for ChannelMesh {
    fn sever(&self, from: Rank, to: Rank) {
        tracing::debug!("Severing link {} -> {}", from, to);
        self.state.lock().severed.insert((from, to));
    }

    fn heal_all(&self) {
        self.state.lock().severed.clear();
    }

    fn is_severed(&self, from: Rank, to: Rank) -> bool {
        self.state.lock().severed.contains(&(from, to))
    }
}

/// One rank's view of a [`ChannelMesh`].
#[derive(Clone)]
pub struct MeshEndpoint {
    rank: Rank,
    world_size: usize,
    state: SharedState,
}

impl MeshEndpoint {
    fn check_peer(&self, peer: Rank) -> Result<(), EnvError> {
        if peer.index() >= self.world_size || peer == self.rank {
            return Err(EnvError::unreachable(peer));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkTransport for MeshEndpoint {
    async fn send(&self, peer: Rank, tag: Tag, envelope: Envelope) -> Result<(), EnvError> {
        self.check_peer(peer)?;
        {
            let state = self.state.lock();
            if state.closed.contains(&self.rank) {
                return Err(EnvError::closed(self.rank));
            }
            if state.closed.contains(&peer) {
                return Err(EnvError::closed(peer));
            }
            if state.severed.contains(&(self.rank, peer)) {
                return Err(EnvError::LinkSevered { from: self.rank, to: peer });
            }
        }

        let (tx, _) = self.state.link(self.rank, peer, tag);
        tx.send(envelope)
            .await
            .map_err(|_| EnvError::network("Channel closed"))
    }

    async fn recv(&self, peer: Rank, tag: Tag) -> Result<Envelope, EnvError> {
        self.check_peer(peer)?;
        let closed = self.state.lock().closed.contains(&self.rank);
        if closed {
            return Err(EnvError::closed(self.rank));
        }

        let (_, rx) = self.state.link(peer, self.rank, tag);
        let mut rx = rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| EnvError::closed(format!("{} -> {} {}", peer, self.rank, tag)))
    }

    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn close(&self) {
        self.state.lock().closed.insert(self.rank);
    }
}
