//! Multi-process transport over TCP.
//!
//! The group forms a star: the coordinator listens, every worker dials in and
//! announces its rank. Only coordinator <-> worker links exist, which is all
//! the phase protocol needs.
//!
//! # Framing
//!
//! ```text
//! +----------------+-------------------------------+
//! | len: u32 (BE)  | JSON body (len bytes)         |
//! +----------------+-------------------------------+
//! ```
//!
//! The first frame on a connection is a [`Hello`]; every later frame is a
//! [`Frame`] carrying one tagged envelope.

use crate::error::EnvError;
use crate::network::NetworkTransport;
use crate::types::{Envelope, Rank, Tag};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest accepted frame body.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Connection attempts a worker makes before giving up.
const CONNECT_ATTEMPTS: u32 = 50;

/// Delay between connection attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: Rank,
    world_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    tag: Tag,
    envelope: Envelope,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>;

/// `None` once a write failed part way; the stream may hold half a frame.
type LinkWriter = tokio::sync::Mutex<Option<OwnedWriteHalf>>;

struct Queue {
    /// `None` once the peer's connection is gone
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    rx: SharedReceiver,
}

/// Per-`(peer, tag)` queues filled by the reader tasks.
#[derive(Default)]
struct Inbox {
    queues: HashMap<(Rank, Tag), Queue>,
    disconnected: HashSet<Rank>,
}

impl Inbox {
    fn queue(&mut self, peer: Rank, tag: Tag) -> &mut Queue {
        let disconnected = &self.disconnected;
        self.queues.entry((peer, tag)).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Queue {
                tx: (!disconnected.contains(&peer)).then_some(tx),
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        })
    }

    fn disconnect(&mut self, peer: Rank) {
        self.disconnected.insert(peer);
        for ((from, _), queue) in self.queues.iter_mut() {
            if *from == peer {
                queue.tx = None;
            }
        }
    }
}

#[derive(Clone, Default)]
struct SharedInbox(Arc<Mutex<Inbox>>);

impl SharedInbox {
    fn lock(&self) -> MutexGuard<'_, Inbox> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// TCP-backed [`NetworkTransport`].
pub struct TcpTransport {
    rank: Rank,
    world_size: usize,
    writers: HashMap<Rank, LinkWriter>,
    inbox: SharedInbox,
    readers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Binds `addr` and waits until every worker of a `world_size` group has
    /// connected.
    pub async fn coordinator(addr: impl ToSocketAddrs, world_size: usize) -> Result<Self, EnvError> {
        let listener = TcpListener::bind(addr).await?;
        Self::accept_workers(listener, world_size).await
    }

    /// Accepts worker connections on an already bound listener.
    pub async fn accept_workers(listener: TcpListener, world_size: usize) -> Result<Self, EnvError> {
        let inbox = SharedInbox::default();
        let mut writers = HashMap::new();
        let mut readers = Vec::new();

        info!(
            "Coordinator waiting for {} workers on {:?}",
            world_size.saturating_sub(1),
            listener.local_addr().ok()
        );

        while writers.len() + 1 < world_size {
            let (stream, remote) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Dropping connection from {}: {}", remote, e);
                continue;
            }
            let (mut read_half, write_half) = stream.into_split();

            let hello: Hello = match read_frame(&mut read_half).await {
                Ok(hello) => hello,
                Err(e) => {
                    warn!("Dropping connection from {} without a hello: {}", remote, e);
                    continue;
                }
            };
            if hello.world_size != world_size {
                warn!(
                    "Rejecting {} from {}: world size {} != {}",
                    hello.rank, remote, hello.world_size, world_size
                );
                continue;
            }
            if hello.rank.is_coordinator()
                || hello.rank.index() >= world_size
                || writers.contains_key(&hello.rank)
            {
                warn!("Rejecting duplicate or invalid {} from {}", hello.rank, remote);
                continue;
            }

            debug!("{} connected from {}", hello.rank, remote);
            readers.push(spawn_reader(hello.rank, read_half, inbox.clone()));
            writers.insert(hello.rank, tokio::sync::Mutex::new(Some(write_half)));
        }

        Ok(Self {
            rank: Rank::COORDINATOR,
            world_size,
            writers,
            inbox,
            readers: Mutex::new(readers),
            closed: AtomicBool::new(false),
        })
    }

    /// Dials the coordinator at `addr` as worker `rank`, retrying while the
    /// coordinator is not yet listening.
    pub async fn worker(addr: impl ToSocketAddrs + Clone, rank: Rank, world_size: usize) -> Result<Self, EnvError> {
        if rank.is_coordinator() || rank.index() >= world_size {
            return Err(EnvError::unreachable(rank));
        }

        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(addr.clone()).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    attempt += 1;
                    debug!("{} connect attempt {} failed: {}", rank, attempt, e);
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, &Hello { rank, world_size }).await?;

        let inbox = SharedInbox::default();
        let reader = spawn_reader(Rank::COORDINATOR, read_half, inbox.clone());

        let mut writers = HashMap::new();
        writers.insert(Rank::COORDINATOR, tokio::sync::Mutex::new(Some(write_half)));

        Ok(Self {
            rank,
            world_size,
            writers,
            inbox,
            readers: Mutex::new(vec![reader]),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), EnvError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnvError::closed(self.rank));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkTransport for TcpTransport {
    async fn send(&self, peer: Rank, tag: Tag, envelope: Envelope) -> Result<(), EnvError> {
        self.ensure_open()?;
        let writer = self.writers.get(&peer).ok_or_else(|| EnvError::unreachable(peer))?;
        let mut guard = writer.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| EnvError::closed(format!("link to {} after a failed write", peer)))?;

        let result = write_frame(stream, &Frame { tag, envelope }).await;
        if let Err(EnvError::Io(e)) = &result {
            // A retry would start a new length prefix inside the broken frame.
            warn!("Dropping link to {} after write failure: {}", peer, e);
            *guard = None;
        }
        result
    }

    async fn recv(&self, peer: Rank, tag: Tag) -> Result<Envelope, EnvError> {
        self.ensure_open()?;
        if !self.writers.contains_key(&peer) {
            return Err(EnvError::unreachable(peer));
        }

        let rx = Arc::clone(&self.inbox.lock().queue(peer, tag).rx);
        let mut rx = rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| EnvError::closed(format!("connection to {}", peer)))
    }

    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (peer, writer) in &self.writers {
            if let Some(stream) = writer.lock().await.as_mut() {
                if let Err(e) = stream.shutdown().await {
                    debug!("Shutdown of link to {} failed: {}", peer, e);
                }
            }
        }
        let readers = std::mem::take(&mut *self.readers.lock().unwrap_or_else(|p| p.into_inner()));
        for reader in readers {
            reader.abort();
        }
    }
}

/// Pumps frames from one connection into the inbox until the peer hangs up.
fn spawn_reader(peer: Rank, mut read_half: OwnedReadHalf, inbox: SharedInbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_frame::<_, Frame>(&mut read_half).await {
                Ok(frame) => {
                    let mut inbox = inbox.lock();
                    if let Some(tx) = &inbox.queue(peer, frame.tag).tx {
                        // Receiver lives in the inbox as long as the queue does.
                        let _ = tx.send(frame.envelope);
                    }
                }
                Err(e) => {
                    debug!("Reader for {} stopped: {}", peer, e);
                    inbox.lock().disconnect(peer);
                    break;
                }
            }
        }
    })
}

async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), EnvError>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_BYTES)
        .ok_or_else(|| EnvError::SerializationError(format!("frame of {} bytes too large", body.len())))?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R) -> Result<T, EnvError>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(EnvError::SerializationError(format!("frame of {} bytes too large", len)));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn star(world_size: usize) -> (TcpTransport, Vec<TcpTransport>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let coordinator = tokio::spawn(TcpTransport::accept_workers(listener, world_size));
        let mut workers = Vec::new();
        for r in 1..world_size as u32 {
            workers.push(TcpTransport::worker(addr, Rank(r), world_size).await.unwrap());
        }
        (coordinator.await.unwrap().unwrap(), workers)
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let (coordinator, workers) = star(3).await;

        coordinator
            .send(Rank(2), Tag::COMMAND, Envelope::new(b"hello two".to_vec()))
            .await
            .unwrap();
        let env = workers[1].recv(Rank::COORDINATOR, Tag::COMMAND).await.unwrap();
        assert_eq!(env.payload, b"hello two".to_vec());

        workers[0]
            .send(Rank::COORDINATOR, Tag::DATA, Envelope::new(b"from one".to_vec()))
            .await
            .unwrap();
        let env = coordinator.recv(Rank(1), Tag::DATA).await.unwrap();
        assert_eq!(env.payload, b"from one".to_vec());
    }

    #[tokio::test]
    async fn test_frames_demultiplex_by_tag() {
        let (coordinator, workers) = star(2).await;

        coordinator.send(Rank(1), Tag::DATA, Envelope::new(vec![1])).await.unwrap();
        coordinator.send(Rank(1), Tag::COMMAND, Envelope::new(vec![2])).await.unwrap();

        let cmd = workers[0].recv(Rank::COORDINATOR, Tag::COMMAND).await.unwrap();
        let data = workers[0].recv(Rank::COORDINATOR, Tag::DATA).await.unwrap();
        assert_eq!(cmd.payload, vec![2]);
        assert_eq!(data.payload, vec![1]);
    }

    #[tokio::test]
    async fn test_workers_cannot_address_each_other() {
        let (_coordinator, workers) = star(3).await;
        let err = workers[0].send(Rank(2), Tag::COMMAND, Envelope::new(vec![])).await;
        assert!(matches!(err, Err(EnvError::NodeUnreachable(_))));
    }

    #[tokio::test]
    async fn test_stray_connections_do_not_block_setup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator = tokio::spawn(TcpTransport::accept_workers(listener, 2));

        // One client hangs up before its hello, another sends garbage.
        drop(TcpStream::connect(addr).await.unwrap());
        let mut garbage = TcpStream::connect(addr).await.unwrap();
        garbage.write_all(&[0, 0, 0, 3, b'x', b'y', b'z']).await.unwrap();

        let worker = TcpTransport::worker(addr, Rank(1), 2).await.unwrap();
        let coordinator = coordinator.await.unwrap().unwrap();

        coordinator.send(Rank(1), Tag::COMMAND, Envelope::new(vec![7])).await.unwrap();
        let env = worker.recv(Rank::COORDINATOR, Tag::COMMAND).await.unwrap();
        assert_eq!(env.payload, vec![7]);
    }

    #[tokio::test]
    async fn test_failed_write_closes_link() {
        let (coordinator, mut workers) = star(2).await;
        workers[0].close().await;
        drop(workers.pop());

        let mut first_error = None;
        for _ in 0..200 {
            match coordinator.send(Rank(1), Tag::DATA, Envelope::new(vec![0; 1024])).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(first_error, Some(EnvError::Io(_))));

        let err = coordinator.send(Rank(1), Tag::DATA, Envelope::new(vec![1])).await;
        assert!(matches!(err, Err(EnvError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_peer_close_wakes_receiver() {
        let (coordinator, workers) = star(2).await;
        workers[0].close().await;

        let err = coordinator.recv(Rank(1), Tag::DATA).await;
        assert!(matches!(err, Err(EnvError::ChannelClosed(_))));
    }
}
