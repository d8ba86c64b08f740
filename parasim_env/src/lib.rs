//! Parasim Environment Abstraction Layer
//!
//! This crate provides the message-passing substrate that lets a single
//! coordinator (rank 0) drive a fixed group of worker ranks. Engines in
//! `parasim_core` only ever see the [`NetworkTransport`] trait, so the same
//! protocol code runs over:
//! - **In-process mesh** ([`ChannelMesh`]): every rank is a tokio task, links
//!   are bounded mpsc queues, faults are injected through [`NetworkController`]
//! - **TCP** ([`TcpTransport`]): every rank is an OS process, the coordinator
//!   accepts one connection per worker (star topology)
//!
//! # Addressing
//!
//! Every message travels on a logical link identified by
//! `(sender rank, receiver rank, tag)`. Messages on one link are delivered in
//! send order; nothing is promised across links.
//!
//! # Example
//!
//! ```ignore
//! use parasim_env::{ChannelMesh, Envelope, NetworkTransport, Rank, Tag};
//!
//! let mesh = ChannelMesh::new(3);
//! let coordinator = mesh.endpoint(Rank::COORDINATOR);
//! let worker = mesh.endpoint(Rank(1));
//!
//! coordinator.send(Rank(1), Tag::COMMAND, Envelope::new(b"1".to_vec())).await?;
//! let envelope = worker.recv(Rank::COORDINATOR, Tag::COMMAND).await?;
//! ```

mod error;
mod mesh;
mod network;
mod tcp;
mod types;

pub use error::EnvError;
pub use mesh::{ChannelMesh, MeshEndpoint};
pub use network::{NetworkController, NetworkTransport};
pub use tcp::TcpTransport;
pub use types::{Envelope, Rank, Tag};
