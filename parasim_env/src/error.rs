//! Error types for the Parasim transport layer.

use crate::types::Rank;
use thiserror::Error;

/// Errors that can occur while moving envelopes between ranks.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Generic network failure (write failed, queue rejected the message, ...)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target rank is not part of this transport or cannot be addressed from here
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// The link was severed by fault injection
    #[error("Link severed: {from} -> {to}")]
    LinkSevered { from: Rank, to: Rank },

    /// Envelope or frame serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The local endpoint or the remote side has been closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(node: impl std::fmt::Display) -> Self {
        Self::NodeUnreachable(node.to_string())
    }

    /// Creates a channel-closed error.
    pub fn closed(what: impl std::fmt::Display) -> Self {
        Self::ChannelClosed(what.to_string())
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
