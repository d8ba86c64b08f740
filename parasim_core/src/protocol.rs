//! Phase codes and the typed message layer on top of [`NetworkTransport`].
//!
//! # Phase codes
//!
//! | Code | Phase      |
//! |------|------------|
//! | 0    | continue   |
//! | 1    | build      |
//! | 2    | pre-step   |
//! | 3    | step       |
//! | 4    | post-step  |
//! | 9    | end        |
//!
//! Codes travel as raw integers inside [`Message::Command`], so a peer can
//! still send a code this side does not know. Decoding it into a
//! [`PhaseCode`] is where that gets caught.

use crate::agent::Agent;
use crate::error::CoreError;
use crate::partition::ChunkAssignment;
use async_trait::async_trait;
use parasim_env::{Envelope, NetworkTransport, Rank, Tag};
use serde::{Deserialize, Serialize};

/// A phase the coordinator can ask workers to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseCode {
    Continue,
    Build,
    PreStep,
    Step,
    PostStep,
    End,
}

impl PhaseCode {
    /// Wire value of the phase.
    pub fn code(&self) -> i32 {
        match self {
            PhaseCode::Continue => 0,
            PhaseCode::Build => 1,
            PhaseCode::PreStep => 2,
            PhaseCode::Step => 3,
            PhaseCode::PostStep => 4,
            PhaseCode::End => 9,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhaseCode::Continue => "continue",
            PhaseCode::Build => "build",
            PhaseCode::PreStep => "pre_step",
            PhaseCode::Step => "step",
            PhaseCode::PostStep => "post_step",
            PhaseCode::End => "end",
        }
    }
}

impl TryFrom<i32> for PhaseCode {
    type Error = CoreError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PhaseCode::Continue),
            1 => Ok(PhaseCode::Build),
            2 => Ok(PhaseCode::PreStep),
            3 => Ok(PhaseCode::Step),
            4 => Ok(PhaseCode::PostStep),
            9 => Ok(PhaseCode::End),
            other => Err(CoreError::protocol(format!("unknown phase code {}", other))),
        }
    }
}

impl std::fmt::Display for PhaseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Everything that travels between coordinator and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// A raw phase code
    Command(i32),

    /// The slice a worker owns, sent right before its first batch
    Assignment(ChunkAssignment),

    /// Agents in population order
    Batch(Vec<Agent>),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Command(_) => "command",
            Message::Assignment(_) => "assignment",
            Message::Batch(_) => "batch",
        }
    }

    /// Encodes the message into a transport envelope.
    pub fn encode(&self) -> Result<Envelope, CoreError> {
        Ok(Envelope::new(serde_json::to_vec(self)?))
    }

    /// Decodes a transport envelope.
    pub fn decode(envelope: &Envelope) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(&envelope.payload)?)
    }
}

/// Typed send/receive operations for any [`NetworkTransport`].
#[async_trait]
pub trait PhaseTransport: NetworkTransport {
    async fn send_message(&self, peer: Rank, tag: Tag, message: &Message) -> Result<(), CoreError> {
        let envelope = message.encode()?;
        self.send(peer, tag, envelope)
            .await
            .map_err(|e| CoreError::transport(peer, e))
    }

    async fn recv_message(&self, peer: Rank, tag: Tag) -> Result<Message, CoreError> {
        let envelope = self
            .recv(peer, tag)
            .await
            .map_err(|e| CoreError::transport(peer, e))?;
        Message::decode(&envelope)
    }

    /// Sends one integer.
    async fn send_int(&self, peer: Rank, tag: Tag, value: i32) -> Result<(), CoreError> {
        self.send_message(peer, tag, &Message::Command(value)).await
    }

    /// Receives one integer.
    async fn recv_int(&self, peer: Rank, tag: Tag) -> Result<i32, CoreError> {
        match self.recv_message(peer, tag).await? {
            Message::Command(value) => Ok(value),
            other => Err(CoreError::protocol(format!(
                "expected command from {}, got {}",
                peer,
                other.kind()
            ))),
        }
    }

    /// Sends agents by value, in order.
    async fn send_batch(&self, peer: Rank, tag: Tag, agents: &[Agent]) -> Result<(), CoreError> {
        self.send_message(peer, tag, &Message::Batch(agents.to_vec())).await
    }

    /// Receives exactly `expected` agents.
    async fn recv_batch(&self, peer: Rank, tag: Tag, expected: usize) -> Result<Vec<Agent>, CoreError> {
        match self.recv_message(peer, tag).await? {
            Message::Batch(agents) if agents.len() == expected => Ok(agents),
            Message::Batch(agents) => Err(CoreError::BatchSizeMismatch {
                rank: peer,
                expected,
                actual: agents.len(),
            }),
            other => Err(CoreError::protocol(format!(
                "expected batch from {}, got {}",
                peer,
                other.kind()
            ))),
        }
    }

    async fn send_assignment(&self, peer: Rank, tag: Tag, assignment: ChunkAssignment) -> Result<(), CoreError> {
        self.send_message(peer, tag, &Message::Assignment(assignment)).await
    }

    async fn recv_assignment(&self, peer: Rank, tag: Tag) -> Result<ChunkAssignment, CoreError> {
        match self.recv_message(peer, tag).await? {
            Message::Assignment(assignment) => Ok(assignment),
            other => Err(CoreError::protocol(format!(
                "expected assignment from {}, got {}",
                peer,
                other.kind()
            ))),
        }
    }
}

impl<T: NetworkTransport> PhaseTransport for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use parasim_env::ChannelMesh;

    #[test]
    fn test_phase_codes_match_wire_table() {
        let table = [
            (0, PhaseCode::Continue),
            (1, PhaseCode::Build),
            (2, PhaseCode::PreStep),
            (3, PhaseCode::Step),
            (4, PhaseCode::PostStep),
            (9, PhaseCode::End),
        ];
        for (code, phase) in table {
            assert_eq!(phase.code(), code);
            assert_eq!(PhaseCode::try_from(code).unwrap(), phase);
        }
    }

    #[test]
    fn test_unknown_code_is_protocol_violation() {
        for code in [5, 8, 10, -1, 50] {
            assert!(matches!(
                PhaseCode::try_from(code),
                Err(CoreError::ProtocolViolation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_int_and_batch_transfer() {
        let mesh = ChannelMesh::new(2);
        let coordinator = mesh.endpoint(Rank::COORDINATOR);
        let worker = mesh.endpoint(Rank(1));

        let agents = vec![Agent::new(0, 1, 2), Agent::new(1, 3, 4)];
        coordinator.send_int(Rank(1), Tag::COMMAND, 3).await.unwrap();
        coordinator.send_batch(Rank(1), Tag::DATA, &agents).await.unwrap();

        assert_eq!(worker.recv_int(Rank::COORDINATOR, Tag::COMMAND).await.unwrap(), 3);
        let received = worker.recv_batch(Rank::COORDINATOR, Tag::DATA, 2).await.unwrap();
        assert_eq!(received, agents);
    }

    #[tokio::test]
    async fn test_batch_length_is_checked() {
        let mesh = ChannelMesh::new(2);
        let coordinator = mesh.endpoint(Rank::COORDINATOR);
        let worker = mesh.endpoint(Rank(1));

        coordinator
            .send_batch(Rank(1), Tag::DATA, &[Agent::new(0, 0, 0)])
            .await
            .unwrap();
        let err = worker.recv_batch(Rank::COORDINATOR, Tag::DATA, 3).await;
        assert!(matches!(
            err,
            Err(CoreError::BatchSizeMismatch { expected: 3, actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_variant_is_protocol_violation() {
        let mesh = ChannelMesh::new(2);
        let coordinator = mesh.endpoint(Rank::COORDINATOR);
        let worker = mesh.endpoint(Rank(1));

        coordinator.send_int(Rank(1), Tag::DATA, 1).await.unwrap();
        let err = worker.recv_batch(Rank::COORDINATOR, Tag::DATA, 0).await;
        assert!(matches!(err, Err(CoreError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_transport_failure_names_the_peer() {
        let mesh = ChannelMesh::new(3);
        let coordinator = mesh.endpoint(Rank::COORDINATOR);
        mesh.endpoint(Rank(2)).close().await;

        let err = coordinator.send_int(Rank(2), Tag::COMMAND, 1).await;
        assert!(matches!(err, Err(CoreError::Transport { rank: Rank(2), .. })));
    }
}
