use anyhow::Result;
use async_trait::async_trait;
use booth_common::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States after which the connection is dropped without renegotiation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Callbacks raised by a peer connection, tagged with the remote participant.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate {
        remote_id: String,
        candidate: IceCandidate,
    },
    StateChanged {
        remote_id: String,
        state: PeerState,
    },
    RemoteTrack {
        remote_id: String,
        kind: String,
    },
}

/// One negotiated connection to a remote participant.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn apply_remote(&self, description: SessionDescription) -> Result<()>;
    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerLink>>;
}
