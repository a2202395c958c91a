use super::{AudioFrame, MediaError, RemoteTrack};
use crate::types::media::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
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

/// Notifications raised by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    /// Candidate gathering finished; the local description now lists them all.
    GatheringComplete,
    RemoteTrack(RemoteTrack),
    StateChanged(PeerState),
}

/// One negotiated media session with the far end.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Adds the outgoing audio track, fed from `frames`.
    async fn add_audio_track(&self, frames: mpsc::Receiver<AudioFrame>) -> Result<(), MediaError>;

    /// Swaps the feed of the outgoing audio track without renegotiating.
    async fn replace_audio_track(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), MediaError>;

    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Applies a local description; this starts candidate gathering.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    /// The current local description, including gathered candidates.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}
