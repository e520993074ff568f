use std::sync::Arc;

use async_trait::async_trait;
use proctor_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::capture::{MediaTrack, TrackKind};
use crate::error::NegotiationError;

/// Transport health as reported by the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    LocalIce(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrackInfo),
}

/// One peer-to-peer media connection.
///
/// `create_offer` and `create_answer` also install the result as the local
/// description before returning it.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Declares receive-only audio and video, for links that only watch.
    async fn prepare_receive_only(&self) -> Result<(), NegotiationError>;
    async fn attach_tracks(&self, tracks: &[Arc<dyn MediaTrack>]) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self);
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        remote_peer_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), NegotiationError>;
}
