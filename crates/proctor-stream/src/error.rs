use proctor_protocol::ProtocolError;
use thiserror::Error;

/// Why a local capture could not back a stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("not entire screen")]
    NotEntireScreen,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture produced no video track")]
    NoVideoTrack,
}

impl CaptureError {
    /// Human-readable reason shown to the student.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Failures while establishing or running a peer link. Always link-scoped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
    #[error("failed to create local description: {0}")]
    LocalDescription(String),
    #[error("failed to add ICE candidate: {0}")]
    IceCandidate(String),
    #[error("failed to attach local media: {0}")]
    Media(String),
    #[error("peer connection error: {0}")]
    Connection(String),
    #[error("negotiation timed out")]
    TimedOut,
    #[error("peer transport failed")]
    TransportFailed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
