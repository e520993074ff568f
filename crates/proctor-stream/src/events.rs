use crate::connection::RemoteTrackInfo;
use crate::link::LinkState;

/// Notifications for the embedding UI layer.
///
/// Signaling connectivity is published separately through
/// [`crate::signaling::SignalingHandle::connectivity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Registered {
        connection_id: Option<String>,
    },
    RegistrationRejected {
        reason: String,
    },
    /// The relay answered a request with an error notice.
    RelayError {
        message: String,
    },
    SignalingLost {
        reason: String,
    },
    LinkStateChanged {
        peer_id: String,
        state: LinkState,
        error: Option<String>,
    },
    CaptureFailed {
        peer_id: String,
        reason: String,
    },
    RemoteTrack {
        peer_id: String,
        track: RemoteTrackInfo,
    },
}
