//! In-memory capture devices, peer connections and signal sinks for tests
//! and for embedding the client without a media stack.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use proctor_protocol::{ClientMessage, IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;

use crate::capture::{MediaDevices, MediaTrack, SurfaceKind, TrackKind, TrackList};
use crate::connection::{
    ConnectionEvent, ConnectionEvents, PeerConnection, PeerConnector, RemoteTrackInfo,
    TransportState,
};
use crate::error::{CaptureError, NegotiationError, TransportError};
use crate::signaling::SignalSink;

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: TrackKind,
    label: String,
    surface: Option<SurfaceKind>,
    stops: AtomicUsize,
}

impl MockTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        label: impl Into<String>,
        surface: Option<SurfaceKind>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            surface,
            stops: AtomicUsize::new(0),
        }
    }

    pub fn video(id: impl Into<String>, label: impl Into<String>, surface: Option<SurfaceKind>) -> Self {
        Self::new(id, TrackKind::Video, label, surface)
    }

    pub fn audio(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Audio, label, None)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn display_surface(&self) -> Option<SurfaceKind> {
        self.surface
    }

    fn is_live(&self) -> bool {
        self.stop_count() == 0
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct DeviceSettings {
    display_surface: Option<SurfaceKind>,
    display_label: String,
    failure: Option<CaptureError>,
}

/// Capture backend that fabricates tracks. Display capture reports an
/// entire-screen surface unless told otherwise.
pub struct MockDevices {
    settings: Mutex<DeviceSettings>,
    created: Mutex<Vec<Arc<MockTrack>>>,
    user_media_calls: AtomicUsize,
    display_media_calls: AtomicUsize,
}

impl Default for MockDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevices {
    pub fn new() -> Self {
        Self {
            settings: Mutex::new(DeviceSettings {
                display_surface: Some(SurfaceKind::Monitor),
                display_label: "screen:0:0".to_string(),
                failure: None,
            }),
            created: Mutex::new(Vec::new()),
            user_media_calls: AtomicUsize::new(0),
            display_media_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_display_surface(&self, surface: Option<SurfaceKind>) {
        self.settings.lock().display_surface = surface;
    }

    pub fn set_display_label(&self, label: &str) {
        self.settings.lock().display_label = label.to_string();
    }

    /// Every later capture fails as if the user dismissed the prompt.
    pub fn deny(&self, reason: &str) {
        self.settings.lock().failure = Some(CaptureError::PermissionDenied(reason.to_string()));
    }

    /// Every later capture fails as if no camera or screen were present.
    pub fn unplug(&self, reason: &str) {
        self.settings.lock().failure = Some(CaptureError::DeviceUnavailable(reason.to_string()));
    }

    pub fn created(&self) -> Vec<Arc<MockTrack>> {
        self.created.lock().clone()
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    pub fn display_media_calls(&self) -> usize {
        self.display_media_calls.load(Ordering::SeqCst)
    }

    fn produce(&self, tracks: Vec<MockTrack>) -> TrackList {
        let tracks: Vec<Arc<MockTrack>> = tracks.into_iter().map(Arc::new).collect();
        self.created.lock().extend(tracks.iter().cloned());
        tracks
            .into_iter()
            .map(|track| track as Arc<dyn MediaTrack>)
            .collect()
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn user_media(&self) -> Result<TrackList, CaptureError> {
        let call = self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.settings.lock().failure.clone() {
            return Err(err);
        }
        Ok(self.produce(vec![
            MockTrack::video(format!("camera-{call}"), "Integrated Camera", None),
            MockTrack::audio(format!("microphone-{call}"), "Default Microphone"),
        ]))
    }

    async fn display_media(&self) -> Result<TrackList, CaptureError> {
        let call = self.display_media_calls.fetch_add(1, Ordering::SeqCst);
        let (surface, label) = {
            let settings = self.settings.lock();
            if let Some(err) = settings.failure.clone() {
                return Err(err);
            }
            (settings.display_surface, settings.display_label.clone())
        };
        Ok(self.produce(vec![MockTrack::video(
            format!("display-{call}"),
            label,
            surface,
        )]))
    }
}

/// Operations observed by a [`MockConnection`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    PrepareReceiveOnly,
    AttachTracks(Vec<String>),
    CreateOffer,
    CreateAnswer,
    ApplyRemote(SdpType),
    AddIce(String),
    Close,
}

pub struct MockConnection {
    remote_peer_id: String,
    calls: Mutex<Vec<MockCall>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    auto_connect: bool,
}

impl MockConnection {
    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// ICE candidates added so far, in order.
    pub fn added_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::AddIce(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Injects a transport state change, as the network would.
    pub fn set_state(&self, state: TransportState) {
        let _ = self.events.send(ConnectionEvent::StateChanged(state));
    }

    pub fn emit_remote_track(&self, id: &str, kind: TrackKind) {
        let _ = self.events.send(ConnectionEvent::RemoteTrack(RemoteTrackInfo {
            id: id.to_string(),
            kind,
        }));
    }

    fn record(&self, call: MockCall) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Connection("connection closed".to_string()));
        }
        self.calls.lock().push(call);
        Ok(())
    }

    fn local_description_set(&self) {
        self.local_set.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::LocalIce(IceCandidate {
            candidate: format!("candidate:mock 1 udp 2122260223 10.0.0.1 50000 typ host ({})", self.remote_peer_id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connect();
    }

    fn maybe_connect(&self) {
        if self.auto_connect
            && self.local_set.load(Ordering::SeqCst)
            && self.remote_set.load(Ordering::SeqCst)
        {
            self.set_state(TransportState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn prepare_receive_only(&self) -> Result<(), NegotiationError> {
        self.record(MockCall::PrepareReceiveOnly)
    }

    async fn attach_tracks(&self, tracks: &[Arc<dyn MediaTrack>]) -> Result<(), NegotiationError> {
        if let Some(ended) = tracks.iter().find(|track| !track.is_live()) {
            return Err(NegotiationError::Media(format!("track `{}` has ended", ended.id())));
        }
        let ids = tracks.iter().map(|track| track.id().to_string()).collect();
        self.record(MockCall::AttachTracks(ids))
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(MockCall::CreateOffer)?;
        self.local_description_set();
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock-offer {}\r\n",
            self.remote_peer_id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(NegotiationError::LocalDescription(
                "no remote offer to answer".to_string(),
            ));
        }
        self.record(MockCall::CreateAnswer)?;
        self.local_description_set();
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=mock-answer {}\r\n",
            self.remote_peer_id
        )))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if !description.sdp.starts_with("v=0") {
            return Err(NegotiationError::InvalidDescription(
                "sdp must start with v=0".to_string(),
            ));
        }
        self.record(MockCall::ApplyRemote(description.sdp_type))?;
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if candidate.candidate.is_empty() {
            return Err(NegotiationError::IceCandidate("empty candidate".to_string()));
        }
        self.record(MockCall::AddIce(candidate.candidate))
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.calls.lock().push(MockCall::Close);
        }
    }
}

/// Hands out [`MockConnection`]s and keeps them for inspection.
#[derive(Default)]
pub struct MockConnector {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    auto_connect: bool,
    refuse: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections report `connected` once both descriptions are in place.
    pub fn auto_connect() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn connections_to(&self, remote_peer_id: &str) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|connection| connection.remote_peer_id == remote_peer_id)
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        remote_peer_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), NegotiationError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(NegotiationError::Connection("connector refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockConnection {
            remote_peer_id: remote_peer_id.to_string(),
            calls: Mutex::new(Vec::new()),
            events: tx,
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            auto_connect: self.auto_connect,
        });
        self.connections.lock().push(connection.clone());
        Ok((connection as Arc<dyn PeerConnection>, rx))
    }
}

/// Signal sink that records what would have gone to the relay.
pub struct RecordingSink {
    sent: Mutex<Vec<ClientMessage>>,
    connected: AtomicBool,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}
