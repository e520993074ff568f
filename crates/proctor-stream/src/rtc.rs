//! [`PeerConnector`] backed by webrtc-rs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use proctor_protocol::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::capture::{MediaTrack, SurfaceKind, TrackKind};
use crate::connection::{
    ConnectionEvent, ConnectionEvents, PeerConnection, PeerConnector, RemoteTrackInfo,
    TransportState,
};
use crate::error::NegotiationError;

pub struct RtcConnector {
    api: API,
    config: RTCConfiguration,
}

impl RtcConnector {
    pub fn new(stun_urls: &[String]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(connection_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(connection_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };
        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        remote_peer_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), NegotiationError> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(connection_error)?,
        );
        let (tx, rx) = mpsc::unbounded_channel();

        let ice_tx = tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = ice_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ConnectionEvent::LocalIce(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local ICE candidate"),
                }
            })
        }));

        let state_tx = tx.clone();
        let peer = remote_peer_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                debug!(peer_id = %peer, state = %state, "peer connection state changed");
                let tx = state_tx.clone();
                Box::pin(async move {
                    if let Some(state) = transport_state(state) {
                        let _ = tx.send(ConnectionEvent::StateChanged(state));
                    }
                })
            },
        ));

        let track_tx = tx;
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let info = RemoteTrackInfo {
                id: track.id(),
                kind: match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                },
            };
            let tx = track_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ConnectionEvent::RemoteTrack(info));
            })
        }));

        let connection: Arc<dyn PeerConnection> = Arc::new(RtcConnection { peer_connection });
        Ok((connection, rx))
    }
}

struct RtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn prepare_receive_only(&self) -> Result<(), NegotiationError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(connection_error)?;
        }
        Ok(())
    }

    async fn attach_tracks(&self, tracks: &[Arc<dyn MediaTrack>]) -> Result<(), NegotiationError> {
        for track in tracks {
            let Some(local) = track.rtp_track() else {
                return Err(NegotiationError::Media(format!(
                    "track `{}` has no RTP source",
                    track.id()
                )));
            };
            let sender = self
                .peer_connection
                .add_track(local)
                .await
                .map_err(|err| NegotiationError::Media(err.to_string()))?;
            // RTCP has to be drained for interceptors such as NACK to work.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::LocalDescription(err.to_string()))?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|err| NegotiationError::LocalDescription(err.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::LocalDescription(err.to_string()))?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|err| NegotiationError::LocalDescription(err.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let parsed = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Rollback => {
                return Err(NegotiationError::InvalidDescription(
                    "rollback is not supported".to_string(),
                ))
            }
        }
        .map_err(|err| NegotiationError::InvalidDescription(err.to_string()))?;
        self.peer_connection
            .set_remote_description(parsed)
            .await
            .map_err(|err| NegotiationError::RemoteDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| NegotiationError::IceCandidate(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            warn!(error = %err, "failed to close peer connection");
        }
    }
}

/// Local track fed with encoded samples by a native capture source.
#[derive(Debug)]
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    label: String,
    surface: Option<SurfaceKind>,
    live: AtomicBool,
    local: Arc<TrackLocalStaticSample>,
}

impl SampleTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>, surface: Option<SurfaceKind>) -> Self {
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let id = Uuid::new_v4().to_string();
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            "proctor".to_owned(),
        ));
        Self {
            id,
            kind,
            label: label.into(),
            surface,
            live: AtomicBool::new(true),
            local,
        }
    }

    /// Sink the capture source writes samples into.
    pub fn sample_sink(&self) -> Arc<TrackLocalStaticSample> {
        self.local.clone()
    }
}

impl MediaTrack for SampleTrack {
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
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn rtp_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        if !self.is_live() {
            return None;
        }
        Some(self.local.clone() as Arc<dyn TrackLocal + Send + Sync>)
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn connection_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Connection(err.to_string())
}
