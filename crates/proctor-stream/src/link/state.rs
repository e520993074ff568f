//! The peer link state machine.
//!
//! [`PeerLink::apply`] is a pure transition from an event to a list of
//! effects; the actor in `link::actor` performs the effects and feeds their
//! outcomes back in as events.

use std::collections::VecDeque;
use std::fmt;

use proctor_protocol::{IceCandidate, SdpType, SessionDescription, StreamType};

use crate::connection::TransportState;
use crate::error::{CaptureError, NegotiationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::New => "new",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        }
    }

    /// A failed or closed link is never reused.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }

    pub fn is_streaming(&self) -> bool {
        *self == LinkState::Connected
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of the negotiation this link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Teacher side: receive-only, answers the student's offer.
    Viewer,
    /// Student side: captures, attaches tracks and offers.
    Publisher,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The viewer's connection exists and may now await an offer.
    Armed,
    /// The publisher's capture succeeded and its connection exists.
    LocalMediaReady,
    CaptureFailed(CaptureError),
    OfferReceived(SessionDescription),
    AnswerReceived(SessionDescription),
    RemoteDescriptionApplied,
    LocalDescriptionCreated(SessionDescription),
    LocalIceGathered(IceCandidate),
    IceReceived(IceCandidate),
    TransportChanged(TransportState),
    NegotiationFailed(NegotiationError),
    TimerFired(u64),
    CloseRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    Description(SessionDescription),
    Ice(IceCandidate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEffect {
    PrepareReceiveOnly,
    AttachLocalTracks,
    /// Create and install the local offer.
    CreateOffer,
    /// Create and install the local answer.
    CreateAnswer,
    ApplyRemoteDescription(SessionDescription),
    AddIceCandidates(Vec<IceCandidate>),
    EmitSignal(OutboundSignal),
    ArmTimer { epoch: u64 },
    DisarmTimer,
    /// Close the connection and give back the local media. Emitted once.
    Release,
}

#[derive(Debug)]
pub struct PeerLink {
    remote_peer_id: String,
    role: LinkRole,
    stream_type: Option<StreamType>,
    state: LinkState,
    pending_ice: VecDeque<IceCandidate>,
    applying_remote: Option<SdpType>,
    remote_applied: bool,
    offer_sent: bool,
    timer_epoch: u64,
    timer_armed: bool,
    released: bool,
    last_error: Option<String>,
}

impl PeerLink {
    pub fn new(remote_peer_id: impl Into<String>, role: LinkRole, stream_type: Option<StreamType>) -> Self {
        Self {
            remote_peer_id: remote_peer_id.into(),
            role,
            stream_type,
            state: LinkState::New,
            pending_ice: VecDeque::new(),
            applying_remote: None,
            remote_applied: false,
            offer_sent: false,
            timer_epoch: 0,
            timer_armed: false,
            released: false,
            last_error: None,
        }
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        self.stream_type
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn pending_ice(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn apply(&mut self, event: LinkEvent) -> Vec<LinkEffect> {
        if self.state == LinkState::Closed {
            return Vec::new();
        }
        if self.state == LinkState::Failed {
            return match event {
                LinkEvent::CloseRequested => {
                    self.state = LinkState::Closed;
                    Vec::new()
                }
                _ => Vec::new(),
            };
        }

        match event {
            LinkEvent::Armed => {
                if self.role != LinkRole::Viewer || self.state != LinkState::New {
                    return Vec::new();
                }
                vec![LinkEffect::PrepareReceiveOnly, self.arm_timer()]
            }
            LinkEvent::LocalMediaReady => {
                if self.role != LinkRole::Publisher || self.state != LinkState::New {
                    return Vec::new();
                }
                self.state = LinkState::Negotiating;
                vec![
                    LinkEffect::AttachLocalTracks,
                    LinkEffect::CreateOffer,
                    self.arm_timer(),
                ]
            }
            LinkEvent::CaptureFailed(err) => self.fail(err.reason()),
            LinkEvent::OfferReceived(description) => {
                if self.role != LinkRole::Viewer
                    || self.state != LinkState::New
                    || self.applying_remote.is_some()
                {
                    return Vec::new();
                }
                self.state = LinkState::Negotiating;
                self.applying_remote = Some(SdpType::Offer);
                vec![
                    self.arm_timer(),
                    LinkEffect::ApplyRemoteDescription(description),
                ]
            }
            LinkEvent::AnswerReceived(description) => {
                if self.role != LinkRole::Publisher
                    || !self.offer_sent
                    || self.applying_remote.is_some()
                    || self.remote_applied
                {
                    return Vec::new();
                }
                self.applying_remote = Some(SdpType::Answer);
                vec![LinkEffect::ApplyRemoteDescription(description)]
            }
            LinkEvent::RemoteDescriptionApplied => {
                let Some(applied) = self.applying_remote else {
                    return Vec::new();
                };
                self.remote_applied = true;
                let mut effects = Vec::new();
                if !self.pending_ice.is_empty() {
                    effects.push(LinkEffect::AddIceCandidates(
                        self.pending_ice.drain(..).collect(),
                    ));
                }
                if applied == SdpType::Offer {
                    effects.push(LinkEffect::CreateAnswer);
                }
                effects
            }
            LinkEvent::LocalDescriptionCreated(description) => {
                if description.sdp_type == SdpType::Offer {
                    self.offer_sent = true;
                }
                vec![LinkEffect::EmitSignal(OutboundSignal::Description(description))]
            }
            LinkEvent::LocalIceGathered(candidate) => {
                vec![LinkEffect::EmitSignal(OutboundSignal::Ice(candidate))]
            }
            LinkEvent::IceReceived(candidate) => {
                if self.remote_applied {
                    vec![LinkEffect::AddIceCandidates(vec![candidate])]
                } else {
                    self.pending_ice.push_back(candidate);
                    Vec::new()
                }
            }
            LinkEvent::TransportChanged(transport) => self.on_transport(transport),
            LinkEvent::NegotiationFailed(err) => self.fail(err.to_string()),
            LinkEvent::TimerFired(epoch) => {
                if !self.timer_armed || epoch != self.timer_epoch {
                    return Vec::new();
                }
                match self.state {
                    LinkState::New | LinkState::Negotiating | LinkState::Disconnected => {
                        self.fail(NegotiationError::TimedOut.to_string())
                    }
                    _ => Vec::new(),
                }
            }
            LinkEvent::CloseRequested => {
                self.state = LinkState::Closed;
                self.pending_ice.clear();
                let mut effects = self.disarm_timer();
                effects.extend(self.release());
                effects
            }
        }
    }

    fn on_transport(&mut self, transport: TransportState) -> Vec<LinkEffect> {
        match transport {
            TransportState::Connected => match self.state {
                LinkState::Negotiating | LinkState::Disconnected => {
                    self.state = LinkState::Connected;
                    self.disarm_timer()
                }
                _ => Vec::new(),
            },
            TransportState::Disconnected => match self.state {
                LinkState::Negotiating | LinkState::Connected => {
                    self.state = LinkState::Disconnected;
                    vec![self.arm_timer()]
                }
                _ => Vec::new(),
            },
            TransportState::Failed | TransportState::Closed => {
                self.fail(NegotiationError::TransportFailed.to_string())
            }
            TransportState::New | TransportState::Connecting => Vec::new(),
        }
    }

    fn fail(&mut self, reason: String) -> Vec<LinkEffect> {
        self.state = LinkState::Failed;
        self.last_error = Some(reason);
        self.pending_ice.clear();
        let mut effects = self.disarm_timer();
        effects.extend(self.release());
        effects
    }

    fn arm_timer(&mut self) -> LinkEffect {
        self.timer_epoch += 1;
        self.timer_armed = true;
        LinkEffect::ArmTimer {
            epoch: self.timer_epoch,
        }
    }

    fn disarm_timer(&mut self) -> Vec<LinkEffect> {
        if !self.timer_armed {
            return Vec::new();
        }
        self.timer_armed = false;
        self.timer_epoch += 1;
        vec![LinkEffect::DisarmTimer]
    }

    fn release(&mut self) -> Option<LinkEffect> {
        if self.released {
            return None;
        }
        self.released = true;
        Some(LinkEffect::Release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ice(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn releases(effects: &[LinkEffect]) -> usize {
        effects
            .iter()
            .filter(|effect| **effect == LinkEffect::Release)
            .count()
    }

    #[test]
    fn viewer_queues_ice_until_the_offer_is_applied() {
        let mut link = PeerLink::new("student-1", LinkRole::Viewer, Some(StreamType::Webcam));
        link.apply(LinkEvent::Armed);
        for n in 0..3 {
            assert!(link.apply(LinkEvent::IceReceived(ice(n))).is_empty());
        }
        assert_eq!(link.pending_ice(), 3);

        let effects = link.apply(LinkEvent::OfferReceived(SessionDescription::offer("v=0")));
        assert_eq!(link.state(), LinkState::Negotiating);
        assert!(effects.contains(&LinkEffect::ApplyRemoteDescription(SessionDescription::offer("v=0"))));

        // Arrives while the description is still being applied.
        assert!(link.apply(LinkEvent::IceReceived(ice(3))).is_empty());

        let effects = link.apply(LinkEvent::RemoteDescriptionApplied);
        assert_eq!(
            effects,
            vec![
                LinkEffect::AddIceCandidates(vec![ice(0), ice(1), ice(2), ice(3)]),
                LinkEffect::CreateAnswer,
            ]
        );
        assert_eq!(link.pending_ice(), 0);
        assert_eq!(
            link.apply(LinkEvent::IceReceived(ice(4))),
            vec![LinkEffect::AddIceCandidates(vec![ice(4)])]
        );
    }

    #[test]
    fn viewer_answers_and_connects() {
        let mut link = PeerLink::new("student-1", LinkRole::Viewer, None);
        assert_eq!(
            link.apply(LinkEvent::Armed),
            vec![LinkEffect::PrepareReceiveOnly, LinkEffect::ArmTimer { epoch: 1 }]
        );
        link.apply(LinkEvent::OfferReceived(SessionDescription::offer("v=0")));
        link.apply(LinkEvent::RemoteDescriptionApplied);
        let answer = SessionDescription::answer("v=0 answer");
        assert_eq!(
            link.apply(LinkEvent::LocalDescriptionCreated(answer.clone())),
            vec![LinkEffect::EmitSignal(OutboundSignal::Description(answer))]
        );
        assert_eq!(link.state(), LinkState::Negotiating);

        let effects = link.apply(LinkEvent::TransportChanged(TransportState::Connected));
        assert_eq!(link.state(), LinkState::Connected);
        assert!(link.state().is_streaming());
        assert_eq!(effects, vec![LinkEffect::DisarmTimer]);
    }

    #[test]
    fn publisher_offers_once_media_is_ready() {
        let mut link = PeerLink::new("teacher-1", LinkRole::Publisher, Some(StreamType::Screen));
        assert!(link.apply(LinkEvent::Armed).is_empty());
        let effects = link.apply(LinkEvent::LocalMediaReady);
        assert_eq!(link.state(), LinkState::Negotiating);
        assert_eq!(effects[..2], [LinkEffect::AttachLocalTracks, LinkEffect::CreateOffer]);

        // An answer before our offer went out is ignored.
        assert!(link
            .apply(LinkEvent::AnswerReceived(SessionDescription::answer("v=0")))
            .is_empty());

        link.apply(LinkEvent::LocalDescriptionCreated(SessionDescription::offer("v=0")));
        assert_eq!(
            link.apply(LinkEvent::AnswerReceived(SessionDescription::answer("v=0"))),
            vec![LinkEffect::ApplyRemoteDescription(SessionDescription::answer("v=0"))]
        );
        assert!(link.apply(LinkEvent::RemoteDescriptionApplied).is_empty());
    }

    #[test]
    fn capture_failure_fails_without_offering() {
        let mut link = PeerLink::new("teacher-1", LinkRole::Publisher, Some(StreamType::Screen));
        let effects = link.apply(LinkEvent::CaptureFailed(CaptureError::NotEntireScreen));

        assert_eq!(link.state(), LinkState::Failed);
        assert_eq!(link.last_error(), Some("not entire screen"));
        assert_eq!(effects, vec![LinkEffect::Release]);
        assert!(link.apply(LinkEvent::LocalMediaReady).is_empty());
    }

    #[test]
    fn close_releases_once_from_any_state() {
        let setups: Vec<Vec<LinkEvent>> = vec![
            vec![],
            vec![LinkEvent::Armed],
            vec![LinkEvent::Armed, LinkEvent::OfferReceived(SessionDescription::offer("v=0"))],
            vec![
                LinkEvent::Armed,
                LinkEvent::OfferReceived(SessionDescription::offer("v=0")),
                LinkEvent::TransportChanged(TransportState::Connected),
            ],
            vec![LinkEvent::NegotiationFailed(NegotiationError::TimedOut)],
        ];

        for setup in setups {
            let mut link = PeerLink::new("student-1", LinkRole::Viewer, None);
            let mut released = 0;
            for event in setup {
                released += releases(&link.apply(event));
            }
            for _ in 0..3 {
                released += releases(&link.apply(LinkEvent::CloseRequested));
            }
            assert_eq!(link.state(), LinkState::Closed);
            assert_eq!(released, 1);
        }
    }

    #[test]
    fn failure_discards_queued_ice() {
        let mut link = PeerLink::new("student-1", LinkRole::Viewer, None);
        link.apply(LinkEvent::IceReceived(ice(1)));
        link.apply(LinkEvent::NegotiationFailed(NegotiationError::InvalidDescription(
            "garbage".to_string(),
        )));

        assert_eq!(link.pending_ice(), 0);
        assert!(link.apply(LinkEvent::IceReceived(ice(2))).is_empty());
        assert!(link
            .apply(LinkEvent::OfferReceived(SessionDescription::offer("v=0")))
            .is_empty());
    }

    #[test]
    fn stale_timer_is_ignored() {
        let mut link = PeerLink::new("student-1", LinkRole::Viewer, None);
        link.apply(LinkEvent::Armed);
        link.apply(LinkEvent::OfferReceived(SessionDescription::offer("v=0")));

        // Epoch 1 was superseded when the offer re-armed the timer.
        assert!(link.apply(LinkEvent::TimerFired(1)).is_empty());
        assert_eq!(link.state(), LinkState::Negotiating);

        let effects = link.apply(LinkEvent::TimerFired(2));
        assert_eq!(link.state(), LinkState::Failed);
        assert_eq!(link.last_error(), Some("negotiation timed out"));
        assert_eq!(releases(&effects), 1);
    }

    #[test]
    fn disconnect_rearms_the_timer_and_recovery_disarms_it() {
        let mut link = PeerLink::new("student-1", LinkRole::Viewer, None);
        link.apply(LinkEvent::Armed);
        link.apply(LinkEvent::OfferReceived(SessionDescription::offer("v=0")));
        link.apply(LinkEvent::TransportChanged(TransportState::Connected));

        let effects = link.apply(LinkEvent::TransportChanged(TransportState::Disconnected));
        assert_eq!(link.state(), LinkState::Disconnected);
        let [LinkEffect::ArmTimer { epoch }] = effects.as_slice() else {
            panic!("expected a timer, got {effects:?}");
        };
        let epoch = *epoch;

        link.apply(LinkEvent::TransportChanged(TransportState::Connected));
        assert!(link.apply(LinkEvent::TimerFired(epoch)).is_empty());
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn transport_failure_fails_the_link() {
        let mut link = PeerLink::new("student-1", LinkRole::Viewer, None);
        link.apply(LinkEvent::Armed);
        link.apply(LinkEvent::OfferReceived(SessionDescription::offer("v=0")));
        link.apply(LinkEvent::TransportChanged(TransportState::Connected));

        let effects = link.apply(LinkEvent::TransportChanged(TransportState::Failed));

        assert_eq!(link.state(), LinkState::Failed);
        assert_eq!(effects, vec![LinkEffect::Release]);
    }
}
