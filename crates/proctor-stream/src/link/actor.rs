use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proctor_protocol::{ClientMessage, Role, SdpType, SignalKind, SignalMessage, StreamType};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::capture::{CaptureManager, CapturedStream};
use crate::connection::{ConnectionEvent, ConnectionEvents, PeerConnection, PeerConnector};
use crate::error::NegotiationError;
use crate::events::ClientEvent;
use crate::link::state::{LinkEffect, LinkEvent, LinkRole, LinkState, OutboundSignal, PeerLink};
use crate::signaling::SignalSink;

/// Everything a link needs from the session that owns it.
#[derive(Clone)]
pub struct LinkContext {
    pub local_user_id: String,
    pub local_role: Role,
    pub test_id: i64,
    pub connector: Arc<dyn PeerConnector>,
    pub signals: Arc<dyn SignalSink>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub negotiation_timeout: Duration,
}

pub enum LinkPlan {
    Viewer {
        stream_type: StreamType,
    },
    Publisher {
        captures: Arc<CaptureManager>,
        stream_type: StreamType,
        pre_authorized: Option<CapturedStream>,
    },
}

#[derive(Default)]
struct LinkResources {
    connection: Option<Arc<dyn PeerConnection>>,
    media: Option<CapturedStream>,
    media_attached: bool,
    keep_media: bool,
    released: bool,
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

struct LinkShared {
    id: u64,
    remote_peer_id: String,
    machine: Mutex<PeerLink>,
    resources: Mutex<LinkResources>,
    state: watch::Sender<LinkState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    captures: Option<Arc<CaptureManager>>,
}

impl LinkShared {
    fn apply(&self, event: LinkEvent) -> Vec<LinkEffect> {
        let mut machine = self.machine.lock();
        let before = machine.state();
        let effects = machine.apply(event);
        let after = machine.state();
        if after != before {
            let error = machine.last_error().map(str::to_string);
            match &error {
                Some(error) => info!(
                    peer_id = %self.remote_peer_id,
                    from = %before,
                    to = %after,
                    error = %error,
                    "peer link state changed"
                ),
                None => info!(
                    peer_id = %self.remote_peer_id,
                    from = %before,
                    to = %after,
                    "peer link state changed"
                ),
            }
            self.state.send_replace(after);
            let _ = self.events.send(ClientEvent::LinkStateChanged {
                peer_id: self.remote_peer_id.clone(),
                state: after,
                error,
            });
        }
        effects
    }

    fn current_state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn install_media(&self, stream: CapturedStream) -> bool {
        let mut resources = self.resources.lock();
        if resources.released {
            return false;
        }
        resources.media = Some(stream);
        true
    }

    fn install_connection(&self, connection: Arc<dyn PeerConnection>) -> bool {
        let mut resources = self.resources.lock();
        if resources.released {
            return false;
        }
        resources.connection = Some(connection);
        true
    }

    /// Marks the media as handed to the connection; from here on releasing
    /// stops its tracks instead of parking them. A failed link stops them too.
    fn attach_media(&self) -> Option<CapturedStream> {
        let mut resources = self.resources.lock();
        let media = resources.media.clone()?;
        resources.media_attached = true;
        Some(media)
    }

    /// Gives back the media and hands out the connection to close. Runs once.
    fn release(&self) -> Option<Arc<dyn PeerConnection>> {
        let failed = self.current_state() == LinkState::Failed;
        let (connection, media, stop_media) = {
            let mut resources = self.resources.lock();
            if resources.released {
                return None;
            }
            resources.released = true;
            (
                resources.connection.take(),
                resources.media.take(),
                (resources.media_attached || failed) && !resources.keep_media,
            )
        };
        if let (Some(media), Some(captures)) = (media, self.captures.as_ref()) {
            if stop_media {
                captures.release(&media);
            } else {
                debug!(peer_id = %self.remote_peer_id, "parking capture for reuse");
                captures.park(&media);
            }
        }
        connection
    }

    /// Performs a release requested outside the actor.
    fn release_detached(&self, effects: &[LinkEffect]) {
        if !effects.contains(&LinkEffect::Release) {
            return;
        }
        let Some(connection) = self.release() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { connection.close().await });
            }
            Err(_) => warn!(
                peer_id = %self.remote_peer_id,
                "no runtime available to close peer connection"
            ),
        }
    }
}

/// Handle to a running peer link. Cloning shares the same link.
#[derive(Clone)]
pub struct LinkHandle {
    inbox: mpsc::UnboundedSender<LinkEvent>,
    shared: Arc<LinkShared>,
}

impl LinkHandle {
    /// Distinguishes links to the same peer.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.shared.remote_peer_id
    }

    pub fn role(&self) -> LinkRole {
        self.shared.machine.lock().role()
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        self.shared.machine.lock().stream_type()
    }

    pub fn state(&self) -> LinkState {
        self.shared.current_state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.machine.lock().last_error().map(str::to_string)
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    pub async fn wait_for<F>(&self, mut predicate: F) -> LinkState
    where
        F: FnMut(LinkState) -> bool,
    {
        let mut rx = self.subscribe();
        let reached = match rx.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    /// Feeds a relayed signal from the remote peer into the link.
    pub fn deliver_signal(&self, message: &SignalMessage) {
        let event = match message.kind {
            SignalKind::Offer => message.decode_data().map(LinkEvent::OfferReceived),
            SignalKind::Answer => message.decode_data().map(LinkEvent::AnswerReceived),
            SignalKind::IceCandidate => message.decode_data().map(LinkEvent::IceReceived),
        };
        let event = event.unwrap_or_else(|err| {
            warn!(peer_id = %self.shared.remote_peer_id, error = %err, "undecodable signal payload");
            LinkEvent::NegotiationFailed(NegotiationError::InvalidDescription(err.to_string()))
        });
        self.send(event);
    }

    pub(crate) fn send(&self, event: LinkEvent) {
        if self.inbox.send(event).is_err() {
            debug!(peer_id = %self.shared.remote_peer_id, "link actor already finished");
        }
    }

    /// Closes the link. Safe to call repeatedly and from any state; the
    /// state is `closed` when this returns.
    pub fn close(&self) {
        let effects = self.shared.apply(LinkEvent::CloseRequested);
        self.shared.release_detached(&effects);
    }

    /// Closes the link but parks its capture, still running, so the link
    /// that replaces it can lease the same tracks.
    pub fn close_keeping_media(&self) {
        self.shared.resources.lock().keep_media = true;
        self.close();
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("id", &self.shared.id)
            .field("remote_peer_id", &self.shared.remote_peer_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Starts the actor that drives one peer link.
pub fn spawn_link(context: LinkContext, remote_peer_id: impl Into<String>, plan: LinkPlan) -> LinkHandle {
    let remote_peer_id = remote_peer_id.into();
    let (role, stream_type, captures) = match &plan {
        LinkPlan::Viewer { stream_type } => (LinkRole::Viewer, *stream_type, None),
        LinkPlan::Publisher {
            captures,
            stream_type,
            ..
        } => (LinkRole::Publisher, *stream_type, Some(captures.clone())),
    };
    let (state, _) = watch::channel(LinkState::New);
    let shared = Arc::new(LinkShared {
        id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
        machine: Mutex::new(PeerLink::new(remote_peer_id.clone(), role, Some(stream_type))),
        remote_peer_id,
        resources: Mutex::new(LinkResources::default()),
        state,
        events: context.events.clone(),
        captures,
    });
    let (inbox, inbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(shared.clone(), context, plan, inbox_rx));
    LinkHandle { inbox, shared }
}

async fn run_link(
    shared: Arc<LinkShared>,
    context: LinkContext,
    plan: LinkPlan,
    inbox: mpsc::UnboundedReceiver<LinkEvent>,
) {
    let peer_id = shared.remote_peer_id.clone();
    let first = match plan {
        LinkPlan::Viewer { .. } => LinkEvent::Armed,
        LinkPlan::Publisher {
            captures,
            stream_type,
            pre_authorized,
        } => match captures.acquire(stream_type, pre_authorized.as_ref()).await {
            Ok(stream) => {
                if !shared.install_media(stream.clone()) {
                    captures.park(&stream);
                    return;
                }
                LinkEvent::LocalMediaReady
            }
            Err(err) => {
                if !shared.current_state().is_terminal() {
                    let _ = shared.events.send(ClientEvent::CaptureFailed {
                        peer_id: peer_id.clone(),
                        reason: err.reason(),
                    });
                }
                let effects = shared.apply(LinkEvent::CaptureFailed(err));
                shared.release_detached(&effects);
                return;
            }
        },
    };

    let (connection, connection_events) = match context.connector.connect(&peer_id).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(peer_id = %peer_id, error = %err, "failed to create peer connection");
            let effects = shared.apply(LinkEvent::NegotiationFailed(err));
            shared.release_detached(&effects);
            return;
        }
    };
    if !shared.install_connection(connection.clone()) {
        connection.close().await;
        return;
    }

    let actor = LinkActor {
        shared,
        context,
        connection,
        timer: None,
        queue: VecDeque::from([first]),
    };
    actor.run(inbox, connection_events).await;
    debug!(peer_id = %peer_id, "peer link actor finished");
}

struct LinkActor {
    shared: Arc<LinkShared>,
    context: LinkContext,
    connection: Arc<dyn PeerConnection>,
    timer: Option<(u64, Pin<Box<Sleep>>)>,
    queue: VecDeque<LinkEvent>,
}

impl LinkActor {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<LinkEvent>,
        mut connection_events: ConnectionEvents,
    ) {
        let mut state = self.shared.state.subscribe();
        let mut connection_open = true;
        loop {
            self.drain().await;
            if self.shared.current_state().is_terminal() {
                break;
            }

            tokio::select! {
                event = inbox.recv() => match event {
                    Some(event) => self.queue.push_back(event),
                    None => self.queue.push_back(LinkEvent::CloseRequested),
                },
                event = connection_events.recv(), if connection_open => match event {
                    Some(ConnectionEvent::LocalIce(candidate)) => {
                        self.queue.push_back(LinkEvent::LocalIceGathered(candidate));
                    }
                    Some(ConnectionEvent::StateChanged(transport)) => {
                        self.queue.push_back(LinkEvent::TransportChanged(transport));
                    }
                    Some(ConnectionEvent::RemoteTrack(track)) => {
                        let _ = self.shared.events.send(ClientEvent::RemoteTrack {
                            peer_id: self.shared.remote_peer_id.clone(),
                            track,
                        });
                    }
                    None => connection_open = false,
                },
                epoch = fire(&mut self.timer) => {
                    self.queue.push_back(LinkEvent::TimerFired(epoch));
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Applies queued events; outcomes of effects are queued behind them.
    async fn drain(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            let effects = self.shared.apply(event);
            for effect in effects {
                match self.execute(effect).await {
                    Ok(Some(next)) => self.queue.push_back(next),
                    Ok(None) => {}
                    Err(err) => {
                        self.queue.push_back(LinkEvent::NegotiationFailed(err));
                        break;
                    }
                }
            }
        }
    }

    async fn execute(&mut self, effect: LinkEffect) -> Result<Option<LinkEvent>, NegotiationError> {
        match effect {
            LinkEffect::ArmTimer { epoch } => {
                self.timer = Some((epoch, Box::pin(sleep(self.context.negotiation_timeout))));
                Ok(None)
            }
            LinkEffect::DisarmTimer => {
                self.timer = None;
                Ok(None)
            }
            LinkEffect::Release => {
                if let Some(connection) = self.shared.release() {
                    connection.close().await;
                }
                Ok(None)
            }
            _ if self.shared.current_state().is_terminal() => Ok(None),
            LinkEffect::PrepareReceiveOnly => {
                self.connection.prepare_receive_only().await?;
                Ok(None)
            }
            LinkEffect::AttachLocalTracks => {
                let media = self
                    .shared
                    .attach_media()
                    .ok_or_else(|| NegotiationError::Media("no local media".to_string()))?;
                self.connection.attach_tracks(media.tracks()).await?;
                Ok(None)
            }
            LinkEffect::CreateOffer => {
                let offer = self.connection.create_offer().await?;
                Ok(Some(LinkEvent::LocalDescriptionCreated(offer)))
            }
            LinkEffect::CreateAnswer => {
                let answer = self.connection.create_answer().await?;
                Ok(Some(LinkEvent::LocalDescriptionCreated(answer)))
            }
            LinkEffect::ApplyRemoteDescription(description) => {
                self.connection.apply_remote_description(description).await?;
                Ok(Some(LinkEvent::RemoteDescriptionApplied))
            }
            LinkEffect::AddIceCandidates(candidates) => {
                for candidate in candidates {
                    self.connection.add_ice_candidate(candidate).await?;
                }
                Ok(None)
            }
            LinkEffect::EmitSignal(signal) => {
                self.emit(signal);
                Ok(None)
            }
        }
    }

    fn emit(&self, signal: OutboundSignal) {
        let context = &self.context;
        let remote = &self.shared.remote_peer_id;
        let message = match &signal {
            OutboundSignal::Description(description) => {
                let kind = match description.sdp_type {
                    SdpType::Offer => SignalKind::Offer,
                    _ => SignalKind::Answer,
                };
                SignalMessage::new(
                    kind,
                    &context.local_user_id,
                    remote,
                    context.test_id,
                    context.local_role,
                    description,
                )
            }
            OutboundSignal::Ice(candidate) => SignalMessage::new(
                SignalKind::IceCandidate,
                &context.local_user_id,
                remote,
                context.test_id,
                context.local_role,
                candidate,
            ),
        };
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(peer_id = %remote, error = %err, "failed to encode signal");
                return;
            }
        };
        let kind = message.kind;
        // Lost signals surface through the negotiation timeout.
        if let Err(err) = context.signals.send(ClientMessage::Signal(message)) {
            warn!(peer_id = %remote, kind = %kind, error = %err, "dropping outbound signal");
        }
    }
}

async fn fire(timer: &mut Option<(u64, Pin<Box<Sleep>>)>) -> u64 {
    match timer {
        Some((epoch, sleep)) => {
            sleep.as_mut().await;
            let epoch = *epoch;
            *timer = None;
            epoch
        }
        None => std::future::pending().await,
    }
}
