//! Wires a signaling connection to a teacher or student session.

use std::sync::Arc;

use proctor_protocol::{Register, Role, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{CaptureManager, MediaDevices};
use crate::config::StreamConfig;
use crate::connection::PeerConnector;
use crate::events::ClientEvent;
use crate::orchestrator::TeacherSession;
use crate::publisher::StudentSession;
use crate::signaling::{SignalingClient, SignalingEvent, SignalingHandle};

/// What the dispatcher needs from a session.
pub trait SessionRole: Send + Sync + 'static {
    fn handle_server_message(&self, message: &ServerMessage);
    fn handle_disconnect(&self);
    fn shutdown(&self) {
        self.handle_disconnect();
    }
}

impl SessionRole for TeacherSession {
    fn handle_server_message(&self, message: &ServerMessage) {
        TeacherSession::handle_server_message(self, message);
    }

    fn handle_disconnect(&self) {
        TeacherSession::handle_disconnect(self);
    }
}

impl SessionRole for StudentSession {
    fn handle_server_message(&self, message: &ServerMessage) {
        StudentSession::handle_server_message(self, message);
    }

    fn handle_disconnect(&self) {
        StudentSession::handle_disconnect(self);
    }

    fn shutdown(&self) {
        StudentSession::shutdown(self);
    }
}

pub struct ClientRuntime<S> {
    pub session: Arc<S>,
    pub signaling: SignalingHandle,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    supervisor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl<S: SessionRole> ClientRuntime<S> {
    /// Stops signaling and closes every link.
    pub async fn shutdown(self) {
        self.signaling.shutdown();
        let _ = self.supervisor.await;
        self.dispatcher.abort();
        self.session.shutdown();
    }
}

pub fn start_teacher(
    config: &StreamConfig,
    teacher_id: &str,
    test_id: i64,
    connector: Arc<dyn PeerConnector>,
) -> ClientRuntime<TeacherSession> {
    start(config, teacher_id, Role::Teacher, test_id, |signaling, events| {
        TeacherSession::new(
            teacher_id,
            test_id,
            connector,
            Arc::new(signaling),
            events,
            config.negotiation_timeout,
        )
    })
}

pub fn start_student(
    config: &StreamConfig,
    student_id: &str,
    test_id: i64,
    connector: Arc<dyn PeerConnector>,
    devices: Arc<dyn MediaDevices>,
) -> ClientRuntime<StudentSession> {
    start(config, student_id, Role::Student, test_id, |signaling, events| {
        StudentSession::new(
            student_id,
            test_id,
            connector,
            Arc::new(signaling),
            Arc::new(CaptureManager::new(devices)),
            events,
            config.negotiation_timeout,
        )
    })
}

fn start<S, F>(config: &StreamConfig, user_id: &str, role: Role, test_id: i64, build: F) -> ClientRuntime<S>
where
    S: SessionRole,
    F: FnOnce(SignalingHandle, mpsc::UnboundedSender<ClientEvent>) -> S,
{
    let (signaling, signaling_events, supervisor) =
        SignalingClient::new(config.signaling_url.clone(), Register::new(user_id, role, test_id))
            .with_policy(config.reconnect.clone())
            .with_heartbeat(config.heartbeat_interval)
            .spawn();
    let (events_tx, events) = mpsc::unbounded_channel();
    let session = Arc::new(build(signaling.clone(), events_tx.clone()));
    let dispatcher = tokio::spawn(dispatch(session.clone(), signaling_events, events_tx));
    ClientRuntime {
        session,
        signaling,
        events,
        supervisor,
        dispatcher,
    }
}

async fn dispatch<S: SessionRole>(
    session: Arc<S>,
    mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    while let Some(event) = signaling.recv().await {
        match event {
            SignalingEvent::Connected => debug!("signaling socket open, awaiting registration"),
            SignalingEvent::Registered(ack) => {
                let event = if ack.success {
                    info!(connection_id = ?ack.connection_id, "registered with relay");
                    ClientEvent::Registered {
                        connection_id: ack.connection_id,
                    }
                } else {
                    let reason = ack.reason.unwrap_or_else(|| "registration rejected".to_string());
                    warn!(reason = %reason, "relay rejected registration");
                    ClientEvent::RegistrationRejected { reason }
                };
                let _ = events.send(event);
            }
            SignalingEvent::Message(ServerMessage::Error(notice)) => {
                warn!(message = %notice.message, "relay reported an error");
                let _ = events.send(ClientEvent::RelayError {
                    message: notice.message,
                });
            }
            SignalingEvent::Message(message) => session.handle_server_message(&message),
            SignalingEvent::Disconnected { reason } => {
                session.handle_disconnect();
                let _ = events.send(ClientEvent::SignalingLost { reason });
            }
        }
    }
}
