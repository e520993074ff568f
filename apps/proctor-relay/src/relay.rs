use metrics::counter;
use proctor_protocol::{
    Role, ServerMessage, SignalMessage, StartStream, StopStream, StreamRequest, StreamStopped,
};
use thiserror::Error;
use tracing::debug;

use crate::directory::{ConnectionId, DeliveryError, Session, SessionDirectory};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("no session registered for `{0}`")]
    Undeliverable(String),
    #[error("connection for `{0}` already closed")]
    ConnectionClosed(String),
    #[error("sender claims to be `{claimed}` but registered as `{registered}`")]
    SenderMismatch { claimed: String, registered: String },
    #[error("only teachers may request streams")]
    NotTeacher,
}

impl RelayError {
    fn reason(&self) -> &'static str {
        match self {
            RelayError::Undeliverable(_) => "unregistered",
            RelayError::ConnectionClosed(_) => "closed",
            RelayError::SenderMismatch { .. } => "sender_mismatch",
            RelayError::NotTeacher => "not_teacher",
        }
    }
}

/// Routes signaling and stream control between registered sessions.
///
/// Payloads are never inspected; a message goes to the recipient's current
/// connection only, through that connection's single ordered outbound queue.
#[derive(Clone)]
pub struct SignalingRelay {
    directory: SessionDirectory,
}

impl SignalingRelay {
    pub fn new(directory: SessionDirectory) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn relay(&self, sender: &Session, message: SignalMessage) -> Result<ConnectionId, RelayError> {
        ensure_sender(sender, &message.from)?;
        let to = message.to.clone();
        let kind = message.kind;
        let delivered = self.deliver(&to, ServerMessage::Signal(message));
        if delivered.is_ok() {
            debug!(from = %sender.user_id, %to, kind = %kind, "signal relayed");
        }
        delivered
    }

    /// Turns a teacher's `start-stream` into a `stream-request` for the student.
    pub fn forward_start(&self, sender: &Session, request: StartStream) -> Result<ConnectionId, RelayError> {
        if sender.role != Role::Teacher {
            return self.reject(RelayError::NotTeacher);
        }
        ensure_sender(sender, &request.teacher_id)?;
        self.deliver(
            &request.student_id,
            ServerMessage::StreamRequest(StreamRequest {
                teacher_id: request.teacher_id,
                test_id: request.test_id,
                stream_type: request.stream_type,
            }),
        )
    }

    /// Delivers `stream-stopped` to whichever side of the pair did not send the stop.
    pub fn forward_stop(&self, sender: &Session, stop: StopStream) -> Result<ConnectionId, RelayError> {
        let (claimed, counterpart) = match sender.role {
            Role::Teacher => (&stop.teacher_id, &stop.student_id),
            Role::Student => (&stop.student_id, &stop.teacher_id),
        };
        ensure_sender(sender, claimed)?;
        self.deliver(
            counterpart,
            ServerMessage::StreamStopped(StreamStopped {
                peer_id: Some(sender.user_id.clone()),
                test_id: Some(stop.test_id),
            }),
        )
    }

    fn deliver(&self, to: &str, message: ServerMessage) -> Result<ConnectionId, RelayError> {
        let event = message.event();
        match self.directory.deliver(to, message) {
            Ok(connection_id) => {
                counter!("proctor_relay_forwarded_total", 1, "event" => event);
                Ok(connection_id)
            }
            Err(DeliveryError::NotRegistered) => {
                self.reject(RelayError::Undeliverable(to.to_string()))
            }
            Err(DeliveryError::ConnectionClosed) => {
                self.reject(RelayError::ConnectionClosed(to.to_string()))
            }
        }
    }

    fn reject<T>(&self, err: RelayError) -> Result<T, RelayError> {
        counter!("proctor_relay_dropped_total", 1, "reason" => err.reason());
        Err(err)
    }
}

fn ensure_sender(sender: &Session, claimed: &str) -> Result<(), RelayError> {
    if sender.user_id == claimed {
        return Ok(());
    }
    let err = RelayError::SenderMismatch {
        claimed: claimed.to_string(),
        registered: sender.user_id.clone(),
    };
    counter!("proctor_relay_dropped_total", 1, "reason" => err.reason());
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Outbound;
    use proctor_protocol::{Register, SessionDescription, SignalKind, StreamType};
    use tokio::sync::mpsc;

    struct Peer {
        session: Session,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn register(directory: &SessionDirectory, user: &str, role: Role, test_id: i64) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();
        directory.register(&Register::new(user, role, test_id), connection, tx);
        Peer {
            session: directory.session_for(connection).unwrap(),
            rx,
        }
    }

    fn offer(from: &str, to: &str) -> SignalMessage {
        SignalMessage::new(
            SignalKind::Offer,
            from,
            to,
            1,
            Role::Student,
            &SessionDescription::offer("v=0"),
        )
        .unwrap()
    }

    #[test]
    fn signal_reaches_only_the_addressed_peer() {
        let directory = SessionDirectory::new();
        let relay = SignalingRelay::new(directory.clone());
        let student = register(&directory, "s-1", Role::Student, 1);
        let mut teacher = register(&directory, "t-1", Role::Teacher, 1);
        let mut bystander = register(&directory, "t-2", Role::Teacher, 1);

        relay.relay(&student.session, offer("s-1", "t-1")).unwrap();

        match teacher.rx.try_recv().unwrap() {
            Outbound::Message(ServerMessage::Signal(signal)) => {
                assert_eq!(signal.from, "s-1");
                assert_eq!(signal.kind, SignalKind::Offer);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(bystander.rx.try_recv().is_err());
    }

    #[test]
    fn signal_to_unregistered_peer_is_undeliverable() {
        let directory = SessionDirectory::new();
        let relay = SignalingRelay::new(directory.clone());
        let student = register(&directory, "s-1", Role::Student, 1);

        let err = relay.relay(&student.session, offer("s-1", "nobody")).unwrap_err();

        assert_eq!(err, RelayError::Undeliverable("nobody".into()));
    }

    #[test]
    fn spoofed_sender_is_rejected() {
        let directory = SessionDirectory::new();
        let relay = SignalingRelay::new(directory.clone());
        let student = register(&directory, "s-1", Role::Student, 1);
        let mut teacher = register(&directory, "t-1", Role::Teacher, 1);

        let err = relay.relay(&student.session, offer("s-9", "t-1")).unwrap_err();

        assert!(matches!(err, RelayError::SenderMismatch { .. }));
        assert!(teacher.rx.try_recv().is_err());
    }

    #[test]
    fn start_stream_becomes_stream_request() {
        let directory = SessionDirectory::new();
        let relay = SignalingRelay::new(directory.clone());
        let mut student = register(&directory, "s-1", Role::Student, 5);
        let teacher = register(&directory, "t-1", Role::Teacher, 5);

        relay
            .forward_start(
                &teacher.session,
                StartStream {
                    student_id: "s-1".into(),
                    teacher_id: "t-1".into(),
                    test_id: 5,
                    stream_type: StreamType::Screen,
                },
            )
            .unwrap();

        match student.rx.try_recv().unwrap() {
            Outbound::Message(ServerMessage::StreamRequest(request)) => {
                assert_eq!(request.teacher_id, "t-1");
                assert_eq!(request.stream_type, StreamType::Screen);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn students_cannot_request_streams() {
        let directory = SessionDirectory::new();
        let relay = SignalingRelay::new(directory.clone());
        let student = register(&directory, "s-1", Role::Student, 5);
        let _other = register(&directory, "s-2", Role::Student, 5);

        let err = relay
            .forward_start(
                &student.session,
                StartStream {
                    student_id: "s-2".into(),
                    teacher_id: "s-1".into(),
                    test_id: 5,
                    stream_type: StreamType::Webcam,
                },
            )
            .unwrap_err();

        assert_eq!(err, RelayError::NotTeacher);
    }

    #[test]
    fn stop_is_delivered_to_the_counterpart() {
        let directory = SessionDirectory::new();
        let relay = SignalingRelay::new(directory.clone());
        let student = register(&directory, "s-1", Role::Student, 5);
        let mut teacher = register(&directory, "t-1", Role::Teacher, 5);
        let stop = StopStream {
            student_id: "s-1".into(),
            teacher_id: "t-1".into(),
            test_id: 5,
        };

        relay.forward_stop(&student.session, stop).unwrap();

        match teacher.rx.try_recv().unwrap() {
            Outbound::Message(ServerMessage::StreamStopped(stopped)) => {
                assert_eq!(stopped.peer_id.as_deref(), Some("s-1"));
                assert_eq!(stopped.test_id, Some(5));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
