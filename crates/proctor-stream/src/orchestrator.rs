//! Teacher side: asks students to stream and watches the result.

use std::sync::Arc;
use std::time::Duration;

use proctor_protocol::{ClientMessage, Role, ServerMessage, StartStream, StopStream, StreamType};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::PeerConnector;
use crate::error::StreamError;
use crate::events::ClientEvent;
use crate::link::{spawn_link, LinkContext, LinkHandle, LinkPlan, LinkState, PeerLinkTable};
use crate::signaling::SignalSink;

pub struct TeacherSession {
    context: LinkContext,
    links: PeerLinkTable,
}

impl TeacherSession {
    pub fn new(
        teacher_id: impl Into<String>,
        test_id: i64,
        connector: Arc<dyn PeerConnector>,
        signals: Arc<dyn SignalSink>,
        events: mpsc::UnboundedSender<ClientEvent>,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            context: LinkContext {
                local_user_id: teacher_id.into(),
                local_role: Role::Teacher,
                test_id,
                connector,
                signals,
                events,
                negotiation_timeout,
            },
            links: PeerLinkTable::new(),
        }
    }

    pub fn teacher_id(&self) -> &str {
        &self.context.local_user_id
    }

    pub fn test_id(&self) -> i64 {
        self.context.test_id
    }

    /// Arms a fresh receive-only link to `student_id`, closing any earlier
    /// one, and asks the student to start streaming.
    ///
    /// Delivery is not confirmed: if the student never answers, the link
    /// fails when the negotiation window runs out.
    pub fn request_stream(
        &self,
        student_id: &str,
        stream_type: StreamType,
    ) -> Result<LinkHandle, StreamError> {
        let link = spawn_link(
            self.context.clone(),
            student_id,
            LinkPlan::Viewer { stream_type },
        );
        self.links.replace(link.clone());

        let request = ClientMessage::StartStream(StartStream {
            student_id: student_id.to_string(),
            teacher_id: self.context.local_user_id.clone(),
            test_id: self.context.test_id,
            stream_type,
        });
        if let Err(err) = self.context.signals.send(request) {
            self.links.remove(student_id);
            return Err(err.into());
        }
        info!(
            student_id,
            stream_type = %stream_type,
            test_id = self.context.test_id,
            "requested stream"
        );
        Ok(link)
    }

    /// Closes the local link and tells the student to stop.
    pub fn stop_viewing_stream(&self, student_id: &str) -> Result<(), StreamError> {
        self.links.remove(student_id);
        self.context
            .signals
            .send(ClientMessage::StopStream(StopStream {
                student_id: student_id.to_string(),
                teacher_id: self.context.local_user_id.clone(),
                test_id: self.context.test_id,
            }))?;
        info!(student_id, "stopped viewing stream");
        Ok(())
    }

    pub fn handle_server_message(&self, message: &ServerMessage) {
        match message {
            ServerMessage::Signal(signal) => {
                if signal.to != self.context.local_user_id {
                    debug!(to = %signal.to, "ignoring signal addressed elsewhere");
                    return;
                }
                match self.links.get(&signal.from) {
                    Some(link) => link.deliver_signal(signal),
                    None => debug!(
                        from = %signal.from,
                        kind = %signal.kind,
                        "no armed link for signal"
                    ),
                }
            }
            ServerMessage::StreamStopped(stopped) => match &stopped.peer_id {
                Some(student_id) => {
                    if self.links.remove(student_id) {
                        info!(student_id = %student_id, "student stopped streaming");
                    }
                }
                None => self.links.close_all(),
            },
            ServerMessage::StreamRequest(request) => {
                debug!(teacher_id = %request.teacher_id, "teachers do not serve stream requests");
            }
            ServerMessage::Registered(_) | ServerMessage::Pong | ServerMessage::Error(_) => {}
        }
    }

    /// Broken links are not resumed after the relay comes back.
    pub fn handle_disconnect(&self) {
        self.links.close_all();
    }

    pub fn link(&self, student_id: &str) -> Option<LinkHandle> {
        self.links.get(student_id)
    }

    pub fn link_state(&self, student_id: &str) -> Option<LinkState> {
        self.link(student_id).map(|link| link.state())
    }

    pub fn links(&self) -> &PeerLinkTable {
        &self.links
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, RecordingSink};
    use proctor_protocol::{SessionDescription, SignalKind, SignalMessage, StreamStopped};

    fn session() -> (TeacherSession, Arc<MockConnector>, Arc<RecordingSink>) {
        let connector = Arc::new(MockConnector::auto_connect());
        let sink = Arc::new(RecordingSink::new());
        let (events, _) = mpsc::unbounded_channel();
        let session = TeacherSession::new(
            "teacher-1",
            42,
            connector.clone(),
            sink.clone(),
            events,
            Duration::from_secs(30),
        );
        (session, connector, sink)
    }

    #[tokio::test]
    async fn request_stream_arms_a_link_and_sends_start_stream() {
        let (session, _, sink) = session();

        let link = session.request_stream("student-1", StreamType::Screen).unwrap();

        assert_eq!(link.stream_type(), Some(StreamType::Screen));
        match &sink.sent()[..] {
            [ClientMessage::StartStream(start)] => {
                assert_eq!(start.student_id, "student-1");
                assert_eq!(start.teacher_id, "teacher-1");
                assert_eq!(start.test_id, 42);
                assert_eq!(start.stream_type, StreamType::Screen);
            }
            other => panic!("unexpected messages {other:?}"),
        }
    }

    #[tokio::test]
    async fn requesting_again_replaces_the_failed_link() {
        let (session, _, _) = session();
        let first = session.request_stream("student-1", StreamType::Webcam).unwrap();
        first.close();
        assert_eq!(session.link_state("student-1"), None);

        let second = session.request_stream("student-1", StreamType::Webcam).unwrap();

        assert_eq!(second.state(), LinkState::New);
        assert_eq!(session.links().peers(), vec!["student-1".to_string()]);
    }

    #[tokio::test]
    async fn request_while_disconnected_leaves_no_link() {
        let (session, _, sink) = session();
        sink.set_connected(false);

        let err = session.request_stream("student-1", StreamType::Webcam).unwrap_err();

        assert!(matches!(err, StreamError::Transport(_)));
        assert!(session.links().is_empty());
    }

    #[tokio::test]
    async fn offer_from_student_is_answered() {
        let (session, connector, sink) = session();
        let link = session.request_stream("student-1", StreamType::Webcam).unwrap();

        let offer = SignalMessage::new(
            SignalKind::Offer,
            "student-1",
            "teacher-1",
            42,
            Role::Student,
            &SessionDescription::offer("v=0\r\n"),
        )
        .unwrap();
        session.handle_server_message(&ServerMessage::Signal(offer));

        tokio::time::timeout(Duration::from_secs(2), link.wait_for(|state| state == LinkState::Connected))
            .await
            .unwrap();
        assert_eq!(connector.connections_to("student-1").len(), 1);
        assert!(sink.sent().iter().any(|message| matches!(
            message,
            ClientMessage::Signal(signal) if signal.kind == SignalKind::Answer
        )));
    }

    #[tokio::test]
    async fn stop_viewing_closes_and_notifies() {
        let (session, _, sink) = session();
        let link = session.request_stream("student-1", StreamType::Webcam).unwrap();

        session.stop_viewing_stream("student-1").unwrap();

        assert_eq!(link.state(), LinkState::Closed);
        assert!(matches!(sink.sent().last(), Some(ClientMessage::StopStream(stop)) if stop.student_id == "student-1"));
    }

    #[tokio::test]
    async fn stream_stopped_from_student_closes_only_that_link() {
        let (session, _, _) = session();
        let first = session.request_stream("student-1", StreamType::Webcam).unwrap();
        let second = session.request_stream("student-2", StreamType::Webcam).unwrap();

        session.handle_server_message(&ServerMessage::StreamStopped(StreamStopped {
            peer_id: Some("student-1".to_string()),
            test_id: Some(42),
        }));

        assert_eq!(first.state(), LinkState::Closed);
        assert_ne!(second.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn disconnect_closes_every_link() {
        let (session, _, _) = session();
        let links: Vec<_> = ["student-1", "student-2"]
            .iter()
            .map(|student| session.request_stream(student, StreamType::Webcam).unwrap())
            .collect();

        session.handle_disconnect();

        assert!(links.iter().all(|link| link.state() == LinkState::Closed));
        assert!(session.links().is_empty());
    }
}
