//! Student side: answers stream requests by capturing and offering.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proctor_protocol::{ClientMessage, Role, ServerMessage, StopStream, StreamType};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::{CaptureManager, CapturedStream};
use crate::connection::PeerConnector;
use crate::error::StreamError;
use crate::events::ClientEvent;
use crate::link::{spawn_link, LinkContext, LinkHandle, LinkPlan, LinkState, PeerLinkTable};
use crate::signaling::SignalSink;

pub struct StudentSession {
    context: LinkContext,
    captures: Arc<CaptureManager>,
    pre_authorized: Mutex<Vec<CapturedStream>>,
    links: PeerLinkTable,
}

impl StudentSession {
    pub fn new(
        student_id: impl Into<String>,
        test_id: i64,
        connector: Arc<dyn PeerConnector>,
        signals: Arc<dyn SignalSink>,
        captures: Arc<CaptureManager>,
        events: mpsc::UnboundedSender<ClientEvent>,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            context: LinkContext {
                local_user_id: student_id.into(),
                local_role: Role::Student,
                test_id,
                connector,
                signals,
                events,
                negotiation_timeout,
            },
            captures,
            pre_authorized: Mutex::new(Vec::new()),
            links: PeerLinkTable::new(),
        }
    }

    pub fn student_id(&self) -> &str {
        &self.context.local_user_id
    }

    /// Registers a stream the student already granted, e.g. during the
    /// pre-exam check. Its tracks are never stopped here.
    pub fn set_pre_authorized(&self, stream: CapturedStream) {
        let mut streams = self.pre_authorized.lock();
        streams.retain(|existing| existing.stream_type() != stream.stream_type());
        streams.push(stream);
    }

    pub fn clear_pre_authorized(&self, stream_type: StreamType) {
        self.pre_authorized
            .lock()
            .retain(|stream| stream.stream_type() != stream_type);
    }

    /// Starts publishing to `teacher_id`, replacing any earlier link to them.
    ///
    /// The earlier link is closed before capturing. When it carried the same
    /// stream type its capture is parked, so the new link reuses it instead
    /// of prompting again.
    pub fn start_stream(&self, teacher_id: &str, stream_type: StreamType) -> LinkHandle {
        if let Some(previous) = self.links.take(teacher_id) {
            if previous.stream_type() == Some(stream_type) {
                debug!(teacher_id, "handing capture over to the new link");
                previous.close_keeping_media();
            } else {
                previous.close();
            }
        }
        let pre_authorized = self
            .pre_authorized
            .lock()
            .iter()
            .find(|stream| stream.stream_type() == stream_type)
            .cloned();
        let link = spawn_link(
            self.context.clone(),
            teacher_id,
            LinkPlan::Publisher {
                captures: self.captures.clone(),
                stream_type,
                pre_authorized,
            },
        );
        self.links.replace(link.clone());
        info!(teacher_id, stream_type = %stream_type, "starting stream");
        link
    }

    /// Ends the stream to `teacher_id` from this side, e.g. when the student
    /// stops sharing.
    pub fn end_stream(&self, teacher_id: &str) -> Result<(), StreamError> {
        self.links.remove(teacher_id);
        self.context
            .signals
            .send(ClientMessage::StopStream(StopStream {
                student_id: self.context.local_user_id.clone(),
                teacher_id: teacher_id.to_string(),
                test_id: self.context.test_id,
            }))?;
        info!(teacher_id, "ended stream");
        Ok(())
    }

    pub fn handle_server_message(&self, message: &ServerMessage) {
        match message {
            ServerMessage::StreamRequest(request) => {
                if request.test_id != self.context.test_id {
                    warn!(
                        teacher_id = %request.teacher_id,
                        requested = request.test_id,
                        current = self.context.test_id,
                        "ignoring stream request for another test"
                    );
                    return;
                }
                self.start_stream(&request.teacher_id, request.stream_type);
            }
            ServerMessage::Signal(signal) => {
                if signal.to != self.context.local_user_id {
                    debug!(to = %signal.to, "ignoring signal addressed elsewhere");
                    return;
                }
                match self.links.get(&signal.from) {
                    Some(link) => link.deliver_signal(signal),
                    None => debug!(from = %signal.from, kind = %signal.kind, "no link for signal"),
                }
            }
            ServerMessage::StreamStopped(stopped) => match &stopped.peer_id {
                Some(teacher_id) => {
                    if self.links.remove(teacher_id) {
                        info!(teacher_id = %teacher_id, "teacher stopped viewing");
                    }
                }
                None => self.links.close_all(),
            },
            ServerMessage::Registered(_) | ServerMessage::Pong | ServerMessage::Error(_) => {}
        }
    }

    pub fn handle_disconnect(&self) {
        self.links.close_all();
    }

    /// Closes every link and stops every capture this session started.
    pub fn shutdown(&self) {
        self.links.close_all();
        self.captures.release_all();
    }

    pub fn link(&self, teacher_id: &str) -> Option<LinkHandle> {
        self.links.get(teacher_id)
    }

    pub fn link_state(&self, teacher_id: &str) -> Option<LinkState> {
        self.link(teacher_id).map(|link| link.state())
    }

    pub fn links(&self) -> &PeerLinkTable {
        &self.links
    }

    pub fn captures(&self) -> &Arc<CaptureManager> {
        &self.captures
    }
}
