//! Message shapes exchanged between the proctoring relay and its clients.
//!
//! Every WebSocket frame is a JSON envelope `{"event": "...", "payload": {...}}`.
//! Signal payloads (`signal.data`) are kept as raw JSON so the relay can forward
//! them without re-encoding a single byte.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid `{event}` payload: {source}")]
    InvalidPayload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode `{event}`: {source}")]
    Encode {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown {kind} `{value}`")]
    UnknownVariant { kind: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            other => Err(ProtocolError::UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind of capture a teacher asks a student to publish.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    #[default]
    Webcam,
    Screen,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Webcam => "webcam",
            StreamType::Screen => "screen",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webcam" => Ok(StreamType::Webcam),
            "screen" => Ok(StreamType::Screen),
            other => Err(ProtocolError::UnknownVariant {
                kind: "stream type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity triple a client registers with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub user_id: String,
    pub role: Role,
    pub test_id: i64,
}

impl Register {
    pub fn new(user_id: impl Into<String>, role: Role, test_id: i64) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            test_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: Box<RawValue>,
    pub from: String,
    pub to: String,
    pub test_id: i64,
    pub role: Role,
}

impl SignalMessage {
    pub fn new<T: Serialize>(
        kind: SignalKind,
        from: impl Into<String>,
        to: impl Into<String>,
        test_id: i64,
        role: Role,
        data: &T,
    ) -> Result<Self, ProtocolError> {
        let data = serde_json::value::to_raw_value(data).map_err(|source| {
            ProtocolError::Encode {
                event: "signal",
                source,
            }
        })?;
        Ok(Self {
            kind,
            data,
            from: from.into(),
            to: to.into(),
            test_id,
            role,
        })
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(self.data.get()).map_err(|source| ProtocolError::InvalidPayload {
            event: "signal",
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as browsers serialize `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as browsers serialize `RTCIceCandidateInit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartStream {
    pub student_id: String,
    pub teacher_id: String,
    pub test_id: i64,
    #[serde(default)]
    pub stream_type: StreamType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StopStream {
    pub student_id: String,
    pub teacher_id: String,
    pub test_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Registered {
    pub fn accepted(connection_id: impl Into<String>) -> Self {
        Self {
            success: true,
            connection_id: Some(connection_id.into()),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            connection_id: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub teacher_id: String,
    pub test_id: i64,
    #[serde(default)]
    pub stream_type: StreamType,
}

/// Tells a peer that the other side ended the link.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStopped {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorNotice {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Empty {}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Register(Register),
    Signal(SignalMessage),
    StartStream(StartStream),
    StopStream(StopStream),
    Ping,
}

impl ClientMessage {
    pub fn event(&self) -> &'static str {
        match self {
            ClientMessage::Register(_) => "register",
            ClientMessage::Signal(_) => "signal",
            ClientMessage::StartStream(_) => "start-stream",
            ClientMessage::StopStream(_) => "stop-stream",
            ClientMessage::Ping => "ping",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let event = self.event();
        match self {
            ClientMessage::Register(payload) => encode(event, payload),
            ClientMessage::Signal(payload) => encode(event, payload),
            ClientMessage::StartStream(payload) => encode(event, payload),
            ClientMessage::StopStream(payload) => encode(event, payload),
            ClientMessage::Ping => encode(event, &Empty {}),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope<'_> = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let payload = envelope.payload_str();
        match envelope.event.as_str() {
            "register" => decode("register", payload).map(ClientMessage::Register),
            "signal" => decode("signal", payload).map(ClientMessage::Signal),
            "start-stream" => decode("start-stream", payload).map(ClientMessage::StartStream),
            "stop-stream" => decode("stop-stream", payload).map(ClientMessage::StopStream),
            "ping" => Ok(ClientMessage::Ping),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Registered(Registered),
    Signal(SignalMessage),
    StreamRequest(StreamRequest),
    StreamStopped(StreamStopped),
    Pong,
    Error(ErrorNotice),
}

impl ServerMessage {
    pub fn event(&self) -> &'static str {
        match self {
            ServerMessage::Registered(_) => "registered",
            ServerMessage::Signal(_) => "signal",
            ServerMessage::StreamRequest(_) => "stream-request",
            ServerMessage::StreamStopped(_) => "stream-stopped",
            ServerMessage::Pong => "pong",
            ServerMessage::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorNotice {
            message: message.into(),
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let event = self.event();
        match self {
            ServerMessage::Registered(payload) => encode(event, payload),
            ServerMessage::Signal(payload) => encode(event, payload),
            ServerMessage::StreamRequest(payload) => encode(event, payload),
            ServerMessage::StreamStopped(payload) => encode(event, payload),
            ServerMessage::Pong => encode(event, &Empty {}),
            ServerMessage::Error(payload) => encode(event, payload),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope<'_> = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let payload = envelope.payload_str();
        match envelope.event.as_str() {
            "registered" => decode("registered", payload).map(ServerMessage::Registered),
            "signal" => decode("signal", payload).map(ServerMessage::Signal),
            "stream-request" => decode("stream-request", payload).map(ServerMessage::StreamRequest),
            "stream-stopped" => decode("stream-stopped", payload).map(ServerMessage::StreamStopped),
            "pong" => Ok(ServerMessage::Pong),
            "error" => decode("error", payload).map(ServerMessage::Error),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct Envelope<'a> {
    event: String,
    #[serde(borrow, default)]
    payload: Option<&'a RawValue>,
}

impl<'a> Envelope<'a> {
    fn payload_str(&self) -> &'a str {
        self.payload.map(RawValue::get).unwrap_or("{}")
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T: Serialize> {
    event: &'a str,
    payload: &'a T,
}

fn encode<T: Serialize>(event: &'static str, payload: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(&OutgoingEnvelope { event, payload })
        .map_err(|source| ProtocolError::Encode { event, source })
}

fn decode<T: DeserializeOwned>(event: &'static str, payload: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(payload).map_err(|source| ProtocolError::InvalidPayload { event, source })
}
