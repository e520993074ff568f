//! Client core for proctored test streaming.
//!
//! A [`TeacherSession`] asks a student to stream and receives the media; a
//! [`StudentSession`] captures, validates and offers it. Both talk to the
//! relay through a reconnecting [`SignalingClient`] and keep one
//! [`link::LinkHandle`] per remote peer.

pub mod capture;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod link;
pub mod mock;
pub mod orchestrator;
pub mod publisher;
pub mod reconnect;
pub mod rtc;
pub mod signaling;

pub use capture::{CaptureManager, CapturedStream, MediaDevices, MediaTrack, SurfaceKind};
pub use client::{start_student, start_teacher, ClientRuntime};
pub use config::StreamConfig;
pub use connection::{PeerConnection, PeerConnector};
pub use error::{CaptureError, NegotiationError, StreamError, TransportError};
pub use events::ClientEvent;
pub use link::{LinkHandle, LinkState};
pub use orchestrator::TeacherSession;
pub use publisher::StudentSession;
pub use reconnect::{Backoff, Connectivity, ReconnectPolicy};
pub use rtc::RtcConnector;
pub use signaling::{SignalingClient, SignalingHandle};
