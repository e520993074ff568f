//! WebSocket connection to the relay, with registration, heartbeat and
//! reconnection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use proctor_protocol::{ClientMessage, Register, Registered, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::reconnect::{Backoff, Connectivity, ReconnectPolicy};

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Where peer links send their outbound messages.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// A socket is open and `register` has been sent on it.
    Connected,
    Registered(Registered),
    Message(ServerMessage),
    Disconnected { reason: String },
}

type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>>;

/// Cloneable handle onto a running [`SignalingClient`].
#[derive(Clone)]
pub struct SignalingHandle {
    identity: Register,
    outbound: OutboundSlot,
    connectivity: watch::Receiver<Connectivity>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SignalingHandle {
    pub fn identity(&self) -> &Register {
        &self.identity
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.clone()
    }

    pub fn status(&self) -> Connectivity {
        self.connectivity.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Stops reconnecting and closes the current socket.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl SignalSink for SignalingHandle {
    /// Queues `message` on the current socket. Nothing is buffered across
    /// reconnects: while disconnected this fails with `NotConnected`.
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let outbound = self.outbound.lock();
        let Some(sender) = outbound.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        sender
            .send(message)
            .map_err(|_| TransportError::NotConnected)
    }
}

pub struct SignalingClient {
    url: String,
    identity: Register,
    policy: ReconnectPolicy,
    heartbeat: Duration,
}

impl SignalingClient {
    pub fn new(url: impl Into<String>, identity: Register) -> Self {
        Self {
            url: url.into(),
            identity,
            policy: ReconnectPolicy::default(),
            heartbeat: Duration::from_secs(25),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Starts the connection supervisor. It runs until [`SignalingHandle::shutdown`]
    /// is called or every handle has been dropped.
    pub fn spawn(
        self,
    ) -> (
        SignalingHandle,
        mpsc::UnboundedReceiver<SignalingEvent>,
        JoinHandle<()>,
    ) {
        let outbound: OutboundSlot = Arc::new(Mutex::new(None));
        let (connectivity_tx, connectivity_rx) = watch::channel(Connectivity::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = SignalingHandle {
            identity: self.identity.clone(),
            outbound: outbound.clone(),
            connectivity: connectivity_rx,
            shutdown: Arc::new(shutdown_tx),
        };
        let supervisor = Supervisor {
            url: self.url,
            identity: self.identity,
            backoff: Backoff::new(self.policy),
            heartbeat: self.heartbeat.max(MIN_HEARTBEAT),
            outbound,
            connectivity: connectivity_tx,
            shutdown: shutdown_rx,
            events: events_tx,
        };
        let task = tokio::spawn(supervisor.run());
        (handle, events_rx, task)
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Supervisor {
    url: String,
    identity: Register,
    backoff: Backoff,
    heartbeat: Duration,
    outbound: OutboundSlot,
    connectivity: watch::Sender<Connectivity>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let attempt = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            };

            match attempt {
                Ok((socket, _)) => {
                    self.backoff.reset();
                    self.connectivity.send_replace(Connectivity::Connected);
                    info!(url = %self.url, user_id = %self.identity.user_id, "signaling connected");

                    let end = self.run_session(socket).await;
                    self.outbound.lock().take();
                    let reason = match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => reason,
                    };
                    warn!(url = %self.url, reason = %reason, "signaling connection lost");
                    let _ = self.events.send(SignalingEvent::Disconnected { reason });
                }
                Err(err) => {
                    debug!(url = %self.url, error = %err, "signaling connect failed");
                }
            }

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            let status = if self.backoff.is_degraded() {
                Connectivity::Degraded { attempt }
            } else {
                Connectivity::Reconnecting { attempt, delay }
            };
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to signaling relay");
            self.connectivity.send_replace(status);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            }
        }

        self.outbound.lock().take();
        self.connectivity.send_replace(Connectivity::Stopped);
        debug!(url = %self.url, "signaling supervisor stopped");
    }

    async fn run_session(&mut self, socket: Socket) -> SessionEnd {
        let (mut write, mut read) = socket.split();

        let register = match ClientMessage::Register(self.identity.clone()).to_json() {
            Ok(text) => text,
            Err(err) => return SessionEnd::Lost(err.to_string()),
        };
        if let Err(err) = write.send(Message::Text(register)).await {
            return SessionEnd::Lost(err.to_string());
        }

        // Only now may peer links write; anything they queued against an
        // earlier socket died with that socket's channel.
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        *self.outbound.lock() = Some(tx);
        let _ = self.events.send(SignalingEvent::Connected);

        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                outbound = rx.recv() => {
                    let Some(message) = outbound else {
                        return SessionEnd::Lost("outbound channel closed".to_string());
                    };
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(event = message.event(), error = %err, "failed to encode message");
                            continue;
                        }
                    };
                    if let Err(err) = write.send(Message::Text(text)).await {
                        return SessionEnd::Lost(err.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    let Ok(ping) = ClientMessage::Ping.to_json() else { continue };
                    if let Err(err) = write.send(Message::Text(ping)).await {
                        return SessionEnd::Lost(err.to_string());
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.handle_frame(&text),
                        Err(_) => warn!("ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "relay closed the connection".to_string());
                        return SessionEnd::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                    None => return SessionEnd::Lost("relay closed the connection".to_string()),
                },
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let message = match ServerMessage::from_json(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring malformed relay message");
                return;
            }
        };
        trace!(event = message.event(), "relay message");
        let event = match message {
            ServerMessage::Pong => return,
            ServerMessage::Registered(ack) => SignalingEvent::Registered(ack),
            other => SignalingEvent::Message(other),
        };
        let _ = self.events.send(event);
    }
}

/// Resolves once shutdown is requested or every handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_protocol::Role;

    #[tokio::test]
    async fn sending_while_disconnected_fails_instead_of_buffering() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            degraded_after: 2,
        };
        // Nothing listens on port 9 of localhost.
        let (handle, _events, task) =
            SignalingClient::new("ws://127.0.0.1:9/ws", Register::new("student-1", Role::Student, 1))
                .with_policy(policy)
                .spawn();

        let err = handle.send(ClientMessage::Ping).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));

        let mut connectivity = handle.connectivity();
        tokio::time::timeout(
            Duration::from_secs(5),
            connectivity.wait_for(|status| matches!(status, Connectivity::Degraded { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(handle.status(), Connectivity::Stopped);
    }
}
