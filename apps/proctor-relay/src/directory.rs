use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use proctor_protocol::{Register, Role, ServerMessage};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frames queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Close(String),
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    pub test_id: i64,
    pub connection_id: ConnectionId,
    pub registered_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// Same connection re-sent the identity it is already bound to.
    Unchanged,
    /// The user was bound to another connection, which stops receiving traffic.
    Superseded { previous: ConnectionId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    NotRegistered,
    ConnectionClosed,
}

/// Routing handle for one registered session.
#[derive(Clone)]
pub struct Route {
    pub connection_id: ConnectionId,
    pub role: Role,
    pub test_id: i64,
    sender: OutboundSender,
}

impl Route {
    pub fn send(&self, message: ServerMessage) -> Result<(), DeliveryError> {
        self.sender
            .send(Outbound::Message(message))
            .map_err(|_| DeliveryError::ConnectionClosed)
    }
}

struct SessionEntry {
    session: Session,
    sender: OutboundSender,
    last_activity: AtomicU64,
}

impl SessionEntry {
    fn route(&self) -> Route {
        Route {
            connection_id: self.session.connection_id,
            role: self.session.role,
            test_id: self.session.test_id,
            sender: self.sender.clone(),
        }
    }

    fn matches(&self, identity: &Register, connection_id: ConnectionId) -> bool {
        self.session.connection_id == connection_id
            && self.session.user_id == identity.user_id
            && self.session.role == identity.role
            && self.session.test_id == identity.test_id
    }
}

/// Maps user ids to the connection currently registered for them.
///
/// Every mutation is keyed by connection id and issued from that connection's
/// own task, so per-connection ordering comes for free; cross-connection races
/// on the same user are settled by the map's per-key locking.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    inner: Arc<DirectoryInner>,
}

#[derive(Default)]
struct DirectoryInner {
    by_user: DashMap<String, Arc<SessionEntry>>,
    by_connection: DashMap<ConnectionId, String>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        identity: &Register,
        connection_id: ConnectionId,
        sender: OutboundSender,
    ) -> Registration {
        let bound_user = self
            .inner
            .by_connection
            .get(&connection_id)
            .map(|entry| entry.value().clone());

        if let Some(bound_user) = bound_user {
            if bound_user == identity.user_id {
                if let Some(entry) = self.inner.by_user.get(&bound_user) {
                    if entry.matches(identity, connection_id) {
                        entry.last_activity.store(now_millis(), Ordering::Relaxed);
                        return Registration::Unchanged;
                    }
                }
            } else {
                self.inner
                    .by_user
                    .remove_if(&bound_user, |_, entry| {
                        entry.session.connection_id == connection_id
                    });
            }
        }

        let entry = Arc::new(SessionEntry {
            session: Session {
                user_id: identity.user_id.clone(),
                role: identity.role,
                test_id: identity.test_id,
                connection_id,
                registered_at: OffsetDateTime::now_utc(),
            },
            sender,
            last_activity: AtomicU64::new(now_millis()),
        });

        let previous = self.inner.by_user.insert(identity.user_id.clone(), entry);
        self.inner
            .by_connection
            .insert(connection_id, identity.user_id.clone());

        match previous {
            Some(previous) if previous.session.connection_id != connection_id => {
                let previous_id = previous.session.connection_id;
                self.inner
                    .by_connection
                    .remove_if(&previous_id, |_, user| user == &identity.user_id);
                Registration::Superseded {
                    previous: previous_id,
                }
            }
            _ => Registration::Created,
        }
    }

    pub fn lookup(&self, user_id: &str) -> Option<Route> {
        self.inner.by_user.get(user_id).map(|entry| entry.route())
    }

    pub fn deliver(&self, user_id: &str, message: ServerMessage) -> Result<ConnectionId, DeliveryError> {
        let route = self.lookup(user_id).ok_or(DeliveryError::NotRegistered)?;
        route.send(message)?;
        Ok(route.connection_id)
    }

    /// Session bound to `connection_id`, if that connection still owns it.
    pub fn session_for(&self, connection_id: ConnectionId) -> Option<Session> {
        let user_id = self
            .inner
            .by_connection
            .get(&connection_id)
            .map(|entry| entry.value().clone())?;
        self.inner
            .by_user
            .get(&user_id)
            .filter(|entry| entry.session.connection_id == connection_id)
            .map(|entry| entry.session.clone())
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Session> {
        let (_, user_id) = self.inner.by_connection.remove(&connection_id)?;
        self.inner
            .by_user
            .remove_if(&user_id, |_, entry| entry.session.connection_id == connection_id)
            .map(|(_, entry)| entry.session.clone())
    }

    pub fn touch(&self, connection_id: ConnectionId) {
        let Some(user_id) = self
            .inner
            .by_connection
            .get(&connection_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        if let Some(entry) = self.inner.by_user.get(&user_id) {
            if entry.session.connection_id == connection_id {
                entry.last_activity.store(now_millis(), Ordering::Relaxed);
            }
        }
    }

    /// Connections whose last activity is older than `timeout`.
    pub fn idle_connections(&self, now: u64, timeout: Duration) -> Vec<(ConnectionId, OutboundSender)> {
        let timeout_ms = timeout.as_millis() as u64;
        self.inner
            .by_user
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)) > timeout_ms
            })
            .map(|entry| (entry.session.connection_id, entry.sender.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .by_user
            .iter()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.test_id.cmp(&b.test_id).then_with(|| a.user_id.cmp(&b.user_id)));
        sessions
    }

    /// Asks idle connections to close; their connection tasks unregister them.
    pub fn force_close_idle(&self, now: u64, timeout: Duration) -> usize {
        let idle = self.idle_connections(now, timeout);
        for (connection_id, sender) in &idle {
            info!(connection_id = %connection_id, "closing idle session");
            if sender
                .send(Outbound::Close("idle timeout".to_string()))
                .is_err()
            {
                debug!(connection_id = %connection_id, "writer already gone; unregistering");
                self.unregister(*connection_id);
            }
        }
        idle.len()
    }

    pub fn spawn_recycler(&self, idle_timeout: Duration, every: Duration) -> JoinHandle<()> {
        let directory = self.clone();
        let mut interval = tokio::time::interval(every);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                directory.force_close_idle(now_millis(), idle_timeout);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.by_user.is_empty()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
