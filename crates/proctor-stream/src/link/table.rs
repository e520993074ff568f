use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::link::actor::LinkHandle;

/// Per-client registry holding at most one live link per remote peer.
///
/// Links are closed outside the lock. A link that fails is closed and
/// dropped from the table as soon as it reaches a terminal state.
#[derive(Default)]
pub struct PeerLinkTable {
    links: Arc<Mutex<HashMap<String, LinkHandle>>>,
}

impl PeerLinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `link`, closing whatever was registered for the same peer.
    pub fn replace(&self, link: LinkHandle) -> Option<LinkHandle> {
        self.discard_when_finished(&link);
        let previous = self
            .links
            .lock()
            .insert(link.remote_peer_id().to_string(), link);
        if let Some(previous) = &previous {
            debug!(
                peer_id = %previous.remote_peer_id(),
                state = %previous.state(),
                "replacing peer link"
            );
            previous.close();
        }
        previous
    }

    pub fn get(&self, peer_id: &str) -> Option<LinkHandle> {
        let mut links = self.links.lock();
        match links.get(peer_id) {
            Some(link) if link.is_terminal() => {
                links.remove(peer_id);
                None
            }
            Some(link) => Some(link.clone()),
            None => None,
        }
    }

    /// Removes the link to `peer_id` without closing it.
    pub fn take(&self, peer_id: &str) -> Option<LinkHandle> {
        self.links.lock().remove(peer_id)
    }

    /// Removes and closes the link to `peer_id`. Returns whether one existed.
    pub fn remove(&self, peer_id: &str) -> bool {
        let removed = self.links.lock().remove(peer_id);
        match removed {
            Some(link) => {
                link.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<LinkHandle> = self.links.lock().drain().map(|(_, link)| link).collect();
        for link in drained {
            link.close();
        }
    }

    /// Peers with a live link, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut links = self.links.lock();
        links.retain(|_, link| !link.is_terminal());
        let mut peers: Vec<String> = links.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn discard_when_finished(&self, link: &LinkHandle) {
        let links: Weak<Mutex<HashMap<String, LinkHandle>>> = Arc::downgrade(&self.links);
        let mut state = link.subscribe();
        let peer_id = link.remote_peer_id().to_string();
        let link_id = link.id();
        tokio::spawn(async move {
            // A dropped sender also ends the link.
            let _ = state.wait_for(|state| state.is_terminal()).await;
            let Some(links) = links.upgrade() else {
                return;
            };
            let finished = {
                let mut links = links.lock();
                match links.get(&peer_id) {
                    Some(current) if current.id() == link_id => links.remove(&peer_id),
                    _ => None,
                }
            };
            if let Some(link) = finished {
                debug!(peer_id = %peer_id, state = %link.state(), "discarding finished peer link");
                link.close();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proctor_protocol::{Role, StreamType};
    use tokio::sync::mpsc;

    use super::*;
    use crate::link::actor::{spawn_link, LinkContext, LinkPlan};
    use crate::link::LinkState;
    use crate::mock::{MockConnector, RecordingSink};

    fn context() -> LinkContext {
        let (events, _) = mpsc::unbounded_channel();
        LinkContext {
            local_user_id: "teacher-1".to_string(),
            local_role: Role::Teacher,
            test_id: 3,
            connector: Arc::new(MockConnector::new()),
            signals: Arc::new(RecordingSink::new()),
            events,
            negotiation_timeout: Duration::from_secs(30),
        }
    }

    fn viewer(peer: &str) -> LinkHandle {
        spawn_link(
            context(),
            peer,
            LinkPlan::Viewer {
                stream_type: StreamType::Webcam,
            },
        )
    }

    #[tokio::test]
    async fn replacing_closes_the_previous_link() {
        let table = PeerLinkTable::new();
        let first = viewer("student-1");
        table.replace(first.clone());

        let second = viewer("student-1");
        let previous = table.replace(second.clone()).unwrap();

        assert_eq!(previous.state(), LinkState::Closed);
        assert_eq!(first.state(), LinkState::Closed);
        assert_eq!(second.state(), LinkState::New);
        assert_eq!(table.peers(), vec!["student-1".to_string()]);
    }

    #[tokio::test]
    async fn failed_link_is_closed_and_dropped_right_away() {
        let table = PeerLinkTable::new();
        let link = viewer("student-2");
        table.replace(link.clone());

        link.send(crate::link::LinkEvent::NegotiationFailed(
            crate::error::NegotiationError::TransportFailed,
        ));
        tokio::time::timeout(Duration::from_secs(2), link.wait_for(|state| state.is_terminal()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), link.wait_for(|state| state == LinkState::Closed))
            .await
            .unwrap();
        assert!(table.links.lock().is_empty());
        assert!(table.get("student-2").is_none());

        table.replace(viewer("student-2"));
        assert_eq!(table.get("student-2").unwrap().state(), LinkState::New);
    }

    #[tokio::test]
    async fn links_to_different_peers_are_independent() {
        let table = PeerLinkTable::new();
        table.replace(viewer("student-a"));
        table.replace(viewer("student-b"));

        assert!(table.remove("student-a"));
        assert!(!table.remove("student-a"));

        assert_eq!(table.peers(), vec!["student-b".to_string()]);
        table.close_all();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn take_leaves_the_link_running() {
        let table = PeerLinkTable::new();
        let link = viewer("student-3");
        table.replace(link.clone());

        let taken = table.take("student-3").unwrap();

        assert_eq!(taken.id(), link.id());
        assert_eq!(taken.state(), LinkState::New);
        assert!(table.is_empty());
        assert!(table.take("student-3").is_none());
    }
}
