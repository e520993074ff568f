//! Peer links: one negotiated media connection per remote peer.

mod actor;
mod state;
mod table;

pub use actor::{spawn_link, LinkContext, LinkHandle, LinkPlan};
pub use state::{LinkEffect, LinkEvent, LinkRole, LinkState, OutboundSignal, PeerLink};
pub use table::PeerLinkTable;
