use std::collections::HashMap;

use axum::extract::ws::Message as WsMessage;
use common_net::message::{self, SignalEvent};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type EndpointSender = mpsc::UnboundedSender<WsMessage>;

#[derive(Default)]
struct Group {
    members: HashMap<String, EndpointSender>,
}

/// Maps a session id to its currently connected endpoints.
///
/// Membership mutation and broadcast for one session serialize on the
/// dashmap entry; different sessions never contend. Pure in-memory
/// bookkeeping; a group simply disappears once its last member leaves.
#[derive(Default)]
pub struct GroupRegistry {
    groups: DashMap<String, Group>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint to a session group. Re-joining under the same
    /// endpoint id is a no-op apart from refreshing the sender handle.
    pub fn join(&self, session_id: &str, endpoint_id: &str, sender: EndpointSender) {
        let mut group = self.groups.entry(session_id.to_string()).or_default();
        group.members.insert(endpoint_id.to_string(), sender);
        debug!(session_id, endpoint_id, members = group.members.len(), "endpoint joined");
    }

    /// Detach an endpoint. Leaving a group it never joined is a no-op.
    pub fn leave(&self, session_id: &str, endpoint_id: &str) {
        let emptied = match self.groups.get_mut(session_id) {
            Some(mut group) => {
                group.members.remove(endpoint_id);
                group.members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.groups
                .remove_if(session_id, |_, group| group.members.is_empty());
        }
    }

    pub fn member_count(&self, session_id: &str) -> usize {
        self.groups
            .get(session_id)
            .map(|group| group.members.len())
            .unwrap_or(0)
    }

    /// Fan an event out to every member of the group except the optionally
    /// excluded sender. Delivery is fire-and-forget per member: an endpoint
    /// whose channel is gone gets evicted on the spot, and the remaining
    /// members still receive the event. Returns the number of deliveries.
    pub fn broadcast(
        &self,
        session_id: &str,
        event: &SignalEvent,
        excluding: Option<&str>,
    ) -> usize {
        let text = match message::encode(event) {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, session_id, "failed to encode outbound event");
                return 0;
            }
        };

        let Some(mut group) = self.groups.get_mut(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (endpoint_id, sender) in &group.members {
            if excluding == Some(endpoint_id.as_str()) {
                continue;
            }
            if sender.send(WsMessage::Text(text.clone())).is_ok() {
                delivered += 1;
            } else {
                dead.push(endpoint_id.clone());
            }
        }

        for endpoint_id in dead {
            group.members.remove(&endpoint_id);
            common_net::metrics::signaling_metrics().inc_members_evicted();
            warn!(session_id, endpoint_id, "member evicted after failed delivery");
        }

        delivered
    }

    /// Deliver an event to a single member, e.g. an error back to the
    /// endpoint that caused it.
    pub fn send_to(&self, session_id: &str, endpoint_id: &str, event: &SignalEvent) {
        let Ok(text) = message::encode(event) else {
            return;
        };
        if let Some(group) = self.groups.get(session_id) {
            if let Some(sender) = group.members.get(endpoint_id) {
                let _ = sender.send(WsMessage::Text(text));
            }
        }
    }
}
