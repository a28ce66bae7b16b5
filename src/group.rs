//! Named fan-out groups.
//!
//! A group is a membership set plus the broadcast loop over it. Groups never
//! write to sockets themselves; they enqueue into each member's session
//! handle and let the per-session writer tasks do the delivery at their own
//! pace.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::message::{ChatMessage, ServerToClient};
use crate::session::{SessionHandle, SessionId};

/// Whether a broadcast is delivered back to the session that sent it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BroadcastPolicy {
    /// Senders hear their own messages, like everyone else in the group.
    #[default]
    IncludeSender,
    /// Senders are skipped during fan-out.
    ExcludeSender,
}

pub struct Group {
    name: String,
    policy: BroadcastPolicy,
    members: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl Group {
    pub(crate) fn new(name: &str, policy: BroadcastPolicy) -> Self {
        Self {
            name: name.to_string(),
            policy,
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn add_member(&self, handle: Arc<SessionHandle>) {
        let mut members = self.members.lock().await;
        let _ = members.insert(handle.id(), handle);
    }

    /// Removes a session from the group. Removing an id that is not a member
    /// is a no-op, so teardown paths may call this without checking first.
    pub async fn remove_member(&self, id: SessionId) {
        let mut members = self.members.lock().await;
        let _ = members.remove(&id);
    }

    pub async fn member_count(&self) -> usize {
        self.members.lock().await.len()
    }

    /// Fans one message out to the current membership. The membership lock is
    /// held across the whole loop, so the set cannot change mid-broadcast: a
    /// member disconnecting concurrently has either already left the set or
    /// still receives the enqueue, which its closed session absorbs.
    pub async fn broadcast(&self, message: &ChatMessage, sender: SessionId) {
        let members = self.members.lock().await;
        let mut recipients = 0usize;
        for (id, member) in members.iter() {
            if self.policy == BroadcastPolicy::ExcludeSender && *id == sender {
                continue;
            }
            member
                .enqueue(ServerToClient::Message(message.clone()))
                .await;
            recipients += 1;
        }
        debug!(group = %self.name, recipients, "broadcast message");
    }
}
