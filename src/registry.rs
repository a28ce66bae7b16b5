//! Name-to-group lookup with create-on-first-use semantics.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::group::{BroadcastPolicy, Group};

/// Owns every [`Group`] for the life of the process. Built once at startup
/// and handed to the server, which shares it with every session; there is no
/// global instance.
pub struct Registry {
    policy: BroadcastPolicy,
    groups: Mutex<HashMap<String, Arc<Group>>>,
}

impl Registry {
    pub fn new(policy: BroadcastPolicy) -> Self {
        Self {
            policy,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the unique group for `name`, creating it on first reference.
    /// Lookup and insertion happen under one lock, so callers racing on the
    /// same name all receive the same instance.
    pub async fn get_or_create(&self, name: &str) -> Arc<Group> {
        let mut groups = self.groups.lock().await;
        if let Some(group) = groups.get(name) {
            return Arc::clone(group);
        }
        let group = Arc::new(Group::new(name, self.policy));
        let _ = groups.insert(name.to_string(), Arc::clone(&group));
        debug!(group = name, "created group");
        group
    }

    /// Number of distinct groups created so far. Groups live until the
    /// process exits, even when their last member leaves.
    pub async fn group_count(&self) -> usize {
        self.groups.lock().await.len()
    }
}
