//! Session-to-deployment affinity map.
//!
//! A bounded map from session identifier to the deployment name last
//! chosen for it, with least-recently-used eviction. Lookups bump
//! recency. Operations never suspend, so the map lives behind a plain
//! mutex in the switchboard.

use std::collections::HashMap;

#[derive(Debug)]
pub(crate) struct SessionMap {
    capacity: usize,
    entries: HashMap<String, SessionEntry>,
    /// Monotonic tick standing in for wall-clock recency.
    clock: u64,
}

#[derive(Debug)]
struct SessionEntry {
    deployment: String,
    last_used: u64,
}

impl SessionMap {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "session map capacity must be positive");
        Self {
            capacity,
            entries: HashMap::new(),
            clock: 0,
        }
    }

    /// Look up the deployment bound to a session, refreshing its recency.
    pub(crate) fn get(&mut self, session_id: &str) -> Option<&str> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(session_id)?;
        entry.last_used = clock;
        Some(entry.deployment.as_str())
    }

    /// Bind (or rebind) a session to a deployment, evicting the least
    /// recently used entry on overflow.
    pub(crate) fn insert(&mut self, session_id: &str, deployment: &str) {
        self.clock += 1;
        if let Some(entry) = self.entries.get_mut(session_id) {
            entry.deployment = deployment.to_string();
            entry.last_used = self.clock;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.entries.insert(
            session_id.to_string(),
            SessionEntry {
                deployment: deployment.to_string(),
                last_used: self.clock,
            },
        );
    }

    pub(crate) fn remove(&mut self, session_id: &str) {
        self.entries.remove(session_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_bound_deployment() {
        let mut sessions = SessionMap::new(4);
        sessions.insert("s1", "east");
        assert_eq!(sessions.get("s1"), Some("east"));
        assert_eq!(sessions.get("unknown"), None);
    }

    #[test]
    fn rebinding_overwrites_existing_entry() {
        let mut sessions = SessionMap::new(4);
        sessions.insert("s1", "east");
        sessions.insert("s1", "west");
        assert_eq!(sessions.get("s1"), Some("west"));
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let mut sessions = SessionMap::new(2);
        sessions.insert("s1", "east");
        sessions.insert("s2", "west");

        // Touch s1 so s2 becomes the LRU entry.
        sessions.get("s1");
        sessions.insert("s3", "east");

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.get("s2"), None);
        assert_eq!(sessions.get("s1"), Some("east"));
        assert_eq!(sessions.get("s3"), Some("east"));
    }

    #[test]
    fn remove_is_explicit() {
        let mut sessions = SessionMap::new(2);
        sessions.insert("s1", "east");
        sessions.remove("s1");
        assert_eq!(sessions.get("s1"), None);
    }
}
