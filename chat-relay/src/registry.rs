//! Live set of sessions keyed by username.

use std::sync::Arc;

use dashmap::DashMap;

use crate::session::Session;

#[derive(Default)]
pub struct Registry {
    sessions: DashMap<String, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Inserts `session` under its username, returning whatever it replaced.
    /// Last registration wins.
    pub fn put(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.username().to_string(), session)
    }

    pub fn remove(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions.remove(username).map(|(_, session)| session)
    }

    /// Removes the entry for this session's username only if it still points
    /// at this exact session, so a displaced session cannot evict its successor.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.username(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Point-in-time copy of the registered sessions, safe to iterate while
    /// other tasks register and remove.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
