//! In-memory presence table: which relay session currently represents a user.
//!
//! Single active session per user. A newer `user_online` overwrites the entry;
//! the older session is not torn down, it just stops owning the user. Every
//! mutation is a single per-key DashMap operation, so a late disconnect of a
//! superseded session can never remove the newer session's entry.

use dashmap::DashMap;

/// Thread-safe, DashMap-backed presence table (user id → session id).
pub struct PresenceTable {
    inner: DashMap<String, String>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Point `user_id` at `session_id`. Returns the session it replaced, if any.
    pub fn upsert(&self, user_id: &str, session_id: &str) -> Option<String> {
        self.inner
            .insert(user_id.to_string(), session_id.to_string())
            .filter(|prev| prev.as_str() != session_id)
    }

    /// Remove `user_id` only if `session_id` still owns the entry.
    pub fn remove_owned(&self, user_id: &str, session_id: &str) -> Removal {
        if self
            .inner
            .remove_if(user_id, |_, owner| owner.as_str() == session_id)
            .is_some()
        {
            return Removal::Removed;
        }
        match self.inner.get(user_id) {
            Some(_) => Removal::Superseded,
            None => Removal::Absent,
        }
    }

    /// Drop every entry owned by `session_id`. Returns the affected users.
    pub fn remove_session(&self, session_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.inner.retain(|user_id, owner| {
            if owner.as_str() == session_id {
                removed.push(user_id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn session_of(&self, user_id: &str) -> Option<String> {
        self.inner.get(user_id).map(|e| e.value().clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of removing a user on behalf of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The session owned the entry and it is gone.
    Removed,
    /// Another (newer) session owns the entry; it was left alone.
    Superseded,
    /// No entry existed.
    Absent,
}
