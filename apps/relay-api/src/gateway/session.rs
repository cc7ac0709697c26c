//! Per-connection relay session state.

use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::Mutex;
use pairchat_common::id::{self, prefix};

use super::fanout::Audience;

/// State for a single WebSocket connection.
pub struct RelaySession {
    /// Unique session identifier (`ses_` prefixed ULID).
    pub session_id: String,
    /// User announced by the first `user_online` on this connection.
    user_id: OnceLock<String>,
    /// Rooms this connection has joined.
    rooms: Mutex<HashSet<String>>,
}

impl RelaySession {
    pub fn new() -> Self {
        Self::with_id(id::prefixed_ulid(prefix::SESSION))
    }

    pub fn with_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: OnceLock::new(),
            rooms: Mutex::new(HashSet::new()),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    /// Associate this connection with `user_id`. The first call wins; returns
    /// false if the session already belongs to a different user.
    pub fn bind_user(&self, user_id: &str) -> bool {
        self.user_id.get_or_init(|| user_id.to_string()) == user_id
    }

    /// Whether this session may speak for `user_id`.
    pub fn may_act_for(&self, user_id: &str) -> bool {
        self.user_id().map_or(true, |bound| bound == user_id)
    }

    /// Add a room to the joined set. Returns false if already joined.
    pub fn join(&self, room_id: &str) -> bool {
        self.rooms.lock().insert(room_id.to_string())
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        self.rooms.lock().contains(room_id)
    }

    /// Check whether a broadcast addressed to `audience` should reach this session.
    pub fn accepts(&self, audience: &Audience) -> bool {
        match audience {
            Audience::Everyone => true,
            Audience::Room { room_id, except } => {
                except != &self.session_id && self.is_joined(room_id)
            }
            Audience::Session(session_id) => session_id == &self.session_id,
        }
    }
}

impl Default for RelaySession {
    fn default() -> Self {
        Self::new()
    }
}
