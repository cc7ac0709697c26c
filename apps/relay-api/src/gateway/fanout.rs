//! Broadcast hub for dispatching relay events to connected sessions.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each connected session
//! subscribes and filters events locally by [`Audience`]. Events are encoded
//! once at dispatch time, not once per receiver.

use std::sync::Arc;

use pairchat_common::ServerEvent;
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel. Slow receivers that fall behind
/// will skip messages (RecvError::Lagged).
pub const DEFAULT_BROADCAST_CAPACITY: usize = 4096;

/// Which sessions an event is meant for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every connected session.
    Everyone,
    /// Sessions joined to `room_id`, except the one that caused the event.
    Room { room_id: String, except: String },
    /// Exactly one session.
    Session(String),
}

/// A payload broadcast to all connected relay sessions.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    pub audience: Audience,
    pub event: ServerEvent,
    /// `event` encoded as a JSON text frame.
    pub frame: String,
}

/// The relay-wide broadcast hub.
#[derive(Clone)]
pub struct RelayBroadcast {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl RelayBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to the broadcast channel. Each relay session should call
    /// this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    /// Dispatch an event to every session in `audience`.
    pub fn dispatch(&self, audience: Audience, event: ServerEvent) {
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(?err, "failed to encode relay event");
                return;
            }
        };
        // send() only fails when nobody is subscribed.
        let _ = self.sender.send(Arc::new(BroadcastPayload {
            audience,
            event,
            frame,
        }));
    }
}

impl Default for RelayBroadcast {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}
