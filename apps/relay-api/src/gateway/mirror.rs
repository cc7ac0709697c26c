//! Best-effort presence mirror into the document store.
//!
//! Changes are queued to a single task that writes them one at a time. The
//! value written is read from the presence table when the write happens, not
//! when it was queued, so the last write for a user always carries the
//! relay's current answer. A failure is only logged; the relay path never
//! waits for the store.

use std::sync::Arc;

use pairchat_common::store::{paths, FieldValue, Fields};
use pairchat_common::DocumentStore;
use tokio::sync::mpsc;

use super::presence::PresenceTable;

/// Fields merged into `users/<uid>` when presence changes.
pub fn presence_fields(is_online: bool) -> Fields {
    let mut fields = Fields::new();
    fields.insert("isOnline".to_string(), FieldValue::value(is_online));
    fields.insert("lastSeen".to_string(), FieldValue::ServerTimestamp);
    fields
}

/// Handle to the mirror task. Must be created inside a tokio runtime.
pub struct PresenceMirror {
    queue: mpsc::UnboundedSender<String>,
}

impl PresenceMirror {
    pub fn spawn(store: Arc<dyn DocumentStore>, presence: Arc<PresenceTable>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_mirror(store, presence, rx));
        Self { queue }
    }

    /// Queue a write of `user_id`'s presence.
    pub fn record(&self, user_id: &str) {
        if self.queue.send(user_id.to_string()).is_err() {
            tracing::debug!(user_id = %user_id, "presence mirror stopped, write dropped");
        }
    }
}

async fn run_mirror(
    store: Arc<dyn DocumentStore>,
    presence: Arc<PresenceTable>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(user_id) = rx.recv().await {
        let is_online = presence.is_online(&user_id);
        if let Err(err) = store
            .set(&paths::user(&user_id), presence_fields(is_online), true)
            .await
        {
            tracing::warn!(%err, user_id = %user_id, is_online, "presence mirror write failed");
        }
    }
}
