//! Per-room delivery state machine.
//!
//! Relay events and store snapshots arrive on different tasks. Both are fed
//! into a single actor per open room, which owns the message list and is the
//! only writer of every message's status flags. Flags are OR-merged, so any
//! order or repetition of acknowledgments converges on the same state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use pairchat_common::events::{MessageRef, RoomRef, TypingPayload};
use pairchat_common::message::summary_fields;
use pairchat_common::store::{paths, Direction, Document, FieldValue, Fields, Query, SnapshotStream};
use pairchat_common::{
    room_id, Author, ChatMessage, ClientEvent, DocumentStore, ServerEvent, StatusFlags, StoreError,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::{SendError, TransportError};
use crate::storage::{Attachment, ObjectStorage};
use crate::transport::RelayTransport;

/// Collaborators a room needs.
#[derive(Clone)]
pub struct RoomDeps {
    pub transport: Arc<dyn RelayTransport>,
    pub store: Arc<dyn DocumentStore>,
    pub storage: Arc<dyn ObjectStorage>,
}

/// Handle to an open conversation. Dropping it stops the room's actor.
pub struct RoomSync {
    room_id: String,
    me: Author,
    deps: RoomDeps,
    requests: mpsc::UnboundedSender<SendRequest>,
    messages: watch::Receiver<Vec<ChatMessage>>,
}

struct SendRequest {
    message: ChatMessage,
    reply: oneshot::Sender<Result<String, SendError>>,
}

impl RoomSync {
    /// Enter the conversation between `me` and `peer_id`.
    ///
    /// Connects and joins the relay room (failures only logged), resets the
    /// caller's unread counter and subscribes to the room's messages, newest
    /// first. Only a failed store subscription is an error.
    pub async fn open(
        me: Author,
        peer_id: impl Into<String>,
        deps: RoomDeps,
    ) -> Result<Self, StoreError> {
        let peer_id = peer_id.into();
        let room_id = room_id(&me.id, &peer_id);

        // Subscribe before joining so nothing addressed to the room is missed.
        let relay_events = deps.transport.subscribe();
        if let Err(err) = join_relay_room(deps.transport.as_ref(), &room_id).await {
            tracing::warn!(%err, room_id = %room_id, "relay unavailable, room runs on the store only");
        }

        let mut reset = Fields::new();
        reset.insert(paths::unread_field(&me.id), FieldValue::value(0));
        if let Err(err) = deps.store.set(&paths::chat(&room_id), reset, true).await {
            tracing::warn!(%err, room_id = %room_id, "failed to reset unread counter");
        }

        let snapshots = deps
            .store
            .subscribe(
                Query::collection(paths::messages(&room_id))
                    .order_by("createdAt", Direction::Descending),
            )
            .await?;

        let (published, messages) = watch::channel(Vec::new());
        let (requests, requests_rx) = mpsc::unbounded_channel();

        let actor = RoomActor {
            room_id: room_id.clone(),
            me: me.clone(),
            peer_id,
            transport: deps.transport.clone(),
            store: deps.store.clone(),
            messages: Vec::new(),
            pending: HeldStatuses::default(),
            unconfirmed: HashSet::new(),
            published,
        };
        tokio::spawn(actor.run(requests_rx, relay_events, snapshots));

        tracing::debug!(room_id = %room_id, "room opened");
        Ok(Self {
            room_id,
            me,
            deps,
            requests,
            messages,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Current message list, newest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.borrow().clone()
    }

    /// Change feed of the message list.
    pub fn watch(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages.clone()
    }

    /// Send a text message. Returns the message id once the store has it.
    pub async fn send_text(&self, text: &str) -> Result<String, SendError> {
        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        self.send(text.to_string(), String::new()).await
    }

    /// Upload an attachment and send it as an image message. An upload
    /// failure aborts the send before anything reaches the relay or store.
    pub async fn send_attachment(&self, attachment: Attachment) -> Result<String, SendError> {
        if attachment.bytes.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let content_type = attachment.content_type();
        let url = self
            .deps
            .storage
            .upload(attachment.bytes, &content_type)
            .await?;
        self.send(String::new(), url).await
    }

    async fn send(&self, text: String, image: String) -> Result<String, SendError> {
        let id = self.deps.store.new_id(&paths::messages(&self.room_id));
        let message = ChatMessage::outgoing(id, self.room_id.clone(), self.me.clone(), text, image);

        let (reply, reply_rx) = oneshot::channel();
        self.requests
            .send(SendRequest { message, reply })
            .map_err(|_| SendError::Closed)?;
        reply_rx.await.map_err(|_| SendError::Closed)?
    }

    /// Tell the peer whether a draft is being typed. Best effort.
    pub fn typing_changed(&self, draft: &str) {
        let event = ClientEvent::Typing(TypingPayload {
            room_id: self.room_id.clone(),
            user_id: self.me.id.clone(),
            is_typing: !draft.is_empty(),
        });
        if let Err(err) = self.deps.transport.emit(event) {
            tracing::debug!(%err, room_id = %self.room_id, "typing event not sent");
        }
    }

    /// Reconnect the relay and join the room again.
    pub async fn rejoin(&self) -> Result<(), TransportError> {
        join_relay_room(self.deps.transport.as_ref(), &self.room_id).await
    }
}

async fn join_relay_room(transport: &dyn RelayTransport, room_id: &str) -> Result<(), TransportError> {
    transport.connect().await?;
    transport.emit(ClientEvent::JoinChat(RoomRef {
        room_id: room_id.to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct RoomActor {
    room_id: String,
    me: Author,
    peer_id: String,
    transport: Arc<dyn RelayTransport>,
    store: Arc<dyn DocumentStore>,
    /// Newest first.
    messages: Vec<ChatMessage>,
    /// Status learned for messages this client has not seen yet.
    pending: HeldStatuses,
    /// Messages known locally (sent here or received over the relay) that no
    /// snapshot has contained yet.
    unconfirmed: HashSet<String>,
    published: watch::Sender<Vec<ChatMessage>>,
}

impl RoomActor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<SendRequest>,
        mut relay: broadcast::Receiver<ServerEvent>,
        mut snapshots: SnapshotStream,
    ) {
        let mut relay_open = true;
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.send(request),
                    None => break,
                },

                event = relay.recv(), if relay_open => match event {
                    Ok(event) => self.on_relay(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(room_id = %self.room_id, skipped = n, "room lagged behind relay events");
                    }
                    Err(broadcast::error::RecvError::Closed) => relay_open = false,
                },

                snapshot = snapshots.recv() => match snapshot {
                    Some(docs) => self.on_snapshot(docs),
                    None => {
                        tracing::debug!(room_id = %self.room_id, "message subscription ended");
                        break;
                    }
                },
            }
        }
        tracing::debug!(room_id = %self.room_id, "room closed");
    }

    fn send(&mut self, SendRequest { message, reply }: SendRequest) {
        self.unconfirmed.insert(message.id.clone());
        self.insert(message.clone());
        self.publish();

        let wire = message.to_wire(Some(self.peer_id.clone()));
        if let Err(err) = self.transport.emit(ClientEvent::SendMessage(wire)) {
            tracing::debug!(%err, message_id = %message.id, "relay send skipped, store only");
        }

        let store = self.store.clone();
        let peer_id = self.peer_id.clone();
        tokio::spawn(async move {
            let result = write_message(store.as_ref(), &message, &peer_id)
                .await
                .map(|()| message.id.clone())
                .map_err(SendError::from);
            let _ = reply.send(result);
        });
    }

    fn on_relay(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ReceiveMessage(wire) if wire.room_id == self.room_id => {
                let message = ChatMessage::from_wire(wire);
                let id = message.id.clone();
                let from_peer = !message.is_from(&self.me.id);
                if !self.messages.iter().any(|m| m.id == id) {
                    self.unconfirmed.insert(id.clone());
                    self.insert(message);
                }
                if from_peer {
                    // The room is open, so receiving is reading.
                    self.acknowledge_read(&id);
                    self.apply(&id, StatusFlags::ALL);
                }
                self.publish();
            }
            ServerEvent::MessageStatusUpdate(update) if update.room_id == self.room_id => {
                self.apply(&update.message_id, update.status.into());
                self.publish();
            }
            _ => {}
        }
    }

    fn on_snapshot(&mut self, docs: Vec<Document>) {
        let mut previous: HashMap<String, ChatMessage> = self
            .messages
            .drain(..)
            .map(|m| (m.id.clone(), m))
            .collect();

        let mut next = Vec::with_capacity(docs.len());
        let mut to_acknowledge = Vec::new();

        for doc in &docs {
            let Some(mut message) = ChatMessage::from_document(&self.room_id, doc) else {
                tracing::debug!(room_id = %self.room_id, doc_id = %doc.id, "skipping message without author");
                continue;
            };
            let stored = message.flags;

            if let Some(known) = previous.remove(&message.id) {
                message.flags.merge(known.flags);
            }
            if let Some(held) = self.pending.take(&message.id) {
                message.flags.merge(held);
            }
            self.unconfirmed.remove(&message.id);

            if !message.is_from(&self.me.id) && !message.flags.seen {
                message.flags.merge(StatusFlags::ALL);
                to_acknowledge.push(message.id.clone());
            }
            if !stored.covers(message.flags) {
                self.mirror(&message.id, message.flags);
            }
            next.push(message);
        }

        for (id, message) in previous {
            if self.unconfirmed.contains(&id) {
                next.push(message);
            } else {
                self.pending.merge(&id, message.flags);
            }
        }
        next.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.messages = next;

        for id in to_acknowledge {
            self.acknowledge_read(&id);
        }
        self.publish();
    }

    /// OR `flags` into the message (or hold them until it shows up) and
    /// mirror the result when anything changed.
    fn apply(&mut self, message_id: &str, flags: StatusFlags) {
        let merged = match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                if !message.flags.merge(flags) {
                    return;
                }
                message.flags
            }
            None => match self.pending.merge(message_id, flags) {
                Some(held) => held,
                None => return,
            },
        };
        self.mirror(message_id, merged);
    }

    fn acknowledge_read(&self, message_id: &str) {
        let message = MessageRef {
            message_id: message_id.to_string(),
            room_id: self.room_id.clone(),
        };
        for event in [
            ClientEvent::MessageDelivered(message.clone()),
            ClientEvent::MessageSeen(message),
        ] {
            if let Err(err) = self.transport.emit(event) {
                tracing::debug!(%err, message_id = %message_id, "read receipt not sent");
                return;
            }
        }
    }

    /// Fire-and-forget flag write. Only true flags are written and only into
    /// an existing document.
    fn mirror(&self, message_id: &str, flags: StatusFlags) {
        let fields = flags.true_fields();
        if fields.is_empty() {
            return;
        }
        let store = self.store.clone();
        let path = paths::message(&self.room_id, message_id);
        tokio::spawn(async move {
            match store.update(&path, fields).await {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!(path = %path, "status mirror skipped, message not stored yet");
                }
                Err(err) => tracing::warn!(%err, path = %path, "status mirror write failed"),
            }
        });
    }

    fn insert(&mut self, message: ChatMessage) {
        let at = self
            .messages
            .iter()
            .position(|m| m.created_at <= message.created_at)
            .unwrap_or(self.messages.len());
        self.messages.insert(at, message);
    }

    fn publish(&self) {
        self.published.send_replace(self.messages.clone());
    }
}

/// Most statuses a room holds for messages it has not seen. Past this the
/// oldest is dropped; the peer's own mirror still reaches the store.
const MAX_HELD_STATUSES: usize = 256;

/// Flags for message ids not in the list yet, oldest first.
#[derive(Default)]
struct HeldStatuses {
    flags: HashMap<String, StatusFlags>,
    order: VecDeque<String>,
}

impl HeldStatuses {
    /// OR `flags` into the entry for `id`. Returns the merged flags when
    /// anything changed.
    fn merge(&mut self, id: &str, flags: StatusFlags) -> Option<StatusFlags> {
        if let Some(held) = self.flags.get_mut(id) {
            return held.merge(flags).then_some(*held);
        }
        if flags.is_empty() {
            return None;
        }
        if self.order.len() == MAX_HELD_STATUSES {
            if let Some(oldest) = self.order.pop_front() {
                self.flags.remove(&oldest);
                tracing::debug!(message_id = %oldest, "dropping held status for a message never seen");
            }
        }
        self.flags.insert(id.to_string(), flags);
        self.order.push_back(id.to_string());
        Some(flags)
    }

    fn take(&mut self, id: &str) -> Option<StatusFlags> {
        let held = self.flags.remove(id)?;
        self.order.retain(|held_id| held_id != id);
        Some(held)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.flags.len()
    }
}

/// Create the message document, then update the conversation summary.
async fn write_message(
    store: &dyn DocumentStore,
    message: &ChatMessage,
    peer_id: &str,
) -> Result<(), StoreError> {
    store
        .set(
            &paths::message(&message.room_id, &message.id),
            message.store_fields(),
            false,
        )
        .await?;

    if let Err(err) = store
        .set(
            &paths::chat(&message.room_id),
            summary_fields(message, peer_id),
            true,
        )
        .await
    {
        tracing::warn!(%err, room_id = %message.room_id, "conversation summary write failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELIVERED: StatusFlags = StatusFlags {
        sent: true,
        delivered: true,
        seen: false,
    };

    #[test]
    fn held_statuses_merge_and_take() {
        let mut held = HeldStatuses::default();
        assert_eq!(held.merge("m1", DELIVERED), Some(DELIVERED));
        assert_eq!(held.merge("m1", DELIVERED), None);
        assert_eq!(held.merge("m1", StatusFlags::ALL), Some(StatusFlags::ALL));
        assert_eq!(held.merge("m2", StatusFlags::default()), None);

        assert_eq!(held.take("m1"), Some(StatusFlags::ALL));
        assert_eq!(held.take("m1"), None);
        assert_eq!(held.len(), 0);
    }

    #[test]
    fn held_statuses_are_bounded_oldest_first() {
        let mut held = HeldStatuses::default();
        for n in 0..MAX_HELD_STATUSES + 10 {
            held.merge(&format!("m{n}"), DELIVERED);
        }
        assert_eq!(held.len(), MAX_HELD_STATUSES);
        assert_eq!(held.take("m0"), None);
        assert_eq!(held.take("m9"), None);
        assert_eq!(held.take("m10"), Some(DELIVERED));
        assert_eq!(held.take(&format!("m{}", MAX_HELD_STATUSES + 9)), Some(DELIVERED));
    }
}
