//! Presence and typing view model.
//!
//! Seeded from the store's user documents, then kept fresh by relay presence
//! and typing events. A tracker task owns the state and publishes it on a
//! watch channel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pairchat_common::events::{PresencePayload, TypingPayload};
use pairchat_common::store::{paths, Document, Query, SnapshotStream};
use pairchat_common::{DocumentStore, ServerEvent, StoreError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::transport::RelayTransport;

/// What the client knows about another user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPresence {
    pub user_id: String,
    pub display_name: String,
    pub photo_url: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserPresence {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: String::new(),
            photo_url: None,
            is_online: false,
            last_seen: None,
        }
    }

    /// `Online`, `Last seen today HH:MM` or `Last seen YYYY-MM-DD HH:MM`,
    /// rendered in the time zone of `now`. Empty when nothing is known.
    pub fn subtitle<Tz>(&self, now: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        if self.is_online {
            return "Online".to_string();
        }
        let Some(last_seen) = self.last_seen else {
            return String::new();
        };
        let local = last_seen.with_timezone(&now.timezone());
        let time = local.format("%H:%M");
        if local.date_naive() == now.date_naive() {
            format!("Last seen today {time}")
        } else {
            format!("Last seen {} {time}", local.format("%Y-%m-%d"))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceState {
    /// Every other user, by id.
    pub users: BTreeMap<String, UserPresence>,
    pub open_room: Option<String>,
    /// Users currently typing in the open room.
    pub typing: BTreeSet<String>,
    /// Sum of the caller's unread counters across their conversations.
    pub unread_total: i64,
}

impl PresenceState {
    pub fn user(&self, user_id: &str) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.typing.contains(user_id)
    }

    /// Conversation header: `Typing...` while the peer types, else their name.
    pub fn header_title(&self, peer_id: &str) -> String {
        if self.is_typing(peer_id) {
            return "Typing...".to_string();
        }
        self.user(peer_id)
            .map(|u| u.display_name.clone())
            .unwrap_or_default()
    }
}

enum Command {
    OpenRoom(Option<String>),
}

/// Handle to the running view model. Dropping it stops the tracker.
pub struct PresenceView {
    state: watch::Receiver<PresenceState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PresenceView {
    pub async fn start(
        me: &str,
        transport: Arc<dyn RelayTransport>,
        store: Arc<dyn DocumentStore>,
        config: &ClientConfig,
    ) -> Result<Self, StoreError> {
        let relay = transport.subscribe();
        let users = store.subscribe(Query::collection(paths::USERS)).await?;
        let chats = store.subscribe(Query::collection(paths::CHATS)).await?;

        let (published, state) = watch::channel(PresenceState::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let tracker = Tracker {
            me: me.to_string(),
            typing_timeout: config.typing_timeout,
            state: PresenceState::default(),
            typing_deadlines: HashMap::new(),
            published,
        };
        tokio::spawn(tracker.run(commands_rx, relay, users, chats));

        Ok(Self { state, commands })
    }

    pub fn state(&self) -> PresenceState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PresenceState> {
        self.state.clone()
    }

    /// Typing events are only tracked for the room currently on screen.
    pub fn set_open_room(&self, room_id: Option<String>) {
        let _ = self.commands.send(Command::OpenRoom(room_id));
    }
}

struct Tracker {
    me: String,
    typing_timeout: Duration,
    state: PresenceState,
    typing_deadlines: HashMap<String, Instant>,
    published: watch::Sender<PresenceState>,
}

impl Tracker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut relay: broadcast::Receiver<ServerEvent>,
        mut users: SnapshotStream,
        mut chats: SnapshotStream,
    ) {
        let mut relay_open = true;
        let mut users_open = true;
        let mut chats_open = true;

        loop {
            let next_expiry = self.typing_deadlines.values().min().copied();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::OpenRoom(room_id)) => self.open_room(room_id),
                    None => break,
                },

                event = relay.recv(), if relay_open => match event {
                    Ok(event) => self.on_relay(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "presence view lagged behind relay events");
                    }
                    Err(broadcast::error::RecvError::Closed) => relay_open = false,
                },

                docs = users.recv(), if users_open => match docs {
                    Some(docs) => self.on_users(docs),
                    None => users_open = false,
                },

                docs = chats.recv(), if chats_open => match docs {
                    Some(docs) => self.on_chats(docs),
                    None => chats_open = false,
                },

                _ = tokio::time::sleep_until(next_expiry.unwrap_or_else(Instant::now)),
                    if next_expiry.is_some() => self.expire_typing(Instant::now()),
            }
        }
    }

    fn open_room(&mut self, room_id: Option<String>) {
        self.state.open_room = room_id;
        self.state.typing.clear();
        self.typing_deadlines.clear();
        self.publish();
    }

    fn on_relay(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::StatusUpdate(presence) => self.on_presence(presence),
            ServerEvent::UserTyping(typing) => self.on_typing(typing),
            ServerEvent::ReceiveMessage(message) => {
                if self.state.open_room.as_deref() == Some(message.room_id.as_str()) {
                    self.stop_typing(&message.user.id);
                }
            }
            ServerEvent::MessageStatusUpdate(_) => return,
        }
        self.publish();
    }

    fn on_presence(&mut self, presence: PresencePayload) {
        if presence.user_id == self.me {
            return;
        }
        let user = self
            .state
            .users
            .entry(presence.user_id.clone())
            .or_insert_with(|| UserPresence::new(&presence.user_id));
        user.is_online = presence.is_online;
        if let Some(at) = presence.last_seen.and_then(DateTime::from_timestamp_millis) {
            user.last_seen = Some(at);
        }
    }

    fn on_typing(&mut self, typing: TypingPayload) {
        if typing.user_id == self.me
            || self.state.open_room.as_deref() != Some(typing.room_id.as_str())
        {
            return;
        }
        if typing.is_typing {
            self.state.typing.insert(typing.user_id.clone());
            self.typing_deadlines
                .insert(typing.user_id, Instant::now() + self.typing_timeout);
        } else {
            self.stop_typing(&typing.user_id);
        }
    }

    fn stop_typing(&mut self, user_id: &str) {
        self.state.typing.remove(user_id);
        self.typing_deadlines.remove(user_id);
    }

    fn expire_typing(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .typing_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(user_id, _)| user_id.clone())
            .collect();
        for user_id in &expired {
            tracing::debug!(user_id = %user_id, "typing indicator timed out");
            self.stop_typing(user_id);
        }
        if !expired.is_empty() {
            self.publish();
        }
    }

    fn on_users(&mut self, docs: Vec<Document>) {
        for doc in docs.iter().filter(|d| d.id != self.me) {
            let user = self
                .state
                .users
                .entry(doc.id.clone())
                .or_insert_with(|| UserPresence::new(&doc.id));
            user.display_name = doc.get_str("displayName").unwrap_or_default().to_string();
            user.photo_url = doc
                .get_str("photoURL")
                .filter(|url| !url.is_empty())
                .map(str::to_string);
            user.is_online = doc.get_bool("isOnline").unwrap_or(false);
            user.last_seen = doc
                .get_i64("lastSeen")
                .and_then(DateTime::from_timestamp_millis);
        }
        self.publish();
    }

    fn on_chats(&mut self, docs: Vec<Document>) {
        let unread_field = paths::unread_field(&self.me);
        self.state.unread_total = docs
            .iter()
            .filter(|doc| involves(doc, &self.me))
            .filter_map(|doc| doc.get_i64(&unread_field))
            .map(|n| n.max(0))
            .sum();
        self.publish();
    }

    fn publish(&self) {
        self.published.send_replace(self.state.clone());
    }
}

fn involves(chat: &Document, user_id: &str) -> bool {
    chat.data
        .get("participants")
        .and_then(|p| p.as_array())
        .is_some_and(|participants| participants.iter().any(|p| p.as_str() == Some(user_id)))
}
