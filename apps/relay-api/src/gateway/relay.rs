//! Relay operations: presence, room routing and the offline push fallback.
//!
//! The relay holds no message state. It owns the presence table and forwards
//! every event to the sessions that should see it; anything touching the
//! document store or the push gateway runs on a spawned task.

use std::sync::Arc;

use chrono::Utc;
use pairchat_common::events::{MessageRef, PresencePayload, StatusUpdatePayload, TypingPayload};
use pairchat_common::{ClientEvent, DeliveryStatus, DocumentStore, ServerEvent, WireMessage};
use tokio::sync::broadcast;

use crate::push::{self, PushNotifier};

use super::fanout::{Audience, BroadcastPayload, RelayBroadcast};
use super::mirror::PresenceMirror;
use super::presence::{PresenceTable, Removal};
use super::session::RelaySession;

pub struct Relay {
    presence: Arc<PresenceTable>,
    mirror: PresenceMirror,
    broadcast: RelayBroadcast,
    store: Arc<dyn DocumentStore>,
    push: Arc<dyn PushNotifier>,
}

impl Relay {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        push: Arc<dyn PushNotifier>,
        broadcast_capacity: usize,
    ) -> Self {
        let presence = Arc::new(PresenceTable::new());
        Self {
            mirror: PresenceMirror::spawn(store.clone(), presence.clone()),
            presence,
            broadcast: RelayBroadcast::new(broadcast_capacity),
            store,
            push,
        }
    }

    /// Subscribe a new connection to relay broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.broadcast.subscribe()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.is_online(user_id)
    }

    /// Number of users with a presence entry.
    pub fn online_count(&self) -> usize {
        self.presence.len()
    }

    /// Route one validated client event.
    pub fn handle(&self, session: &RelaySession, event: ClientEvent) {
        match event {
            ClientEvent::UserOnline(u) => self.user_online(session, &u.user_id),
            ClientEvent::UserOffline(u) => self.user_offline(session, &u.user_id),
            ClientEvent::JoinChat(r) => self.join(session, &r.room_id),
            ClientEvent::SendMessage(m) => self.send_message(session, m),
            ClientEvent::Typing(t) => self.typing(session, t),
            ClientEvent::MessageDelivered(m) => {
                self.message_status(session, m, DeliveryStatus::Delivered)
            }
            ClientEvent::MessageSeen(m) => self.message_status(session, m, DeliveryStatus::Seen),
        }
    }

    pub fn join(&self, session: &RelaySession, room_id: &str) {
        if room_id.is_empty() {
            return;
        }
        if session.join(room_id) {
            tracing::debug!(session_id = %session.session_id, room_id = %room_id, "joined room");
        }
    }

    pub fn user_online(&self, session: &RelaySession, user_id: &str) {
        if !session.bind_user(user_id) {
            tracing::debug!(
                session_id = %session.session_id,
                user_id = %user_id,
                "session already bound to another user, ignoring online event"
            );
            return;
        }

        if let Some(previous) = self.presence.upsert(user_id, &session.session_id) {
            tracing::debug!(user_id = %user_id, previous = %previous, "presence moved to new session");
        }
        tracing::info!(session_id = %session.session_id, user_id = %user_id, "user online");

        self.broadcast.dispatch(
            Audience::Everyone,
            ServerEvent::StatusUpdate(PresencePayload {
                user_id: user_id.to_string(),
                is_online: true,
                last_seen: None,
            }),
        );
        self.mirror.record(user_id);
    }

    pub fn user_offline(&self, session: &RelaySession, user_id: &str) {
        if !session.may_act_for(user_id) {
            tracing::debug!(
                session_id = %session.session_id,
                user_id = %user_id,
                "offline event for a user this session does not own"
            );
            return;
        }

        match self.presence.remove_owned(user_id, &session.session_id) {
            Removal::Superseded => {
                tracing::debug!(
                    session_id = %session.session_id,
                    user_id = %user_id,
                    "stale offline event, user reconnected on another session"
                );
            }
            Removal::Removed | Removal::Absent => self.announce_offline(user_id),
        }
    }

    pub fn send_message(&self, session: &RelaySession, message: WireMessage) {
        let room_id = message.room_id.clone();
        let message_id = message.id.clone();

        let push_target = message
            .recipient_id
            .as_deref()
            .filter(|rid| !rid.is_empty() && !self.presence.is_online(rid))
            .map(str::to_string);

        self.broadcast.dispatch(
            Audience::Room {
                room_id: room_id.clone(),
                except: session.session_id.clone(),
            },
            ServerEvent::ReceiveMessage(message.clone()),
        );

        self.broadcast.dispatch(
            Audience::Session(session.session_id.clone()),
            ServerEvent::MessageStatusUpdate(StatusUpdatePayload {
                message_id,
                room_id,
                status: DeliveryStatus::Sent,
            }),
        );

        if let Some(recipient_id) = push_target {
            let store = self.store.clone();
            let notifier = self.push.clone();
            tokio::spawn(async move {
                match push::deliver_offline_push(
                    store.as_ref(),
                    notifier.as_ref(),
                    &recipient_id,
                    &message,
                )
                .await
                {
                    Ok(()) => tracing::debug!(recipient_id = %recipient_id, "offline push sent"),
                    Err(err) => {
                        tracing::warn!(%err, recipient_id = %recipient_id, "offline push failed")
                    }
                }
            });
        }
    }

    pub fn typing(&self, session: &RelaySession, payload: TypingPayload) {
        let room_id = payload.room_id.clone();
        self.broadcast.dispatch(
            Audience::Room {
                room_id,
                except: session.session_id.clone(),
            },
            ServerEvent::UserTyping(payload),
        );
    }

    pub fn message_status(&self, session: &RelaySession, message: MessageRef, status: DeliveryStatus) {
        self.broadcast.dispatch(
            Audience::Room {
                room_id: message.room_id.clone(),
                except: session.session_id.clone(),
            },
            ServerEvent::MessageStatusUpdate(StatusUpdatePayload {
                message_id: message.message_id,
                room_id: message.room_id,
                status,
            }),
        );
    }

    /// Connection closed: every user still pointing at this session goes offline.
    pub fn disconnect(&self, session: &RelaySession) {
        for user_id in self.presence.remove_session(&session.session_id) {
            self.announce_offline(&user_id);
        }
    }

    fn announce_offline(&self, user_id: &str) {
        tracing::info!(user_id = %user_id, "user offline");
        self.broadcast.dispatch(
            Audience::Everyone,
            ServerEvent::StatusUpdate(PresencePayload {
                user_id: user_id.to_string(),
                is_online: false,
                last_seen: Some(Utc::now().timestamp_millis()),
            }),
        );
        self.mirror.record(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use pairchat_common::events::{RoomRef, UserRef};
    use pairchat_common::store::{paths, Document, FieldValue, Fields, Query, SnapshotStream};
    use pairchat_common::{Author, MemoryDocumentStore, StoreError};
    use tokio::sync::mpsc;

    use crate::push::{PushError, PushNotification};

    struct RecordingPush(mpsc::UnboundedSender<PushNotification>);

    #[async_trait]
    impl PushNotifier for RecordingPush {
        async fn send(&self, notification: &PushNotification) -> Result<(), PushError> {
            let _ = self.0.send(notification.clone());
            Ok(())
        }
    }

    struct Harness {
        relay: Relay,
        store: Arc<MemoryDocumentStore>,
        pushes: mpsc::UnboundedReceiver<PushNotification>,
        rx: broadcast::Receiver<Arc<BroadcastPayload>>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryDocumentStore::new());
        let (tx, pushes) = mpsc::unbounded_channel();
        let relay = Relay::new(store.clone(), Arc::new(RecordingPush(tx)), 64);
        let rx = relay.subscribe();
        Harness {
            relay,
            store,
            pushes,
            rx,
        }
    }

    impl Harness {
        /// Drain everything dispatched so far.
        fn drain(&mut self) -> Vec<Arc<BroadcastPayload>> {
            let mut out = Vec::new();
            while let Ok(p) = self.rx.try_recv() {
                out.push(p);
            }
            out
        }

        async fn register_token(&self, user_id: &str, token: &str) {
            let mut fields = Fields::new();
            fields.insert("devicePushToken".into(), FieldValue::value(token));
            self.store.set(&paths::user(user_id), fields, true).await.unwrap();
        }
    }

    /// Events a given session would actually receive.
    fn delivered_to(session: &RelaySession, payloads: &[Arc<BroadcastPayload>]) -> Vec<ServerEvent> {
        payloads
            .iter()
            .filter(|p| session.accepts(&p.audience))
            .map(|p| p.event.clone())
            .collect()
    }

    fn hi(room_id: &str, recipient: Option<&str>) -> WireMessage {
        WireMessage {
            id: "m1".into(),
            room_id: room_id.into(),
            recipient_id: recipient.map(str::to_string),
            text: "hi".into(),
            image: String::new(),
            created_at: 0,
            user: Author::new("alice", "Alice"),
        }
    }

    #[tokio::test]
    async fn online_broadcasts_to_everyone_and_mirrors() {
        let mut h = harness();
        let a = RelaySession::with_id("s_a");
        let other = RelaySession::with_id("s_x");

        h.relay.handle(&a, ClientEvent::UserOnline(UserRef { user_id: "alice".into() }));

        let payloads = h.drain();
        let expected = ServerEvent::StatusUpdate(PresencePayload {
            user_id: "alice".into(),
            is_online: true,
            last_seen: None,
        });
        assert_eq!(delivered_to(&other, &payloads), vec![expected.clone()]);
        assert_eq!(delivered_to(&a, &payloads), vec![expected]);
        assert!(h.relay.is_online("alice"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let doc = h.store.get(&paths::user("alice")).await.unwrap().unwrap();
        assert_eq!(doc.get_bool("isOnline"), Some(true));
    }

    #[tokio::test]
    async fn send_message_routes_to_room_and_acks_sender() {
        let mut h = harness();
        let a = RelaySession::with_id("s_a");
        let b = RelaySession::with_id("s_b");
        let outsider = RelaySession::with_id("s_c");

        h.relay.user_online(&a, "alice");
        h.relay.user_online(&b, "bob");
        h.relay.join(&a, "alice_bob");
        h.relay.join(&b, "alice_bob");
        h.drain();

        h.relay.handle(&a, ClientEvent::SendMessage(hi("alice_bob", Some("bob"))));
        let payloads = h.drain();

        assert_eq!(
            delivered_to(&b, &payloads),
            vec![ServerEvent::ReceiveMessage(hi("alice_bob", Some("bob")))]
        );
        assert_eq!(
            delivered_to(&a, &payloads),
            vec![ServerEvent::MessageStatusUpdate(StatusUpdatePayload {
                message_id: "m1".into(),
                room_id: "alice_bob".into(),
                status: DeliveryStatus::Sent,
            })]
        );
        assert!(delivered_to(&outsider, &payloads).is_empty());

        // Online recipient: no push.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_recipient_gets_exactly_one_push() {
        let mut h = harness();
        h.register_token("bob", "bob-device").await;
        let a = RelaySession::with_id("s_a");
        h.relay.user_online(&a, "alice");
        h.relay.join(&a, "alice_bob");

        h.relay.send_message(&a, hi("alice_bob", Some("bob")));

        let push = tokio::time::timeout(Duration::from_secs(1), h.pushes.recv())
            .await
            .expect("push not sent")
            .unwrap();
        assert_eq!(push.device_token, "bob-device");
        assert_eq!(push.title, "Alice");
        assert_eq!(push.body, "hi");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.pushes.try_recv().is_err());

        // Nobody else joined: zero direct deliveries.
        let payloads = h.drain();
        let receive_count = payloads
            .iter()
            .filter(|p| matches!(p.event, ServerEvent::ReceiveMessage(_)))
            .filter(|p| a.accepts(&p.audience))
            .count();
        assert_eq!(receive_count, 0);
    }

    #[tokio::test]
    async fn message_without_recipient_never_pushes() {
        let mut h = harness();
        h.register_token("bob", "bob-device").await;
        let a = RelaySession::with_id("s_a");

        h.relay.send_message(&a, hi("alice_bob", None));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_and_status_stay_inside_the_room() {
        let mut h = harness();
        let a = RelaySession::with_id("s_a");
        let b = RelaySession::with_id("s_b");
        let c = RelaySession::with_id("s_c");
        h.relay.join(&a, "alice_bob");
        h.relay.join(&b, "alice_bob");
        h.relay.join(&c, "alice_carol");

        h.relay.handle(
            &b,
            ClientEvent::Typing(TypingPayload {
                room_id: "alice_bob".into(),
                user_id: "bob".into(),
                is_typing: true,
            }),
        );
        let seen = MessageRef {
            message_id: "m1".into(),
            room_id: "alice_bob".into(),
        };
        h.relay.handle(&b, ClientEvent::MessageDelivered(seen.clone()));
        h.relay.handle(&b, ClientEvent::MessageSeen(seen));

        let payloads = h.drain();
        let to_a = delivered_to(&a, &payloads);
        assert_eq!(to_a.len(), 3);
        assert!(matches!(&to_a[0], ServerEvent::UserTyping(t) if t.is_typing));
        assert!(matches!(
            &to_a[1],
            ServerEvent::MessageStatusUpdate(s) if s.status == DeliveryStatus::Delivered
        ));
        assert!(matches!(
            &to_a[2],
            ServerEvent::MessageStatusUpdate(s) if s.status == DeliveryStatus::Seen
        ));
        assert!(delivered_to(&b, &payloads).is_empty());
        assert!(delivered_to(&c, &payloads).is_empty());
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_mark_reconnected_user_offline() {
        let mut h = harness();
        let old = RelaySession::with_id("s_old");
        let new = RelaySession::with_id("s_new");

        h.relay.user_online(&old, "alice");
        h.relay.user_online(&new, "alice");
        h.drain();

        h.relay.disconnect(&old);
        h.relay.user_offline(&old, "alice");

        assert!(h.relay.is_online("alice"));
        assert!(h.drain().is_empty());

        h.relay.disconnect(&new);
        assert!(!h.relay.is_online("alice"));
        let payloads = h.drain();
        assert_eq!(payloads.len(), 1);
        match &payloads[0].event {
            ServerEvent::StatusUpdate(p) => {
                assert_eq!(p.user_id, "alice");
                assert!(!p.is_online);
                assert!(p.last_seen.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_cannot_speak_for_another_user() {
        let mut h = harness();
        let a = RelaySession::with_id("s_a");
        let b = RelaySession::with_id("s_b");
        h.relay.user_online(&a, "alice");
        h.relay.user_online(&b, "bob");
        h.drain();

        h.relay.user_online(&a, "bob");
        h.relay.user_offline(&a, "bob");

        assert!(h.relay.is_online("bob"));
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn join_is_idempotent_and_ignores_empty_rooms() {
        let h = harness();
        let a = RelaySession::with_id("s_a");
        h.relay.handle(&a, ClientEvent::JoinChat(RoomRef { room_id: "a_b".into() }));
        h.relay.handle(&a, ClientEvent::JoinChat(RoomRef { room_id: "a_b".into() }));
        h.relay.join(&a, "");
        assert!(a.is_joined("a_b"));
        assert!(!a.is_joined(""));
    }

    /// Store whose `isOnline: true` writes land late.
    struct SlowOnlineStore {
        inner: MemoryDocumentStore,
        delay: Duration,
    }

    #[async_trait]
    impl DocumentStore for SlowOnlineStore {
        async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
            self.inner.get(path).await
        }

        async fn set(&self, path: &str, fields: Fields, merge: bool) -> Result<(), StoreError> {
            let going_online = matches!(
                fields.get("isOnline"),
                Some(FieldValue::Value(v)) if v.as_bool() == Some(true)
            );
            if going_online {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.set(path, fields, merge).await
        }

        async fn update(&self, path: &str, fields: Fields) -> Result<(), StoreError> {
            self.inner.update(path, fields).await
        }

        async fn subscribe(&self, query: Query) -> Result<SnapshotStream, StoreError> {
            self.inner.subscribe(query).await
        }

        fn new_id(&self, collection: &str) -> String {
            self.inner.new_id(collection)
        }
    }

    #[tokio::test]
    async fn quick_online_then_disconnect_leaves_store_offline() {
        let store = Arc::new(SlowOnlineStore {
            inner: MemoryDocumentStore::new(),
            delay: Duration::from_millis(50),
        });
        let (tx, _pushes) = mpsc::unbounded_channel();
        let relay = Relay::new(store.clone(), Arc::new(RecordingPush(tx)), 64);
        let s = RelaySession::with_id("s_a");

        relay.user_online(&s, "alice");
        relay.disconnect(&s);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!relay.is_online("alice"));
        let doc = store.get(&paths::user("alice")).await.unwrap().unwrap();
        assert_eq!(doc.get_bool("isOnline"), Some(false));
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_leaves_store_online() {
        let store = Arc::new(SlowOnlineStore {
            inner: MemoryDocumentStore::new(),
            delay: Duration::from_millis(50),
        });
        let (tx, _pushes) = mpsc::unbounded_channel();
        let relay = Relay::new(store.clone(), Arc::new(RecordingPush(tx)), 64);
        let first = RelaySession::with_id("s_1");
        let second = RelaySession::with_id("s_2");

        relay.user_online(&first, "alice");
        relay.disconnect(&first);
        relay.user_online(&second, "alice");

        tokio::time::sleep(Duration::from_millis(300)).await;
        let doc = store.get(&paths::user("alice")).await.unwrap().unwrap();
        assert_eq!(doc.get_bool("isOnline"), Some(true));
    }

    #[tokio::test]
    async fn mirror_failures_do_not_block_routing() {
        let mut h = harness();
        h.store.set_fail_writes(true);
        let a = RelaySession::with_id("s_a");

        h.relay.user_online(&a, "alice");
        h.relay.disconnect(&a);

        let payloads = h.drain();
        assert_eq!(payloads.len(), 2);
        assert!(!h.relay.is_online("alice"));
    }
}
