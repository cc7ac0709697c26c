mod common;

use common::FakeRelay;
use pairchat_client::account::{go_online, register_push_token, sign_out, PushToken};
use pairchat_client::{RelayTransport, TransportError};
use pairchat_common::events::UserRef;
use pairchat_common::store::paths;
use pairchat_common::{ClientEvent, DocumentStore, MemoryDocumentStore};

#[tokio::test]
async fn push_tokens_merge_into_the_user_document() {
    let store = MemoryDocumentStore::new();

    register_push_token(
        &store,
        "bob",
        &PushToken::Device {
            token: "apns-123".into(),
            platform: "ios".into(),
        },
    )
    .await
    .unwrap();
    register_push_token(&store, "bob", &PushToken::Fcm("fcm-456".into()))
        .await
        .unwrap();

    let doc = store.get(&paths::user("bob")).await.unwrap().unwrap();
    assert_eq!(doc.get_str("devicePushToken"), Some("apns-123"));
    assert_eq!(doc.get_str("pushPlatform"), Some("ios"));
    assert_eq!(doc.get_str("fcmToken"), Some("fcm-456"));
}

#[tokio::test]
async fn go_online_connects_then_announces() {
    let relay = FakeRelay::new();

    go_online(relay.as_ref(), "alice").await.unwrap();

    assert!(relay.is_connected());
    assert_eq!(
        relay.emitted(),
        vec![ClientEvent::UserOnline(UserRef {
            user_id: "alice".into()
        })]
    );
}

#[tokio::test]
async fn go_online_reports_unreachable_relay() {
    let relay = FakeRelay::new();
    relay.set_unreachable(true);

    let err = go_online(relay.as_ref(), "alice").await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
    assert!(relay.emitted().is_empty());
}

#[tokio::test]
async fn sign_out_announces_records_and_disconnects() {
    let relay = FakeRelay::new();
    let store = MemoryDocumentStore::new();
    go_online(relay.as_ref(), "alice").await.unwrap();

    sign_out(relay.as_ref(), &store, "alice").await;

    assert_eq!(
        relay.emitted().last(),
        Some(&ClientEvent::UserOffline(UserRef {
            user_id: "alice".into()
        }))
    );
    assert!(!relay.is_connected());
    let doc = store.get(&paths::user("alice")).await.unwrap().unwrap();
    assert_eq!(doc.get_bool("isOnline"), Some(false));
    assert!(doc.get_i64("lastSeen").is_some());
}

#[tokio::test]
async fn sign_out_survives_store_and_relay_failures() {
    let relay = FakeRelay::new();
    let store = MemoryDocumentStore::new();
    store.set_fail_writes(true);

    // Never connected and the store refuses writes: still completes.
    sign_out(relay.as_ref(), &store, "alice").await;
    assert!(relay.emitted().is_empty());
}
