#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use pairchat_common::store::{paths, FieldValue, Fields};
use pairchat_common::{ClientEvent, DocumentStore, MemoryDocumentStore, ServerEvent};
use relay_api::config::Config;
use relay_api::push::{PushError, PushNotification, PushNotifier};
use relay_api::AppState;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Push notifier that hands every notification to the test.
pub struct RecordingPush {
    tx: mpsc::UnboundedSender<PushNotification>,
}

#[async_trait]
impl PushNotifier for RecordingPush {
    async fn send(&self, notification: &PushNotification) -> Result<(), PushError> {
        let _ = self.tx.send(notification.clone());
        Ok(())
    }
}

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: AppState,
    pub store: Arc<MemoryDocumentStore>,
    pub pushes: mpsc::UnboundedReceiver<PushNotification>,
}

impl TestRelay {
    pub fn url(&self) -> String {
        format!("ws://{}/relay", self.addr)
    }

    pub async fn register_device(&self, user_id: &str, name: &str, token: &str) {
        let mut fields = Fields::new();
        fields.insert("displayName".into(), FieldValue::value(name));
        fields.insert("devicePushToken".into(), FieldValue::value(token));
        self.store
            .set(&paths::user(user_id), fields, true)
            .await
            .expect("seed user");
    }

    /// Wait for the next push, failing after two seconds.
    pub async fn next_push(&mut self) -> PushNotification {
        time::timeout(Duration::from_secs(2), self.pushes.recv())
            .await
            .expect("timeout waiting for push")
            .expect("push channel closed")
    }

    /// Assert no push arrives within a short grace period.
    pub async fn assert_no_push(&mut self) {
        time::sleep(Duration::from_millis(100)).await;
        assert!(self.pushes.try_recv().is_err(), "unexpected push notification");
    }
}

/// Build the router and state around an in-memory store and recording push.
pub fn test_app() -> (Router, AppState, Arc<MemoryDocumentStore>, mpsc::UnboundedReceiver<PushNotification>) {
    let store = Arc::new(MemoryDocumentStore::new());
    let (tx, pushes) = mpsc::unbounded_channel();
    let state = AppState::new(Config::default(), store.clone(), Arc::new(RecordingPush { tx }));
    let app = relay_api::routes::router().with_state(state.clone());
    (app, state, store, pushes)
}

/// Start an actual TCP server for WebSocket testing.
pub async fn start_relay() -> TestRelay {
    let (app, state, store, pushes) = test_app();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestRelay {
        addr,
        state,
        store,
        pushes,
    }
}

/// Connect and wait until the server side of the session is live.
pub async fn connect(relay: &TestRelay) -> WsStream {
    let (mut ws, _) = tokio_tungstenite::connect_async(relay.url())
        .await
        .expect("ws connect");
    sync(&mut ws).await;
    ws
}

/// Ping round trip. The server only answers after it has read every frame
/// sent before the ping, so anything sent earlier has been handled. Returns
/// the events that arrived in the meantime.
pub async fn sync(ws: &mut WsStream) -> Vec<ServerEvent> {
    ws.send(Message::Ping(Default::default()))
        .await
        .expect("ws ping");
    let mut events = Vec::new();
    loop {
        let msg = time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timeout waiting for pong")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Pong(_) => return events,
            Message::Text(text) => {
                events.push(ServerEvent::parse(text.as_str()).expect("valid server event"))
            }
            _ => {}
        }
    }
}

pub async fn send(ws: &mut WsStream, event: &ClientEvent) {
    let frame = serde_json::to_string(event).expect("encode event");
    ws.send(Message::Text(frame.into())).await.expect("ws send");
}

pub async fn send_raw(ws: &mut WsStream, frame: &str) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("ws send");
}

/// Read the next relay event, failing after two seconds.
pub async fn recv(ws: &mut WsStream) -> ServerEvent {
    loop {
        let msg = time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timeout waiting for relay event")
            .expect("stream ended")
            .expect("ws read error");
        if let Message::Text(text) = msg {
            return ServerEvent::parse(text.as_str()).expect("valid server event");
        }
    }
}

/// Read events until one matches, skipping the rest.
pub async fn recv_matching<F>(ws: &mut WsStream, mut pred: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    loop {
        let event = recv(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Assert that nothing arrives within a short grace period.
pub async fn assert_silent(ws: &mut WsStream) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        time::timeout(Duration::from_millis(150), ws.next()).await
    {
        panic!("unexpected relay event: {text}");
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        if time::Instant::now() >= deadline {
            panic!("condition not met within 2s");
        }
        time::sleep(Duration::from_millis(10)).await;
    }
}
