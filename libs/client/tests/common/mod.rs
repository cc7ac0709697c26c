#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pairchat_client::error::{TransportError, UploadError};
use pairchat_client::{ObjectStorage, RelayTransport, RoomDeps};
use pairchat_common::store::{paths, Document};
use pairchat_common::{Author, ChatMessage, ClientEvent, DocumentStore, MemoryDocumentStore, ServerEvent};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// In-process stand-in for the relay: records what the client emits and
/// lets the test inject server events.
pub struct FakeRelay {
    events: broadcast::Sender<ServerEvent>,
    emitted: Mutex<Vec<ClientEvent>>,
    connected: AtomicBool,
    unreachable: AtomicBool,
}

impl FakeRelay {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            emitted: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        })
    }

    pub fn inject(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.emitted.lock().clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayTransport for FakeRelay {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.emitted.lock().push(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// Object storage that hands out sequential URLs, or fails every upload.
pub struct FakeStorage {
    fail: bool,
    uploads: AtomicUsize,
    content_types: Mutex<Vec<String>>,
}

impl FakeStorage {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            uploads: AtomicUsize::new(0),
            content_types: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            uploads: AtomicUsize::new(0),
            content_types: Mutex::new(Vec::new()),
        })
    }

    pub fn content_types(&self) -> Vec<String> {
        self.content_types.lock().clone()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(&self, _bytes: Vec<u8>, content_type: &str) -> Result<String, UploadError> {
        if self.fail {
            return Err(UploadError::Unavailable("storage offline".into()));
        }
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        self.content_types.lock().push(content_type.to_string());
        Ok(format!("https://files.test/chat_images/{n}"))
    }
}

pub struct Fixture {
    pub relay: Arc<FakeRelay>,
    pub store: Arc<MemoryDocumentStore>,
    pub storage: Arc<FakeStorage>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_storage(FakeStorage::working())
    }

    pub fn with_storage(storage: Arc<FakeStorage>) -> Self {
        Self {
            relay: FakeRelay::new(),
            store: Arc::new(MemoryDocumentStore::new()),
            storage,
        }
    }

    pub fn deps(&self) -> RoomDeps {
        RoomDeps {
            transport: self.relay.clone(),
            store: self.store.clone(),
            storage: self.storage.clone(),
        }
    }

    pub async fn message_doc(&self, room_id: &str, message_id: &str) -> Option<Document> {
        self.store
            .get(&paths::message(room_id, message_id))
            .await
            .expect("store read")
    }

    /// Write a message document the way its author's client would.
    pub async fn store_message(&self, message: &ChatMessage) {
        self.store
            .set(
                &paths::message(&message.room_id, &message.id),
                message.store_fields(),
                false,
            )
            .await
            .expect("store write");
    }
}

pub fn alice() -> Author {
    Author::new("alice", "Alice")
}

pub fn bob() -> Author {
    Author::new("bob", "Bob")
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
