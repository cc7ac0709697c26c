//! Durable document store collaborator.
//!
//! The store is the system of record: users, conversation summaries and
//! messages live here. The relay and clients only see it through
//! [`DocumentStore`], so a hosted backend can be swapped in without touching
//! either side.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::id;

/// Errors surfaced by a [`DocumentStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid store path: {0}")]
    InvalidPath(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A single field in a write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Store this value as-is.
    Value(Value),
    /// Replaced by the store's clock (milliseconds since the Unix epoch).
    ServerTimestamp,
    /// Atomically add to the existing numeric value (missing counts as 0).
    Increment(i64),
}

impl FieldValue {
    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

/// Fields of a write, keyed by field name.
pub type Fields = BTreeMap<String, FieldValue>;

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.data.get(field).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.data.get(field).and_then(Value::as_i64)
    }
}

/// A collection query: every document in `collection`, optionally ordered.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub order_by: Option<(String, Direction)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Query {
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            collection: path.into(),
            order_by: None,
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }
}

/// Stream of full query results. The first snapshot arrives immediately on
/// subscribe, then one per change to the collection.
pub type SnapshotStream = mpsc::UnboundedReceiver<Vec<Document>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// Write `fields` to `path`. With `merge`, existing fields not named in
    /// `fields` are kept; without it, the document is replaced.
    async fn set(&self, path: &str, fields: Fields, merge: bool) -> Result<(), StoreError>;

    /// Merge `fields` into an existing document. Fails with
    /// [`StoreError::NotFound`] when the document does not exist.
    async fn update(&self, path: &str, fields: Fields) -> Result<(), StoreError>;

    async fn subscribe(&self, query: Query) -> Result<SnapshotStream, StoreError>;

    /// Issue a fresh document id for `collection`.
    fn new_id(&self, collection: &str) -> String;
}

/// Store paths used by the chat.
pub mod paths {
    pub const USERS: &str = "users";
    pub const CHATS: &str = "chats";

    pub fn user(user_id: &str) -> String {
        format!("{USERS}/{user_id}")
    }

    pub fn chat(room_id: &str) -> String {
        format!("{CHATS}/{room_id}")
    }

    pub fn messages(room_id: &str) -> String {
        format!("{CHATS}/{room_id}/messages")
    }

    pub fn message(room_id: &str, message_id: &str) -> String {
        format!("{CHATS}/{room_id}/messages/{message_id}")
    }

    /// Per-participant unread counter field on a chat summary.
    pub fn unread_field(user_id: &str) -> String {
        format!("unreadCount_{user_id}")
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for local runs / tests)
// ---------------------------------------------------------------------------

struct Subscriber {
    query: Query,
    tx: mpsc::UnboundedSender<Vec<Document>>,
}

#[derive(Default)]
struct Inner {
    /// collection path -> document id -> fields
    collections: HashMap<String, BTreeMap<String, Map<String, Value>>>,
    subscribers: Vec<Subscriber>,
}

pub struct MemoryDocumentStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    fn write(
        &self,
        path: &str,
        fields: Fields,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let (collection, doc_id) = split_doc_path(path)?;

        let mut inner = self.inner.lock();
        let docs = inner.collections.entry(collection.to_string()).or_default();

        let exists = docs.contains_key(doc_id);
        if mode == WriteMode::Update && !exists {
            return Err(StoreError::NotFound(path.to_string()));
        }

        let doc = docs.entry(doc_id.to_string()).or_default();
        if mode == WriteMode::Replace {
            doc.clear();
        }
        let now = Utc::now().timestamp_millis();
        for (field, value) in fields {
            let resolved = match value {
                FieldValue::Value(v) => v,
                FieldValue::ServerTimestamp => Value::from(now),
                FieldValue::Increment(delta) => {
                    let current = doc.get(&field).and_then(Value::as_i64).unwrap_or(0);
                    Value::from(current + delta)
                }
            };
            doc.insert(field, resolved);
        }

        notify(&mut inner, collection);
        Ok(())
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Replace,
    Merge,
    Update,
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let (collection, doc_id) = split_doc_path(path)?;
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(doc_id))
            .map(|data| Document {
                id: doc_id.to_string(),
                data: data.clone(),
            }))
    }

    async fn set(&self, path: &str, fields: Fields, merge: bool) -> Result<(), StoreError> {
        let mode = if merge { WriteMode::Merge } else { WriteMode::Replace };
        self.write(path, fields, mode)
    }

    async fn update(&self, path: &str, fields: Fields) -> Result<(), StoreError> {
        self.write(path, fields, WriteMode::Update)
    }

    async fn subscribe(&self, query: Query) -> Result<SnapshotStream, StoreError> {
        validate_collection_path(&query.collection)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let _ = tx.send(run_query(&inner, &query));
        inner.subscribers.push(Subscriber { query, tx });
        Ok(rx)
    }

    fn new_id(&self, collection: &str) -> String {
        if collection.ends_with("/messages") {
            id::prefixed_ulid(id::prefix::MESSAGE)
        } else {
            id::prefixed_ulid(id::prefix::DOCUMENT)
        }
    }
}

/// Push a fresh snapshot to every live subscriber of `collection`, dropping
/// subscribers whose receiver is gone.
fn notify(inner: &mut Inner, collection: &str) {
    let current: &Inner = inner;
    let snapshots: Vec<Option<Vec<Document>>> = current
        .subscribers
        .iter()
        .map(|s| (s.query.collection == collection).then(|| run_query(current, &s.query)))
        .collect();

    let mut idx = 0;
    inner.subscribers.retain(|s| {
        let keep = match &snapshots[idx] {
            Some(snapshot) => s.tx.send(snapshot.clone()).is_ok(),
            None => !s.tx.is_closed(),
        };
        idx += 1;
        keep
    });
}

fn run_query(inner: &Inner, query: &Query) -> Vec<Document> {
    let mut docs: Vec<Document> = inner
        .collections
        .get(&query.collection)
        .map(|docs| {
            docs.iter()
                .map(|(id, data)| Document {
                    id: id.clone(),
                    data: data.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some((field, direction)) = &query.order_by {
        docs.sort_by(|a, b| {
            let ka = a.get_i64(field);
            let kb = b.get_i64(field);
            let ord = match direction {
                Direction::Ascending => ka.cmp(&kb),
                // Missing keys still sort last.
                Direction::Descending => match (ka, kb) {
                    (Some(x), Some(y)) => y.cmp(&x),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                },
            };
            ord.then_with(|| a.id.cmp(&b.id))
        });
    }
    docs
}

/// Split `a/b/c/d` into (`a/b/c`, `d`). Document paths have an even number
/// of non-empty segments.
fn split_doc_path(path: &str) -> Result<(&str, &str), StoreError> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() % 2 != 0 || segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    path.rsplit_once('/')
        .ok_or_else(|| StoreError::InvalidPath(path.to_string()))
}

fn validate_collection_path(path: &str) -> Result<(), StoreError> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() % 2 != 1 || segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}
