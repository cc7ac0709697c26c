//! Chat messages and their delivery status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::{Document, FieldValue, Fields};

/// Store preview shown for a message that only carries an attachment.
pub const IMAGE_PREVIEW: &str = "📷 Image";

/// Status carried by a `message_status_update` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Seen,
}

/// The three independent status flags of a message.
///
/// Flags only ever go from `false` to `true`; [`StatusFlags::merge`] is a
/// per-flag logical OR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub sent: bool,
    pub delivered: bool,
    pub seen: bool,
}

impl StatusFlags {
    pub const ALL: StatusFlags = StatusFlags {
        sent: true,
        delivered: true,
        seen: true,
    };

    /// OR `other` into `self`. Returns true if any flag changed.
    pub fn merge(&mut self, other: StatusFlags) -> bool {
        let merged = self.union(other);
        let changed = merged != *self;
        *self = merged;
        changed
    }

    pub fn union(self, other: StatusFlags) -> StatusFlags {
        StatusFlags {
            sent: self.sent || other.sent,
            delivered: self.delivered || other.delivered,
            seen: self.seen || other.seen,
        }
    }

    /// True when every flag set in `other` is also set here.
    pub fn covers(self, other: StatusFlags) -> bool {
        self.union(other) == self
    }

    pub fn is_empty(self) -> bool {
        self == StatusFlags::default()
    }

    /// Read the flags off a stored message document. Missing fields are false.
    pub fn from_document(doc: &Document) -> StatusFlags {
        StatusFlags {
            sent: doc.get_bool("sent").unwrap_or(false),
            delivered: doc.get_bool("received").unwrap_or(false),
            seen: doc.get_bool("seen").unwrap_or(false),
        }
    }

    /// Store fields for the flags that are set. False flags are left out so a
    /// mirror write never clears what another writer already recorded.
    pub fn true_fields(self) -> Fields {
        let mut fields = Fields::new();
        if self.sent {
            fields.insert("sent".to_string(), FieldValue::value(true));
        }
        if self.delivered {
            fields.insert("received".to_string(), FieldValue::value(true));
        }
        if self.seen {
            fields.insert("seen".to_string(), FieldValue::value(true));
        }
        fields
    }
}

impl From<DeliveryStatus> for StatusFlags {
    /// A later status implies the earlier ones.
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Sent => StatusFlags {
                sent: true,
                ..Default::default()
            },
            DeliveryStatus::Delivered => StatusFlags {
                sent: true,
                delivered: true,
                seen: false,
            },
            DeliveryStatus::Seen => StatusFlags::ALL,
        }
    }
}

/// Sender identity embedded in every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Author {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }
}

/// A message as it travels over the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Attachment URL, empty when the message is text only.
    #[serde(default)]
    pub image: String,
    /// Client clock, milliseconds since the Unix epoch.
    #[serde(default)]
    pub created_at: i64,
    pub user: Author,
}

/// A message as a client holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub text: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub user: Author,
    pub flags: StatusFlags,
}

impl ChatMessage {
    /// A freshly composed message, not yet confirmed by either channel.
    pub fn outgoing(
        id: String,
        room_id: String,
        user: Author,
        text: String,
        image: String,
    ) -> Self {
        Self {
            id,
            room_id,
            text,
            image,
            created_at: Utc::now(),
            user,
            flags: StatusFlags::default(),
        }
    }

    pub fn from_wire(wire: WireMessage) -> Self {
        Self {
            id: wire.id,
            room_id: wire.room_id,
            text: wire.text,
            image: wire.image,
            created_at: DateTime::from_timestamp_millis(wire.created_at).unwrap_or_else(Utc::now),
            user: wire.user,
            flags: StatusFlags::default(),
        }
    }

    pub fn to_wire(&self, recipient_id: Option<String>) -> WireMessage {
        WireMessage {
            id: self.id.clone(),
            room_id: self.room_id.clone(),
            recipient_id,
            text: self.text.clone(),
            image: self.image.clone(),
            created_at: self.created_at.timestamp_millis(),
            user: self.user.clone(),
        }
    }

    /// Rebuild a message from its stored document.
    ///
    /// Returns `None` when the document has no author. A missing or
    /// non-numeric `createdAt` (a server timestamp still pending) falls back
    /// to the local clock.
    pub fn from_document(room_id: &str, doc: &Document) -> Option<Self> {
        let user: Author = doc
            .data
            .get("user")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())?;
        if user.id.is_empty() {
            return None;
        }
        let created_at = doc
            .get_i64("createdAt")
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Some(Self {
            id: doc.id.clone(),
            room_id: room_id.to_string(),
            text: doc.get_str("text").unwrap_or_default().to_string(),
            image: doc.get_str("image").unwrap_or_default().to_string(),
            created_at,
            user,
            flags: StatusFlags::from_document(doc),
        })
    }

    /// Fields of the initial store write: all flags false, creation time
    /// assigned by the store.
    pub fn store_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("text".to_string(), FieldValue::value(self.text.clone()));
        fields.insert("image".to_string(), FieldValue::value(self.image.clone()));
        fields.insert("createdAt".to_string(), FieldValue::ServerTimestamp);
        fields.insert(
            "user".to_string(),
            FieldValue::Value(serde_json::to_value(&self.user).unwrap_or(Value::Null)),
        );
        for flag in ["sent", "received", "seen"] {
            fields.insert(flag.to_string(), FieldValue::value(false));
        }
        fields
    }

    /// Text preview stored on the conversation summary.
    pub fn preview(&self) -> &str {
        if self.image.is_empty() {
            &self.text
        } else {
            IMAGE_PREVIEW
        }
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.user.id == user_id
    }
}

/// Summary fields written by the sender on every send.
pub fn summary_fields(message: &ChatMessage, recipient_id: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("lastMessage".to_string(), FieldValue::value(message.preview()));
    fields.insert("lastMessageTime".to_string(), FieldValue::ServerTimestamp);
    fields.insert(
        "participants".to_string(),
        FieldValue::from(json!([message.user.id, recipient_id])),
    );
    fields.insert(
        crate::store::paths::unread_field(recipient_id),
        FieldValue::Increment(1),
    );
    fields
}
