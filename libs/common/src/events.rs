//! Relay wire events.
//!
//! Every WebSocket text frame carries exactly one event encoded as
//! `{"event": "<name>", "data": {...}}`. Payload fields are camelCase.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{DeliveryStatus, WireMessage};

/// Why an incoming frame was dropped.
#[derive(Debug, Error)]
pub enum MalformedEvent {
    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub room_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: String,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload {
    pub message_id: String,
    pub room_id: String,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    pub is_online: bool,
    /// Milliseconds since the Unix epoch; only sent when going offline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    UserOnline(UserRef),
    UserOffline(UserRef),
    JoinChat(RoomRef),
    SendMessage(WireMessage),
    Typing(TypingPayload),
    MessageDelivered(MessageRef),
    MessageSeen(MessageRef),
}

impl ClientEvent {
    /// Decode and validate a frame. Anything that fails here is dropped by
    /// the relay without closing the connection.
    pub fn parse(frame: &str) -> Result<Self, MalformedEvent> {
        let event: ClientEvent = serde_json::from_str(frame)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), MalformedEvent> {
        match self {
            ClientEvent::UserOnline(u) | ClientEvent::UserOffline(u) => {
                require("userId", &u.user_id)
            }
            ClientEvent::JoinChat(r) => require("roomId", &r.room_id),
            ClientEvent::SendMessage(m) => {
                require("_id", &m.id)?;
                require("roomId", &m.room_id)?;
                require("user._id", &m.user.id)
            }
            ClientEvent::Typing(t) => {
                require("roomId", &t.room_id)?;
                require("userId", &t.user_id)
            }
            ClientEvent::MessageDelivered(m) | ClientEvent::MessageSeen(m) => {
                require("messageId", &m.message_id)?;
                require("roomId", &m.room_id)
            }
        }
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserOnline(_) => "user_online",
            ClientEvent::UserOffline(_) => "user_offline",
            ClientEvent::JoinChat(_) => "join_chat",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::MessageDelivered(_) => "message_delivered",
            ClientEvent::MessageSeen(_) => "message_seen",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage(WireMessage),
    UserTyping(TypingPayload),
    MessageStatusUpdate(StatusUpdatePayload),
    StatusUpdate(PresencePayload),
}

impl ServerEvent {
    pub fn parse(frame: &str) -> Result<Self, MalformedEvent> {
        let event: ServerEvent = serde_json::from_str(frame)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), MalformedEvent> {
        match self {
            ServerEvent::ReceiveMessage(m) => {
                require("_id", &m.id)?;
                require("roomId", &m.room_id)?;
                require("user._id", &m.user.id)
            }
            ServerEvent::UserTyping(t) => {
                require("roomId", &t.room_id)?;
                require("userId", &t.user_id)
            }
            ServerEvent::MessageStatusUpdate(s) => {
                require("messageId", &s.message_id)?;
                require("roomId", &s.room_id)
            }
            ServerEvent::StatusUpdate(p) => require("userId", &p.user_id),
        }
    }
}

fn require(field: &'static str, value: &str) -> Result<(), MalformedEvent> {
    if value.trim().is_empty() {
        Err(MalformedEvent::MissingField(field))
    } else {
        Ok(())
    }
}
