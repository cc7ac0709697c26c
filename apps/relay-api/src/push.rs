//! Push-notification fallback for recipients without a live relay session.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pairchat_common::store::{paths, Document};
use pairchat_common::{DocumentStore, WireMessage};
use serde::Serialize;
use thiserror::Error;

use crate::error::RelayError;

/// Title used when the sender has no display name.
const DEFAULT_TITLE: &str = "New Message";
/// Body used for attachment-only messages.
const MEDIA_BODY: &str = "Sent an image";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push gateway rejected notification: HTTP {0}")]
    Rejected(u16),
}

/// A notification addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub device_token: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl PushNotification {
    /// Summarize a chat message for a recipient who is not connected.
    pub fn for_message(device_token: String, message: &WireMessage) -> Self {
        let title = if message.user.name.is_empty() {
            DEFAULT_TITLE.to_string()
        } else {
            message.user.name.clone()
        };
        let (body, kind) = if message.text.is_empty() {
            (MEDIA_BODY.to_string(), "media")
        } else {
            (message.text.clone(), "text")
        };

        let mut data = BTreeMap::new();
        data.insert("chatId".to_string(), message.room_id.clone());
        data.insert("senderId".to_string(), message.user.id.clone());
        data.insert("senderName".to_string(), message.user.name.clone());
        data.insert("type".to_string(), kind.to_string());

        Self {
            device_token,
            title,
            body,
            data,
        }
    }
}

/// Push delivery transport.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn send(&self, notification: &PushNotification) -> Result<(), PushError>;
}

// ---------------------------------------------------------------------------
// HTTP push gateway
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PushRequest<'a> {
    token: &'a str,
    notification: PushContent<'a>,
    data: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct PushContent<'a> {
    title: &'a str,
    body: &'a str,
}

pub struct HttpPushNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPushNotifier {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl PushNotifier for HttpPushNotifier {
    async fn send(&self, notification: &PushNotification) -> Result<(), PushError> {
        let body = PushRequest {
            token: &notification.device_token,
            notification: PushContent {
                title: &notification.title,
                body: &notification.body,
            },
            data: &notification.data,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PushError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log-only notifier (no push gateway configured)
// ---------------------------------------------------------------------------

pub struct LogPushNotifier;

#[async_trait]
impl PushNotifier for LogPushNotifier {
    async fn send(&self, notification: &PushNotification) -> Result<(), PushError> {
        tracing::info!(
            title = %notification.title,
            chat_id = notification.data.get("chatId").map(String::as_str).unwrap_or_default(),
            "push gateway not configured, notification dropped"
        );
        Ok(())
    }
}

/// Pick the token to push to: the native device token first, then the
/// stored FCM token. Expo tokens are not usable from the server.
pub fn device_token(user: &Document) -> Option<String> {
    ["devicePushToken", "fcmToken"]
        .iter()
        .filter_map(|field| user.get_str(field))
        .find(|token| !token.is_empty())
        .map(str::to_string)
}

/// Look up the recipient's push token and send them a summary of `message`.
pub async fn deliver_offline_push(
    store: &dyn DocumentStore,
    notifier: &dyn PushNotifier,
    recipient_id: &str,
    message: &WireMessage,
) -> Result<(), RelayError> {
    let user = store
        .get(&paths::user(recipient_id))
        .await?
        .ok_or_else(|| RelayError::RecipientNotFound(recipient_id.to_string()))?;
    let token =
        device_token(&user).ok_or_else(|| RelayError::NoDeviceToken(recipient_id.to_string()))?;

    notifier
        .send(&PushNotification::for_message(token, message))
        .await?;
    Ok(())
}
