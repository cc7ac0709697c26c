//! Signed-in user lifecycle: coming online, push registration and sign-out.

use pairchat_common::events::UserRef;
use pairchat_common::store::{paths, FieldValue, Fields};
use pairchat_common::{ClientEvent, DocumentStore, StoreError};

use crate::error::TransportError;
use crate::transport::RelayTransport;

/// A push registration reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushToken {
    /// Native device token (APNs or FCM), with its platform name.
    Device { token: String, platform: String },
    Fcm(String),
    Expo(String),
}

impl PushToken {
    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        match self {
            PushToken::Device { token, platform } => {
                fields.insert("devicePushToken".into(), FieldValue::value(token.as_str()));
                fields.insert("pushPlatform".into(), FieldValue::value(platform.as_str()));
            }
            PushToken::Fcm(token) => {
                fields.insert("fcmToken".into(), FieldValue::value(token.as_str()));
            }
            PushToken::Expo(token) => {
                fields.insert("expoPushToken".into(), FieldValue::value(token.as_str()));
            }
        }
        fields
    }
}

/// Merge the token into `users/<uid>` so the relay can push to this device.
pub async fn register_push_token(
    store: &dyn DocumentStore,
    user_id: &str,
    token: &PushToken,
) -> Result<(), StoreError> {
    store.set(&paths::user(user_id), token.fields(), true).await?;
    tracing::info!(user_id = %user_id, "push token registered");
    Ok(())
}

/// Connect the relay and announce the user.
pub async fn go_online(transport: &dyn RelayTransport, user_id: &str) -> Result<(), TransportError> {
    transport.connect().await?;
    transport.emit(ClientEvent::UserOnline(UserRef {
        user_id: user_id.to_string(),
    }))
}

/// Announce the user offline, record it in the store and drop the relay
/// connection. Every step is best effort.
pub async fn sign_out(transport: &dyn RelayTransport, store: &dyn DocumentStore, user_id: &str) {
    if let Err(err) = transport.emit(ClientEvent::UserOffline(UserRef {
        user_id: user_id.to_string(),
    })) {
        tracing::debug!(%err, user_id = %user_id, "offline event not sent");
    }

    let mut fields = Fields::new();
    fields.insert("isOnline".into(), FieldValue::value(false));
    fields.insert("lastSeen".into(), FieldValue::ServerTimestamp);
    if let Err(err) = store.set(&paths::user(user_id), fields, true).await {
        tracing::warn!(%err, user_id = %user_id, "failed to record sign-out");
    }

    transport.disconnect().await;
    tracing::info!(user_id = %user_id, "signed out");
}
