use pairchat_common::StoreError;
use thiserror::Error;

/// Relay connection failures. Never fatal: the store stays authoritative.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("relay connect timed out")]
    Timeout,
    #[error("relay not connected")]
    NotConnected,
    #[error("failed to encode relay event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Object storage failures.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("object storage unavailable: {0}")]
    Unavailable(String),
}

/// Why a send was refused or did not reach the store.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message has neither text nor attachment")]
    EmptyMessage,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("room is closed")]
    Closed,
}
