//! Object storage collaborator for attachments.

use async_trait::async_trait;

use crate::error::UploadError;

/// Stores opaque bytes and returns a URL that resolves to them.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<String, UploadError>;
}

/// An attachment picked by the user.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Type reported by the picker, if any.
    pub mime_type: Option<String>,
}

impl Attachment {
    pub fn content_type(&self) -> String {
        content_type_for(&self.file_name, self.mime_type.as_deref())
    }
}

/// Use the reported type when it is an image type, otherwise guess from the
/// file extension.
pub fn content_type_for(file_name: &str, reported: Option<&str>) -> String {
    if let Some(mime) = reported.filter(|m| m.starts_with("image/")) {
        return mime.to_string();
    }
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
    .to_string()
}
