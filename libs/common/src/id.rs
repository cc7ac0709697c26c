use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = pairchat_common::id::prefixed_ulid("ses");
/// assert!(id.starts_with("ses_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Relay sessions, one per WebSocket connection.
    pub const SESSION: &str = "ses";
    /// Message documents issued by the document store.
    pub const MESSAGE: &str = "msg";
    /// Generic store documents that are not messages.
    pub const DOCUMENT: &str = "doc";
}
