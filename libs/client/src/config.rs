use std::time::Duration;

/// Client-side tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay endpoint.
    pub relay_url: String,
    /// Upper bound on a single relay connect attempt.
    pub connect_timeout: Duration,
    /// How long a peer's "typing" indicator survives without a follow-up.
    pub typing_timeout: Duration,
    /// First wait before redialling a dropped relay connection. Doubles on
    /// every failed attempt up to `max_reconnect_delay`.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3000/relay".to_string(),
            connect_timeout: Duration::from_secs(10),
            typing_timeout: Duration::from_secs(6),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}
