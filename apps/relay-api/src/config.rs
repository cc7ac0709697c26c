use crate::gateway::fanout::DEFAULT_BROADCAST_CAPACITY;

/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// HTTP endpoint of the push gateway. Pushes are only logged when unset.
    pub push_endpoint: Option<String>,
    /// Bearer token sent to the push gateway.
    pub push_api_key: Option<String>,
    /// Capacity of the relay broadcast channel.
    pub broadcast_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables. Every variable is
    /// optional.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT").unwrap_or(3000),
            push_endpoint: optional_var("PUSH_ENDPOINT"),
            push_api_key: optional_var("PUSH_API_KEY"),
            broadcast_capacity: parsed_var("BROADCAST_CAPACITY")
                .unwrap_or(DEFAULT_BROADCAST_CAPACITY),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            push_endpoint: None,
            push_api_key: None,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
