pub mod config;
pub mod error;
pub mod gateway;
pub mod push;
pub mod routes;

use std::sync::Arc;

use config::Config;
use gateway::relay::Relay;
use pairchat_common::DocumentStore;
use push::PushNotifier;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        push: Arc<dyn PushNotifier>,
    ) -> Self {
        let relay = Relay::new(store, push, config.broadcast_capacity);
        Self {
            config: Arc::new(config),
            relay: Arc::new(relay),
        }
    }
}
