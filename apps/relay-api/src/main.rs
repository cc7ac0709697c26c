use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pairchat_common::{DocumentStore, MemoryDocumentStore};
use relay_api::config::Config;
use relay_api::push::{HttpPushNotifier, LogPushNotifier, PushNotifier};
use relay_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // The durable store is an external service; this process only mirrors
    // presence into it and reads push tokens from it. No adapter for a shared
    // store exists yet, so the binary runs on a private in-memory store that
    // no client writes to: presence mirrors are invisible to clients and the
    // offline push fallback never finds a device token. Embedders wire a real
    // store through `AppState::new`.
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
    tracing::warn!(
        "running on a process-local document store, offline pushes and presence mirrors are inert"
    );

    let push: Arc<dyn PushNotifier> = match &config.push_endpoint {
        Some(endpoint) => {
            tracing::info!(%endpoint, "push gateway configured");
            Arc::new(HttpPushNotifier::new(endpoint.clone(), config.push_api_key.clone()))
        }
        None => {
            tracing::warn!("PUSH_ENDPOINT not set, offline pushes will only be logged");
            Arc::new(LogPushNotifier)
        }
    };

    let state = AppState::new(config, store, push);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(relay_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
