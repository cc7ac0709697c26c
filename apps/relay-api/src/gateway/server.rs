//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pairchat_common::ClientEvent;
use tokio::sync::broadcast;

use crate::AppState;

use super::fanout::BroadcastPayload;
use super::relay::Relay;
use super::session::RelaySession;

pub fn router() -> Router<AppState> {
    Router::new().route("/relay", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state.relay))
}

async fn handle_connection(socket: WebSocket, relay: Arc<Relay>) {
    let (ws_tx, ws_rx) = socket.split();
    let session = RelaySession::new();

    // Subscribe before reading anything so no event addressed to this
    // session can slip past between join and the first recv.
    let broadcast_rx = relay.subscribe();

    tracing::info!(session_id = %session.session_id, "relay session established");

    run_session(&relay, &session, ws_tx, ws_rx, broadcast_rx).await;

    relay.disconnect(&session);

    tracing::info!(
        session_id = %session.session_id,
        user_id = session.user_id().unwrap_or("-"),
        "relay session ended"
    );
}

/// Main session event loop: route client events, forward matching broadcasts.
async fn run_session(
    relay: &Relay,
    session: &RelaySession,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
) {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientEvent::parse(text.as_str()) {
                            Ok(event) => {
                                tracing::debug!(
                                    session_id = %session.session_id,
                                    event = event.name(),
                                    "client event"
                                );
                                relay.handle(session, event);
                            }
                            Err(err) => {
                                tracing::debug!(
                                    session_id = %session.session_id,
                                    %err,
                                    "dropping malformed event"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                        break;
                    }
                    // Ping/Pong are answered by the WebSocket layer; binary is ignored.
                    Some(Ok(_)) => continue,
                }
            }

            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        if !session.accepts(&payload.audience) {
                            continue;
                        }
                        if ws_tx.send(Message::Text(payload.frame.clone().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            session_id = %session.session_id,
                            skipped = n,
                            "relay session lagged behind broadcast"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
