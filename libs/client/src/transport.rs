//! Relay connection: a WebSocket client that emits [`ClientEvent`]s and fans
//! incoming [`ServerEvent`]s out to every interested task.
//!
//! The relay keeps no state across sockets, so the client remembers who it
//! announced and which rooms it joined and replays both on every new socket.
//! A socket that drops without [`RelayTransport::disconnect`] is redialled
//! with backoff.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pairchat_common::events::{RoomRef, UserRef};
use pairchat_common::{ClientEvent, ServerEvent};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ClientConfig;
use crate::error::TransportError;

const EVENT_CAPACITY: usize = 256;

/// The client's view of the relay.
///
/// Emitting is best effort: an event emitted while disconnected is lost and
/// the durable store is expected to cover for it.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open the connection. A no-op while already connected.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn emit(&self, event: ClientEvent) -> Result<(), TransportError>;

    /// Receive every server event from now on.
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

/// Session-scoped state the relay forgets when a socket closes.
#[derive(Debug, Default)]
struct SessionMemory {
    user_id: Option<String>,
    rooms: BTreeSet<String>,
}

impl SessionMemory {
    fn record(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::UserOnline(u) => self.user_id = Some(u.user_id.clone()),
            ClientEvent::UserOffline(_) => {
                self.user_id = None;
                self.rooms.clear();
            }
            ClientEvent::JoinChat(r) => {
                self.rooms.insert(r.room_id.clone());
            }
            _ => {}
        }
    }

    /// Events that restore this session on a fresh socket, user first.
    fn replay(&self) -> Vec<ClientEvent> {
        let user = self.user_id.iter().map(|user_id| {
            ClientEvent::UserOnline(UserRef {
                user_id: user_id.clone(),
            })
        });
        let rooms = self.rooms.iter().map(|room_id| {
            ClientEvent::JoinChat(RoomRef {
                room_id: room_id.clone(),
            })
        });
        user.chain(rooms).collect()
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.outgoing.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    /// The client closed the outgoing queue.
    Requested,
    /// The relay or the network went away.
    Dropped,
}

/// WebSocket implementation of [`RelayTransport`].
pub struct RelayClient {
    config: ClientConfig,
    me: Weak<RelayClient>,
    events: broadcast::Sender<ServerEvent>,
    connection: Mutex<Option<Connection>>,
    /// Serializes connect and disconnect so two callers never open two sockets.
    connecting: tokio::sync::Mutex<()>,
    session: Mutex<SessionMemory>,
    /// Set by a successful connect, cleared by disconnect. A dropped socket is
    /// only redialled while this holds.
    wanted: AtomicBool,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            events,
            connection: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            session: Mutex::new(SessionMemory::default()),
            wanted: AtomicBool::new(false),
        })
    }

    async fn open(&self, redial: bool) -> Result<(), TransportError> {
        let _guard = self.connecting.lock().await;
        if redial && !self.wanted.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.is_connected() {
            return Ok(());
        }

        let url = self.config.relay_url.as_str();
        let (stream, _) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        tracing::info!(relay_url = %url, "relay connected");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let replay = self.session.lock().replay();
        if !replay.is_empty() {
            tracing::debug!(events = replay.len(), "restoring relay session");
        }
        for event in &replay {
            // The receiver is alive until the task below exits.
            let _ = outgoing.send(serde_json::to_string(event)?);
        }

        self.wanted.store(true, Ordering::SeqCst);
        let events = self.events.clone();
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            if run_connection(stream, outgoing_rx, events).await == Ended::Dropped {
                if let Some(client) = me.upgrade() {
                    client.schedule_redial();
                }
            }
        });
        *self.connection.lock() = Some(Connection { outgoing, task });
        Ok(())
    }

    fn schedule_redial(&self) {
        if !self.wanted.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!("relay connection lost, reconnecting");
        tokio::spawn(redial(
            self.me.clone(),
            self.config.reconnect_delay,
            self.config.max_reconnect_delay,
        ));
    }
}

async fn redial(client: Weak<RelayClient>, mut delay: Duration, max: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(client) = client.upgrade() else {
            return;
        };
        if !client.wanted.load(Ordering::SeqCst) {
            return;
        }
        let Err(err) = client.open(true).await else {
            return;
        };
        delay = (delay * 2).min(max);
        tracing::warn!(%err, retry_in = ?delay, "relay reconnect failed");
    }
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn connect(&self) -> Result<(), TransportError> {
        self.open(false).await
    }

    async fn disconnect(&self) {
        let _guard = self.connecting.lock().await;
        self.wanted.store(false, Ordering::SeqCst);
        let connection = self.connection.lock().take();
        if let Some(Connection { outgoing, task }) = connection {
            // Closing the queue lets the connection task flush what was
            // already emitted, then send a close frame.
            drop(outgoing);
            if let Err(err) = task.await {
                tracing::debug!(%err, "relay connection task ended abnormally");
            }
            tracing::info!("relay disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(Connection::is_alive)
    }

    fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&event)?;
        // Remembered even when the send fails, so the next socket restores it.
        self.session.lock().record(&event);
        let guard = self.connection.lock();
        let connection = guard.as_ref().ok_or(TransportError::NotConnected)?;
        connection
            .outgoing
            .send(frame)
            .map_err(|_| TransportError::NotConnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

type Stream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn run_connection(
    stream: Stream,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<ServerEvent>,
) -> Ended {
    let (mut ws_tx, mut ws_rx) = stream.split();

    let ended = loop {
        tokio::select! {
            frame = outgoing.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            break Ended::Dropped;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break Ended::Requested;
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match ServerEvent::parse(text.as_str()) {
                        Ok(event) => {
                            // No subscribers is fine: nobody is listening yet.
                            let _ = events.send(event);
                        }
                        Err(err) => tracing::debug!(%err, "dropping malformed relay event"),
                    },
                    Some(Ok(Message::Close(_))) | None => break Ended::Dropped,
                    Some(Err(err)) => {
                        tracing::debug!(%err, "relay read error");
                        break Ended::Dropped;
                    }
                    Some(Ok(_)) => continue,
                }
            }
        }
    };

    tracing::debug!(?ended, "relay connection closed");
    ended
}
