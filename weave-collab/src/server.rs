//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── RoomStore (memory | RocksDB)
//!            ├── Session ── room ───┤      files / code / users
//! Client B ──┘      │               └── BroadcastGroup ──► Client A, B, C
//!                   │
//!                   └── ExecutionCoordinator ── sandboxed subprocesses
//! ```
//!
//! One task per connection drives a [`Session`] with a `select!` over the
//! socket, the room subscription and a heartbeat timer. A failing event is
//! answered with an `error` event and the connection stays open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::config::{ConfigError, ServerConfig};
use crate::exec::{ExecError, ExecStats, ExecutionCoordinator};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::session::{self, CollabContext, Session};
use crate::storage::{MemoryStore, RocksStore, RoomStore, StoreConfig, StoreError};

/// Errors that stop the server or end one connection.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Execution setup error: {0}")]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
    /// Rooms persisted in the store, active or not
    pub stored_rooms: usize,
    pub messages_lagged: u64,
    pub execution: ExecStats,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The room server.
pub struct CollabServer {
    config: ServerConfig,
    ctx: Arc<CollabContext>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Open the configured store and build the server.
    ///
    /// Fails if the store cannot be opened; the server never listens
    /// without one.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let store: Arc<dyn RoomStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
            None => {
                log::info!("No storage path configured, rooms are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store)
    }

    /// Build the server over an already opened store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn RoomStore>) -> Result<Self, ServerError> {
        // Presence left behind by a previous process belongs to dead sockets
        let purged = store.clear_users()?;
        if purged > 0 {
            log::info!("Cleared {purged} stale presence entries");
        }
        log::info!("Store holds {} rooms", store.list_rooms()?.len());

        let exec = Arc::new(ExecutionCoordinator::new(&config.execution)?);
        let ctx = session::context(store, exec, config.broadcast_capacity, config.palette.clone());
        Ok(Self {
            config,
            ctx,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Room server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let stats = self.stats.clone();
            let heartbeat = self.config.heartbeat_interval_secs;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx, stats, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<CollabContext>,
        stats: Arc<RwLock<ServerStats>>,
        heartbeat_secs: u64,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let mut session = Session::new(Uuid::new_v4(), ctx);
        log::info!("WebSocket connection {} established from {addr}", session.id());

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::drive(ws_stream, &mut session, &stats, heartbeat_secs).await;

        // Leave even when the socket failed mid-frame
        session.leave().await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection {} from {addr} closed", session.id());
        result
    }

    async fn drive(
        ws_stream: WebSocketStream<TcpStream>,
        session: &mut Session,
        stats: &RwLock<ServerStats>,
        heartbeat_secs: u64,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut heartbeat = heartbeat_timer(heartbeat_secs);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let replies = Self::dispatch(session, text.as_str()).await;
                            for reply in replies {
                                send_event(&mut ws_sender, &reply).await?;
                            }
                        }

                        Some(Ok(Message::Binary(data))) => {
                            log::warn!("Connection {}: rejected {}-byte binary frame", session.id(), data.len());
                            stats.write().await.rejected_frames += 1;
                            let reply = ServerEvent::error(ProtocolError::UnsupportedFrame.to_string());
                            send_event(&mut ws_sender, &reply).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection {} closed by peer", session.id());
                            break;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {}: {e}", session.id());
                            break;
                        }

                        _ => {}
                    }
                }

                frame = session.next_frame() => {
                    if let Some(frame) = frame {
                        ws_sender.send(Message::text(frame.to_string())).await?;
                    }
                }

                _ = tick(&mut heartbeat) => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    /// Decode and apply one text frame. Failures become an `error` event
    /// for the sender.
    async fn dispatch(session: &mut Session, text: &str) -> Vec<ServerEvent> {
        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Connection {}: undecodable frame: {e}", session.id());
                return vec![ServerEvent::error(e.to_string())];
            }
        };

        let name = event.name();
        log::trace!("Connection {}: {name}", session.id());
        match session.handle(event).await {
            Ok(replies) => replies,
            Err(e) => {
                log::warn!("Connection {}: {name} failed: {e}", session.id());
                vec![ServerEvent::error(e.to_string())]
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let rooms = self.ctx.rooms.active_rooms().await;
        stats.active_rooms = rooms.len();
        for room_id in rooms {
            if let Some(group) = self.ctx.rooms.get(&room_id).await {
                stats.messages_lagged += group.stats().await.messages_lagged;
            }
        }
        match self.ctx.store.list_rooms() {
            Ok(stored) => stats.stored_rooms = stored.len(),
            Err(e) => log::warn!("Failed to count stored rooms: {e}"),
        }
        stats.execution = self.ctx.exec.stats();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.ctx.store
    }

    pub fn context(&self) -> &Arc<CollabContext> {
        &self.ctx
    }
}

async fn send_event(sink: &mut WsSink, event: &ServerEvent) -> Result<(), ServerError> {
    sink.send(Message::text(event.encode()?)).await?;
    Ok(())
}

fn heartbeat_timer(secs: u64) -> Option<Interval> {
    (secs > 0).then(|| {
        let period = Duration::from_secs(secs);
        tokio::time::interval_at(Instant::now() + period, period)
    })
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
