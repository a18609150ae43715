//! WebSocket client for a room server.
//!
//! Used by the integration tests and by tooling that scripts a room
//! (load generators, smoke checks). Inbound frames arrive as
//! [`RoomEvent`]s on a channel taken once with
//! [`RoomClient::take_event_rx`]. Remote cursors are also kept in a
//! [`CursorBook`], pruned by presence updates.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::cursor::CursorBook;
use crate::protocol::{
    ClientEvent, CursorChange, CursorUpdate, ExecutionRequest, FileContent, FilePathRef, JoinRequest,
    ProtocolError, ServerEvent,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Connection established
    Connected,
    /// An event from the server
    Server(ServerEvent),
    /// Connection lost
    Disconnected,
}

/// The room client.
pub struct RoomClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<RoomEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<RoomEvent>,

    /// Latest remote cursor per user
    cursors: Arc<RwLock<CursorBook>>,

    server_url: String,
}

impl RoomClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            cursors: Arc::new(RwLock::new(CursorBook::new())),
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RoomEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RoomEvent::Connected).await;

        // Reader task: decode server events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let cursors = self.cursors.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            cursors.write().await.observe(&event);
                            if event_tx.send(RoomEvent::Server(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RoomEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send one event.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        self.send_message(Message::text(event.encode()?)).await
    }

    /// Send a raw WebSocket message.
    pub async fn send_message(&self, msg: Message) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join(&self, room_id: &str, username: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Join(JoinRequest {
            room_id: room_id.to_string(),
            username: username.to_string(),
        }))
        .await
    }

    pub async fn set_content(&self, file_path: &str, content: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::FileContentChange(FileContent {
            file_path: file_path.to_string(),
            content: content.to_string(),
        }))
        .await
    }

    pub async fn request_content(&self, file_path: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::FileContentRequest(FilePathRef {
            file_path: file_path.to_string(),
        }))
        .await
    }

    pub async fn move_cursor(&self, file_path: &str, line: u32, column: u32) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CursorChange(CursorChange {
            line,
            column,
            file_path: Some(file_path.to_string()),
        }))
        .await
    }

    pub async fn execute(&self, language: &str, file_path: &str, source_code: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::ExecuteRequest(ExecutionRequest {
            source_code: source_code.to_string(),
            language: language.to_string(),
            file_path: file_path.to_string(),
        }))
        .await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Remote cursors currently placed in `file_path`, sorted by user name.
    pub async fn cursors_in(&self, file_path: &str) -> Vec<CursorUpdate> {
        self.cursors
            .read()
            .await
            .in_file(file_path)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
