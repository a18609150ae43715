//! Per-connection session: the join/leave state machine and the router
//! from inbound client events to the room components.
//!
//! ```text
//! Disconnected ──join──► Joining ──► Joined ──leave/close──► Disconnected
//!                            │
//!                            └─ store error ─► Disconnected
//! ```
//!
//! A session handles one event at a time. Replies meant only for this
//! connection are returned from [`Session::handle`]; everything addressed
//! to the room goes through the room's broadcast group and comes back out
//! of [`Session::next_frame`] on every subscribed session.

use std::sync::Arc;

use crate::broadcast::{BroadcastGroup, RoomManager, RoomSubscription};
use crate::cursor;
use crate::document::{self, DocumentError};
use crate::exec::ExecutionCoordinator;
use crate::presence::PresenceEntry;
use crate::protocol::{
    ClientEvent, ConnectionId, FileContent, FileRename, FilePathRef, FileTree, JoinRequest,
    ProtocolError, ServerEvent,
};
use crate::storage::{RoomStore, StoreError};

/// Shared state every session works against.
pub struct CollabContext {
    pub store: Arc<dyn RoomStore>,
    pub rooms: RoomManager,
    pub exec: Arc<ExecutionCoordinator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Joining,
    Joined,
}

/// Errors from handling one inbound event. None of them end the connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Join a room before sending {0}")]
    NotJoined(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

struct JoinedRoom {
    group: Arc<BroadcastGroup>,
    entry: PresenceEntry,
}

/// State of one client connection.
pub struct Session {
    id: ConnectionId,
    state: SessionState,
    ctx: Arc<CollabContext>,
    joined: Option<JoinedRoom>,
    subscription: Option<RoomSubscription>,
    active_file: Option<String>,
}

impl Session {
    pub fn new(id: ConnectionId, ctx: Arc<CollabContext>) -> Self {
        Self {
            id,
            state: SessionState::Disconnected,
            ctx,
            joined: None,
            subscription: None,
            active_file: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        self.joined.as_ref().map(|j| j.group.room_id())
    }

    pub fn presence(&self) -> Option<&PresenceEntry> {
        self.joined.as_ref().map(|j| &j.entry)
    }

    pub fn active_file(&self) -> Option<&str> {
        self.active_file.as_deref()
    }

    /// Apply one client event. Returns the events to send back to this
    /// connection only.
    pub async fn handle(&mut self, event: ClientEvent) -> Result<Vec<ServerEvent>, SessionError> {
        if let ClientEvent::Join(request) = event {
            return self.join(request).await.map(|reply| vec![reply]);
        }

        let Some(joined) = &self.joined else {
            log::debug!("Connection {}: {} before join, dropped", self.id, event.name());
            return Err(SessionError::NotJoined(event.name()));
        };
        let group = &joined.group;
        let room_id = group.room_id();
        let store = self.ctx.store.as_ref();

        match event {
            ClientEvent::Join(_) => Ok(Vec::new()),
            ClientEvent::FileTreeChange(FileTree { tree }) => {
                document::publish_file_tree(store, group, tree)?;
                Ok(Vec::new())
            }
            ClientEvent::FileContentChange(FileContent { file_path, content }) => {
                self.active_file = Some(file_path.clone());
                document::set_file_content(store, group, self.id, file_path, content)?;
                Ok(Vec::new())
            }
            ClientEvent::FileContentRequest(FilePathRef { file_path }) => {
                let reply = document::get_file_content(store, room_id, &file_path)?;
                self.active_file = Some(file_path);
                Ok(vec![reply])
            }
            ClientEvent::CursorChange(change) => {
                let file_path = match change.file_path {
                    Some(path) => {
                        self.active_file = Some(path.clone());
                        path
                    }
                    None => self.active_file.clone().unwrap_or_default(),
                };
                cursor::publish_cursor(group, &joined.entry, change.line, change.column, file_path)?;
                Ok(Vec::new())
            }
            ClientEvent::TerminalCommand(line) => {
                log::debug!("Room {room_id}: terminal {:?} for {}", line.kind, line.file_path);
                group.publish(&ServerEvent::TerminalUpdate(line), None)?;
                Ok(Vec::new())
            }
            ClientEvent::ExecuteRequest(request) => {
                self.ctx.exec.submit(group.clone(), request);
                Ok(Vec::new())
            }
            ClientEvent::FileDelete(FilePathRef { file_path }) => {
                document::delete_file(store, room_id, &file_path)?;
                Ok(Vec::new())
            }
            ClientEvent::FileRename(FileRename { old_path, new_path }) => {
                document::rename_file(store, room_id, &old_path, &new_path)?;
                if self.active_file.as_deref() == Some(old_path.as_str()) {
                    self.active_file = Some(new_path);
                }
                Ok(Vec::new())
            }
        }
    }

    async fn join(&mut self, request: JoinRequest) -> Result<ServerEvent, SessionError> {
        if self.joined.is_some() {
            self.leave().await;
        }
        self.state = SessionState::Joining;
        match self.enter(request).await {
            Ok(reply) => {
                self.state = SessionState::Joined;
                Ok(reply)
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn enter(&mut self, request: JoinRequest) -> Result<ServerEvent, SessionError> {
        let room_id = request.room_id;
        let (room, created) = self.ctx.store.load_or_create(&room_id)?;
        if created {
            log::info!("Room {room_id} created");
        }

        // Subscribes before joining the roster, so the presence update
        // below reaches this connection too.
        let (group, entry, subscription) = self
            .ctx
            .rooms
            .attach(&room_id, self.id, &request.username)
            .await;

        if let Err(e) = self.ctx.store.set_user(&room_id, self.id, &entry.username) {
            group.remove_peer(&self.id).await;
            self.ctx.rooms.remove_if_empty(&room_id).await;
            return Err(e.into());
        }
        group.publish_presence().await?;

        log::info!(
            "{} ({}) joined room {room_id} with color {}",
            entry.username,
            self.id,
            entry.color
        );
        self.joined = Some(JoinedRoom { group, entry });
        self.subscription = Some(subscription);
        Ok(ServerEvent::FileTreeUpdate(FileTree { tree: room.files }))
    }

    /// Leave the current room, if any. Safe to call repeatedly.
    pub async fn leave(&mut self) {
        self.subscription = None;
        self.active_file = None;
        let Some(JoinedRoom { group, entry }) = self.joined.take() else {
            self.state = SessionState::Disconnected;
            return;
        };
        self.state = SessionState::Disconnected;
        let room_id = group.room_id();

        group.remove_peer(&self.id).await;
        if let Err(e) = self.ctx.store.remove_user(room_id, self.id) {
            log::warn!("Room {room_id}: failed to remove {} from store: {e}", self.id);
        }
        if let Err(e) = group.publish_presence().await {
            log::warn!("Room {room_id}: failed to publish presence: {e}");
        }
        self.ctx.rooms.remove_if_empty(room_id).await;

        log::info!("{} ({}) left room {room_id}", entry.username, self.id);
    }

    /// Next room frame for this connection. Pending forever while not
    /// joined; `None` if the room's channel went away.
    pub async fn next_frame(&mut self) -> Option<Arc<str>> {
        let Some(subscription) = self.subscription.as_mut() else {
            return std::future::pending().await;
        };
        let frame = subscription.recv().await;
        if frame.is_none() {
            self.subscription = None;
        }
        frame
    }
}

/// Build a context over `store`.
pub fn context(
    store: Arc<dyn RoomStore>,
    exec: Arc<ExecutionCoordinator>,
    broadcast_capacity: usize,
    palette: Vec<String>,
) -> Arc<CollabContext> {
    Arc::new(CollabContext {
        store,
        rooms: RoomManager::new(broadcast_capacity, palette),
        exec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::protocol::{CursorChange, PresenceList};
    use crate::storage::MemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_context() -> Arc<CollabContext> {
        let exec = ExecutionCoordinator::new(&ExecutionConfig::default()).unwrap();
        context(Arc::new(MemoryStore::new()), Arc::new(exec), 64, Vec::new())
    }

    fn join(room: &str, name: &str) -> ClientEvent {
        ClientEvent::Join(JoinRequest {
            room_id: room.into(),
            username: name.into(),
        })
    }

    async fn next_event(session: &mut Session) -> ServerEvent {
        let frame = tokio::time::timeout(Duration::from_secs(1), session.next_frame())
            .await
            .expect("timed out waiting for frame")
            .expect("subscription closed");
        ServerEvent::decode(&frame).unwrap()
    }

    fn presence(names: &[&str]) -> ServerEvent {
        ServerEvent::PresenceUpdate(PresenceList {
            usernames: names.iter().map(|n| n.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_join_creates_room_and_replies_with_tree() {
        let ctx = test_context();
        let mut session = Session::new(Uuid::new_v4(), ctx.clone());
        assert_eq!(session.state(), SessionState::Disconnected);

        let replies = session.handle(join("fresh", "Alice")).await.unwrap();
        assert_eq!(replies, vec![ServerEvent::FileTreeUpdate(FileTree { tree: vec![] })]);
        assert_eq!(session.state(), SessionState::Joined);
        assert_eq!(next_event(&mut session).await, presence(&["Alice"]));

        let room = ctx.store.load("fresh").unwrap().unwrap();
        assert!(room.files.is_empty());
        assert!(room.code.is_empty());
        assert_eq!(room.users.get(&session.id()).map(String::as_str), Some("Alice"));
    }

    #[tokio::test]
    async fn test_events_before_join_are_rejected() {
        let mut session = Session::new(Uuid::new_v4(), test_context());
        let err = session
            .handle(ClientEvent::FileContentRequest(FilePathRef { file_path: "a".into() }))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotJoined("fileContentRequest")));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_leave_updates_remaining_members() {
        let ctx = test_context();
        let mut alice = Session::new(Uuid::new_v4(), ctx.clone());
        let mut bob = Session::new(Uuid::new_v4(), ctx.clone());

        alice.handle(join("r", "Alice")).await.unwrap();
        bob.handle(join("r", "Bob")).await.unwrap();
        assert_eq!(next_event(&mut alice).await, presence(&["Alice"]));
        assert_eq!(next_event(&mut alice).await, presence(&["Alice", "Bob"]));

        bob.leave().await;
        bob.leave().await;
        assert_eq!(bob.state(), SessionState::Disconnected);
        assert_eq!(next_event(&mut alice).await, presence(&["Alice"]));

        let room = ctx.store.load("r").unwrap().unwrap();
        assert_eq!(room.users.len(), 1);
    }

    #[tokio::test]
    async fn test_last_leave_releases_group() {
        let ctx = test_context();
        let mut session = Session::new(Uuid::new_v4(), ctx.clone());
        session.handle(join("solo", "Alice")).await.unwrap();
        assert_eq!(ctx.rooms.room_count().await, 1);

        session.leave().await;
        assert_eq!(ctx.rooms.room_count().await, 0);
        assert!(ctx.store.load("solo").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejoin_moves_between_rooms() {
        let ctx = test_context();
        let mut watcher = Session::new(Uuid::new_v4(), ctx.clone());
        let mut mover = Session::new(Uuid::new_v4(), ctx.clone());

        watcher.handle(join("one", "Watcher")).await.unwrap();
        mover.handle(join("one", "Mover")).await.unwrap();
        mover.handle(join("two", "Mover")).await.unwrap();

        assert_eq!(next_event(&mut watcher).await, presence(&["Watcher"]));
        assert_eq!(next_event(&mut watcher).await, presence(&["Watcher", "Mover"]));
        assert_eq!(next_event(&mut watcher).await, presence(&["Watcher"]));
        assert_eq!(mover.room_id(), Some("two"));
        assert_eq!(next_event(&mut mover).await, presence(&["Mover"]));
    }

    #[tokio::test]
    async fn test_content_request_is_private_and_sets_active_file() {
        let ctx = test_context();
        let mut alice = Session::new(Uuid::new_v4(), ctx.clone());
        alice.handle(join("r", "Alice")).await.unwrap();

        let replies = alice
            .handle(ClientEvent::FileContentRequest(FilePathRef { file_path: "x.js".into() }))
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![ServerEvent::FileContentUpdate(FileContent {
                file_path: "x.js".into(),
                content: "// Welcome to x.js\n".into(),
            })]
        );
        assert_eq!(alice.active_file(), Some("x.js"));
    }

    #[tokio::test]
    async fn test_cursor_falls_back_to_active_file() {
        let ctx = test_context();
        let mut alice = Session::new(Uuid::new_v4(), ctx.clone());
        let mut bob = Session::new(Uuid::new_v4(), ctx.clone());
        alice.handle(join("r", "Alice")).await.unwrap();
        bob.handle(join("r", "Bob")).await.unwrap();
        // Drain presence updates
        next_event(&mut bob).await;

        alice
            .handle(ClientEvent::FileContentRequest(FilePathRef { file_path: "main.py".into() }))
            .await
            .unwrap();
        alice
            .handle(ClientEvent::CursorChange(CursorChange { line: 2, column: 5, file_path: None }))
            .await
            .unwrap();

        match next_event(&mut bob).await {
            ServerEvent::CursorUpdate(update) => {
                assert_eq!(update.file_path, "main.py");
                assert_eq!(update.user_name, "Alice");
                assert_eq!(update.line, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rename_follows_active_file() {
        let ctx = test_context();
        let mut alice = Session::new(Uuid::new_v4(), ctx.clone());
        alice.handle(join("r", "Alice")).await.unwrap();
        alice
            .handle(ClientEvent::FileContentChange(FileContent {
                file_path: "a.js".into(),
                content: "1".into(),
            }))
            .await
            .unwrap();
        alice
            .handle(ClientEvent::FileRename(FileRename {
                old_path: "a.js".into(),
                new_path: "b.js".into(),
            }))
            .await
            .unwrap();

        assert_eq!(alice.active_file(), Some("b.js"));
        assert_eq!(ctx.store.get_code("r", "b.js").unwrap().as_deref(), Some("1"));
    }
}
