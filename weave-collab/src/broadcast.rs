//! Room fan-out with backpressure.
//!
//! Each room owns one tokio broadcast channel. Events are encoded once and
//! shared as `Arc<Envelope>`; every subscriber gets an independent receiver
//! that buffers up to `capacity` frames. A subscriber that falls further
//! behind loses the oldest frames and is told how many it missed.
//!
//! Sender exclusion ("everyone but me") is carried in the envelope and
//! applied on the receiving side, so one send serves both room-wide and
//! others-only relays.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

use crate::presence::{PresenceEntry, PresenceRoster};
use crate::protocol::{ConnectionId, PresenceList, ProtocolError, ServerEvent};

/// A pre-encoded frame plus the connection (if any) that must not see it.
#[derive(Debug)]
pub struct Envelope {
    pub skip: Option<ConnectionId>,
    pub frame: Arc<str>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single room: the fan-out channel and the
/// presence roster of everyone subscribed to it.
pub struct BroadcastGroup {
    room_id: String,
    sender: broadcast::Sender<Arc<Envelope>>,
    roster: RwLock<PresenceRoster>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(room_id: impl Into<String>, capacity: usize, palette: Vec<String>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            room_id: room_id.into(),
            sender,
            roster: RwLock::new(PresenceRoster::new(palette)),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Subscribe a connection and add it to the roster.
    ///
    /// The subscription is created before the roster changes so the joiner
    /// sees its own presence update.
    pub async fn add_peer(
        &self,
        connection_id: ConnectionId,
        username: &str,
    ) -> (PresenceEntry, RoomSubscription) {
        let subscription = self.subscribe(connection_id);
        let entry = self.roster.write().await.join(connection_id, username);
        (entry, subscription)
    }

    /// Remove a connection from the roster.
    pub async fn remove_peer(&self, connection_id: &ConnectionId) -> Option<PresenceEntry> {
        self.roster.write().await.leave(connection_id)
    }

    /// Encode an event once and send it to every subscriber except `skip`.
    ///
    /// Returns the number of live receivers (the skipped one included).
    pub fn publish(
        &self,
        event: &ServerEvent,
        skip: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = Arc::from(event.encode()?);
        Ok(self.publish_raw(frame, skip))
    }

    /// Send a pre-encoded frame.
    pub fn publish_raw(&self, frame: Arc<str>, skip: Option<ConnectionId>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Envelope { skip, frame }))
            .unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Broadcast the current roster to the whole room.
    pub async fn publish_presence(&self) -> Result<usize, ProtocolError> {
        let usernames = self.usernames().await;
        self.publish(&ServerEvent::PresenceUpdate(PresenceList { usernames }), None)
    }

    pub async fn peer(&self, connection_id: &ConnectionId) -> Option<PresenceEntry> {
        self.roster.read().await.get(connection_id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.roster.read().await.len()
    }

    pub async fn usernames(&self) -> Vec<String> {
        self.roster.read().await.usernames()
    }

    pub async fn has_peer(&self, connection_id: &ConnectionId) -> bool {
        self.roster.read().await.contains(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let roster = self.roster.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: roster.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw subscription without joining the roster.
    pub fn subscribe(&self, connection_id: ConnectionId) -> RoomSubscription {
        RoomSubscription {
            connection_id,
            receiver: self.sender.subscribe(),
            stats: self.atomic_stats.clone(),
        }
    }
}

/// One connection's view of a room's broadcast stream.
pub struct RoomSubscription {
    connection_id: ConnectionId,
    receiver: broadcast::Receiver<Arc<Envelope>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl RoomSubscription {
    /// Next frame addressed to this connection. `None` once the room's
    /// channel is closed.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if envelope.skip == Some(self.connection_id) {
                        continue;
                    }
                    return Some(envelope.frame.clone());
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Connection {} lagged by {n} messages", self.connection_id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

/// Room manager: maps room ids to broadcast groups.
///
/// Joins and empty-room removal are serialized through the map lock, so a
/// connection can never attach to a group that has just been dropped from
/// the map.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
    palette: Vec<String>,
}

impl RoomManager {
    pub fn new(default_capacity: usize, palette: Vec<String>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            palette,
        }
    }

    /// Get or create the group for `room_id` and attach a connection to it.
    pub async fn attach(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        username: &str,
    ) -> (Arc<BroadcastGroup>, PresenceEntry, RoomSubscription) {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room_id) {
                let (entry, sub) = group.add_peer(connection_id, username).await;
                return (group.clone(), entry, sub);
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                Arc::new(BroadcastGroup::new(
                    room_id,
                    self.default_capacity,
                    self.palette.clone(),
                ))
            })
            .clone();
        let (entry, sub) = group.add_peer(connection_id, username).await;
        (group, entry, sub)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Drop a room's group once nobody is connected to it.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room_id) {
            if group.peer_count().await == 0 {
                rooms.remove(room_id);
                log::debug!("Room {room_id} has no connections, group released");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileContent, TerminalEvent};
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn content_event(text: &str) -> ServerEvent {
        ServerEvent::FileContentUpdate(FileContent {
            file_path: "x.js".into(),
            content: text.into(),
        })
    }

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new("r", 16, Vec::new());
        let id = Uuid::new_v4();

        let (entry, _sub) = group.add_peer(id, "Alice").await;
        assert_eq!(entry.username, "Alice");
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        assert!(group.remove_peer(&id).await.is_some());
        assert_eq!(group.peer_count().await, 0);
        assert!(group.remove_peer(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all() {
        let group = BroadcastGroup::new("r", 16, Vec::new());
        let (_, mut a) = group.add_peer(Uuid::new_v4(), "A").await;
        let (_, mut b) = group.add_peer(Uuid::new_v4(), "B").await;

        let count = group
            .publish(&ServerEvent::TerminalUpdate(TerminalEvent::output("f", "hi")), None)
            .unwrap();
        assert_eq!(count, 2);

        let fa = a.recv().await.unwrap();
        let fb = b.recv().await.unwrap();
        assert_eq!(fa, fb);
    }

    #[tokio::test]
    async fn test_publish_skips_sender() {
        let group = BroadcastGroup::new("r", 16, Vec::new());
        let alice = Uuid::new_v4();
        let (_, mut a) = group.add_peer(alice, "A").await;
        let (_, mut b) = group.add_peer(Uuid::new_v4(), "B").await;

        group.publish(&content_event("1"), Some(alice)).unwrap();

        let frame = b.recv().await.unwrap();
        assert_eq!(ServerEvent::decode(&frame).unwrap(), content_event("1"));
        assert!(timeout(Duration::from_millis(50), a.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_sender_order_preserved() {
        let group = BroadcastGroup::new("r", 16, Vec::new());
        let (_, mut rx) = group.add_peer(Uuid::new_v4(), "A").await;
        for i in 0..5 {
            group.publish(&content_event(&i.to_string()), None).unwrap();
        }
        for i in 0..5 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(ServerEvent::decode(&frame).unwrap(), content_event(&i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let group = BroadcastGroup::new("r", 2, Vec::new());
        let (_, mut rx) = group.add_peer(Uuid::new_v4(), "A").await;
        for i in 0..5 {
            group.publish(&content_event(&i.to_string()), None).unwrap();
        }
        let frame = rx.recv().await.unwrap();
        assert_eq!(ServerEvent::decode(&frame).unwrap(), content_event("3"));
        assert_eq!(group.stats().await.messages_lagged, 3);
    }

    #[tokio::test]
    async fn test_presence_broadcast_lists_join_order() {
        let group = BroadcastGroup::new("r", 16, Vec::new());
        let (_, mut rx) = group.add_peer(Uuid::new_v4(), "Alice").await;
        group.add_peer(Uuid::new_v4(), "Bob").await;
        group.publish_presence().await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(
            ServerEvent::decode(&frame).unwrap(),
            ServerEvent::PresenceUpdate(PresenceList {
                usernames: vec!["Alice".into(), "Bob".into()]
            })
        );
    }

    #[tokio::test]
    async fn test_stats_count_sends() {
        let group = BroadcastGroup::new("r", 16, Vec::new());
        let _sub = group.add_peer(Uuid::new_v4(), "A").await;
        group.publish(&content_event("a"), None).unwrap();
        group.publish(&content_event("b"), None).unwrap();
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_room_manager_attach_reuses_group() {
        let manager = RoomManager::new(16, Vec::new());
        let (g1, _, _s1) = manager.attach("abc", Uuid::new_v4(), "A").await;
        let (g2, _, _s2) = manager.attach("abc", Uuid::new_v4(), "B").await;
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(g1.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_room_manager_isolates_rooms() {
        let manager = RoomManager::new(16, Vec::new());
        let (g1, _, _s1) = manager.attach("one", Uuid::new_v4(), "A").await;
        let (g2, _, _s2) = manager.attach("two", Uuid::new_v4(), "B").await;
        assert!(!Arc::ptr_eq(&g1, &g2));
        let mut rooms = manager.active_rooms().await;
        rooms.sort();
        assert_eq!(rooms, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16, Vec::new());
        let id = Uuid::new_v4();
        let (group, _, _sub) = manager.attach("abc", id, "A").await;

        assert!(!manager.remove_if_empty("abc").await);
        group.remove_peer(&id).await;
        assert!(manager.remove_if_empty("abc").await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.get("abc").await.is_none());
    }
}
