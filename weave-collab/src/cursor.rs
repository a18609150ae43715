//! Cursor relay.
//!
//! The server keeps no cursor state: a cursor change is tagged with the
//! sender's identity and color and forwarded to everyone else in the room.
//! Receivers hold "latest per user", which [`CursorBook`] implements.

use std::collections::HashMap;

use crate::broadcast::BroadcastGroup;
use crate::presence::PresenceEntry;
use crate::protocol::{ConnectionId, CursorUpdate, PresenceList, ProtocolError, ServerEvent};

/// Tag a cursor position with its sender and relay it to the rest of the room.
pub fn publish_cursor(
    group: &BroadcastGroup,
    sender: &PresenceEntry,
    line: u32,
    column: u32,
    file_path: String,
) -> Result<CursorUpdate, ProtocolError> {
    let update = CursorUpdate {
        user_id: sender.connection_id,
        user_name: sender.username.clone(),
        line,
        column,
        color: sender.color.clone(),
        file_path,
    };
    group.publish(&ServerEvent::CursorUpdate(update.clone()), Some(sender.connection_id))?;
    log::trace!(
        "Room {}: cursor {}:{}:{} from {}",
        group.room_id(),
        update.file_path,
        line,
        column,
        update.user_name
    );
    Ok(update)
}

/// Latest cursor of every remote user, as seen by one client.
#[derive(Debug, Clone, Default)]
pub struct CursorBook {
    cursors: HashMap<ConnectionId, CursorUpdate>,
}

impl CursorBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cursor, replacing that user's previous one.
    pub fn apply(&mut self, update: CursorUpdate) {
        self.cursors.insert(update.user_id, update);
    }

    /// Drop cursors of users no longer in the room.
    ///
    /// Presence lists carry display names only, so matching is by name.
    pub fn retain_present(&mut self, presence: &PresenceList) {
        self.cursors
            .retain(|_, cursor| presence.usernames.iter().any(|name| name == &cursor.user_name));
    }

    /// Feed any server event; cursor and presence updates are applied,
    /// everything else is ignored.
    pub fn observe(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::CursorUpdate(update) => self.apply(update.clone()),
            ServerEvent::PresenceUpdate(presence) => self.retain_present(presence),
            _ => {}
        }
    }

    pub fn get(&self, user_id: &ConnectionId) -> Option<&CursorUpdate> {
        self.cursors.get(user_id)
    }

    /// Cursors placed in `file_path`, sorted by user name.
    pub fn in_file(&self, file_path: &str) -> Vec<&CursorUpdate> {
        let mut cursors: Vec<&CursorUpdate> = self
            .cursors
            .values()
            .filter(|c| c.file_path == file_path)
            .collect();
        cursors.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        cursors
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
