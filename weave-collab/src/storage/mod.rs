//! Persistent room store.
//!
//! A room document has three independently updated fields:
//! ```text
//! room_id ─┬─ files  ordered file tree (whole-tree replace)
//!          ├─ code   sanitized path → full text (per-entry upsert)
//!          └─ users  connection id → display name (per-entry upsert/delete)
//! ```
//!
//! Updates touch one field (or one entry of a map field) at a time, so
//! concurrent writers to different fields never clobber each other and two
//! writers of the same field race with the last one winning.
//!
//! Two backends implement [`RoomStore`]: [`MemoryStore`] for tests and
//! ephemeral servers, and [`RocksStore`] for durable deployments.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig, RoomMetadata};

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{ConnectionId, FileNode};

/// A room as persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Room {
    pub id: String,
    pub files: Vec<FileNode>,
    /// Keyed by sanitized path.
    pub code: BTreeMap<String, String>,
    pub users: HashMap<ConnectionId, String>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Whether the room has no files, no content and nobody in it.
    pub fn is_blank(&self) -> bool {
        self.files.is_empty() && self.code.is_empty() && self.users.is_empty()
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            file_count: self.files.iter().map(FileNode::node_count).sum(),
            code_entries: self.code.len(),
            online_users: self.users.len(),
        }
    }
}

/// Operator view of a stored room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub id: String,
    pub file_count: usize,
    pub code_entries: usize,
    pub online_users: usize,
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Room not found: {0}")]
    NotFound(String),
    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable room documents with field-level updates.
///
/// File paths passed in are raw client paths; implementations sanitize them
/// with [`sanitize_path`] before using them as keys.
pub trait RoomStore: Send + Sync {
    /// Load a room, creating an empty one if the id is unseen.
    /// The flag is `true` when the room was created by this call.
    fn load_or_create(&self, room_id: &str) -> Result<(Room, bool), StoreError>;

    fn load(&self, room_id: &str) -> Result<Option<Room>, StoreError>;

    /// Replace the whole file tree.
    fn set_files(&self, room_id: &str, files: &[FileNode]) -> Result<(), StoreError>;

    fn set_code(&self, room_id: &str, file_path: &str, content: &str) -> Result<(), StoreError>;

    fn get_code(&self, room_id: &str, file_path: &str) -> Result<Option<String>, StoreError>;

    /// Drop the content of `file_path` and of every path below it.
    /// Returns the number of entries removed.
    fn remove_code(&self, room_id: &str, file_path: &str) -> Result<usize, StoreError>;

    /// Move the content of `old_path` and everything below it under
    /// `new_path`. Returns the number of entries moved.
    fn rename_code(&self, room_id: &str, old_path: &str, new_path: &str) -> Result<usize, StoreError>;

    fn set_user(&self, room_id: &str, connection_id: ConnectionId, username: &str) -> Result<(), StoreError>;

    /// Returns whether an entry was removed.
    fn remove_user(&self, room_id: &str, connection_id: ConnectionId) -> Result<bool, StoreError>;

    /// Empty the presence map of every room. Returns entries removed.
    fn clear_users(&self) -> Result<usize, StoreError>;

    fn list_rooms(&self) -> Result<Vec<RoomSummary>, StoreError>;

    fn delete_room(&self, room_id: &str) -> Result<(), StoreError>;
}

/// Turn a file path into a storage key: every `.` becomes `_`.
///
/// The mapping is character-wise, so `sanitize(a + b) == sanitize(a) +
/// sanitize(b)` and descendant keys keep their parent's key as a prefix.
pub fn sanitize_path(file_path: &str) -> String {
    file_path.replace('.', "_")
}

/// Whether `key` is `base` itself or a key below it.
pub(crate) fn is_same_or_below(key: &str, base: &str) -> bool {
    key == base || (key.starts_with(base) && key[base.len()..].starts_with('/'))
}

/// Reject ids that cannot be stored as a key prefix.
pub(crate) fn check_room_id(room_id: &str) -> Result<(), StoreError> {
    if room_id.is_empty() || room_id.contains('\0') {
        return Err(StoreError::InvalidRoomId(room_id.to_string()));
    }
    Ok(())
}
