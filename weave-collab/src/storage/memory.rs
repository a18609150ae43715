//! In-process room store. Nothing survives a restart.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{check_room_id, is_same_or_below, sanitize_path, Room, RoomStore, RoomSummary, StoreError};
use crate::protocol::{ConnectionId, FileNode};

/// `RoomStore` backed by a `HashMap` behind a lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, Room>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Room>>, StoreError> {
        self.rooms.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Room>>, StoreError> {
        self.rooms.write().map_err(|_| StoreError::Poisoned)
    }

    /// Run `f` against the room, creating it first if needed.
    fn with_room<T>(&self, room_id: &str, f: impl FnOnce(&mut Room) -> T) -> Result<T, StoreError> {
        check_room_id(room_id)?;
        let mut rooms = self.write()?;
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id));
        Ok(f(room))
    }
}

impl RoomStore for MemoryStore {
    fn load_or_create(&self, room_id: &str) -> Result<(Room, bool), StoreError> {
        check_room_id(room_id)?;
        let mut rooms = self.write()?;
        let created = !rooms.contains_key(room_id);
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id));
        Ok((room.clone(), created))
    }

    fn load(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.read()?.get(room_id).cloned())
    }

    fn set_files(&self, room_id: &str, files: &[FileNode]) -> Result<(), StoreError> {
        self.with_room(room_id, |room| room.files = files.to_vec())
    }

    fn set_code(&self, room_id: &str, file_path: &str, content: &str) -> Result<(), StoreError> {
        let key = sanitize_path(file_path);
        self.with_room(room_id, |room| {
            room.code.insert(key, content.to_string());
        })
    }

    fn get_code(&self, room_id: &str, file_path: &str) -> Result<Option<String>, StoreError> {
        let key = sanitize_path(file_path);
        Ok(self
            .read()?
            .get(room_id)
            .and_then(|room| room.code.get(&key).cloned()))
    }

    fn remove_code(&self, room_id: &str, file_path: &str) -> Result<usize, StoreError> {
        let base = sanitize_path(file_path);
        let mut rooms = self.write()?;
        let Some(room) = rooms.get_mut(room_id) else {
            return Ok(0);
        };
        let before = room.code.len();
        room.code.retain(|key, _| !is_same_or_below(key, &base));
        Ok(before - room.code.len())
    }

    fn rename_code(&self, room_id: &str, old_path: &str, new_path: &str) -> Result<usize, StoreError> {
        let from = sanitize_path(old_path);
        let to = sanitize_path(new_path);
        if from == to {
            return Ok(0);
        }
        let mut rooms = self.write()?;
        let Some(room) = rooms.get_mut(room_id) else {
            return Ok(0);
        };

        let keys: Vec<String> = room
            .code
            .keys()
            .filter(|key| is_same_or_below(key, &from))
            .cloned()
            .collect();
        // Take everything out before reinserting so a target inside the
        // source subtree cannot overwrite an entry that is still to move.
        let moving: Vec<(String, String)> = keys
            .into_iter()
            .filter_map(|key| room.code.remove(&key).map(|content| (key, content)))
            .collect();
        for (key, content) in &moving {
            room.code.insert(format!("{to}{}", &key[from.len()..]), content.clone());
        }
        Ok(moving.len())
    }

    fn set_user(&self, room_id: &str, connection_id: ConnectionId, username: &str) -> Result<(), StoreError> {
        self.with_room(room_id, |room| {
            room.users.insert(connection_id, username.to_string());
        })
    }

    fn remove_user(&self, room_id: &str, connection_id: ConnectionId) -> Result<bool, StoreError> {
        let mut rooms = self.write()?;
        Ok(rooms
            .get_mut(room_id)
            .map(|room| room.users.remove(&connection_id).is_some())
            .unwrap_or(false))
    }

    fn clear_users(&self) -> Result<usize, StoreError> {
        let mut rooms = self.write()?;
        let mut removed = 0;
        for room in rooms.values_mut() {
            removed += room.users.len();
            room.users.clear();
        }
        Ok(removed)
    }

    fn list_rooms(&self) -> Result<Vec<RoomSummary>, StoreError> {
        let mut summaries: Vec<RoomSummary> = self.read()?.values().map(Room::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        self.write()?
            .remove(room_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_load_or_create_is_idempotent() {
        let store = MemoryStore::new();
        let (room, created) = store.load_or_create("abc123").unwrap();
        assert!(created);
        assert!(room.is_blank());

        let (_, created) = store.load_or_create("abc123").unwrap();
        assert!(!created);
        assert_eq!(store.list_rooms().unwrap().len(), 1);
    }

    #[test]
    fn test_code_uses_sanitized_keys() {
        let store = MemoryStore::new();
        store.set_code("r", "a/b.txt", "hello").unwrap();

        assert_eq!(store.get_code("r", "a/b.txt").unwrap().as_deref(), Some("hello"));
        let room = store.load("r").unwrap().unwrap();
        assert!(room.code.contains_key("a/b_txt"));
    }

    #[test]
    fn test_field_updates_do_not_clobber_each_other() {
        let store = MemoryStore::new();
        let conn = Uuid::new_v4();
        store.set_code("r", "x.js", "1").unwrap();
        store.set_files("r", &[FileNode::file("x.js", "x.js")]).unwrap();
        store.set_user("r", conn, "Alice").unwrap();
        store.set_code("r", "y.js", "2").unwrap();

        let room = store.load("r").unwrap().unwrap();
        assert_eq!(room.files.len(), 1);
        assert_eq!(room.code.len(), 2);
        assert_eq!(room.users.get(&conn).map(String::as_str), Some("Alice"));
    }

    #[test]
    fn test_remove_code_takes_descendants() {
        let store = MemoryStore::new();
        store.set_code("r", "src/a.js", "a").unwrap();
        store.set_code("r", "src/lib/b.js", "b").unwrap();
        store.set_code("r", "src2/c.js", "c").unwrap();

        assert_eq!(store.remove_code("r", "src").unwrap(), 2);
        assert_eq!(store.get_code("r", "src/a.js").unwrap(), None);
        assert_eq!(store.get_code("r", "src2/c.js").unwrap().as_deref(), Some("c"));
        assert_eq!(store.remove_code("missing", "src").unwrap(), 0);
    }

    #[test]
    fn test_rename_code_moves_subtree() {
        let store = MemoryStore::new();
        store.set_code("r", "old/a.js", "a").unwrap();
        store.set_code("r", "old/deep/b.js", "b").unwrap();
        store.set_code("r", "older.js", "keep").unwrap();

        assert_eq!(store.rename_code("r", "old", "new").unwrap(), 2);
        assert_eq!(store.get_code("r", "new/a.js").unwrap().as_deref(), Some("a"));
        assert_eq!(store.get_code("r", "new/deep/b.js").unwrap().as_deref(), Some("b"));
        assert_eq!(store.get_code("r", "older.js").unwrap().as_deref(), Some("keep"));
        assert_eq!(store.get_code("r", "old/a.js").unwrap(), None);
    }

    #[test]
    fn test_users_add_remove_and_clear() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.set_user("r1", a, "Alice").unwrap();
        store.set_user("r2", b, "Bob").unwrap();

        assert!(store.remove_user("r1", a).unwrap());
        assert!(!store.remove_user("r1", a).unwrap());
        assert_eq!(store.clear_users().unwrap(), 1);
        assert!(store.load("r2").unwrap().unwrap().users.is_empty());
    }

    #[test]
    fn test_delete_room() {
        let store = MemoryStore::new();
        store.load_or_create("gone").unwrap();
        store.delete_room("gone").unwrap();
        assert!(store.load("gone").unwrap().is_none());
        assert!(matches!(store.delete_room("gone"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_invalid_room_id_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(store.load_or_create(""), Err(StoreError::InvalidRoomId(_))));
        assert!(store.set_code("", "a.js", "x").is_err());
    }
}
