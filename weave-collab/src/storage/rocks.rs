//! RocksDB-backed room store.
//!
//! Column families:
//! - `rooms`: room metadata (bincode: created_at, updated_at), keyed by room id
//! - `files`: file tree as LZ4-compressed JSON, keyed by room id
//! - `code`: LZ4-compressed file text, keyed by `room_id \0 sanitized_path`
//! - `users`: display names, keyed by `room_id \0 connection_uuid`
//!
//! Every field of a room lives under its own key, so an update is a single
//! put (plus a metadata touch in the same batch) and never rewrites the rest
//! of the room.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

use super::{check_room_id, is_same_or_below, sanitize_path, Room, RoomStore, RoomSummary, StoreError};
use crate::protocol::{ConnectionId, FileNode};

const CF_ROOMS: &str = "rooms";
const CF_FILES: &str = "files";
const CF_CODE: &str = "code";
const CF_USERS: &str = "users";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_FILES, CF_CODE, CF_USERS];

/// Separates the room id from the entry name in `code` and `users` keys.
/// Room ids may not contain it.
const KEY_SEP: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("weave_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config at `path` with the default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-room bookkeeping stored in the `rooms` family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last field update (seconds since epoch)
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        let now = now_secs();
        Self {
            room_id: room_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable [`RoomStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the exists-check and insert of a new room
    create_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            create_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS | CF_USERS => {
                // Small values, point lookups
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            CF_FILES | CF_CODE => {
                // Values are already LZ4 framed
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Load room metadata, if the room exists.
    pub fn metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(RoomMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Stage a metadata update for `room_id` into `batch`, creating the
    /// room if it has none yet.
    fn touch(&self, batch: &mut WriteBatch, room_id: &str) -> Result<(), StoreError> {
        check_room_id(room_id)?;
        let mut meta = self
            .metadata(room_id)?
            .unwrap_or_else(|| RoomMetadata::new(room_id));
        meta.updated_at = now_secs();
        batch.put_cf(self.cf(CF_ROOMS)?, room_id.as_bytes(), meta.encode()?);
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    fn load_files(&self, room_id: &str) -> Result<Vec<FileNode>, StoreError> {
        let cf = self.cf(CF_FILES)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(compressed) => {
                let raw = decompress(&compressed)?;
                serde_json::from_slice(&raw)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    /// All entries of `cf` whose key starts with `prefix`, in key order.
    fn scan_prefix(
        &self,
        cf: &ColumnFamily,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Code entries at or below the sanitized path `base`.
    fn code_subtree(
        &self,
        room_id: &str,
        base: &str,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let prefix = entry_key(room_id, base.as_bytes());
        let room_len = room_id.len() + 1;
        let entries = self.scan_prefix(self.cf(CF_CODE)?, &prefix)?;
        Ok(entries
            .into_iter()
            .filter(|(key, _)| {
                std::str::from_utf8(&key[room_len..])
                    .map(|path| is_same_or_below(path, base))
                    .unwrap_or(false)
            })
            .collect())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl RoomStore for RocksStore {
    fn load_or_create(&self, room_id: &str) -> Result<(Room, bool), StoreError> {
        check_room_id(room_id)?;
        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = self.load(room_id)? {
            return Ok((room, false));
        }

        // An absent files row reads as an empty tree
        let meta = RoomMetadata::new(room_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ROOMS)?, room_id.as_bytes(), meta.encode()?);
        self.commit(batch)?;

        log::debug!("Created room {room_id} in store");
        Ok((Room::new(room_id), true))
    }

    fn load(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        if self.metadata(room_id)?.is_none() {
            return Ok(None);
        }

        let prefix = entry_key(room_id, &[]);
        let mut room = Room::new(room_id);
        room.files = self.load_files(room_id)?;

        for (key, value) in self.scan_prefix(self.cf(CF_CODE)?, &prefix)? {
            let path = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            let text = String::from_utf8(decompress(&value)?)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            room.code.insert(path, text);
        }

        for (key, value) in self.scan_prefix(self.cf(CF_USERS)?, &prefix)? {
            let id = Uuid::from_slice(&key[prefix.len()..])
                .map_err(|_| StoreError::DeserializationError("Invalid connection id key".into()))?;
            let name = String::from_utf8(value.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            room.users.insert(id, name);
        }

        Ok(Some(room))
    }

    fn set_files(&self, room_id: &str, files: &[FileNode]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        self.touch(&mut batch, room_id)?;
        batch.put_cf(self.cf(CF_FILES)?, room_id.as_bytes(), compress_json(files)?);
        self.commit(batch)
    }

    fn set_code(&self, room_id: &str, file_path: &str, content: &str) -> Result<(), StoreError> {
        let key = entry_key(room_id, sanitize_path(file_path).as_bytes());
        let mut batch = WriteBatch::default();
        self.touch(&mut batch, room_id)?;
        batch.put_cf(
            self.cf(CF_CODE)?,
            key,
            lz4_flex::compress_prepend_size(content.as_bytes()),
        );
        self.commit(batch)
    }

    fn get_code(&self, room_id: &str, file_path: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_CODE)?;
        let key = entry_key(room_id, sanitize_path(file_path).as_bytes());
        match self.db.get_cf(&cf, &key)? {
            Some(compressed) => String::from_utf8(decompress(&compressed)?)
                .map(Some)
                .map_err(|e| StoreError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    fn remove_code(&self, room_id: &str, file_path: &str) -> Result<usize, StoreError> {
        let entries = self.code_subtree(room_id, &sanitize_path(file_path))?;
        if entries.is_empty() {
            return Ok(0);
        }

        let cf = self.cf(CF_CODE)?;
        let mut batch = WriteBatch::default();
        self.touch(&mut batch, room_id)?;
        for (key, _) in &entries {
            batch.delete_cf(&cf, key);
        }
        self.commit(batch)?;
        Ok(entries.len())
    }

    fn rename_code(&self, room_id: &str, old_path: &str, new_path: &str) -> Result<usize, StoreError> {
        let from = sanitize_path(old_path);
        let to = sanitize_path(new_path);
        if from == to {
            return Ok(0);
        }
        let entries = self.code_subtree(room_id, &from)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let cf = self.cf(CF_CODE)?;
        let suffix_at = room_id.len() + 1 + from.len();
        let mut batch = WriteBatch::default();
        self.touch(&mut batch, room_id)?;
        // Deletes first: a later put of the same key must win.
        for (key, _) in &entries {
            batch.delete_cf(&cf, key);
        }
        for (key, value) in &entries {
            let mut renamed = entry_key(room_id, to.as_bytes());
            renamed.extend_from_slice(&key[suffix_at..]);
            batch.put_cf(&cf, renamed, value);
        }
        self.commit(batch)?;
        Ok(entries.len())
    }

    fn set_user(&self, room_id: &str, connection_id: ConnectionId, username: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        self.touch(&mut batch, room_id)?;
        batch.put_cf(
            self.cf(CF_USERS)?,
            entry_key(room_id, connection_id.as_bytes()),
            username.as_bytes(),
        );
        self.commit(batch)
    }

    fn remove_user(&self, room_id: &str, connection_id: ConnectionId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_USERS)?;
        let key = entry_key(room_id, connection_id.as_bytes());
        if self.db.get_cf(&cf, &key)?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf(&cf, &key)?;
        Ok(true)
    }

    fn clear_users(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_USERS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0usize;

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            self.commit(batch)?;
        }
        Ok(count)
    }

    fn list_rooms(&self) -> Result<Vec<RoomSummary>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(room) = self.load(&id)? {
                summaries.push(room.summary());
            }
        }
        Ok(summaries)
    }

    fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        if self.metadata(room_id)?.is_none() {
            return Err(StoreError::NotFound(room_id.to_string()));
        }

        let prefix = entry_key(room_id, &[]);
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_ROOMS)?, room_id.as_bytes());
        batch.delete_cf(self.cf(CF_FILES)?, room_id.as_bytes());
        for name in [CF_CODE, CF_USERS] {
            let cf = self.cf(name)?;
            for (key, _) in self.scan_prefix(cf, &prefix)? {
                batch.delete_cf(&cf, &key);
            }
        }
        self.commit(batch)?;

        log::info!("Deleted room {room_id}");
        Ok(())
    }
}

/// `room_id \0 tail`
fn entry_key(room_id: &str, tail: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(room_id.len() + 1 + tail.len());
    key.extend_from_slice(room_id.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(tail);
    key
}

fn compress_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = serde_json::to_vec(value).map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::CompressionError(e.to_string()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
