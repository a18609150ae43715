//! # weave-collab: collaborative coding rooms
//!
//! A room holds a shared file tree, the contents of its files, and the
//! people currently in it. Clients talk JSON over WebSocket; every change
//! is stored first and then relayed to the rest of the room. Source files
//! can be run in a sandboxed subprocess, with the result shown to the
//! whole room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON / WebSocket   ┌───────────────┐
//! │ RoomClient  │ ◄──────────────────► │ CollabServer  │
//! │ (browser)   │   {event, data}      │  Session/conn │
//! └─────────────┘                      └───────┬───────┘
//!                                              │
//!               ┌──────────────────────────────┼──────────────────────┐
//!               ▼                              ▼                      ▼
//!       ┌───────────────┐            ┌──────────────────┐   ┌──────────────────┐
//!       │ RoomStore     │            │ BroadcastGroup   │   │ Execution        │
//!       │ memory/Rocks  │            │ (fan-out, roster)│   │ Coordinator      │
//!       └───────────────┘            └──────────────────┘   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire events (`{"event": ..., "data": ...}`)
//! - [`presence`]: roster and color assignment
//! - [`broadcast`]: per-room fan-out with sender exclusion
//! - [`storage`]: room persistence (in-memory or RocksDB)
//! - [`document`]: file tree and file content operations
//! - [`cursor`]: cursor relay
//! - [`exec`]: language registry, sandbox, bounded execution pool
//! - [`session`]: per-connection state machine and event routing
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client
//! - [`config`]: TOML configuration with environment overrides

pub mod protocol;
pub mod presence;
pub mod broadcast;
pub mod storage;
pub mod document;
pub mod cursor;
pub mod exec;
pub mod config;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, ConnectionId, FileNode, NodeKind, ProtocolError, ServerEvent, TerminalEvent,
    TerminalKind,
};
pub use presence::{PresenceEntry, PresenceRoster};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use storage::{MemoryStore, RocksStore, Room, RoomStore, StoreConfig, StoreError};
pub use cursor::CursorBook;
pub use exec::{ExecError, ExecStats, ExecutionCoordinator, Isolation, LanguageRegistry, LanguageSpec, ResourceLimits};
pub use config::{ConfigError, ExecutionConfig, ServerConfig};
pub use session::{CollabContext, Session, SessionError, SessionState};
pub use server::{CollabServer, ServerError, ServerStats};
pub use client::{ConnectionState, RoomClient, RoomEvent};
