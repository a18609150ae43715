//! JSON event protocol between editor clients and the room coordinator.
//!
//! Every WebSocket text frame carries one adjacently tagged event:
//! ```text
//! { "event": "fileContentChange", "data": { "filePath": "src/a.js", "content": "…" } }
//! ```
//!
//! Client → server events are [`ClientEvent`], server → client events are
//! [`ServerEvent`]. Payload field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identity of one client socket. A reconnect is a new identity.
pub type ConnectionId = Uuid;

/// Kind of a node in the shared file tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// One node of a room's file tree.
///
/// `path` is the slash-joined ancestry (`parent.path + "/" + name`).
/// Client-only fields (e.g. `isOpen`) are kept in `extra` and round-trip
/// untouched through storage and relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub kind: NodeKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileNode {
    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::File,
            path: path.into(),
            children: None,
            extra: Map::new(),
        }
    }

    pub fn folder(name: impl Into<String>, path: impl Into<String>, children: Vec<FileNode>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Folder,
            path: path.into(),
            children: Some(children),
            extra: Map::new(),
        }
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .as_deref()
            .map_or(0, |c| c.iter().map(FileNode::node_count).sum())
    }
}

/// Kind of a terminal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    Command,
    Output,
    Error,
}

/// A unit of console text scoped to one file of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEvent {
    pub file_path: String,
    pub kind: TerminalKind,
    pub content: String,
}

impl TerminalEvent {
    pub fn output(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            kind: TerminalKind::Output,
            content: content.into(),
        }
    }

    pub fn error(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            kind: TerminalKind::Error,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTree {
    pub tree: Vec<FileNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePathRef {
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRename {
    pub old_path: String,
    pub new_path: String,
}

/// Cursor position sent by a client. `file_path` defaults to the sender's
/// active file when omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorChange {
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Cursor position relayed to the other members of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    pub user_id: ConnectionId,
    pub user_name: String,
    pub line: u32,
    pub column: u32,
    pub color: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub source_code: String,
    pub language: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceList {
    pub usernames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
}

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Join(JoinRequest),
    FileTreeChange(FileTree),
    FileContentChange(FileContent),
    FileContentRequest(FilePathRef),
    CursorChange(CursorChange),
    TerminalCommand(TerminalEvent),
    ExecuteRequest(ExecutionRequest),
    FileDelete(FilePathRef),
    FileRename(FileRename),
}

impl ClientEvent {
    /// Wire name of the event, for logs and error reports.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "join",
            ClientEvent::FileTreeChange(_) => "fileTreeChange",
            ClientEvent::FileContentChange(_) => "fileContentChange",
            ClientEvent::FileContentRequest(_) => "fileContentRequest",
            ClientEvent::CursorChange(_) => "cursorChange",
            ClientEvent::TerminalCommand(_) => "terminalCommand",
            ClientEvent::ExecuteRequest(_) => "executeRequest",
            ClientEvent::FileDelete(_) => "fileDelete",
            ClientEvent::FileRename(_) => "fileRename",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Events the server sends to one client or to a whole room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    FileTreeUpdate(FileTree),
    PresenceUpdate(PresenceList),
    FileContentUpdate(FileContent),
    CursorUpdate(CursorUpdate),
    TerminalUpdate(TerminalEvent),
    Error(ErrorReport),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorReport { message: message.into() })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unsupported frame: only JSON text frames are accepted")]
    UnsupportedFrame,
    #[error("Connection closed")]
    ConnectionClosed,
}
