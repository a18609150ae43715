//! Per-file document synchronization.
//!
//! Snapshot based and last-write-wins: every change carries the full text
//! (or the full tree) and replaces what was stored. There are no versions
//! and no diffs; two concurrent writers of the same file race and the later
//! store write is what a fresh reader sees.

use std::collections::HashSet;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{
    ConnectionId, FileContent, FileNode, FileTree, ProtocolError, ServerEvent,
};
use crate::storage::{RoomStore, StoreError};

/// Errors raised while applying a document change.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A structural problem found in a published tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeIssue {
    /// Two siblings share a path.
    DuplicatePath(String),
    /// A node's path is not its parent's path joined with its name.
    PathMismatch { expected: String, found: String },
}

impl std::fmt::Display for TreeIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeIssue::DuplicatePath(path) => write!(f, "duplicate sibling path {path:?}"),
            TreeIssue::PathMismatch { expected, found } => {
                write!(f, "node path {found:?} should be {expected:?}")
            }
        }
    }
}

impl FileNode {
    /// Check this subtree, with `parent` the path of the enclosing folder
    /// (`None` at the root level).
    pub fn validate(&self, parent: Option<&str>) -> Vec<TreeIssue> {
        let mut issues = Vec::new();
        check_node(self, parent, &mut issues);
        issues
    }
}

/// Check a whole top-level tree.
pub fn validate_tree(nodes: &[FileNode]) -> Vec<TreeIssue> {
    let mut issues = Vec::new();
    check_siblings(nodes, None, &mut issues);
    issues
}

fn check_siblings(nodes: &[FileNode], parent: Option<&str>, issues: &mut Vec<TreeIssue>) {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.path.as_str()) {
            issues.push(TreeIssue::DuplicatePath(node.path.clone()));
        }
        check_node(node, parent, issues);
    }
}

fn check_node(node: &FileNode, parent: Option<&str>, issues: &mut Vec<TreeIssue>) {
    let expected = match parent {
        Some(parent) => format!("{parent}/{}", node.name),
        None => node.name.clone(),
    };
    if node.path != expected {
        issues.push(TreeIssue::PathMismatch {
            expected,
            found: node.path.clone(),
        });
    }
    if let Some(children) = &node.children {
        check_siblings(children, Some(&node.path), issues);
    }
}

/// Replace the room's tree and send it to everyone in the room, the
/// publisher included.
///
/// A tree that breaks the path invariants is still stored and relayed.
pub fn publish_file_tree(
    store: &dyn RoomStore,
    group: &BroadcastGroup,
    tree: Vec<FileNode>,
) -> Result<(), DocumentError> {
    let room_id = group.room_id();
    for issue in validate_tree(&tree) {
        log::warn!("Room {room_id}: file tree published with {issue}");
    }

    store.set_files(room_id, &tree)?;
    let receivers = group.publish(&ServerEvent::FileTreeUpdate(FileTree { tree }), None)?;
    log::debug!("Room {room_id}: file tree relayed to {receivers} connections");
    Ok(())
}

/// Store a file's full text and relay it to everyone except `sender`.
pub fn set_file_content(
    store: &dyn RoomStore,
    group: &BroadcastGroup,
    sender: ConnectionId,
    file_path: String,
    content: String,
) -> Result<(), DocumentError> {
    let room_id = group.room_id();
    store.set_code(room_id, &file_path, &content)?;
    log::trace!("Room {room_id}: {file_path} updated ({} bytes)", content.len());

    group.publish(
        &ServerEvent::FileContentUpdate(FileContent { file_path, content }),
        Some(sender),
    )?;
    Ok(())
}

/// Text returned for a file that has never been written.
pub fn placeholder(file_path: &str) -> String {
    format!("// Welcome to {file_path}\n")
}

/// Current content of a file, for the requester only. Never writes.
pub fn get_file_content(
    store: &dyn RoomStore,
    room_id: &str,
    file_path: &str,
) -> Result<ServerEvent, DocumentError> {
    let content = store
        .get_code(room_id, file_path)?
        .unwrap_or_else(|| placeholder(file_path));
    Ok(ServerEvent::FileContentUpdate(FileContent {
        file_path: file_path.to_string(),
        content,
    }))
}

/// Drop stored content for `file_path` and everything below it.
/// The tree itself is republished separately by the client.
pub fn delete_file(store: &dyn RoomStore, room_id: &str, file_path: &str) -> Result<usize, DocumentError> {
    let removed = store.remove_code(room_id, file_path)?;
    log::debug!("Room {room_id}: deleted {file_path} ({removed} content entries)");
    Ok(removed)
}

/// Move stored content from `old_path` (and below) to `new_path`.
pub fn rename_file(
    store: &dyn RoomStore,
    room_id: &str,
    old_path: &str,
    new_path: &str,
) -> Result<usize, DocumentError> {
    let moved = store.rename_code(room_id, old_path, new_path)?;
    log::debug!("Room {room_id}: renamed {old_path} -> {new_path} ({moved} content entries)");
    Ok(moved)
}
