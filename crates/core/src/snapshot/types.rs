//! Snapshot data model.

use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while capturing a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// An entry under the root could not be read or stat'd.
    #[error("Path unreadable during {operation}: {path}: {source}")]
    PathUnreadable {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Two nodes resolved to the same relative path.
    #[error("Duplicate node in snapshot: {0}")]
    DuplicatePath(String),

    /// The blocking task running the walk panicked or was cancelled.
    #[error("Snapshot task failed: {0}")]
    TaskFailed(String),
}

impl SnapshotError {
    pub(crate) fn unreadable(operation: &'static str, path: &Path, source: io::Error) -> Self {
        SnapshotError::PathUnreadable {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn from_walk(operation: &'static str, root: &Path, err: walkdir::Error) -> Self {
        let path = err
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        let source = err
            .into_io_error()
            .unwrap_or_else(|| io::Error::other("filesystem loop detected"));
        SnapshotError::PathUnreadable {
            operation,
            path,
            source,
        }
    }
}

/// Kind of a node in a captured tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Directory,
    File,
    Symlink,
}

impl NodeKind {
    /// Creation order within one directory level.
    fn rank(self) -> u8 {
        match self {
            NodeKind::Directory => 0,
            NodeKind::File => 1,
            NodeKind::Symlink => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Directory => "directory",
            NodeKind::File => "file",
            NodeKind::Symlink => "symlink",
        }
    }
}

/// Where a library file's bytes come from inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentSource {
    /// Info hash of the torrent owning the data.
    pub hash: String,
    /// Path of the data file relative to the torrent's save path.
    pub relative_path: PathBuf,
}

/// A node in a directory tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    /// Path relative to the snapshot root, `/` separated.
    pub path: String,
    pub kind: NodeKind,
    /// File size in bytes (files only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Sampled content fingerprint (files only, absent in expected layouts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Link target (symlinks only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<PathBuf>,
    /// Torrent data this file is a hardlink of, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torrent_source: Option<TorrentSource>,
}

impl FileNode {
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Directory,
            size: None,
            fingerprint: None,
            link_target: None,
            torrent_source: None,
        }
    }

    pub fn file(path: impl Into<String>, size: u64, fingerprint: Option<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::File,
            size: Some(size),
            fingerprint,
            link_target: None,
            torrent_source: None,
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Symlink,
            size: None,
            fingerprint: None,
            link_target: Some(target.into()),
            torrent_source: None,
        }
    }

    pub fn with_torrent_source(mut self, source: TorrentSource) -> Self {
        self.torrent_source = Some(source);
        self
    }

    fn parent(&self) -> &str {
        self.path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
    }

    fn name(&self) -> &str {
        self.path.rsplit_once('/').map(|(_, n)| n).unwrap_or(&self.path)
    }

    /// Ordering used to recreate a tree: level by level, and within one
    /// directory directories first, then files, then symlinks.
    pub fn restore_order(a: &FileNode, b: &FileNode) -> Ordering {
        let pa = a.parent().split('/').filter(|s| !s.is_empty());
        let pb = b.parent().split('/').filter(|s| !s.is_empty());
        pa.cmp(pb)
            .then_with(|| a.kind.rank().cmp(&b.kind.rank()))
            .then_with(|| a.name().cmp(b.name()))
    }
}

/// Captured layout of one media entry root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// Media manager entry the root belongs to.
    pub entry_id: String,
    /// Absolute root that was walked.
    pub root: PathBuf,
    /// Nodes in restore order, unique by path.
    pub nodes: Vec<FileNode>,
    pub captured_at: DateTime<Utc>,
}

impl EntrySnapshot {
    pub fn files(&self) -> impl Iterator<Item = &FileNode> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::File)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files().filter_map(|n| n.size).sum()
    }

    pub fn node(&self, path: &str) -> Option<&FileNode> {
        self.nodes.iter().find(|n| n.path == path)
    }
}

/// Torrent data a capture should link library files back to.
#[derive(Debug, Clone)]
pub struct TorrentContent {
    pub hash: String,
    pub save_path: PathBuf,
    pub content_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_order_levels_then_kind() {
        let mut nodes = vec![
            FileNode::symlink("link", "Season 01"),
            FileNode::file("Season 01/ep1.mkv", 10, None),
            FileNode::file("poster.jpg", 5, None),
            FileNode::directory("Season 01/Subs"),
            FileNode::directory("Season 01"),
            FileNode::file("Season 01/Subs/ep1.srt", 1, None),
        ];
        nodes.sort_by(FileNode::restore_order);
        let paths: Vec<&str> = nodes.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "Season 01",
                "poster.jpg",
                "link",
                "Season 01/Subs",
                "Season 01/ep1.mkv",
                "Season 01/Subs/ep1.srt",
            ]
        );
    }

    #[test]
    fn test_parent_precedes_children() {
        let mut nodes = vec![
            FileNode::file("a/b/c.txt", 1, None),
            FileNode::directory("a/b"),
            FileNode::directory("a"),
        ];
        nodes.sort_by(FileNode::restore_order);
        assert_eq!(nodes[0].path, "a");
        assert_eq!(nodes[1].path, "a/b");
        assert_eq!(nodes[2].path, "a/b/c.txt");
    }

    #[test]
    fn test_node_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&NodeKind::Directory).unwrap(),
            "\"directory\""
        );
        let node = FileNode::file("x.mkv", 3, Some("abc".into()));
        let json = serde_json::to_string(&node).unwrap();
        assert!(!json.contains("link_target"));
        let parsed: FileNode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, node);
    }
}
