//! Restore report types.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a restore.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// A directory, link or copy could not be created at the destination.
    #[error("Path unwritable during {operation}: {path}: {source}")]
    PathUnwritable {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A restored entry could not be read back for verification.
    #[error("Path unreadable during {operation}: {path}: {source}")]
    PathUnreadable {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The blocking task running the restore panicked or was cancelled.
    #[error("Restore task failed: {0}")]
    TaskFailed(String),
}

impl RestoreError {
    pub(crate) fn unwritable(operation: &'static str, path: &Path, source: io::Error) -> Self {
        RestoreError::PathUnwritable {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn unreadable(operation: &'static str, path: &Path, source: io::Error) -> Self {
        RestoreError::PathUnreadable {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// How a file ended up at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStrategy {
    /// Hardlinked from the relocated torrent data.
    Hardlinked,
    /// Byte copy (cross-device link, or no torrent data behind the file).
    Copied,
    /// A matching file was already there.
    AlreadyPresent,
    /// No source could be found for the file.
    Missing,
}

impl RestoreStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStrategy::Hardlinked => "hardlinked",
            RestoreStrategy::Copied => "copied",
            RestoreStrategy::AlreadyPresent => "already_present",
            RestoreStrategy::Missing => "missing",
        }
    }
}

/// Per-file restore result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRestore {
    pub path: String,
    pub strategy: RestoreStrategy,
}

/// A restored entry that does not agree with the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreMismatch {
    pub entry_id: String,
    pub path: String,
    pub reason: String,
}

/// Outcome of replaying one snapshot at a new root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub entry_id: String,
    pub root: PathBuf,
    pub files: Vec<FileRestore>,
    pub directories_created: usize,
    pub symlinks_created: usize,
    pub mismatches: Vec<RestoreMismatch>,
}

impl RestoreReport {
    pub fn new(entry_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            entry_id: entry_id.into(),
            root: root.into(),
            files: Vec::new(),
            directories_created: 0,
            symlinks_created: 0,
            mismatches: Vec::new(),
        }
    }

    pub fn strategy_of(&self, path: &str) -> Option<RestoreStrategy> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .map(|f| f.strategy)
    }

    pub fn count(&self, strategy: RestoreStrategy) -> usize {
        self.files.iter().filter(|f| f.strategy == strategy).count()
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub(crate) fn mismatch(&mut self, path: &str, reason: impl Into<String>) {
        self.mismatches.push(RestoreMismatch {
            entry_id: self.entry_id.clone(),
            path: path.to_string(),
            reason: reason.into(),
        });
    }
}

/// Where restored files are sourced from.
#[derive(Debug, Clone, Default)]
pub struct RestoreSources {
    /// New save path of each torrent, keyed by info hash.
    pub torrent_save_paths: HashMap<String, PathBuf>,
    /// The entry root the snapshot was captured from.
    pub original_root: PathBuf,
    /// Absolute prefixes rewritten in symlink targets (old -> new).
    pub path_rewrites: Vec<(PathBuf, PathBuf)>,
}

impl RestoreSources {
    /// Rewrite an absolute symlink target that points into a relocated tree.
    pub fn rewrite_target(&self, target: &Path) -> PathBuf {
        if target.is_absolute() {
            for (old, new) in &self.path_rewrites {
                if let Ok(rest) = target.strip_prefix(old) {
                    return new.join(rest);
                }
            }
        }
        target.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_absolute_target() {
        let sources = RestoreSources {
            path_rewrites: vec![(
                PathBuf::from("/data/media/tv/Show"),
                PathBuf::from("/archive/media/tv/Show"),
            )],
            ..Default::default()
        };
        assert_eq!(
            sources.rewrite_target(Path::new("/data/media/tv/Show/Season 01")),
            PathBuf::from("/archive/media/tv/Show/Season 01")
        );
        assert_eq!(
            sources.rewrite_target(Path::new("/elsewhere/x")),
            PathBuf::from("/elsewhere/x")
        );
        assert_eq!(
            sources.rewrite_target(Path::new("Season 01")),
            PathBuf::from("Season 01")
        );
    }

    #[test]
    fn test_report_counts() {
        let mut report = RestoreReport::new("1", "/archive/media/tv/Show");
        report.files.push(FileRestore {
            path: "a.mkv".into(),
            strategy: RestoreStrategy::Hardlinked,
        });
        report.files.push(FileRestore {
            path: "b.mkv".into(),
            strategy: RestoreStrategy::Copied,
        });
        assert_eq!(report.count(RestoreStrategy::Hardlinked), 1);
        assert_eq!(report.strategy_of("b.mkv"), Some(RestoreStrategy::Copied));
        assert!(report.is_clean());
        report.mismatch("b.mkv", "size differs");
        assert!(!report.is_clean());
        assert_eq!(report.mismatches[0].entry_id, "1");
    }
}
