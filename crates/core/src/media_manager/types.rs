//! Types for media manager operations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher::normalize_title;
use crate::snapshot::FileNode;

/// Errors that can occur when talking to a media manager.
#[derive(Debug, Error)]
pub enum MediaManagerError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Entry not found (404).
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// API returned an error.
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// No manager is configured for this kind of media.
    #[error("Media manager not configured: {0}")]
    NotConfigured(String),
}

impl MediaManagerError {
    /// True when the manager could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        match self {
            MediaManagerError::HttpError(e) => e.is_connect() || e.is_timeout(),
            MediaManagerError::ApiError { status, .. } => *status == 401 || *status >= 500,
            _ => false,
        }
    }
}

/// What a media manager manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Series,
    Movie,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Series => "series",
            MediaKind::Movie => "movie",
        }
    }
}

/// A series or movie as known to a media manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    /// Manager-native identifier.
    pub id: String,
    pub kind: MediaKind,
    pub title: String,
    /// Title normalized for matching.
    pub normalized_title: String,
    /// Alternate titles known to the manager (also matched against).
    #[serde(default)]
    pub alternate_titles: Vec<String>,
    /// Monitored seasons with files in the library (series only).
    #[serde(default)]
    pub seasons: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    /// Library folder of the entry.
    pub root_path: PathBuf,
}

impl MediaEntry {
    pub fn new(
        id: impl Into<String>,
        kind: MediaKind,
        title: impl Into<String>,
        root_path: impl Into<PathBuf>,
    ) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            kind,
            normalized_title: normalize_title(&title),
            title,
            alternate_titles: Vec::new(),
            seasons: Vec::new(),
            year: None,
            root_path: root_path.into(),
        }
    }

    pub fn with_alternate_titles(mut self, titles: Vec<String>) -> Self {
        self.alternate_titles = titles;
        self
    }

    pub fn with_seasons(mut self, seasons: Vec<u32>) -> Self {
        self.seasons = seasons;
        self
    }

    pub fn with_year(mut self, year: Option<u32>) -> Self {
        self.year = year;
        self
    }

    /// Primary title followed by alternates.
    pub fn titles(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.title.as_str()).chain(self.alternate_titles.iter().map(String::as_str))
    }

    /// Whether the entry's folder already sits under `archive_root`.
    pub fn is_under(&self, archive_root: &Path) -> bool {
        self.root_path.starts_with(archive_root)
    }
}

/// Root folder and expected files of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryLayout {
    pub root: PathBuf,
    /// Files the manager tracks, with directories implied by their paths.
    pub expected: Vec<FileNode>,
}

impl EntryLayout {
    /// Expected files missing from a captured node list.
    pub fn missing_from<'a>(&'a self, captured: &[FileNode]) -> Vec<&'a FileNode> {
        self.expected
            .iter()
            .filter(|e| !captured.iter().any(|c| c.path == e.path))
            .collect()
    }
}

/// Result of a path change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOutcome {
    /// Path updated and rescan requested.
    Updated,
    /// The manager already pointed at the new root; rescan requested.
    Unchanged,
}

/// Trait for media manager backends.
#[async_trait]
pub trait MediaManager: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// What this manager manages.
    fn kind(&self) -> MediaKind;

    /// All series or movies known to the manager.
    async fn list_catalog(&self) -> Result<Vec<MediaEntry>, MediaManagerError>;

    /// Root folder and tracked files of one entry.
    async fn get_entry_layout(&self, entry_id: &str) -> Result<EntryLayout, MediaManagerError>;

    /// Point the entry at `new_root` and ask the manager to rescan it.
    async fn notify_path_changed(
        &self,
        entry_id: &str,
        new_root: &Path,
    ) -> Result<NotifyOutcome, MediaManagerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_entry_normalizes_title() {
        let entry = MediaEntry::new("1", MediaKind::Series, "The Show: Reloaded", "/data/media/tv/The Show")
            .with_alternate_titles(vec!["Show Reloaded".to_string()]);
        assert_eq!(entry.normalized_title, "show reloaded");
        let titles: Vec<&str> = entry.titles().collect();
        assert_eq!(titles, vec!["The Show: Reloaded", "Show Reloaded"]);
    }

    #[test]
    fn test_is_under_archive_root() {
        let entry = MediaEntry::new("1", MediaKind::Movie, "Movie", "/archive/media/movies/Movie");
        assert!(entry.is_under(Path::new("/archive/media")));
        assert!(!entry.is_under(Path::new("/data/media")));
    }

    #[test]
    fn test_layout_missing_from() {
        let layout = EntryLayout {
            root: PathBuf::from("/data/media/tv/Show"),
            expected: vec![
                FileNode::file("Season 01/ep1.mkv", 10, None),
                FileNode::file("Season 01/ep2.mkv", 10, None),
            ],
        };
        let captured = vec![FileNode::file("Season 01/ep1.mkv", 10, Some("x".into()))];
        let missing = layout.missing_from(&captured);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].path, "Season 01/ep2.mkv");
    }

    #[test]
    fn test_media_kind_serialization() {
        assert_eq!(serde_json::to_string(&MediaKind::Series).unwrap(), "\"series\"");
        assert_eq!(MediaKind::Movie.as_str(), "movie");
    }
}
