//! Types for torrent client operations.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during torrent client operations.
#[derive(Debug, Error)]
pub enum TorrentClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorrentClientError {
    /// True when the client could not be reached at all, as opposed to
    /// rejecting a specific request.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TorrentClientError::ConnectionFailed(_)
                | TorrentClientError::AuthenticationFailed(_)
                | TorrentClientError::Timeout
        )
    }
}

/// State of a torrent as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    /// Downloading from peers.
    Downloading,
    /// Complete and seeding (or complete and stopped).
    Seeding,
    /// Incomplete and paused.
    Paused,
    /// Storage is being relocated.
    Moving,
    /// Data is being re-verified.
    Rechecking,
    /// Queued for download or upload.
    Queued,
    /// Stalled (no peers).
    Stalled,
    /// Error state (including missing files).
    Error,
    /// Unknown state.
    Unknown,
}

impl TorrentState {
    /// Returns the string representation for logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            TorrentState::Downloading => "downloading",
            TorrentState::Seeding => "seeding",
            TorrentState::Paused => "paused",
            TorrentState::Moving => "moving",
            TorrentState::Rechecking => "rechecking",
            TorrentState::Queued => "queued",
            TorrentState::Stalled => "stalled",
            TorrentState::Error => "error",
            TorrentState::Unknown => "unknown",
        }
    }

    /// A move or recheck is in flight.
    pub fn is_mid_transfer(&self) -> bool {
        matches!(self, TorrentState::Moving | TorrentState::Rechecking)
    }
}

/// A torrent as seen by the archival workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentRecord {
    /// Info hash (lowercase hex).
    pub hash: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Directory the torrent's data lives in.
    pub save_path: PathBuf,
    /// Root file or directory of the torrent's data.
    pub content_path: PathBuf,
    pub size_bytes: u64,
    /// Download progress (0.0 - 1.0).
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub state: TorrentState,
    /// Media manager entry this torrent belongs to, when the client knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_entry_id: Option<String>,
}

impl TorrentRecord {
    /// Time elapsed since completion. `None` for incomplete torrents.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.completed_at.map(|completed| now - completed)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Name of the content root relative to the save path.
    pub fn content_name(&self) -> PathBuf {
        self.content_path
            .strip_prefix(&self.save_path)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(&self.name))
    }

    /// Content root once the torrent is saved under `save_path`.
    pub fn content_path_under(&self, save_path: &Path) -> PathBuf {
        save_path.join(self.content_name())
    }
}

/// Handle for an issued storage move.
#[derive(Debug, Clone)]
pub struct MoveHandle {
    pub hash: String,
    pub target: PathBuf,
    pub issued_at: Instant,
}

impl MoveHandle {
    pub fn new(hash: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            hash: hash.into(),
            target: target.into(),
            issued_at: Instant::now(),
        }
    }
}

/// Progress of a storage move.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveStatus {
    Pending,
    Done,
    Failed(String),
}

/// Handle for an issued recheck.
#[derive(Debug, Clone)]
pub struct RecheckHandle {
    pub hash: String,
    pub issued_at: Instant,
}

impl RecheckHandle {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            issued_at: Instant::now(),
        }
    }
}

/// Outcome of a recheck.
#[derive(Debug, Clone, PartialEq)]
pub enum RecheckStatus {
    Pending,
    /// All pieces verified.
    Valid,
    /// Verification finished with missing or corrupt pieces.
    Invalid { progress: f64 },
    Failed(String),
}

/// Trait for torrent client backends.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// List all torrents.
    async fn list_torrents(&self) -> Result<Vec<TorrentRecord>, TorrentClientError>;

    /// Get a specific torrent by hash.
    async fn get_torrent(&self, hash: &str) -> Result<TorrentRecord, TorrentClientError>;

    /// Relocate a torrent's data to `new_path` (the new save path).
    async fn move_storage(
        &self,
        hash: &str,
        new_path: &Path,
    ) -> Result<MoveHandle, TorrentClientError>;

    /// Check on a move issued with [`TorrentClient::move_storage`].
    async fn poll_move_status(&self, handle: &MoveHandle)
        -> Result<MoveStatus, TorrentClientError>;

    /// Force re-verification of a torrent's data.
    async fn recheck(&self, hash: &str) -> Result<RecheckHandle, TorrentClientError>;

    /// Check on a recheck issued with [`TorrentClient::recheck`].
    async fn poll_recheck_status(
        &self,
        handle: &RecheckHandle,
    ) -> Result<RecheckStatus, TorrentClientError>;
}
