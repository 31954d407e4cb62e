//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the external service traits
//! (torrent client, media managers), allowing whole archival runs to be
//! exercised against a temporary directory tree.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellar_core::testing::{fixtures, MockMediaManager, MockTorrentClient};
//!
//! let temp = tempfile::TempDir::new()?;
//! let config = fixtures::config(temp.path());
//!
//! let client = MockTorrentClient::new();
//! client.add_torrent(fixtures::torrent("abc", "Show.S01.1080p", Some("tv"), &save_path, 400)).await;
//!
//! let sonarr = MockMediaManager::series();
//! sonarr.add_entry(MediaEntry::new("1", MediaKind::Series, "Show", &show_root)).await;
//! ```

mod mock_media_manager;
mod mock_torrent_client;

pub use mock_media_manager::{MockMediaManager, RecordedNotify};
pub use mock_torrent_client::{MockTorrentClient, RecordedCall};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::fs;
    use std::path::{Path, PathBuf};

    use chrono::{Duration, Utc};

    use crate::config::{
        Config, DatabaseConfig, LoggingConfig, MatcherConfig, MetricsConfig, MountpointConfig,
        PollConfig, SelectionConfig, TorrentClientBackend, TorrentClientConfig, WorkflowConfig,
    };
    use crate::torrent_client::{TorrentRecord, TorrentState};

    /// Write `content` to `path`, creating parent directories.
    pub fn write_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// Hardlink a torrent data file into a library path.
    pub fn link_file(source: &Path, library_path: &Path) {
        if let Some(parent) = library_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::hard_link(source, library_path).unwrap();
    }

    /// Polling fast enough for tests.
    pub fn fast_poll(timeout_secs: u64) -> PollConfig {
        PollConfig {
            initial_interval_ms: 5,
            max_interval_ms: 20,
            multiplier: 2.0,
            timeout_secs,
        }
    }

    /// Configuration rooted in a temporary directory:
    /// `<root>/media` is the live library, `<root>/archive/...` the archival volume.
    pub fn config(root: &Path) -> Config {
        Config {
            database: DatabaseConfig {
                path: root.join("cellar.db"),
            },
            torrent_client: TorrentClientConfig {
                backend: TorrentClientBackend::QBittorrent,
                qbittorrent: None,
            },
            sonarr: None,
            radarr: None,
            mountpoints: MountpointConfig {
                source_media: root.join("media"),
                destination_media: root.join("archive/media"),
                destination_torrents: root.join("archive/torrents"),
            },
            selection: SelectionConfig::default(),
            matcher: MatcherConfig::default(),
            workflow: WorkflowConfig {
                move_poll: fast_poll(1),
                recheck_poll: fast_poll(1),
                max_concurrent_jobs: 4,
                max_jobs_per_run: 10,
                ..WorkflowConfig::default()
            },
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Torrent download directory for a category in a test tree.
    pub fn torrents_dir(root: &Path, category: &str) -> PathBuf {
        root.join("torrents").join(category)
    }

    /// A complete, seeding torrent finished `days_old` days ago.
    pub fn torrent(
        hash: &str,
        name: &str,
        category: Option<&str>,
        save_path: &Path,
        days_old: i64,
    ) -> TorrentRecord {
        TorrentRecord {
            hash: hash.to_string(),
            name: name.to_string(),
            category: category.map(str::to_string),
            tags: Vec::new(),
            save_path: save_path.to_path_buf(),
            content_path: save_path.join(name),
            size_bytes: 1024 * 1024,
            progress: 1.0,
            completed_at: Some(Utc::now() - Duration::days(days_old)),
            state: TorrentState::Seeding,
            media_entry_id: None,
        }
    }
}
