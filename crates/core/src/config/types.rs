use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub torrent_client: TorrentClientConfig,
    #[serde(default)]
    pub sonarr: Option<MediaManagerConfig>,
    #[serde(default)]
    pub radarr: Option<MediaManagerConfig>,
    pub mountpoints: MountpointConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("cellar.db")
}

/// Torrent client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TorrentClientConfig {
    /// Which backend to use.
    pub backend: TorrentClientBackend,
    /// qBittorrent-specific configuration (required when backend = "qbittorrent").
    #[serde(default)]
    pub qbittorrent: Option<QBittorrentConfig>,
}

/// Available torrent client backends
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TorrentClientBackend {
    #[serde(rename = "qbittorrent")]
    QBittorrent,
}

/// qBittorrent Web API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QBittorrentConfig {
    /// Web UI URL (e.g., "http://localhost:8080")
    pub url: String,
    pub username: String,
    pub password: String,
    /// Request timeout in seconds (default: 360, moves of large torrents block the API)
    #[serde(default = "default_qbit_timeout")]
    pub timeout_secs: u32,
}

fn default_qbit_timeout() -> u32 {
    360
}

/// Sonarr/Radarr connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaManagerConfig {
    /// Base URL (e.g., "http://localhost:8989")
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_manager_timeout")]
    pub timeout_secs: u32,
}

fn default_manager_timeout() -> u32 {
    30
}

/// Logical mountpoint roles mapped to physical paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MountpointConfig {
    /// Library root the media managers currently point at (e.g. /data/media).
    pub source_media: PathBuf,
    /// Library root on the archival volume (e.g. /archive/media).
    pub destination_media: PathBuf,
    /// Torrent data root on the archival volume (e.g. /archive/torrents).
    pub destination_torrents: PathBuf,
}

impl MountpointConfig {
    /// Torrent save directory for a category on the archival volume.
    pub fn torrents_dir(&self, category: Option<&str>) -> PathBuf {
        match category {
            Some(c) if !c.is_empty() => self.destination_torrents.join(c),
            _ => self.destination_torrents.clone(),
        }
    }

    /// Maps a library root from the source mountpoint onto the destination one.
    ///
    /// Roots outside `source_media` keep only their basename under
    /// `destination_media/<category>`.
    pub fn relocate_media_root(&self, root: &std::path::Path, category: Option<&str>) -> PathBuf {
        if let Ok(rel) = root.strip_prefix(&self.source_media) {
            return self.destination_media.join(rel);
        }
        let mut dest = self.destination_media.clone();
        if let Some(c) = category.filter(|c| !c.is_empty()) {
            dest.push(c);
        }
        if let Some(name) = root.file_name() {
            dest.push(name);
        }
        dest
    }

    /// True when a path already lives on the archival volume.
    pub fn is_archived_path(&self, path: &std::path::Path) -> bool {
        path.starts_with(&self.destination_torrents) || path.starts_with(&self.destination_media)
    }
}

/// Candidate selection policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectionConfig {
    /// Minimum days since completion before a torrent is archived.
    #[serde(default = "default_min_age_days")]
    pub min_age_days: u32,
    /// Torrent categories that hold TV series.
    #[serde(default = "default_series_categories")]
    pub series_categories: Vec<String>,
    /// Torrent categories that hold movies.
    #[serde(default = "default_movie_categories")]
    pub movie_categories: Vec<String>,
    /// Torrents carrying any of these tags are never selected.
    #[serde(default = "default_excluded_tags")]
    pub excluded_tags: Vec<String>,
}

fn default_min_age_days() -> u32 {
    180
}

fn default_series_categories() -> Vec<String> {
    vec!["tv".to_string()]
}

fn default_movie_categories() -> Vec<String> {
    vec!["movies".to_string()]
}

fn default_excluded_tags() -> Vec<String> {
    vec!["skip".to_string()]
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_age_days: default_min_age_days(),
            series_categories: default_series_categories(),
            movie_categories: default_movie_categories(),
            excluded_tags: default_excluded_tags(),
        }
    }
}

impl SelectionConfig {
    pub fn min_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.min_age_days as i64)
    }
}

/// Fuzzy matcher tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatcherConfig {
    /// Minimum score (0.0-1.0) for a catalog entry to count as a match.
    #[serde(default = "default_match_threshold")]
    pub threshold: f32,
    /// Top two scores closer than this are reported as ambiguous.
    #[serde(default = "default_ambiguity_epsilon")]
    pub ambiguity_epsilon: f32,
}

fn default_match_threshold() -> f32 {
    0.6
}

fn default_ambiguity_epsilon() -> f32 {
    0.05
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: default_match_threshold(),
            ambiguity_epsilon: default_ambiguity_epsilon(),
        }
    }
}

/// Exponential backoff with a hard deadline for external operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollConfig {
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u64,
}

fn default_initial_interval() -> u64 {
    2_000
}

fn default_max_interval() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_poll_timeout() -> u64 {
    6 * 3600
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            multiplier: default_multiplier(),
            timeout_secs: default_poll_timeout(),
        }
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Workflow execution settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub move_poll: PollConfig,
    #[serde(default)]
    pub recheck_poll: PollConfig,
    /// Automatic resume attempts for a failed job before it is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Jobs executed at once; only jobs with disjoint roots run together.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// New jobs planned per run (resumed jobs do not count).
    #[serde(default = "default_max_jobs_per_run")]
    pub max_jobs_per_run: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_max_jobs_per_run() -> usize {
    1
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            move_poll: PollConfig::default(),
            recheck_poll: PollConfig::default(),
            max_retries: default_max_retries(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_jobs_per_run: default_max_jobs_per_run(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Metrics export
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Write the Prometheus text exposition here after every run.
    #[serde(default)]
    pub textfile_path: Option<PathBuf>,
}

/// Sanitized config for logging (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub database: DatabaseConfig,
    pub torrent_client_url: Option<String>,
    pub sonarr: Option<SanitizedManagerConfig>,
    pub radarr: Option<SanitizedManagerConfig>,
    pub mountpoints: MountpointConfig,
    pub selection: SelectionConfig,
    pub matcher: MatcherConfig,
    pub workflow: WorkflowConfig,
}

/// Media manager config with the API key hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedManagerConfig {
    pub url: String,
    pub api_key_configured: bool,
}

impl From<&MediaManagerConfig> for SanitizedManagerConfig {
    fn from(config: &MediaManagerConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key_configured: !config.api_key.is_empty(),
        }
    }
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            database: config.database.clone(),
            torrent_client_url: config
                .torrent_client
                .qbittorrent
                .as_ref()
                .map(|q| q.url.clone()),
            sonarr: config.sonarr.as_ref().map(SanitizedManagerConfig::from),
            radarr: config.radarr.as_ref().map(SanitizedManagerConfig::from),
            mountpoints: config.mountpoints.clone(),
            selection: config.selection.clone(),
            matcher: config.matcher.clone(),
            workflow: config.workflow.clone(),
        }
    }
}
