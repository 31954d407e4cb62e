//! qBittorrent torrent client implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::QBittorrentConfig;
use crate::metrics;

use super::{
    MoveHandle, MoveStatus, RecheckHandle, RecheckStatus, TorrentClient, TorrentClientError,
    TorrentRecord, TorrentState,
};

/// How long a recheck may stay out of a checking state before its result is
/// trusted. qBittorrent queues the recheck and the state flips a moment later.
const RECHECK_SETTLE: Duration = Duration::from_secs(5);

/// Progress at or above this counts as fully verified.
const COMPLETE_PROGRESS: f64 = 0.9999;

/// qBittorrent client implementation.
pub struct QBittorrentClient {
    client: Client,
    config: QBittorrentConfig,
    /// Session marker (refreshed on auth failure).
    session: Arc<RwLock<Option<String>>>,
}

impl QBittorrentClient {
    /// Create a new qBittorrent client.
    pub fn new(config: QBittorrentConfig) -> Result<Self, TorrentClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .cookie_store(true)
            .build()
            .map_err(|e| TorrentClientError::Internal(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            session: Arc::new(RwLock::new(None)),
        })
    }

    /// Get the base URL without trailing slash.
    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    /// Login and store session cookie.
    async fn login(&self) -> Result<(), TorrentClientError> {
        let url = format!("{}/api/v2/auth/login", self.base_url());

        let params = [
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if body.contains("Ok.") {
            debug!("qBittorrent login successful");
            // Session cookie is stored by the cookie jar
            let mut session = self.session.write().await;
            *session = Some("authenticated".to_string());
            Ok(())
        } else if body.contains("Fails.") || status.as_u16() == 403 {
            Err(TorrentClientError::AuthenticationFailed(
                "Invalid credentials".to_string(),
            ))
        } else {
            Err(TorrentClientError::AuthenticationFailed(format!(
                "Unexpected response: {}",
                body.chars().take(100).collect::<String>()
            )))
        }
    }

    /// Ensure we have a valid session, logging in if needed.
    async fn ensure_authenticated(&self) -> Result<(), TorrentClientError> {
        let session = self.session.read().await;
        if session.is_some() {
            return Ok(());
        }
        drop(session);
        self.login().await
    }

    async fn invalidate_session(&self) {
        warn!("qBittorrent session expired, re-authenticating");
        let mut session = self.session.write().await;
        *session = None;
    }

    /// Make an authenticated GET request.
    async fn get(&self, endpoint: &str) -> Result<String, TorrentClientError> {
        self.ensure_authenticated().await?;
        metrics::EXTERNAL_REQUESTS_TOTAL
            .with_label_values(&["qbittorrent", "get"])
            .inc();

        let url = format!("{}{}", self.base_url(), endpoint);
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(map_request_error)?;

        if response.status().as_u16() == 403 {
            self.invalidate_session().await;
            self.login().await?;
            response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(map_request_error)?;
        }

        read_body(response).await
    }

    /// Make an authenticated POST request with form data.
    async fn post_form(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<String, TorrentClientError> {
        self.ensure_authenticated().await?;
        metrics::EXTERNAL_REQUESTS_TOTAL
            .with_label_values(&["qbittorrent", "post"])
            .inc();

        let url = format!("{}{}", self.base_url(), endpoint);
        let mut response = self
            .client
            .post(&url)
            .form(params)
            .send()
            .await
            .map_err(map_request_error)?;

        if response.status().as_u16() == 403 {
            self.invalidate_session().await;
            self.login().await?;
            response = self
                .client
                .post(&url)
                .form(params)
                .send()
                .await
                .map_err(map_request_error)?;
        }

        read_body(response).await
    }
}

fn map_request_error(e: reqwest::Error) -> TorrentClientError {
    if e.is_timeout() {
        TorrentClientError::Timeout
    } else if e.is_connect() {
        TorrentClientError::ConnectionFailed(e.to_string())
    } else {
        TorrentClientError::ApiError(e.to_string())
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, TorrentClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TorrentClientError::ApiError(format!(
            "HTTP {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| TorrentClientError::ApiError(e.to_string()))
}

/// qBittorrent torrent info response.
#[derive(Debug, Deserialize)]
struct QBTorrentInfo {
    hash: String,
    name: String,
    state: String,
    progress: f64,
    size: i64,
    completion_on: i64,
    save_path: String,
    #[serde(default)]
    content_path: String,
    #[serde(default)]
    category: String,
    /// Comma separated.
    #[serde(default)]
    tags: String,
}

impl QBTorrentInfo {
    fn into_torrent_record(self) -> TorrentRecord {
        let save_path = PathBuf::from(&self.save_path);
        let content_path = if self.content_path.is_empty() {
            save_path.join(&self.name)
        } else {
            PathBuf::from(&self.content_path)
        };
        TorrentRecord {
            hash: self.hash.to_lowercase(),
            name: self.name,
            category: if self.category.is_empty() {
                None
            } else {
                Some(self.category)
            },
            tags: parse_tags(&self.tags),
            save_path,
            content_path,
            size_bytes: self.size.max(0) as u64,
            progress: self.progress,
            completed_at: if self.completion_on > 0 {
                timestamp_to_datetime(self.completion_on)
            } else {
                None
            },
            state: parse_qb_state(&self.state),
            media_entry_id: None,
        }
    }
}

fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Parse qBittorrent state string to TorrentState.
fn parse_qb_state(state: &str) -> TorrentState {
    match state {
        "downloading" | "forcedDL" | "metaDL" | "forcedMetaDL" | "allocating" => {
            TorrentState::Downloading
        }
        "uploading" | "forcedUP" | "stalledUP" | "pausedUP" | "stoppedUP" | "queuedUP" => {
            TorrentState::Seeding
        }
        "pausedDL" | "stoppedDL" => TorrentState::Paused,
        "moving" => TorrentState::Moving,
        "checkingDL" | "checkingUP" | "checkingResumeData" => TorrentState::Rechecking,
        "queuedDL" => TorrentState::Queued,
        "stalledDL" => TorrentState::Stalled,
        "error" | "missingFiles" => TorrentState::Error,
        _ => TorrentState::Unknown,
    }
}

/// Convert Unix timestamp to DateTime<Utc>.
fn timestamp_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    if ts > 0 {
        Utc.timestamp_opt(ts, 0).single()
    } else {
        None
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    a.components().eq(b.components())
}

/// Decide a move's progress from the torrent's current view.
fn move_status_of(torrent: &TorrentRecord, target: &Path) -> MoveStatus {
    match torrent.state {
        TorrentState::Moving => MoveStatus::Pending,
        TorrentState::Error => MoveStatus::Failed(format!(
            "torrent {} entered error state while moving",
            torrent.hash
        )),
        _ if same_path(&torrent.save_path, target) => MoveStatus::Done,
        _ => MoveStatus::Pending,
    }
}

/// Decide a recheck's outcome from the torrent's current view.
fn recheck_status_of(torrent: &TorrentRecord, settled: bool) -> RecheckStatus {
    match torrent.state {
        TorrentState::Rechecking => RecheckStatus::Pending,
        TorrentState::Error if settled => {
            RecheckStatus::Failed(format!("torrent {} is in error state", torrent.hash))
        }
        _ if !settled => RecheckStatus::Pending,
        _ if torrent.progress >= COMPLETE_PROGRESS => RecheckStatus::Valid,
        _ => RecheckStatus::Invalid {
            progress: torrent.progress,
        },
    }
}

#[async_trait]
impl TorrentClient for QBittorrentClient {
    fn name(&self) -> &str {
        "qbittorrent"
    }

    async fn list_torrents(&self) -> Result<Vec<TorrentRecord>, TorrentClientError> {
        let response = self.get("/api/v2/torrents/info").await?;
        let torrents: Vec<QBTorrentInfo> = serde_json::from_str(&response).map_err(|e| {
            TorrentClientError::ApiError(format!("Failed to parse response: {}", e))
        })?;

        Ok(torrents
            .into_iter()
            .map(|t| t.into_torrent_record())
            .collect())
    }

    async fn get_torrent(&self, hash: &str) -> Result<TorrentRecord, TorrentClientError> {
        let hash_lower = hash.to_lowercase();
        let endpoint = format!(
            "/api/v2/torrents/info?hashes={}",
            urlencoding::encode(&hash_lower)
        );
        let response = self.get(&endpoint).await?;

        let torrents: Vec<QBTorrentInfo> = serde_json::from_str(&response).map_err(|e| {
            TorrentClientError::ApiError(format!("Failed to parse response: {}", e))
        })?;

        torrents
            .into_iter()
            .next()
            .map(|t| t.into_torrent_record())
            .ok_or_else(|| TorrentClientError::TorrentNotFound(hash.to_string()))
    }

    async fn move_storage(
        &self,
        hash: &str,
        new_path: &Path,
    ) -> Result<MoveHandle, TorrentClientError> {
        let hash_lower = hash.to_lowercase();
        let location = new_path.to_string_lossy();
        debug!(hash = %hash_lower, location = %location, "Issuing setLocation");

        self.post_form(
            "/api/v2/torrents/setLocation",
            &[("hashes", &hash_lower), ("location", &location)],
        )
        .await?;

        Ok(MoveHandle::new(hash_lower, new_path))
    }

    async fn poll_move_status(
        &self,
        handle: &MoveHandle,
    ) -> Result<MoveStatus, TorrentClientError> {
        let torrent = self.get_torrent(&handle.hash).await?;
        Ok(move_status_of(&torrent, &handle.target))
    }

    async fn recheck(&self, hash: &str) -> Result<RecheckHandle, TorrentClientError> {
        let hash_lower = hash.to_lowercase();
        self.post_form("/api/v2/torrents/recheck", &[("hashes", &hash_lower)])
            .await?;
        Ok(RecheckHandle::new(hash_lower))
    }

    async fn poll_recheck_status(
        &self,
        handle: &RecheckHandle,
    ) -> Result<RecheckStatus, TorrentClientError> {
        let torrent = self.get_torrent(&handle.hash).await?;
        let settled = handle.issued_at.elapsed() >= RECHECK_SETTLE;
        Ok(recheck_status_of(&torrent, settled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn qb_info(state: &str) -> QBTorrentInfo {
        QBTorrentInfo {
            hash: "ABC123".to_string(),
            name: "Show.S01.1080p".to_string(),
            state: state.to_string(),
            progress: 1.0,
            size: 1000000,
            completion_on: 1703980800,
            save_path: "/data/torrents/tv".to_string(),
            content_path: "/data/torrents/tv/Show.S01.1080p".to_string(),
            category: "tv".to_string(),
            tags: "keep, skip".to_string(),
        }
    }

    #[test]
    fn test_parse_qb_state_downloading() {
        assert_eq!(parse_qb_state("downloading"), TorrentState::Downloading);
        assert_eq!(parse_qb_state("forcedDL"), TorrentState::Downloading);
        assert_eq!(parse_qb_state("metaDL"), TorrentState::Downloading);
    }

    #[test]
    fn test_parse_qb_state_completed_upload_states_are_seeding() {
        assert_eq!(parse_qb_state("uploading"), TorrentState::Seeding);
        assert_eq!(parse_qb_state("forcedUP"), TorrentState::Seeding);
        assert_eq!(parse_qb_state("stalledUP"), TorrentState::Seeding);
        assert_eq!(parse_qb_state("pausedUP"), TorrentState::Seeding);
        assert_eq!(parse_qb_state("stoppedUP"), TorrentState::Seeding);
    }

    #[test]
    fn test_parse_qb_state_moving_and_checking() {
        assert_eq!(parse_qb_state("moving"), TorrentState::Moving);
        assert_eq!(parse_qb_state("checkingDL"), TorrentState::Rechecking);
        assert_eq!(parse_qb_state("checkingUP"), TorrentState::Rechecking);
        assert_eq!(parse_qb_state("checkingResumeData"), TorrentState::Rechecking);
    }

    #[test]
    fn test_parse_qb_state_error() {
        assert_eq!(parse_qb_state("error"), TorrentState::Error);
        assert_eq!(parse_qb_state("missingFiles"), TorrentState::Error);
    }

    #[test]
    fn test_parse_qb_state_unknown() {
        assert_eq!(parse_qb_state("something_else"), TorrentState::Unknown);
    }

    #[test]
    fn test_timestamp_to_datetime() {
        let dt = timestamp_to_datetime(1703980800);
        assert!(dt.is_some());
        assert_eq!(dt.unwrap().year(), 2023);

        assert!(timestamp_to_datetime(-1).is_none());
        assert!(timestamp_to_datetime(0).is_none());
    }

    #[test]
    fn test_qb_torrent_info_conversion() {
        let record = qb_info("stalledUP").into_torrent_record();
        assert_eq!(record.hash, "abc123");
        assert_eq!(record.state, TorrentState::Seeding);
        assert_eq!(record.category.as_deref(), Some("tv"));
        assert_eq!(record.tags, vec!["keep", "skip"]);
        assert_eq!(record.size_bytes, 1000000);
        assert!(record.completed_at.is_some());
        assert_eq!(
            record.content_path,
            PathBuf::from("/data/torrents/tv/Show.S01.1080p")
        );
    }

    #[test]
    fn test_missing_content_path_falls_back_to_name() {
        let mut info = qb_info("uploading");
        info.content_path = String::new();
        info.completion_on = -1;
        let record = info.into_torrent_record();
        assert_eq!(
            record.content_path,
            PathBuf::from("/data/torrents/tv/Show.S01.1080p")
        );
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn test_move_status() {
        let target = Path::new("/archive/torrents/tv");
        let mut record = qb_info("moving").into_torrent_record();
        assert_eq!(move_status_of(&record, target), MoveStatus::Pending);

        record.state = TorrentState::Seeding;
        assert_eq!(move_status_of(&record, target), MoveStatus::Pending);

        record.save_path = PathBuf::from("/archive/torrents/tv/");
        assert_eq!(move_status_of(&record, target), MoveStatus::Done);

        record.state = TorrentState::Error;
        assert!(matches!(
            move_status_of(&record, target),
            MoveStatus::Failed(_)
        ));
    }

    #[test]
    fn test_recheck_status() {
        let mut record = qb_info("checkingUP").into_torrent_record();
        assert_eq!(recheck_status_of(&record, true), RecheckStatus::Pending);

        record.state = TorrentState::Seeding;
        assert_eq!(recheck_status_of(&record, false), RecheckStatus::Pending);
        assert_eq!(recheck_status_of(&record, true), RecheckStatus::Valid);

        record.state = TorrentState::Paused;
        record.progress = 0.75;
        assert_eq!(
            recheck_status_of(&record, true),
            RecheckStatus::Invalid { progress: 0.75 }
        );

        record.state = TorrentState::Error;
        assert!(matches!(
            recheck_status_of(&record, true),
            RecheckStatus::Failed(_)
        ));
    }

    #[test]
    fn test_new_client() {
        let client = QBittorrentClient::new(QBittorrentConfig {
            url: "http://localhost:8080/".to_string(),
            username: "admin".to_string(),
            password: "adminadmin".to_string(),
            timeout_secs: 10,
        })
        .unwrap();
        assert_eq!(client.name(), "qbittorrent");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
