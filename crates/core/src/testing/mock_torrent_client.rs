//! Mock torrent client for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::torrent_client::{
    MoveHandle, MoveStatus, RecheckHandle, RecheckStatus, TorrentClient, TorrentClientError,
    TorrentRecord, TorrentState,
};

/// A recorded client call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    MoveStorage { hash: String, new_path: PathBuf },
    Recheck { hash: String },
}

/// Mock implementation of the TorrentClient trait.
///
/// Storage moves really relocate the torrent's content on disk (a rename
/// into the new save path), so library hardlinks keep pointing at the same
/// inodes exactly as with a real client on one filesystem.
///
/// Provides controllable behavior for testing:
/// - Fail the next move of a torrent, or stall it forever
/// - Script recheck outcomes per torrent
/// - Make the whole client unreachable
///
/// # Example
///
/// ```rust,ignore
/// let client = MockTorrentClient::new();
/// client.add_torrent(fixtures::torrent("abc", "Show.S01.1080p", "tv", &save_path, 400)).await;
///
/// client.fail_next_move("abc", "disk full").await;
/// client.set_recheck_outcome("abc", RecheckStatus::Invalid { progress: 0.4 }).await;
///
/// let calls = client.calls().await;
/// ```
#[derive(Debug, Default)]
pub struct MockTorrentClient {
    torrents: Arc<RwLock<HashMap<String, TorrentRecord>>>,
    calls: Arc<RwLock<Vec<RecordedCall>>>,
    /// One-shot move failures by hash.
    move_failures: Arc<RwLock<HashMap<String, String>>>,
    /// Moves that never finish.
    stalled_moves: Arc<RwLock<HashSet<String>>>,
    /// Results of issued moves, consumed by polling.
    move_results: Arc<RwLock<HashMap<String, MoveStatus>>>,
    recheck_outcomes: Arc<RwLock<HashMap<String, RecheckStatus>>>,
    unavailable: Arc<RwLock<bool>>,
}

impl MockTorrentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a torrent.
    pub async fn add_torrent(&self, torrent: TorrentRecord) {
        self.torrents
            .write()
            .await
            .insert(torrent.hash.clone(), torrent);
    }

    /// Current record of a torrent.
    pub async fn torrent(&self, hash: &str) -> Option<TorrentRecord> {
        self.torrents.read().await.get(hash).cloned()
    }

    pub async fn set_state(&self, hash: &str, state: TorrentState) {
        if let Some(torrent) = self.torrents.write().await.get_mut(hash) {
            torrent.state = state;
        }
    }

    /// Make the next move of `hash` fail with `message`.
    pub async fn fail_next_move(&self, hash: &str, message: &str) {
        self.move_failures
            .write()
            .await
            .insert(hash.to_string(), message.to_string());
    }

    /// Make moves of `hash` stay pending forever.
    pub async fn stall_moves(&self, hash: &str) {
        self.stalled_moves.write().await.insert(hash.to_string());
    }

    /// Outcome reported by every recheck of `hash`. Defaults to valid when
    /// the content exists, invalid otherwise.
    pub async fn set_recheck_outcome(&self, hash: &str, outcome: RecheckStatus) {
        self.recheck_outcomes
            .write()
            .await
            .insert(hash.to_string(), outcome);
    }

    /// Make every call fail as if the client were down.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    /// All recorded move and recheck calls, in order.
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.read().await.clone()
    }

    /// Hashes moved so far, in order.
    pub async fn moved_hashes(&self) -> Vec<String> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                RecordedCall::MoveStorage { hash, .. } => Some(hash.clone()),
                _ => None,
            })
            .collect()
    }

    /// Hashes rechecked so far, in order.
    pub async fn rechecked_hashes(&self) -> Vec<String> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                RecordedCall::Recheck { hash } => Some(hash.clone()),
                _ => None,
            })
            .collect()
    }

    async fn check_available(&self) -> Result<(), TorrentClientError> {
        if *self.unavailable.read().await {
            return Err(TorrentClientError::ConnectionFailed(
                "mock client unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Move `torrent`'s content into `new_path`.
    fn relocate(torrent: &mut TorrentRecord, new_path: &Path) -> std::io::Result<()> {
        let target = torrent.content_path_under(new_path);
        if torrent.content_path.exists() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&torrent.content_path, &target)?;
        }
        torrent.save_path = new_path.to_path_buf();
        torrent.content_path = target;
        Ok(())
    }
}

#[async_trait]
impl TorrentClient for MockTorrentClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_torrents(&self) -> Result<Vec<TorrentRecord>, TorrentClientError> {
        self.check_available().await?;
        let mut torrents: Vec<TorrentRecord> =
            self.torrents.read().await.values().cloned().collect();
        torrents.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(torrents)
    }

    async fn get_torrent(&self, hash: &str) -> Result<TorrentRecord, TorrentClientError> {
        self.check_available().await?;
        self.torrents
            .read()
            .await
            .get(hash)
            .cloned()
            .ok_or_else(|| TorrentClientError::TorrentNotFound(hash.to_string()))
    }

    async fn move_storage(
        &self,
        hash: &str,
        new_path: &Path,
    ) -> Result<MoveHandle, TorrentClientError> {
        self.check_available().await?;
        self.calls.write().await.push(RecordedCall::MoveStorage {
            hash: hash.to_string(),
            new_path: new_path.to_path_buf(),
        });

        let mut torrents = self.torrents.write().await;
        let torrent = torrents
            .get_mut(hash)
            .ok_or_else(|| TorrentClientError::TorrentNotFound(hash.to_string()))?;

        let result = if let Some(message) = self.move_failures.write().await.remove(hash) {
            MoveStatus::Failed(message)
        } else if self.stalled_moves.read().await.contains(hash) {
            torrent.state = TorrentState::Moving;
            MoveStatus::Pending
        } else {
            match Self::relocate(torrent, new_path) {
                Ok(()) => MoveStatus::Done,
                Err(e) => MoveStatus::Failed(e.to_string()),
            }
        };
        self.move_results
            .write()
            .await
            .insert(hash.to_string(), result);

        Ok(MoveHandle::new(hash, new_path))
    }

    async fn poll_move_status(
        &self,
        handle: &MoveHandle,
    ) -> Result<MoveStatus, TorrentClientError> {
        self.check_available().await?;
        if self.stalled_moves.read().await.contains(&handle.hash) {
            return Ok(MoveStatus::Pending);
        }
        if let Some(result) = self.move_results.read().await.get(&handle.hash) {
            return Ok(result.clone());
        }
        let torrents = self.torrents.read().await;
        match torrents.get(&handle.hash) {
            Some(t) if t.save_path == handle.target => Ok(MoveStatus::Done),
            Some(_) => Ok(MoveStatus::Pending),
            None => Err(TorrentClientError::TorrentNotFound(handle.hash.clone())),
        }
    }

    async fn recheck(&self, hash: &str) -> Result<RecheckHandle, TorrentClientError> {
        self.check_available().await?;
        if !self.torrents.read().await.contains_key(hash) {
            return Err(TorrentClientError::TorrentNotFound(hash.to_string()));
        }
        self.calls.write().await.push(RecordedCall::Recheck {
            hash: hash.to_string(),
        });
        Ok(RecheckHandle::new(hash))
    }

    async fn poll_recheck_status(
        &self,
        handle: &RecheckHandle,
    ) -> Result<RecheckStatus, TorrentClientError> {
        self.check_available().await?;
        if let Some(outcome) = self.recheck_outcomes.read().await.get(&handle.hash) {
            return Ok(outcome.clone());
        }
        let torrents = self.torrents.read().await;
        let torrent = torrents
            .get(&handle.hash)
            .ok_or_else(|| TorrentClientError::TorrentNotFound(handle.hash.clone()))?;
        if torrent.content_path.exists() {
            Ok(RecheckStatus::Valid)
        } else {
            Ok(RecheckStatus::Invalid { progress: 0.0 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_move_relocates_content() {
        let temp = TempDir::new().unwrap();
        let save = temp.path().join("torrents/tv");
        fixtures::write_file(&save.join("Show.S01/ep1.mkv"), b"data");
        let client = MockTorrentClient::new();
        client
            .add_torrent(fixtures::torrent("a", "Show.S01", Some("tv"), &save, 400))
            .await;

        let dest = temp.path().join("archive/tv");
        let handle = client.move_storage("a", &dest).await.unwrap();
        assert_eq!(client.poll_move_status(&handle).await.unwrap(), MoveStatus::Done);

        let moved = client.torrent("a").await.unwrap();
        assert_eq!(moved.save_path, dest);
        assert!(dest.join("Show.S01/ep1.mkv").is_file());
        assert!(!save.join("Show.S01").exists());
        assert_eq!(client.moved_hashes().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_move_is_one_shot() {
        let temp = TempDir::new().unwrap();
        let save = temp.path().join("torrents");
        let client = MockTorrentClient::new();
        client
            .add_torrent(fixtures::torrent("a", "Movie.2010", None, &save, 400))
            .await;
        client.fail_next_move("a", "disk full").await;

        let dest = temp.path().join("archive");
        let handle = client.move_storage("a", &dest).await.unwrap();
        assert_eq!(
            client.poll_move_status(&handle).await.unwrap(),
            MoveStatus::Failed("disk full".to_string())
        );
        let handle = client.move_storage("a", &dest).await.unwrap();
        assert_eq!(client.poll_move_status(&handle).await.unwrap(), MoveStatus::Done);
    }

    #[tokio::test]
    async fn test_recheck_defaults_to_content_presence() {
        let temp = TempDir::new().unwrap();
        let save = temp.path().join("torrents");
        let client = MockTorrentClient::new();
        client
            .add_torrent(fixtures::torrent("a", "Missing.Movie", None, &save, 400))
            .await;

        let handle = client.recheck("a").await.unwrap();
        assert_eq!(
            client.poll_recheck_status(&handle).await.unwrap(),
            RecheckStatus::Invalid { progress: 0.0 }
        );

        client.set_recheck_outcome("a", RecheckStatus::Valid).await;
        assert_eq!(
            client.poll_recheck_status(&handle).await.unwrap(),
            RecheckStatus::Valid
        );
    }

    #[tokio::test]
    async fn test_unavailable_client() {
        let client = MockTorrentClient::new();
        client.set_unavailable(true).await;
        let err = client.list_torrents().await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
