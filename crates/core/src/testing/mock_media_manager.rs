//! Mock media manager for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::media_manager::{
    EntryLayout, MediaEntry, MediaKind, MediaManager, MediaManagerError, NotifyOutcome,
};

/// A recorded path change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedNotify {
    pub entry_id: String,
    pub new_root: PathBuf,
}

/// Mock implementation of the MediaManager trait.
///
/// Holds an in-memory catalog. Notifications update the stored root of the
/// entry, so a second run sees the archived location like a real manager
/// would after a rescan.
#[derive(Debug)]
pub struct MockMediaManager {
    kind: MediaKind,
    catalog: Arc<RwLock<Vec<MediaEntry>>>,
    /// Layout overrides by entry id.
    layouts: Arc<RwLock<HashMap<String, EntryLayout>>>,
    notifications: Arc<RwLock<Vec<RecordedNotify>>>,
    /// Entries whose notifications are rejected.
    notify_failures: Arc<RwLock<HashSet<String>>>,
    unavailable: Arc<RwLock<bool>>,
}

impl MockMediaManager {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            catalog: Arc::new(RwLock::new(Vec::new())),
            layouts: Arc::new(RwLock::new(HashMap::new())),
            notifications: Arc::new(RwLock::new(Vec::new())),
            notify_failures: Arc::new(RwLock::new(HashSet::new())),
            unavailable: Arc::new(RwLock::new(false)),
        }
    }

    /// Mock Sonarr.
    pub fn series() -> Self {
        Self::new(MediaKind::Series)
    }

    /// Mock Radarr.
    pub fn movies() -> Self {
        Self::new(MediaKind::Movie)
    }

    pub async fn add_entry(&self, entry: MediaEntry) {
        self.catalog.write().await.push(entry);
    }

    pub async fn entry(&self, entry_id: &str) -> Option<MediaEntry> {
        self.catalog
            .read()
            .await
            .iter()
            .find(|e| e.id == entry_id)
            .cloned()
    }

    /// Report `layout` for `entry_id` instead of one derived from the catalog.
    pub async fn set_layout(&self, entry_id: &str, layout: EntryLayout) {
        self.layouts
            .write()
            .await
            .insert(entry_id.to_string(), layout);
    }

    /// Reject notifications for `entry_id` until cleared.
    pub async fn fail_notify(&self, entry_id: &str) {
        self.notify_failures
            .write()
            .await
            .insert(entry_id.to_string());
    }

    pub async fn clear_notify_failures(&self) {
        self.notify_failures.write().await.clear();
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    /// Accepted notifications, in order.
    pub async fn notifications(&self) -> Vec<RecordedNotify> {
        self.notifications.read().await.clone()
    }

    async fn check_available(&self) -> Result<(), MediaManagerError> {
        if *self.unavailable.read().await {
            return Err(MediaManagerError::ApiError {
                status: 503,
                message: "mock manager unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaManager for MockMediaManager {
    fn name(&self) -> &str {
        match self.kind {
            MediaKind::Series => "mock-sonarr",
            MediaKind::Movie => "mock-radarr",
        }
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn list_catalog(&self) -> Result<Vec<MediaEntry>, MediaManagerError> {
        self.check_available().await?;
        Ok(self.catalog.read().await.clone())
    }

    async fn get_entry_layout(&self, entry_id: &str) -> Result<EntryLayout, MediaManagerError> {
        self.check_available().await?;
        if let Some(layout) = self.layouts.read().await.get(entry_id) {
            return Ok(layout.clone());
        }
        let entry = self
            .entry(entry_id)
            .await
            .ok_or_else(|| MediaManagerError::NotFound(entry_id.to_string()))?;
        Ok(EntryLayout {
            root: entry.root_path,
            expected: Vec::new(),
        })
    }

    async fn notify_path_changed(
        &self,
        entry_id: &str,
        new_root: &Path,
    ) -> Result<NotifyOutcome, MediaManagerError> {
        self.check_available().await?;
        if self.notify_failures.read().await.contains(entry_id) {
            return Err(MediaManagerError::ApiError {
                status: 400,
                message: format!("path rejected for {}", entry_id),
            });
        }

        let mut catalog = self.catalog.write().await;
        let entry = catalog
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| MediaManagerError::NotFound(entry_id.to_string()))?;
        let outcome = if entry.root_path == new_root {
            NotifyOutcome::Unchanged
        } else {
            entry.root_path = new_root.to_path_buf();
            NotifyOutcome::Updated
        };
        self.notifications.write().await.push(RecordedNotify {
            entry_id: entry_id.to_string(),
            new_root: new_root.to_path_buf(),
        });
        Ok(outcome)
    }
}
