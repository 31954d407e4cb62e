//! Age-based candidate selection.

use chrono::{DateTime, Duration, Utc};

use crate::config::{MountpointConfig, SelectionConfig};
use crate::matcher::looks_like_series;
use crate::media_manager::MediaKind;
use crate::torrent_client::{TorrentRecord, TorrentState};

/// Picks torrents old enough to archive.
///
/// A torrent counts as already archived when its data sits on an archival
/// mountpoint or it carries one of the excluded tags.
#[derive(Debug, Clone)]
pub struct CandidateSelector {
    min_age: Duration,
    selection: SelectionConfig,
    mountpoints: MountpointConfig,
}

impl CandidateSelector {
    pub fn new(selection: &SelectionConfig, mountpoints: &MountpointConfig) -> Self {
        Self {
            min_age: selection.min_age(),
            selection: selection.clone(),
            mountpoints: mountpoints.clone(),
        }
    }

    pub fn min_age(&self) -> Duration {
        self.min_age
    }

    pub fn is_archived(&self, torrent: &TorrentRecord) -> bool {
        self.mountpoints.is_archived_path(&torrent.save_path)
            || self
                .selection
                .excluded_tags
                .iter()
                .any(|tag| torrent.has_tag(tag))
    }

    /// Complete, idle, and not yet archived. Age is not considered.
    pub fn is_movable(&self, torrent: &TorrentRecord) -> bool {
        torrent.completed_at.is_some()
            && !torrent.state.is_mid_transfer()
            && torrent.state != TorrentState::Error
            && !self.is_archived(torrent)
    }

    /// Movable and idle for longer than the minimum age.
    pub fn is_candidate(&self, torrent: &TorrentRecord, now: DateTime<Utc>) -> bool {
        self.is_movable(torrent)
            && torrent
                .age(now)
                .map(|age| age > self.min_age)
                .unwrap_or(false)
    }

    /// Candidates ordered oldest first, ties broken by hash.
    pub fn select(&self, torrents: &[TorrentRecord], now: DateTime<Utc>) -> Vec<TorrentRecord> {
        let mut candidates: Vec<TorrentRecord> = torrents
            .iter()
            .filter(|t| self.is_candidate(t, now))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        candidates
    }

    /// Series or movie, by category first and release name second.
    pub fn classify(&self, torrent: &TorrentRecord) -> MediaKind {
        if let Some(category) = torrent.category.as_deref() {
            let listed = |list: &[String]| list.iter().any(|c| c.eq_ignore_ascii_case(category));
            if listed(&self.selection.series_categories) {
                return MediaKind::Series;
            }
            if listed(&self.selection.movie_categories) {
                return MediaKind::Movie;
            }
        }
        if looks_like_series(&torrent.name) {
            MediaKind::Series
        } else {
            MediaKind::Movie
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn selector() -> CandidateSelector {
        CandidateSelector::new(
            &SelectionConfig::default(),
            &MountpointConfig {
                source_media: PathBuf::from("/data/media"),
                destination_media: PathBuf::from("/archive/media"),
                destination_torrents: PathBuf::from("/archive/torrents"),
            },
        )
    }

    fn torrent(hash: &str, days: i64, now: DateTime<Utc>) -> TorrentRecord {
        TorrentRecord {
            hash: hash.to_string(),
            name: format!("Release.{}", hash),
            category: Some("tv".to_string()),
            tags: vec![],
            save_path: PathBuf::from("/data/torrents/tv"),
            content_path: PathBuf::from(format!("/data/torrents/tv/Release.{}", hash)),
            size_bytes: 10,
            progress: 1.0,
            completed_at: Some(now - Duration::days(days)),
            state: TorrentState::Seeding,
            media_entry_id: None,
        }
    }

    #[test]
    fn test_select_orders_oldest_first() {
        let now = Utc::now();
        let torrents = vec![
            torrent("c", 200, now),
            torrent("a", 400, now),
            torrent("b", 300, now),
            torrent("young", 10, now),
        ];
        let selected = selector().select(&torrents, now);
        let hashes: Vec<&str> = selected.iter().map(|t| t.hash.as_str()).collect();
        assert_eq!(hashes, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_broken_by_hash() {
        let now = Utc::now();
        let mut second = torrent("b", 300, now);
        let first = torrent("a", 300, now);
        second.completed_at = first.completed_at;
        let selected = selector().select(&[second, first], now);
        assert_eq!(selected[0].hash, "a");
        assert_eq!(selected[1].hash, "b");
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let now = Utc::now();
        let at_threshold = torrent("a", 180, now);
        let over = torrent("b", 181, now);
        let s = selector();
        assert!(!s.is_candidate(&at_threshold, now));
        assert!(s.is_candidate(&over, now));
    }

    #[test]
    fn test_excludes_archived_mid_transfer_and_incomplete() {
        let now = Utc::now();
        let mut archived = torrent("archived", 400, now);
        archived.save_path = PathBuf::from("/archive/torrents/tv");
        let mut tagged = torrent("tagged", 400, now);
        tagged.tags = vec!["Skip".to_string()];
        let mut moving = torrent("moving", 400, now);
        moving.state = TorrentState::Moving;
        let mut rechecking = torrent("rechecking", 400, now);
        rechecking.state = TorrentState::Rechecking;
        let mut incomplete = torrent("incomplete", 400, now);
        incomplete.completed_at = None;

        let selected = selector().select(
            &[archived, tagged, moving, rechecking, incomplete, torrent("ok", 400, now)],
            now,
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].hash, "ok");
    }

    #[test]
    fn test_classify_by_category_then_name() {
        let now = Utc::now();
        let s = selector();
        let mut movie = torrent("m", 1, now);
        movie.category = Some("Movies".to_string());
        movie.name = "Show.S01E01.1080p".to_string();
        assert_eq!(s.classify(&movie), MediaKind::Movie);

        let mut uncategorized = torrent("u", 1, now);
        uncategorized.category = None;
        uncategorized.name = "Show.S02.720p".to_string();
        assert_eq!(s.classify(&uncategorized), MediaKind::Series);

        uncategorized.name = "Some.Film.2010.1080p".to_string();
        assert_eq!(s.classify(&uncategorized), MediaKind::Movie);
    }
}
