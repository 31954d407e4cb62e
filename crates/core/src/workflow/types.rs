//! Types for the archival workflow and runner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::job::{ArchivalJob, FailureReason, JobState, JobStoreError};
use crate::media_manager::{MediaEntry, MediaKind, MediaManagers};
use crate::restore::{RestoreError, RestoreMismatch};
use crate::snapshot::SnapshotError;
use crate::torrent_client::{TorrentClient, TorrentClientError, TorrentRecord};

/// Errors raised while driving a job.
#[derive(Debug, Error)]
pub enum ArchivalError {
    /// Torrent client or media manager could not be reached.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("move failed for {hash}: {message}")]
    MoveFailed { hash: String, message: String },

    #[error("move of {hash} not confirmed after {elapsed:?}")]
    MoveTimeout { hash: String, elapsed: Duration },

    #[error("recheck of {hash} not confirmed after {elapsed:?}")]
    RecheckTimeout { hash: String, elapsed: Duration },

    #[error("recheck of {hash} found invalid data (progress {progress:.4})")]
    RecheckInvalid { hash: String, progress: f64 },

    #[error("recheck failed for {hash}: {message}")]
    RecheckFailed { hash: String, message: String },

    #[error("notification failed for entries {entries:?}: {message}")]
    NotifyFailed {
        entries: Vec<String>,
        message: String,
    },

    #[error("no catalog entry for {name}: {detail}")]
    Unmatched {
        hash: String,
        name: String,
        detail: String,
    },

    #[error("entry {entry_id} has files for season(s) {missing:?} but no torrent for them")]
    IncompleteSeasons { entry_id: String, missing: Vec<u32> },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("cannot {operation} job {job_id}: current state is {current_state}")]
    InvalidState {
        job_id: String,
        current_state: String,
        operation: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ArchivalError {
    /// Persisted failure reason for this error.
    pub fn reason(&self) -> FailureReason {
        match self {
            ArchivalError::SourceUnavailable(_) => FailureReason::SourceUnavailable,
            ArchivalError::Snapshot(SnapshotError::PathUnreadable { .. }) => {
                FailureReason::PathUnreadable
            }
            ArchivalError::Restore(RestoreError::PathUnwritable { .. }) => {
                FailureReason::PathUnwritable
            }
            ArchivalError::Restore(RestoreError::PathUnreadable { .. }) => {
                FailureReason::PathUnreadable
            }
            ArchivalError::MoveFailed { .. } => FailureReason::MoveFailed,
            ArchivalError::MoveTimeout { .. } => FailureReason::MoveTimeout,
            ArchivalError::RecheckTimeout { .. } => FailureReason::RecheckTimeout,
            ArchivalError::RecheckInvalid { .. } => FailureReason::RecheckInvalid,
            ArchivalError::RecheckFailed { .. } => FailureReason::RecheckFailed,
            ArchivalError::NotifyFailed { .. } => FailureReason::NotifyFailed,
            ArchivalError::Unmatched { .. } => FailureReason::Unmatched,
            ArchivalError::IncompleteSeasons { .. } => FailureReason::IncompleteSeasons,
            _ => FailureReason::Internal,
        }
    }

    /// Torrents or entries the error is about.
    pub fn subjects(&self) -> Vec<String> {
        match self {
            ArchivalError::MoveFailed { hash, .. }
            | ArchivalError::MoveTimeout { hash, .. }
            | ArchivalError::RecheckTimeout { hash, .. }
            | ArchivalError::RecheckInvalid { hash, .. }
            | ArchivalError::RecheckFailed { hash, .. }
            | ArchivalError::Unmatched { hash, .. } => vec![hash.clone()],
            ArchivalError::IncompleteSeasons { entry_id, .. } => vec![entry_id.clone()],
            ArchivalError::NotifyFailed { entries, .. } => entries.clone(),
            _ => Vec::new(),
        }
    }

    /// Unreachable-client errors become `SourceUnavailable`; anything else
    /// is built by `otherwise` from the hash and the error message.
    pub(crate) fn from_client(
        hash: &str,
        err: TorrentClientError,
        otherwise: impl FnOnce(String, String) -> ArchivalError,
    ) -> Self {
        if err.is_unavailable() {
            ArchivalError::SourceUnavailable(format!("torrent client ({}): {}", hash, err))
        } else {
            otherwise(hash.to_string(), err.to_string())
        }
    }
}

/// Options for a single run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Plan and report without persisting or mutating anything.
    pub dry_run: bool,
}

/// Catalog of one media kind as fetched at the start of a run.
#[derive(Debug, Clone)]
pub enum CatalogState {
    Loaded(Vec<MediaEntry>),
    /// The manager could not be queried.
    Unavailable(String),
    /// No manager configured for this kind; its torrents run unmanaged.
    NotConfigured,
}

/// Live view of the torrent client and media managers shared by every
/// job of a run.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub now: DateTime<Utc>,
    pub torrents: Vec<TorrentRecord>,
    pub series: CatalogState,
    pub movies: CatalogState,
}

impl PlanContext {
    /// Fetch the torrent list and both catalogs.
    ///
    /// Fails only when the torrent client is unreachable; a failing media
    /// manager is recorded on its catalog and surfaces on the jobs that need it.
    pub async fn load(
        client: &dyn TorrentClient,
        managers: &MediaManagers,
    ) -> Result<Self, ArchivalError> {
        let torrents = client.list_torrents().await.map_err(|e| {
            ArchivalError::SourceUnavailable(format!("{}: {}", client.name(), e))
        })?;

        let mut context = Self {
            now: Utc::now(),
            torrents,
            series: CatalogState::NotConfigured,
            movies: CatalogState::NotConfigured,
        };
        for kind in [MediaKind::Series, MediaKind::Movie] {
            let state = match managers.for_kind(kind) {
                Some(manager) => match manager.list_catalog().await {
                    Ok(entries) => CatalogState::Loaded(entries),
                    Err(e) => {
                        tracing::warn!("Failed to load {} catalog: {}", manager.name(), e);
                        CatalogState::Unavailable(format!("{}: {}", manager.name(), e))
                    }
                },
                None => CatalogState::NotConfigured,
            };
            match kind {
                MediaKind::Series => context.series = state,
                MediaKind::Movie => context.movies = state,
            }
        }
        Ok(context)
    }

    pub fn catalog(&self, kind: MediaKind) -> &CatalogState {
        match kind {
            MediaKind::Series => &self.series,
            MediaKind::Movie => &self.movies,
        }
    }
}

/// Final outcome of a job in a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Done,
    Degraded {
        mismatches: Vec<RestoreMismatch>,
    },
    Error {
        reason: FailureReason,
        resumable: bool,
        message: String,
    },
    Cancelled,
    Abandoned {
        reason: FailureReason,
    },
    /// Dry run: the job would be executed.
    Planned,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Done => "done",
            JobOutcome::Degraded { .. } => "degraded",
            JobOutcome::Error { .. } => "error",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Abandoned { .. } => "abandoned",
            JobOutcome::Planned => "planned",
        }
    }
}

/// Per-job line of a run report.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub primary: String,
    pub hash: String,
    pub siblings: Vec<String>,
    pub entries: Vec<String>,
    pub ambiguous_match: bool,
    pub total_bytes: u64,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn from_job(job: &ArchivalJob) -> Self {
        let outcome = match &job.state {
            JobState::Done { .. } => JobOutcome::Done,
            JobState::Degraded { mismatches, .. } => JobOutcome::Degraded {
                mismatches: mismatches.clone(),
            },
            JobState::Error { failure, .. } => JobOutcome::Error {
                reason: failure.reason,
                resumable: failure.resumable,
                message: failure.message.clone(),
            },
            JobState::Cancelled { .. } => JobOutcome::Cancelled,
            JobState::Abandoned { failure, .. } => JobOutcome::Abandoned {
                reason: failure.reason,
            },
            _ => JobOutcome::Planned,
        };
        Self {
            job_id: job.id.clone(),
            primary: job.primary.name.clone(),
            hash: job.primary.hash.clone(),
            siblings: job.siblings.iter().map(|t| t.name.clone()).collect(),
            entries: job.entries.iter().map(|e| e.entry.title.clone()).collect(),
            ambiguous_match: job.ambiguous_match,
            total_bytes: job.total_bytes(),
            outcome,
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    /// Torrents that passed candidate selection.
    pub candidates: usize,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn count(&self, outcome: &str) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.outcome.as_str() == outcome)
            .count()
    }

    /// True when no job ended in error.
    pub fn is_success(&self) -> bool {
        self.count("error") == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_reason_mapping() {
        let err = ArchivalError::MoveTimeout {
            hash: "abc".to_string(),
            elapsed: Duration::from_secs(5),
        };
        assert_eq!(err.reason(), FailureReason::MoveTimeout);
        assert_eq!(err.subjects(), vec!["abc"]);

        let err = ArchivalError::Snapshot(SnapshotError::PathUnreadable {
            operation: "stat",
            path: PathBuf::from("/x"),
            source: std::io::Error::other("denied"),
        });
        assert_eq!(err.reason(), FailureReason::PathUnreadable);

        let err = ArchivalError::NotifyFailed {
            entries: vec!["1".to_string(), "2".to_string()],
            message: "boom".to_string(),
        };
        assert_eq!(err.reason(), FailureReason::NotifyFailed);
        assert_eq!(err.subjects().len(), 2);

        let err = ArchivalError::IncompleteSeasons {
            entry_id: "7".to_string(),
            missing: vec![2, 3],
        };
        assert_eq!(err.reason(), FailureReason::IncompleteSeasons);
        assert!(err.reason().needs_review());
        assert_eq!(err.subjects(), vec!["7"]);
    }

    #[test]
    fn test_error_display() {
        let err = ArchivalError::RecheckInvalid {
            hash: "abc".to_string(),
            progress: 0.5,
        };
        assert_eq!(
            err.to_string(),
            "recheck of abc found invalid data (progress 0.5000)"
        );
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let json = serde_json::to_value(JobOutcome::Error {
            reason: FailureReason::RecheckInvalid,
            resumable: false,
            message: "bad".to_string(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "error");
        assert_eq!(json["reason"], "recheck_invalid");
        assert_eq!(json["resumable"], false);
    }
}
