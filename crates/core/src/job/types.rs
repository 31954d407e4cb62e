//! Archival job model.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::media_manager::{MediaEntry, MediaKind};
use crate::restore::{RestoreMismatch, RestoreReport};
use crate::snapshot::EntrySnapshot;
use crate::torrent_client::TorrentRecord;

/// Step of the workflow a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    SiblingExpansion,
    Snapshot,
    Move,
    Recheck,
    Restore,
    Notify,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::SiblingExpansion => "sibling_expansion",
            JobStage::Snapshot => "snapshot",
            JobStage::Move => "move",
            JobStage::Recheck => "recheck",
            JobStage::Restore => "restore",
            JobStage::Notify => "notify",
        }
    }

    /// State a failed job re-enters when resumed at this stage.
    pub fn resume_state(&self) -> JobState {
        match self {
            JobStage::SiblingExpansion => JobState::Selected,
            JobStage::Snapshot => JobState::SiblingExpanded,
            JobStage::Move => JobState::Moving,
            JobStage::Recheck => JobState::Rechecking,
            JobStage::Restore => JobState::Restoring,
            JobStage::Notify => JobState::Notifying,
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Torrent client or media manager unreachable.
    SourceUnavailable,
    PathUnreadable,
    PathUnwritable,
    /// The client reported the move as failed.
    MoveFailed,
    MoveTimeout,
    RecheckTimeout,
    /// Moved data failed verification.
    RecheckInvalid,
    /// The client reported the recheck itself as failed.
    RecheckFailed,
    /// One or more media manager notifications failed.
    NotifyFailed,
    /// No catalog entry could be tied to the primary torrent.
    Unmatched,
    /// Library seasons with files have no torrent in the job.
    IncompleteSeasons,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::SourceUnavailable => "source_unavailable",
            FailureReason::PathUnreadable => "path_unreadable",
            FailureReason::PathUnwritable => "path_unwritable",
            FailureReason::MoveFailed => "move_failed",
            FailureReason::MoveTimeout => "move_timeout",
            FailureReason::RecheckTimeout => "recheck_timeout",
            FailureReason::RecheckInvalid => "recheck_invalid",
            FailureReason::RecheckFailed => "recheck_failed",
            FailureReason::NotifyFailed => "notify_failed",
            FailureReason::Unmatched => "unmatched",
            FailureReason::IncompleteSeasons => "incomplete_seasons",
            FailureReason::Internal => "internal",
        }
    }

    /// Failures that need a human before anything else happens.
    pub fn needs_review(&self) -> bool {
        matches!(
            self,
            FailureReason::RecheckInvalid
                | FailureReason::Unmatched
                | FailureReason::IncompleteSeasons
        )
    }
}

/// Persisted description of a job failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub stage: JobStage,
    pub message: String,
    /// Whether the runner may resume the job on its own.
    pub resumable: bool,
    /// Torrents or entries the failure applies to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
}

/// Workflow state of a job.
///
/// ```text
/// selected -> sibling_expanded -> snapshotted -> moving -> rechecking
///          -> restoring -> notifying -> done | degraded
///
/// any non-terminal state -> error
/// selected | sibling_expanded -> cancelled
/// error -> abandoned
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    /// Candidate picked, siblings not yet resolved.
    Selected,
    /// Torrent set and media entries resolved.
    SiblingExpanded,
    /// Layout of every entry root captured.
    Snapshotted,
    /// Storage moves issued and being awaited.
    Moving,
    /// Rechecks issued and being awaited.
    Rechecking,
    /// Rebuilding entry layouts at the destination.
    Restoring,
    /// Telling media managers about the new roots.
    Notifying,
    Done {
        completed_at: DateTime<Utc>,
    },
    /// Finished, but some restored files disagree with the snapshot.
    Degraded {
        mismatches: Vec<RestoreMismatch>,
        completed_at: DateTime<Utc>,
    },
    Error {
        failure: JobFailure,
        failed_at: DateTime<Utc>,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
    },
    /// Given up on by the operator after a failure. Moved data stays put.
    Abandoned {
        failure: JobFailure,
        abandoned_at: DateTime<Utc>,
    },
}

impl JobState {
    /// Returns the state type as a string (for filtering).
    pub fn state_type(&self) -> &'static str {
        match self {
            JobState::Selected => "selected",
            JobState::SiblingExpanded => "sibling_expanded",
            JobState::Snapshotted => "snapshotted",
            JobState::Moving => "moving",
            JobState::Rechecking => "rechecking",
            JobState::Restoring => "restoring",
            JobState::Notifying => "notifying",
            JobState::Done { .. } => "done",
            JobState::Degraded { .. } => "degraded",
            JobState::Error { .. } => "error",
            JobState::Cancelled { .. } => "cancelled",
            JobState::Abandoned { .. } => "abandoned",
        }
    }

    /// No further transition happens without an explicit resume.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done { .. }
                | JobState::Degraded { .. }
                | JobState::Error { .. }
                | JobState::Cancelled { .. }
                | JobState::Abandoned { .. }
        )
    }

    /// The job no longer holds its torrents.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            JobState::Done { .. }
                | JobState::Degraded { .. }
                | JobState::Cancelled { .. }
                | JobState::Abandoned { .. }
        )
    }

    /// Cancellation is only possible before anything is mutated.
    pub fn can_cancel(&self) -> bool {
        matches!(self, JobState::Selected | JobState::SiblingExpanded)
    }

    /// A move has been issued, so the job must run to done or error.
    pub fn has_mutated(&self) -> bool {
        !matches!(
            self,
            JobState::Selected
                | JobState::SiblingExpanded
                | JobState::Snapshotted
                | JobState::Cancelled { .. }
        )
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            JobState::Error { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// A media entry touched by a job and where it will live afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub entry: MediaEntry,
    /// Entry root on the archival volume.
    pub new_root: PathBuf,
}

/// The unit of archival work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivalJob {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub kind: MediaKind,
    pub primary: TorrentRecord,
    #[serde(default)]
    pub siblings: Vec<TorrentRecord>,
    /// Media entries whose layout the job owns. Empty for unmanaged torrents.
    #[serde(default)]
    pub entries: Vec<JobEntry>,
    /// Sibling discovery was inconclusive; the job runs single-torrent.
    #[serde(default)]
    pub ambiguous_match: bool,
    /// Captured layouts, one per entry.
    #[serde(default)]
    pub snapshot: Option<Vec<EntrySnapshot>>,
    pub state: JobState,
    /// New save path for every torrent of the job.
    pub destination: PathBuf,
    /// Torrents whose move is confirmed.
    #[serde(default)]
    pub moved: BTreeSet<String>,
    /// Torrents whose recheck came back valid.
    #[serde(default)]
    pub rechecked: BTreeSet<String>,
    /// Entries whose layout was rebuilt.
    #[serde(default)]
    pub restored: BTreeSet<String>,
    /// Entries whose manager accepted the new root.
    #[serde(default)]
    pub notified: BTreeSet<String>,
    #[serde(default)]
    pub restore_reports: Vec<RestoreReport>,
    /// Resume attempts so far.
    #[serde(default)]
    pub retry_count: u32,
}

impl ArchivalJob {
    /// New job for a selected candidate.
    pub fn new(primary: TorrentRecord, kind: MediaKind, destination: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kind,
            primary,
            siblings: Vec::new(),
            entries: Vec::new(),
            ambiguous_match: false,
            snapshot: None,
            state: JobState::Selected,
            destination,
            moved: BTreeSet::new(),
            rechecked: BTreeSet::new(),
            restored: BTreeSet::new(),
            notified: BTreeSet::new(),
            restore_reports: Vec::new(),
            retry_count: 0,
        }
    }

    /// Primary followed by siblings.
    pub fn torrents(&self) -> impl Iterator<Item = &TorrentRecord> {
        std::iter::once(&self.primary).chain(self.siblings.iter())
    }

    pub fn torrent_hashes(&self) -> Vec<String> {
        self.torrents().map(|t| t.hash.clone()).collect()
    }

    pub fn contains_torrent(&self, hash: &str) -> bool {
        self.torrents().any(|t| t.hash == hash)
    }

    /// Filesystem roots the job reads or writes.
    pub fn claimed_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self
            .entries
            .iter()
            .flat_map(|e| [e.entry.root_path.clone(), e.new_root.clone()])
            .collect();
        roots.extend(self.torrents().map(|t| t.content_path.clone()));
        roots.extend(
            self.torrents()
                .map(|t| t.content_path_under(&self.destination)),
        );
        roots
    }

    pub fn total_bytes(&self) -> u64 {
        self.torrents().map(|t| t.size_bytes).sum()
    }

    /// Every mismatch across the restore reports.
    pub fn mismatches(&self) -> Vec<RestoreMismatch> {
        self.restore_reports
            .iter()
            .flat_map(|r| r.mismatches.iter().cloned())
            .collect()
    }

    pub fn entry(&self, entry_id: &str) -> Option<&JobEntry> {
        self.entries.iter().find(|e| e.entry.id == entry_id)
    }

    pub fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// How an event came out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Succeeded,
    Failed,
    Info,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Succeeded => "succeeded",
            EventOutcome::Failed => "failed",
            EventOutcome::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => EventOutcome::Succeeded,
            "failed" => EventOutcome::Failed,
            _ => EventOutcome::Info,
        }
    }
}

/// Entry of a job's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Store-assigned sequence number (0 until persisted).
    pub id: i64,
    pub job_id: String,
    pub at: DateTime<Utc>,
    /// Transition or step name, e.g. `moving` or `notify`.
    pub transition: String,
    pub outcome: EventOutcome,
    /// Torrent hash or entry id the event is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}

impl JobEvent {
    pub fn new(
        job_id: impl Into<String>,
        transition: impl Into<String>,
        outcome: EventOutcome,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            job_id: job_id.into(),
            at: Utc::now(),
            transition: transition.into(),
            outcome,
            subject: None,
            message: message.into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_client::TorrentState;
    use std::path::Path;

    fn torrent(hash: &str) -> TorrentRecord {
        TorrentRecord {
            hash: hash.to_string(),
            name: format!("Show.S0{}", hash),
            category: Some("tv".to_string()),
            tags: vec![],
            save_path: PathBuf::from("/data/torrents/tv"),
            content_path: PathBuf::from(format!("/data/torrents/tv/Show.S0{}", hash)),
            size_bytes: 100,
            progress: 1.0,
            completed_at: Some(Utc::now()),
            state: TorrentState::Seeding,
            media_entry_id: None,
        }
    }

    #[test]
    fn test_state_type() {
        assert_eq!(JobState::Selected.state_type(), "selected");
        assert_eq!(JobState::SiblingExpanded.state_type(), "sibling_expanded");
        assert_eq!(
            JobState::Done {
                completed_at: Utc::now()
            }
            .state_type(),
            "done"
        );
    }

    #[test]
    fn test_cancel_only_before_mutation() {
        assert!(JobState::Selected.can_cancel());
        assert!(JobState::SiblingExpanded.can_cancel());
        assert!(!JobState::Snapshotted.can_cancel());
        assert!(!JobState::Moving.can_cancel());
        assert!(JobState::Moving.has_mutated());
        assert!(!JobState::Snapshotted.has_mutated());
    }

    #[test]
    fn test_terminal_and_closed() {
        let error = JobState::Error {
            failure: JobFailure {
                reason: FailureReason::MoveTimeout,
                stage: JobStage::Move,
                message: "timed out".to_string(),
                resumable: true,
                subjects: vec![],
            },
            failed_at: Utc::now(),
        };
        assert!(error.is_terminal());
        assert!(!error.is_closed());
        assert_eq!(error.failure().unwrap().stage, JobStage::Move);
        assert!(!JobState::Rechecking.is_terminal());

        let abandoned = JobState::Abandoned {
            failure: error.failure().unwrap().clone(),
            abandoned_at: Utc::now(),
        };
        assert_eq!(abandoned.state_type(), "abandoned");
        assert!(abandoned.is_terminal());
        assert!(abandoned.is_closed());
        assert!(abandoned.failure().is_none());
    }

    #[test]
    fn test_review_reasons_are_not_retried() {
        assert!(FailureReason::RecheckInvalid.needs_review());
        assert!(FailureReason::Unmatched.needs_review());
        assert!(FailureReason::IncompleteSeasons.needs_review());
        assert!(!FailureReason::MoveFailed.needs_review());
        assert_eq!(FailureReason::IncompleteSeasons.as_str(), "incomplete_seasons");
    }

    #[test]
    fn test_state_serialization_is_tagged() {
        let json = serde_json::to_string(&JobState::Moving).unwrap();
        assert_eq!(json, r#"{"type":"moving"}"#);
        let parsed: JobState = serde_json::from_str(r#"{"type":"restoring"}"#).unwrap();
        assert_eq!(parsed, JobState::Restoring);
    }

    #[test]
    fn test_resume_state_per_stage() {
        assert_eq!(JobStage::Move.resume_state(), JobState::Moving);
        assert_eq!(JobStage::Snapshot.resume_state(), JobState::SiblingExpanded);
        assert_eq!(JobStage::Notify.resume_state(), JobState::Notifying);
    }

    #[test]
    fn test_job_torrents_and_roots() {
        let mut job = ArchivalJob::new(
            torrent("1"),
            MediaKind::Series,
            PathBuf::from("/archive/torrents/tv"),
        );
        job.siblings.push(torrent("2"));
        job.entries.push(JobEntry {
            entry: MediaEntry::new("9", MediaKind::Series, "Show", "/data/media/tv/Show"),
            new_root: PathBuf::from("/archive/media/tv/Show"),
        });

        assert_eq!(job.torrent_hashes(), vec!["1", "2"]);
        assert!(job.contains_torrent("2"));
        assert_eq!(job.total_bytes(), 200);

        let roots = job.claimed_roots();
        assert!(roots.contains(&PathBuf::from("/data/media/tv/Show")));
        assert!(roots.contains(&PathBuf::from("/archive/torrents/tv/Show.S02")));
        assert!(roots.iter().any(|r| r == Path::new("/data/torrents/tv/Show.S01")));
        assert!(job.entry("9").is_some());
    }
}
