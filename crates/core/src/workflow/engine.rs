//! Archival workflow state machine.
//!
//! Drives one job through its states:
//! - Expansion: resolve siblings and media entries from the catalog
//! - Snapshot: capture every entry root before anything moves
//! - Move / recheck: bounded polling on the torrent client, one torrent at a time
//! - Restore / notify: rebuild entry layouts at the destination and tell the managers
//!
//! Every confirmed side effect is checkpointed to the job store before the
//! next one starts, so a resumed job continues exactly where it stopped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MountpointConfig, WorkflowConfig};
use crate::job::{
    ArchivalJob, EventOutcome, JobEntry, JobEvent, JobFailure, JobStage, JobState, JobStore,
};
use crate::matcher::{parse_release, FuzzyMatcher, MatchOutcome};
use crate::media_manager::{
    EntryLayout, MediaEntry, MediaKind, MediaManager, MediaManagerError, MediaManagers,
};
use crate::metrics;
use crate::restore::{RestoreSources, StructureRestorer};
use crate::snapshot::{self, TorrentContent};
use crate::torrent_client::{
    MoveHandle, MoveStatus, RecheckStatus, TorrentClient, TorrentRecord, TorrentState,
};

use super::poll::{BoundedPoll, PollError};
use super::selector::CandidateSelector;
use super::types::{ArchivalError, CatalogState, PlanContext};

/// Stage a job in `state` is working on. `None` for terminal states.
fn stage_of(state: &JobState) -> Option<JobStage> {
    match state {
        JobState::Selected => Some(JobStage::SiblingExpansion),
        JobState::SiblingExpanded => Some(JobStage::Snapshot),
        JobState::Snapshotted | JobState::Moving => Some(JobStage::Move),
        JobState::Rechecking => Some(JobStage::Recheck),
        JobState::Restoring => Some(JobStage::Restore),
        JobState::Notifying => Some(JobStage::Notify),
        _ => None,
    }
}

fn manager_error(manager: &dyn MediaManager, err: MediaManagerError) -> ArchivalError {
    if err.is_unavailable() {
        ArchivalError::SourceUnavailable(format!("{}: {}", manager.name(), err))
    } else {
        ArchivalError::Internal(format!("{}: {}", manager.name(), err))
    }
}

/// Catalog entry the torrent client maps `torrent` to.
fn mapped_entry<'a>(torrent: &TorrentRecord, catalog: &'a [MediaEntry]) -> Option<&'a MediaEntry> {
    let id = torrent.media_entry_id.as_deref()?;
    catalog.iter().find(|e| e.id == id)
}

/// Every season the manager has files for must come from a torrent of the
/// job, or its files would be restored as full copies. Torrents without a
/// season marker are treated as packs covering any season.
fn check_seasons(entry: &MediaEntry, covered: &[Option<u32>]) -> Result<(), ArchivalError> {
    if entry.seasons.is_empty() || covered.iter().any(Option::is_none) {
        return Ok(());
    }
    let covered: HashSet<u32> = covered.iter().flatten().copied().collect();
    let missing: Vec<u32> = entry
        .seasons
        .iter()
        .copied()
        .filter(|s| !covered.contains(s))
        .collect();
    if missing.is_empty() {
        debug!("All {} season(s) of {} are covered", entry.seasons.len(), entry.title);
        return Ok(());
    }
    Err(ArchivalError::IncompleteSeasons {
        entry_id: entry.id.clone(),
        missing,
    })
}

/// Sequences the archival of one job at a time.
pub struct ArchivalWorkflow {
    selector: CandidateSelector,
    matcher: FuzzyMatcher,
    restorer: StructureRestorer,
    mountpoints: MountpointConfig,
    settings: WorkflowConfig,
    client: Arc<dyn TorrentClient>,
    managers: MediaManagers,
    store: Arc<dyn JobStore>,
}

impl ArchivalWorkflow {
    pub fn new(
        config: &Config,
        client: Arc<dyn TorrentClient>,
        managers: MediaManagers,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            selector: CandidateSelector::new(&config.selection, &config.mountpoints),
            matcher: FuzzyMatcher::new(&config.matcher),
            restorer: StructureRestorer::new(),
            mountpoints: config.mountpoints.clone(),
            settings: config.workflow.clone(),
            client,
            managers,
            store,
        }
    }

    pub fn with_matcher(mut self, matcher: FuzzyMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_restorer(mut self, restorer: StructureRestorer) -> Self {
        self.restorer = restorer;
        self
    }

    pub fn selector(&self) -> &CandidateSelector {
        &self.selector
    }

    pub fn settings(&self) -> &WorkflowConfig {
        &self.settings
    }

    pub fn client(&self) -> &Arc<dyn TorrentClient> {
        &self.client
    }

    pub fn managers(&self) -> &MediaManagers {
        &self.managers
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// New job for a candidate. Nothing is persisted.
    pub fn select(&self, candidate: &TorrentRecord) -> ArchivalJob {
        let kind = self.selector.classify(candidate);
        let destination = self
            .mountpoints
            .torrents_dir(candidate.category.as_deref());
        ArchivalJob::new(candidate.clone(), kind, destination)
    }

    /// Resolve the job's media entries and sibling torrents
    /// (`selected -> sibling_expanded`). Nothing is persisted.
    ///
    /// Torrents in `reserved` or held by another open job are never taken
    /// as siblings. When the title match is ambiguous or empty the client's
    /// entry mapping decides; without one the job is refused before
    /// anything moves. A series entry whose library has seasons with files
    /// that no torrent of the job covers is refused as well.
    pub fn expand(
        &self,
        job: &mut ArchivalJob,
        ctx: &PlanContext,
        reserved: &HashSet<String>,
    ) -> Result<(), ArchivalError> {
        job.siblings.clear();
        job.entries.clear();
        job.ambiguous_match = false;

        let catalog = match ctx.catalog(job.kind) {
            CatalogState::Loaded(entries) => entries.as_slice(),
            CatalogState::Unavailable(message) => {
                return Err(ArchivalError::SourceUnavailable(message.clone()))
            }
            CatalogState::NotConfigured => {
                warn!(
                    "No {} manager configured, {} will be archived unmanaged",
                    job.kind.as_str(),
                    job.primary.name
                );
                job.set_state(JobState::SiblingExpanded);
                return Ok(());
            }
        };

        let matched_ids: Vec<String> = match self.matcher.match_title(&job.primary.name, catalog)
        {
            MatchOutcome::Matches(matched) => {
                if let Some(mapped) = job.primary.media_entry_id.as_deref() {
                    if mapped != matched[0].entry.id {
                        warn!(
                            "Client maps {} to entry {} but title matches entry {}",
                            job.primary.name, mapped, matched[0].entry.id
                        );
                    }
                }
                matched.into_iter().map(|s| s.entry.id).collect()
            }
            MatchOutcome::Ambiguous { top } => {
                metrics::AMBIGUOUS_MATCHES.inc();
                job.ambiguous_match = true;
                let candidates: Vec<&str> = top.iter().map(|s| s.entry.title.as_str()).collect();
                let Some(mapped) = mapped_entry(&job.primary, catalog) else {
                    return Err(ArchivalError::Unmatched {
                        hash: job.primary.hash.clone(),
                        name: job.primary.name.clone(),
                        detail: format!(
                            "title is ambiguous between {:?} and the client maps no entry",
                            candidates
                        ),
                    });
                };
                warn!(
                    job_id = %job.id,
                    torrent = %job.primary.name,
                    ?candidates,
                    entry = %mapped.title,
                    "Ambiguous catalog match, using the client's entry mapping"
                );
                vec![mapped.id.clone()]
            }
            MatchOutcome::NoMatch => {
                let Some(mapped) = mapped_entry(&job.primary, catalog) else {
                    return Err(ArchivalError::Unmatched {
                        hash: job.primary.hash.clone(),
                        name: job.primary.name.clone(),
                        detail: "title matches no entry and the client maps none".to_string(),
                    });
                };
                info!(
                    "No title match for {}, using the client's mapping to {}",
                    job.primary.name, mapped.title
                );
                vec![mapped.id.clone()]
            }
        };

        let primary_entry = catalog
            .iter()
            .find(|e| e.id == matched_ids[0])
            .ok_or_else(|| {
                ArchivalError::Internal(format!("matched entry {} left the catalog", matched_ids[0]))
            })?;

        let mut entries: Vec<&MediaEntry> = vec![primary_entry];
        // Season of every job torrent, keyed by the entry it belongs to.
        let mut seasons: HashMap<&str, Vec<Option<u32>>> = HashMap::new();
        seasons
            .entry(primary_entry.id.as_str())
            .or_default()
            .push(parse_release(&job.primary.name).season);

        if job.kind == MediaKind::Series {
            for torrent in &ctx.torrents {
                if torrent.hash == job.primary.hash
                    || reserved.contains(&torrent.hash)
                    || !self.selector.is_movable(torrent)
                    || self.selector.classify(torrent) != MediaKind::Series
                {
                    continue;
                }
                let Some(entry) = self.resolve_entry(torrent, catalog) else {
                    continue;
                };
                if !matched_ids.contains(&entry.id) {
                    continue;
                }
                if self.held_elsewhere(&torrent.hash, &job.id)? {
                    debug!("Sibling {} is held by another job", torrent.name);
                    continue;
                }
                job.siblings.push(torrent.clone());
                seasons
                    .entry(entry.id.as_str())
                    .or_default()
                    .push(parse_release(&torrent.name).season);
                if !entries.iter().any(|e| e.id == entry.id) {
                    entries.push(entry);
                }
            }
            job.siblings
                .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.hash.cmp(&b.hash)));
            metrics::SIBLINGS_DISCOVERED.inc_by(job.siblings.len() as u64);
        }

        let category = job.primary.category.clone();
        for entry in entries {
            if entry.is_under(&self.mountpoints.destination_media) {
                info!("Entry {} is already archived, leaving it alone", entry.title);
                continue;
            }
            if job.kind == MediaKind::Series {
                let covered = seasons.get(entry.id.as_str()).map(Vec::as_slice);
                check_seasons(entry, covered.unwrap_or_default())?;
            }
            job.entries.push(JobEntry {
                entry: entry.clone(),
                new_root: self
                    .mountpoints
                    .relocate_media_root(&entry.root_path, category.as_deref()),
            });
        }

        info!(
            job_id = %job.id,
            torrent = %job.primary.name,
            siblings = job.siblings.len(),
            entries = job.entries.len(),
            "Expanded job"
        );
        job.set_state(JobState::SiblingExpanded);
        Ok(())
    }

    /// Entry a torrent belongs to: its own unambiguous title match, or the
    /// client's mapping when the title matches nothing.
    fn resolve_entry<'a>(
        &self,
        torrent: &TorrentRecord,
        catalog: &'a [MediaEntry],
    ) -> Option<&'a MediaEntry> {
        match self.matcher.match_title(&torrent.name, catalog) {
            MatchOutcome::Matches(matched) => {
                catalog.iter().find(|e| e.id == matched[0].entry.id)
            }
            MatchOutcome::Ambiguous { .. } => None,
            MatchOutcome::NoMatch => mapped_entry(torrent, catalog),
        }
    }

    fn held_elsewhere(&self, hash: &str, job_id: &str) -> Result<bool, ArchivalError> {
        Ok(self
            .store
            .find_open_for_torrent(hash)?
            .map(|open| open.id != job_id)
            .unwrap_or(false))
    }

    /// Persist a freshly selected job and expand it
    /// (`selected -> sibling_expanded`).
    ///
    /// Returns the job in `sibling_expanded`, or in `error` when the catalog
    /// it needs could not be read.
    pub fn plan(
        &self,
        mut job: ArchivalJob,
        ctx: &PlanContext,
        reserved: &HashSet<String>,
    ) -> Result<ArchivalJob, ArchivalError> {
        self.store.create(&job)?;
        self.store.append_event(
            &JobEvent::new(
                &job.id,
                "selected",
                EventOutcome::Succeeded,
                format!("selected {} ({} bytes)", job.primary.name, job.primary.size_bytes),
            )
            .with_subject(&job.primary.hash),
        )?;
        info!("Selected {} for archival as job {}", job.primary.name, job.id);

        self.expand_recorded(&mut job, ctx, reserved);
        Ok(job)
    }

    /// Expand a persisted job in `selected`, checkpointing either the
    /// expansion or the failure.
    pub fn expand_recorded(
        &self,
        job: &mut ArchivalJob,
        ctx: &PlanContext,
        reserved: &HashSet<String>,
    ) {
        let started = Instant::now();
        if let Err(err) = self.expand_stage(job, ctx, reserved) {
            self.fail(job, JobStage::SiblingExpansion, err);
        }
        metrics::STAGE_DURATION
            .with_label_values(&[JobStage::SiblingExpansion.as_str()])
            .observe(started.elapsed().as_secs_f64());
    }

    fn expansion_summary(job: &ArchivalJob) -> String {
        let mut message = format!(
            "{} sibling(s), {} entry root(s)",
            job.siblings.len(),
            job.entries.len()
        );
        if job.ambiguous_match {
            message.push_str(", ambiguous match");
        }
        message
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Drive `job` from its current state until it is done, degraded or failed.
    pub async fn execute(&self, mut job: ArchivalJob, ctx: &PlanContext) -> ArchivalJob {
        info!(
            "Executing job {} ({}) from {}",
            job.id,
            job.primary.name,
            job.state.state_type()
        );

        while let Some(stage) = stage_of(&job.state) {
            let started = Instant::now();
            let result = match stage {
                JobStage::SiblingExpansion => self.expand_stage(&mut job, ctx, &HashSet::new()),
                JobStage::Snapshot => self.snapshot_stage(&mut job).await,
                JobStage::Move => self.move_stage(&mut job).await,
                JobStage::Recheck => self.recheck_stage(&mut job).await,
                JobStage::Restore => self.restore_stage(&mut job).await,
                JobStage::Notify => self.notify_stage(&mut job).await,
            };
            metrics::STAGE_DURATION
                .with_label_values(&[stage.as_str()])
                .observe(started.elapsed().as_secs_f64());

            if let Err(err) = result {
                self.fail(&mut job, stage, err);
            }
        }

        job
    }

    fn expand_stage(
        &self,
        job: &mut ArchivalJob,
        ctx: &PlanContext,
        reserved: &HashSet<String>,
    ) -> Result<(), ArchivalError> {
        self.expand(job, ctx, reserved)?;
        let message = Self::expansion_summary(job);
        self.checkpoint(job, "sibling_expanded", None, message)
    }

    async fn layout(&self, kind: MediaKind, entry_id: &str) -> Result<EntryLayout, ArchivalError> {
        let manager = self.managers.for_kind(kind).ok_or_else(|| {
            ArchivalError::Internal(format!("no {} manager for entry {}", kind.as_str(), entry_id))
        })?;
        manager
            .get_entry_layout(entry_id)
            .await
            .map_err(|e| manager_error(manager.as_ref(), e))
    }

    async fn snapshot_stage(&self, job: &mut ArchivalJob) -> Result<(), ArchivalError> {
        let contents: Vec<TorrentContent> = job
            .torrents()
            .map(|t| TorrentContent {
                hash: t.hash.clone(),
                save_path: t.save_path.clone(),
                content_path: t.content_path.clone(),
            })
            .collect();
        let kind = job.kind;
        let category = job.primary.category.clone();

        let mut snapshots = Vec::with_capacity(job.entries.len());
        for job_entry in job.entries.iter_mut() {
            let layout = self.layout(kind, &job_entry.entry.id).await?;
            if layout.root != job_entry.entry.root_path {
                warn!(
                    "Entry {} moved from {} to {} since the catalog was read",
                    job_entry.entry.title,
                    job_entry.entry.root_path.display(),
                    layout.root.display()
                );
                job_entry.entry.root_path = layout.root.clone();
                job_entry.new_root = self
                    .mountpoints
                    .relocate_media_root(&layout.root, category.as_deref());
            }

            let captured = snapshot::capture(&job_entry.entry.id, &layout.root, &contents).await?;
            let missing = layout.missing_from(&captured.nodes);
            if !missing.is_empty() {
                warn!(
                    entry = %job_entry.entry.title,
                    missing = missing.len(),
                    "Files tracked by the media manager are missing on disk"
                );
            }
            snapshots.push(captured);
        }

        let files: usize = snapshots.iter().map(|s| s.files().count()).sum();
        let message = format!("captured {} root(s), {} file(s)", snapshots.len(), files);
        job.snapshot = Some(snapshots);
        job.set_state(JobState::Snapshotted);
        self.checkpoint(job, "snapshotted", None, message)
    }

    async fn move_stage(&self, job: &mut ArchivalJob) -> Result<(), ArchivalError> {
        if job.state == JobState::Snapshotted {
            job.set_state(JobState::Moving);
            let message = format!(
                "moving {} torrent(s) to {}",
                job.siblings.len() + 1,
                job.destination.display()
            );
            self.checkpoint(job, "moving", None, message)?;
        }

        let poll = BoundedPoll::new(&self.settings.move_poll);
        let pending: Vec<TorrentRecord> = job
            .torrents()
            .filter(|t| !job.moved.contains(&t.hash))
            .cloned()
            .collect();
        for torrent in pending {
            self.move_torrent(&torrent, &job.destination, &poll).await?;
            job.moved.insert(torrent.hash.clone());
            metrics::BYTES_MOVED.inc_by(torrent.size_bytes);
            let message = format!("moved {} to {}", torrent.name, job.destination.display());
            self.checkpoint(job, "move", Some(&torrent.hash), message)?;
        }

        job.set_state(JobState::Rechecking);
        self.checkpoint(job, "rechecking", None, "all torrents moved")
    }

    async fn move_torrent(
        &self,
        torrent: &TorrentRecord,
        destination: &Path,
        poll: &BoundedPoll,
    ) -> Result<(), ArchivalError> {
        let hash = torrent.hash.as_str();
        let move_failed =
            |hash: String, message: String| ArchivalError::MoveFailed { hash, message };

        let current = self
            .client
            .get_torrent(hash)
            .await
            .map_err(|e| ArchivalError::from_client(hash, e, move_failed))?;

        let handle = if current.state == TorrentState::Moving {
            info!("Move of {} already in progress, waiting for it", torrent.name);
            MoveHandle::new(hash, destination)
        } else if current.save_path == destination {
            info!("{} is already at {}", torrent.name, destination.display());
            return Ok(());
        } else {
            info!("Moving {} to {}", torrent.name, destination.display());
            self.client
                .move_storage(hash, destination)
                .await
                .map_err(|e| ArchivalError::from_client(hash, e, move_failed))?
        };

        let client = &self.client;
        let handle = &handle;
        poll.run(|| async move {
            match client.poll_move_status(handle).await {
                Ok(MoveStatus::Pending) => Ok(None),
                Ok(MoveStatus::Done) => Ok(Some(())),
                Ok(MoveStatus::Failed(message)) => Err(ArchivalError::MoveFailed {
                    hash: hash.to_string(),
                    message,
                }),
                Err(e) => Err(ArchivalError::from_client(hash, e, move_failed)),
            }
        })
        .await
        .map_err(|e| match e {
            PollError::TimedOut { elapsed, .. } => ArchivalError::MoveTimeout {
                hash: hash.to_string(),
                elapsed,
            },
            PollError::Failed(err) => err,
        })
    }

    async fn recheck_stage(&self, job: &mut ArchivalJob) -> Result<(), ArchivalError> {
        let poll = BoundedPoll::new(&self.settings.recheck_poll);
        let pending: Vec<TorrentRecord> = job
            .torrents()
            .filter(|t| !job.rechecked.contains(&t.hash))
            .cloned()
            .collect();
        for torrent in pending {
            self.recheck_torrent(&torrent, &poll).await?;
            job.rechecked.insert(torrent.hash.clone());
            let message = format!("{} verified", torrent.name);
            self.checkpoint(job, "recheck", Some(&torrent.hash), message)?;
        }

        job.set_state(JobState::Restoring);
        self.checkpoint(job, "restoring", None, "all torrents verified")
    }

    async fn recheck_torrent(
        &self,
        torrent: &TorrentRecord,
        poll: &BoundedPoll,
    ) -> Result<(), ArchivalError> {
        let hash = torrent.hash.as_str();
        let recheck_failed =
            |hash: String, message: String| ArchivalError::RecheckFailed { hash, message };

        info!("Rechecking {}", torrent.name);
        let handle = self
            .client
            .recheck(hash)
            .await
            .map_err(|e| ArchivalError::from_client(hash, e, recheck_failed))?;

        let client = &self.client;
        let handle = &handle;
        poll.run(|| async move {
            match client.poll_recheck_status(handle).await {
                Ok(RecheckStatus::Pending) => Ok(None),
                Ok(RecheckStatus::Valid) => Ok(Some(())),
                Ok(RecheckStatus::Invalid { progress }) => Err(ArchivalError::RecheckInvalid {
                    hash: hash.to_string(),
                    progress,
                }),
                Ok(RecheckStatus::Failed(message)) => Err(ArchivalError::RecheckFailed {
                    hash: hash.to_string(),
                    message,
                }),
                Err(e) => Err(ArchivalError::from_client(hash, e, recheck_failed)),
            }
        })
        .await
        .map_err(|e| match e {
            PollError::TimedOut { elapsed, .. } => ArchivalError::RecheckTimeout {
                hash: hash.to_string(),
                elapsed,
            },
            PollError::Failed(err) => err,
        })
    }

    async fn restore_stage(&self, job: &mut ArchivalJob) -> Result<(), ArchivalError> {
        let snapshots = job
            .snapshot
            .clone()
            .ok_or_else(|| ArchivalError::Internal(format!("job {} has no snapshot", job.id)))?;

        let torrent_save_paths: HashMap<String, PathBuf> = job
            .torrents()
            .map(|t| (t.hash.clone(), job.destination.clone()))
            .collect();
        let content_rewrites: Vec<(PathBuf, PathBuf)> = job
            .torrents()
            .map(|t| (t.content_path.clone(), t.content_path_under(&job.destination)))
            .collect();

        let pending: Vec<JobEntry> = job
            .entries
            .iter()
            .filter(|e| !job.restored.contains(&e.entry.id))
            .cloned()
            .collect();
        for job_entry in pending {
            let snapshot = snapshots
                .iter()
                .find(|s| s.entry_id == job_entry.entry.id)
                .ok_or_else(|| {
                    ArchivalError::Internal(format!(
                        "no snapshot for entry {}",
                        job_entry.entry.id
                    ))
                })?;

            let mut path_rewrites = content_rewrites.clone();
            path_rewrites.push((snapshot.root.clone(), job_entry.new_root.clone()));
            let sources = RestoreSources {
                torrent_save_paths: torrent_save_paths.clone(),
                original_root: snapshot.root.clone(),
                path_rewrites,
            };

            let report = self
                .restorer
                .restore(snapshot, &job_entry.new_root, &sources)
                .await?;
            if !report.is_clean() {
                warn!(
                    "Restored {} with {} mismatch(es)",
                    job_entry.entry.title,
                    report.mismatches.len()
                );
            }

            let message = format!(
                "restored {} at {} ({} file(s), {} mismatch(es))",
                job_entry.entry.title,
                job_entry.new_root.display(),
                report.files.len(),
                report.mismatches.len()
            );
            job.restore_reports.retain(|r| r.entry_id != report.entry_id);
            job.restore_reports.push(report);
            job.restored.insert(job_entry.entry.id.clone());
            self.checkpoint(job, "restore", Some(&job_entry.entry.id), message)?;
        }

        job.set_state(JobState::Notifying);
        self.checkpoint(job, "notifying", None, "all entries restored")
    }

    async fn notify_stage(&self, job: &mut ArchivalJob) -> Result<(), ArchivalError> {
        let pending: Vec<JobEntry> = job
            .entries
            .iter()
            .filter(|e| !job.notified.contains(&e.entry.id))
            .cloned()
            .collect();

        if !pending.is_empty() {
            let manager = self.managers.for_kind(job.kind).cloned().ok_or_else(|| {
                ArchivalError::NotifyFailed {
                    entries: pending.iter().map(|e| e.entry.id.clone()).collect(),
                    message: format!("no {} manager configured", job.kind.as_str()),
                }
            })?;

            let mut failed = Vec::new();
            let mut reasons = Vec::new();
            for job_entry in pending {
                let entry_id = job_entry.entry.id.clone();
                match manager
                    .notify_path_changed(&entry_id, &job_entry.new_root)
                    .await
                {
                    Ok(outcome) => {
                        job.notified.insert(entry_id.clone());
                        let message = format!(
                            "{} now at {} ({:?})",
                            job_entry.entry.title,
                            job_entry.new_root.display(),
                            outcome
                        );
                        self.checkpoint(job, "notify", Some(&entry_id), message)?;
                    }
                    Err(e) => {
                        warn!(
                            "{} rejected new path for {}: {}",
                            manager.name(),
                            job_entry.entry.title,
                            e
                        );
                        self.record(
                            JobEvent::new(&job.id, "notify", EventOutcome::Failed, e.to_string())
                                .with_subject(&entry_id),
                        );
                        reasons.push(format!("{}: {}", entry_id, e));
                        failed.push(entry_id);
                    }
                }
            }

            if !failed.is_empty() {
                return Err(ArchivalError::NotifyFailed {
                    entries: failed,
                    message: reasons.join("; "),
                });
            }
        }

        let mismatches = job.mismatches();
        let completed_at = Utc::now();
        if mismatches.is_empty() {
            job.set_state(JobState::Done { completed_at });
            info!("Job {} done ({})", job.id, job.primary.name);
            self.checkpoint(job, "done", None, "archival complete")?;
        } else {
            warn!(
                "Job {} degraded: {} restored file(s) differ from the snapshot",
                job.id,
                mismatches.len()
            );
            let message = format!("{} mismatch(es)", mismatches.len());
            job.set_state(JobState::Degraded {
                mismatches,
                completed_at,
            });
            self.checkpoint(job, "degraded", None, message)?;
        }
        metrics::JOBS_TOTAL
            .with_label_values(&[job.state.state_type()])
            .inc();
        Ok(())
    }

    // =========================================================================
    // Checkpoints and failures
    // =========================================================================

    /// Persist the job and append a success event.
    fn checkpoint(
        &self,
        job: &mut ArchivalJob,
        transition: &str,
        subject: Option<&str>,
        message: impl Into<String>,
    ) -> Result<(), ArchivalError> {
        job.updated_at = Utc::now();
        self.store.save(job)?;
        let mut event = JobEvent::new(&job.id, transition, EventOutcome::Succeeded, message);
        if let Some(subject) = subject {
            event = event.with_subject(subject);
        }
        self.store.append_event(&event)?;
        Ok(())
    }

    /// Append an event, logging instead of failing when the store refuses it.
    fn record(&self, event: JobEvent) {
        if let Err(e) = self.store.append_event(&event) {
            error!("Failed to record event for job {}: {}", event.job_id, e);
        }
    }

    /// Error state for `err` raised at `stage`, without persisting it.
    pub fn failure_state(
        &self,
        job: &ArchivalJob,
        stage: JobStage,
        err: &ArchivalError,
    ) -> JobState {
        let reason = err.reason();
        JobState::Error {
            failure: JobFailure {
                reason,
                stage,
                message: err.to_string(),
                resumable: !reason.needs_review() && job.retry_count < self.settings.max_retries,
                subjects: err.subjects(),
            },
            failed_at: Utc::now(),
        }
    }

    fn fail(&self, job: &mut ArchivalJob, stage: JobStage, err: ArchivalError) {
        let state = self.failure_state(job, stage, &err);
        let resumable = state.failure().map(|f| f.resumable).unwrap_or(false);
        error!(
            "Job {} failed at {}: {} (resumable: {})",
            job.id,
            stage.as_str(),
            err,
            resumable
        );
        job.set_state(state);
        metrics::JOBS_TOTAL.with_label_values(&["error"]).inc();

        if let Err(e) = self.store.save(job) {
            error!("Failed to persist error state of job {}: {}", job.id, e);
        }
        let mut event =
            JobEvent::new(&job.id, stage.as_str(), EventOutcome::Failed, err.to_string());
        if let Some(subject) = err.subjects().first() {
            event = event.with_subject(subject);
        }
        self.record(event);
    }

    // =========================================================================
    // Operator actions
    // =========================================================================

    fn load(&self, job_id: &str) -> Result<ArchivalJob, ArchivalError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| ArchivalError::JobNotFound(job_id.to_string()))
    }

    /// Cancel a job that has not mutated anything yet.
    pub fn cancel(&self, job_id: &str) -> Result<ArchivalJob, ArchivalError> {
        let mut job = self.load(job_id)?;
        if !job.state.can_cancel() {
            return Err(ArchivalError::InvalidState {
                job_id: job.id.clone(),
                current_state: job.state.state_type().to_string(),
                operation: "cancel".to_string(),
            });
        }

        job.set_state(JobState::Cancelled {
            cancelled_at: Utc::now(),
        });
        self.checkpoint(&mut job, "cancelled", None, "cancelled by operator")?;
        metrics::JOBS_TOTAL.with_label_values(&["cancelled"]).inc();
        info!("Cancelled job {} ({})", job.id, job.primary.name);
        Ok(job)
    }

    /// Close a failed job for good so its torrents are released. Nothing on
    /// disk is touched: moved data stays on the archival volume.
    pub fn abandon(&self, job_id: &str) -> Result<ArchivalJob, ArchivalError> {
        let mut job = self.load(job_id)?;
        let Some(failure) = job.state.failure().cloned() else {
            return Err(ArchivalError::InvalidState {
                job_id: job.id.clone(),
                current_state: job.state.state_type().to_string(),
                operation: "abandon".to_string(),
            });
        };
        if !job.moved.is_empty() {
            warn!(
                "Abandoning job {} with {} torrent(s) already on the archival volume",
                job.id,
                job.moved.len()
            );
        }

        let message = format!(
            "abandoned by operator after {} at {} ({} retries)",
            failure.reason.as_str(),
            failure.stage.as_str(),
            job.retry_count
        );
        job.set_state(JobState::Abandoned {
            failure,
            abandoned_at: Utc::now(),
        });
        self.checkpoint(&mut job, "abandoned", None, message)?;
        metrics::JOBS_TOTAL.with_label_values(&["abandoned"]).inc();
        info!("Abandoned job {} ({})", job.id, job.primary.name);
        Ok(job)
    }

    /// Put a failed job back into the state of the stage that failed.
    pub fn prepare_resume(&self, job: &mut ArchivalJob) -> Result<(), ArchivalError> {
        let stage = match &job.state {
            JobState::Error { failure, .. } => failure.stage,
            other => {
                return Err(ArchivalError::InvalidState {
                    job_id: job.id.clone(),
                    current_state: other.state_type().to_string(),
                    operation: "resume".to_string(),
                })
            }
        };

        job.retry_count += 1;
        job.set_state(stage.resume_state());
        let message = format!("attempt {} from {}", job.retry_count, stage.as_str());
        info!("Resuming job {}: {}", job.id, message);
        self.checkpoint(job, "resumed", None, message)
    }

    /// Load a job for an operator-requested resume.
    pub fn load_for_resume(&self, job_id: &str) -> Result<ArchivalJob, ArchivalError> {
        let mut job = self.load(job_id)?;
        if job.state.is_closed() {
            return Err(ArchivalError::InvalidState {
                job_id: job.id.clone(),
                current_state: job.state.state_type().to_string(),
                operation: "resume".to_string(),
            });
        }
        if matches!(job.state, JobState::Error { .. }) {
            self.prepare_resume(&mut job)?;
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_of_states() {
        assert_eq!(stage_of(&JobState::Selected), Some(JobStage::SiblingExpansion));
        assert_eq!(stage_of(&JobState::Snapshotted), Some(JobStage::Move));
        assert_eq!(stage_of(&JobState::Moving), Some(JobStage::Move));
        assert_eq!(stage_of(&JobState::Notifying), Some(JobStage::Notify));
        assert_eq!(
            stage_of(&JobState::Done {
                completed_at: Utc::now()
            }),
            None
        );
    }

    #[test]
    fn test_every_resume_state_has_a_stage() {
        for stage in [
            JobStage::SiblingExpansion,
            JobStage::Snapshot,
            JobStage::Move,
            JobStage::Recheck,
            JobStage::Restore,
            JobStage::Notify,
        ] {
            assert_eq!(stage_of(&stage.resume_state()), Some(stage));
        }
    }

    #[test]
    fn test_season_coverage() {
        let entry = MediaEntry::new("7", MediaKind::Series, "Show", "/data/media/tv/Show")
            .with_seasons(vec![1, 2, 3]);

        assert!(check_seasons(&entry, &[Some(1), Some(2), Some(3)]).is_ok());
        // A torrent without a season marker is a complete pack.
        assert!(check_seasons(&entry, &[Some(1), None]).is_ok());

        match check_seasons(&entry, &[Some(2)]) {
            Err(ArchivalError::IncompleteSeasons { entry_id, missing }) => {
                assert_eq!(entry_id, "7");
                assert_eq!(missing, vec![1, 3]);
            }
            other => panic!("expected incomplete seasons, got {:?}", other),
        }

        let unknown = MediaEntry::new("8", MediaKind::Series, "Other", "/data/media/tv/Other");
        assert!(check_seasons(&unknown, &[Some(4)]).is_ok());
    }
}
