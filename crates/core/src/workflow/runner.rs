//! Archival runner.
//!
//! One run:
//! - resumes jobs left in flight or failed with retries left
//! - selects candidates and plans new jobs (up to `max_jobs_per_run`)
//! - executes jobs concurrently when their roots are disjoint, serially otherwise

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::job::{ArchivalJob, JobEvent, JobFilter, JobStage, JobState};

use super::claims::RootClaims;
use super::engine::ArchivalWorkflow;
use super::types::{ArchivalError, JobReport, PlanContext, RunOptions, RunReport};

/// Runs the archival workflow over the whole torrent list.
pub struct ArchivalRunner {
    workflow: Arc<ArchivalWorkflow>,
}

impl ArchivalRunner {
    pub fn new(workflow: Arc<ArchivalWorkflow>) -> Self {
        Self { workflow }
    }

    pub fn workflow(&self) -> &ArchivalWorkflow {
        &self.workflow
    }

    /// Perform one archival run.
    ///
    /// Fails only when the torrent client or the job store is unusable;
    /// per-job failures are part of the report.
    pub async fn run_once(&self, options: RunOptions) -> Result<RunReport, ArchivalError> {
        let started_at = Utc::now();
        let ctx = PlanContext::load(self.workflow.client().as_ref(), self.workflow.managers())
            .await?;
        let candidates = self.workflow.selector().select(&ctx.torrents, ctx.now);
        info!(
            "Run started: {} torrent(s), {} candidate(s){}",
            ctx.torrents.len(),
            candidates.len(),
            if options.dry_run { " (dry run)" } else { "" }
        );

        let resumed = self.resumable_jobs(options)?;
        let mut reserved: HashSet<String> =
            resumed.iter().flat_map(|job| job.torrent_hashes()).collect();
        let mut queue = Vec::with_capacity(resumed.len());
        let mut reports = Vec::new();

        // Jobs that failed before expansion claim their siblings before any
        // new candidate is planned.
        for mut job in resumed {
            if job.state == JobState::Selected {
                if options.dry_run {
                    self.expand_dry(&mut job, &ctx, &reserved);
                } else {
                    self.workflow.expand_recorded(&mut job, &ctx, &reserved);
                }
                reserved.extend(job.torrent_hashes());
            }
            if job.state.is_terminal() {
                reports.push(JobReport::from_job(&job));
            } else {
                queue.push(job);
            }
        }

        let limit = self.workflow.settings().max_jobs_per_run;
        let mut planned = 0;
        for candidate in &candidates {
            if planned >= limit {
                break;
            }
            if reserved.contains(&candidate.hash) {
                continue;
            }
            if let Some(open) = self
                .workflow
                .store()
                .find_open_for_torrent(&candidate.hash)?
            {
                debug!("{} is held by job {}", candidate.name, open.id);
                continue;
            }

            let mut job = self.workflow.select(candidate);
            if options.dry_run {
                self.expand_dry(&mut job, &ctx, &reserved);
                reserved.extend(job.torrent_hashes());
                reports.push(JobReport::from_job(&job));
            } else {
                let job = self.workflow.plan(job, &ctx, &reserved)?;
                reserved.extend(job.torrent_hashes());
                if job.state.is_terminal() {
                    reports.push(JobReport::from_job(&job));
                } else {
                    queue.push(job);
                }
            }
            planned += 1;
        }

        if options.dry_run {
            reports.extend(queue.iter().map(JobReport::from_job));
        } else {
            reports.extend(self.dispatch(queue, &ctx).await);
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            candidates: candidates.len(),
            jobs: reports,
        };
        info!(
            "Run finished: {} done, {} degraded, {} error, {} planned",
            report.count("done"),
            report.count("degraded"),
            report.count("error"),
            report.count("planned")
        );
        Ok(report)
    }

    /// Expand without persisting, recording a failure on the job only.
    fn expand_dry(&self, job: &mut ArchivalJob, ctx: &PlanContext, reserved: &HashSet<String>) {
        if let Err(err) = self.workflow.expand(job, ctx, reserved) {
            warn!("Planning {} failed: {}", job.primary.name, err);
            let state = self
                .workflow
                .failure_state(job, JobStage::SiblingExpansion, &err);
            job.set_state(state);
        }
    }

    /// Jobs to pick up before planning new ones, oldest first: jobs
    /// interrupted mid-workflow, then failed jobs that may be retried.
    fn resumable_jobs(&self, options: RunOptions) -> Result<Vec<ArchivalJob>, ArchivalError> {
        let store = self.workflow.store();
        let max_retries = self.workflow.settings().max_retries;

        let mut jobs = store.list(&JobFilter::new().in_flight().with_limit(i64::MAX))?;
        for job in &jobs {
            info!(
                "Recovering job {} ({}) in state {}",
                job.id,
                job.primary.name,
                job.state.state_type()
            );
        }

        let failed = store.list(&JobFilter::new().with_state("error").with_limit(i64::MAX))?;
        for mut job in failed {
            let Some(failure) = job.state.failure() else {
                continue;
            };
            if !failure.resumable || job.retry_count >= max_retries {
                continue;
            }
            if options.dry_run {
                let state = failure.stage.resume_state();
                job.set_state(state);
            } else {
                self.workflow.prepare_resume(&mut job)?;
            }
            jobs.push(job);
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Execute queued jobs, at most `max_concurrent_jobs` at once and never
    /// two with overlapping roots.
    async fn dispatch(&self, queue: Vec<ArchivalJob>, ctx: &PlanContext) -> Vec<JobReport> {
        let limit = self.workflow.settings().max_concurrent_jobs.max(1);
        let mut queue: VecDeque<ArchivalJob> = queue.into();
        let mut claims = RootClaims::new();
        let mut running = FuturesUnordered::new();
        let mut reports = Vec::new();

        loop {
            let mut index = 0;
            while running.len() < limit && index < queue.len() {
                let roots = queue[index].claimed_roots();
                if claims.try_claim(&queue[index].id, roots) {
                    if let Some(job) = queue.remove(index) {
                        running.push(self.workflow.execute(job, ctx));
                    }
                } else {
                    debug!("Job {} waits for an overlapping job", queue[index].id);
                    index += 1;
                }
            }

            match running.next().await {
                Some(job) => {
                    claims.release(&job.id);
                    reports.push(JobReport::from_job(&job));
                }
                None => break,
            }
        }

        reports
    }

    /// Resume one job on operator request, regardless of its retry budget.
    pub async fn resume(&self, job_id: &str) -> Result<JobReport, ArchivalError> {
        let ctx = PlanContext::load(self.workflow.client().as_ref(), self.workflow.managers())
            .await?;
        let job = self.workflow.load_for_resume(job_id)?;
        let job = self.workflow.execute(job, &ctx).await;
        Ok(JobReport::from_job(&job))
    }

    /// Cancel a job that has not started moving data.
    pub fn cancel(&self, job_id: &str) -> Result<JobReport, ArchivalError> {
        let job = self.workflow.cancel(job_id)?;
        Ok(JobReport::from_job(&job))
    }

    /// Give up on a failed job. With `purge` the job and its events are
    /// deleted instead of kept as history.
    pub fn abandon(&self, job_id: &str, purge: bool) -> Result<JobReport, ArchivalError> {
        let job = self.workflow.abandon(job_id)?;
        let report = JobReport::from_job(&job);
        if purge {
            self.workflow.store().delete(&job.id)?;
            info!("Deleted job {} and its events", job.id);
        }
        Ok(report)
    }

    /// Jobs matching `filter`, for listing.
    pub fn jobs(&self, filter: &JobFilter) -> Result<Vec<ArchivalJob>, ArchivalError> {
        Ok(self.workflow.store().list(filter)?)
    }

    /// A job with its event log.
    pub fn job(&self, job_id: &str) -> Result<(ArchivalJob, Vec<JobEvent>), ArchivalError> {
        let store = self.workflow.store();
        let job = store
            .get(job_id)?
            .ok_or_else(|| ArchivalError::JobNotFound(job_id.to_string()))?;
        let events = store.events(job_id)?;
        Ok((job, events))
    }
}
