//! Job storage trait and types.

use std::fmt;

use crate::job::{ArchivalJob, JobEvent};

/// Error type for job store operations.
#[derive(Debug)]
pub enum JobStoreError {
    /// Job not found.
    NotFound(String),
    /// Job already exists.
    AlreadyExists(String),
    /// Cannot perform operation due to current state.
    InvalidState {
        job_id: String,
        current_state: String,
        operation: String,
    },
    /// Database error.
    Database(String),
}

impl fmt::Display for JobStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStoreError::NotFound(id) => write!(f, "Job not found: {}", id),
            JobStoreError::AlreadyExists(id) => write!(f, "Job already exists: {}", id),
            JobStoreError::InvalidState {
                job_id,
                current_state,
                operation,
            } => write!(
                f,
                "Cannot {} job {}: current state is {}",
                operation, job_id, current_state
            ),
            JobStoreError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for JobStoreError {}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by state type.
    pub state: Option<String>,
    /// Only jobs that have not reached a terminal state.
    pub in_flight: bool,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl JobFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            state: None,
            in_flight: false,
            limit: 100,
            offset: 0,
        }
    }

    /// Filter by state type.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Only non-terminal jobs.
    pub fn in_flight(mut self) -> Self {
        self.in_flight = true;
        self
    }

    /// Set limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set offset.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Durable record of jobs and their event logs.
///
/// `save` replaces the whole job record atomically, so a crash between
/// two saves leaves the previous checkpoint intact.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn create(&self, job: &ArchivalJob) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    fn get(&self, id: &str) -> Result<Option<ArchivalJob>, JobStoreError>;

    /// List jobs matching the filter, oldest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<ArchivalJob>, JobStoreError>;

    /// The job still holding `hash` (primary or sibling), if any.
    ///
    /// Done, degraded, cancelled and abandoned jobs release their torrents;
    /// failed jobs keep them until resumed or abandoned.
    fn find_open_for_torrent(&self, hash: &str) -> Result<Option<ArchivalJob>, JobStoreError>;

    /// Replace the stored record of an existing job.
    fn save(&self, job: &ArchivalJob) -> Result<(), JobStoreError>;

    /// Append to the job's event log. Returns the assigned sequence number.
    fn append_event(&self, event: &JobEvent) -> Result<i64, JobStoreError>;

    /// Events of a job in the order they were appended.
    fn events(&self, job_id: &str) -> Result<Vec<JobEvent>, JobStoreError>;

    /// Permanently delete a job and its events.
    /// Returns the deleted job if found.
    fn delete(&self, id: &str) -> Result<ArchivalJob, JobStoreError>;
}
