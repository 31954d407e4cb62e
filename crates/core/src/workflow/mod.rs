//! Archival workflow: candidate selection, the per-job state machine and
//! the runner that schedules jobs.

mod claims;
mod engine;
mod poll;
mod runner;
mod selector;
mod types;

pub use claims::RootClaims;
pub use engine::ArchivalWorkflow;
pub use poll::{BoundedPoll, PollError};
pub use runner::ArchivalRunner;
pub use selector::CandidateSelector;
pub use types::{
    ArchivalError, CatalogState, JobOutcome, JobReport, PlanContext, RunOptions, RunReport,
};
