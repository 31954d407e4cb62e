//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Archival jobs (outcomes, stage durations)
//! - Filesystem work (files restored by strategy, bytes moved)
//! - External services (torrent client, media managers)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Jobs
// =============================================================================

/// Jobs finished by outcome.
pub static JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cellar_jobs_total", "Archival jobs by outcome"),
        &["outcome"], // "done", "degraded", "error", "cancelled", "abandoned"
    )
    .unwrap()
});

/// Duration of each workflow stage in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "cellar_stage_duration_seconds",
            "Duration of archival workflow stages",
        )
        .buckets(vec![
            0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 21600.0,
        ]),
        &["stage"],
    )
    .unwrap()
});

/// Sibling torrents attached to jobs.
pub static SIBLINGS_DISCOVERED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "cellar_siblings_discovered_total",
        "Sibling torrents added to archival jobs",
    )
    .unwrap()
});

/// Fuzzy matches that were too close to call.
pub static AMBIGUOUS_MATCHES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "cellar_ambiguous_matches_total",
        "Sibling discoveries skipped due to ambiguous matches",
    )
    .unwrap()
});

// =============================================================================
// Filesystem
// =============================================================================

/// Files restored by strategy.
pub static FILES_RESTORED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cellar_files_restored_total", "Files restored by strategy"),
        &["strategy"], // "hardlinked", "copied", "already_present", "missing"
    )
    .unwrap()
});

/// Torrent bytes relocated.
pub static BYTES_MOVED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("cellar_bytes_moved_total", "Torrent bytes moved to archive").unwrap()
});

// =============================================================================
// External Services
// =============================================================================

/// External service requests by service and method.
pub static EXTERNAL_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cellar_external_requests_total",
            "Requests issued to external services",
        ),
        &["service", "method"],
    )
    .unwrap()
});

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Jobs
        Box::new(JOBS_TOTAL.clone()),
        Box::new(STAGE_DURATION.clone()),
        Box::new(SIBLINGS_DISCOVERED.clone()),
        Box::new(AMBIGUOUS_MATCHES.clone()),
        // Filesystem
        Box::new(FILES_RESTORED.clone()),
        Box::new(BYTES_MOVED.clone()),
        // External services
        Box::new(EXTERNAL_REQUESTS_TOTAL.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[test]
    fn test_all_metrics_register() {
        let registry = Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
        JOBS_TOTAL.with_label_values(&["done"]).inc();
        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "cellar_jobs_total"));
    }
}
