//! Prometheus metrics export.
//!
//! The binary runs once and exits, so metrics are written in the text
//! exposition format to a file picked up by node-exporter's textfile
//! collector instead of being served over HTTP.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use prometheus::{self, Encoder, IntGauge, Registry, TextEncoder};

use cellar_core::RunReport;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// Run Metrics
// =============================================================================

/// Unix time the last run finished.
pub static LAST_RUN_TIMESTAMP: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "cellar_last_run_timestamp_seconds",
        "Unix time the last archival run finished",
    )
    .unwrap()
});

/// 1 when no job of the last run ended in error.
pub static LAST_RUN_SUCCESS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "cellar_last_run_success",
        "Whether the last archival run finished without job errors",
    )
    .unwrap()
});

/// Candidates seen by the last run.
pub static LAST_RUN_CANDIDATES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "cellar_last_run_candidates",
        "Torrents that passed candidate selection in the last run",
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(LAST_RUN_TIMESTAMP.clone()))
        .unwrap();
    registry
        .register(Box::new(LAST_RUN_SUCCESS.clone()))
        .unwrap();
    registry
        .register(Box::new(LAST_RUN_CANDIDATES.clone()))
        .unwrap();

    for metric in cellar_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Record the summary of a finished run.
pub fn observe_run(report: &RunReport) {
    LAST_RUN_TIMESTAMP.set(report.finished_at.timestamp());
    LAST_RUN_SUCCESS.set(i64::from(report.is_success()));
    LAST_RUN_CANDIDATES.set(report.candidates as i64);
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics are not valid UTF-8")
}

/// Write the exposition to `path`, replacing it atomically so the collector
/// never reads a partial file.
pub fn write_textfile(path: &Path) -> Result<()> {
    let body = encode_metrics()?;
    let tmp = path.with_extension(format!("tmp.{}", Utc::now().timestamp_millis()));
    fs::write(&tmp, body).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encode_contains_core_and_run_metrics() {
        cellar_core::metrics::JOBS_TOTAL
            .with_label_values(&["done"])
            .inc();
        LAST_RUN_SUCCESS.set(1);

        let text = encode_metrics().unwrap();
        assert!(text.contains("cellar_jobs_total"));
        assert!(text.contains("cellar_last_run_success 1"));
    }

    #[test]
    fn test_write_textfile_replaces_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cellar.prom");
        std::fs::write(&path, "stale").unwrap();

        write_textfile(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("cellar_last_run_timestamp_seconds"));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
