mod metrics;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cellar_core::config::LoggingConfig;
use cellar_core::{
    create_media_managers, create_torrent_client, load_config, validate_config,
    validate_mountpoints, ArchivalJob, ArchivalRunner, ArchivalWorkflow, Config, JobEvent,
    JobFilter, JobOutcome, JobReport, JobStore, RunOptions, RunReport, SanitizedConfig,
    SqliteJobStore,
};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Moves aged torrents to cold storage and rebuilds their library layout.
#[derive(Parser)]
#[command(name = "cellar", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(long, short, global = true, env = "CELLAR_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive eligible torrents and resume interrupted jobs.
    Run {
        /// Plan and report without changing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// List archival jobs.
    Jobs {
        /// Only jobs in this state (e.g. error, done, moving).
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of jobs to list.
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Show a job with its event log.
    Show { job_id: String },

    /// Resume a failed or interrupted job.
    Resume { job_id: String },

    /// Cancel a job that has not moved any data yet.
    Cancel { job_id: String },

    /// Give up on a failed job and release its torrents.
    Abandon {
        job_id: String,

        /// Delete the job and its event log instead of keeping them.
        #[arg(long)]
        purge: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Install the tracing subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Returns whether the command succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let loaded = load_config(&cli.config);
    match &loaded {
        Ok(config) => init_logging(&config.logging),
        Err(_) => init_logging(&LoggingConfig::default()),
    }
    let config =
        loaded.with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    validate_config(&config).context("Configuration validation failed")?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        "cellar {} starting, config {:?} (hash {})",
        VERSION,
        cli.config,
        &config_hash[..16]
    );
    info!(
        "Effective configuration: {}",
        serde_json::to_string(&SanitizedConfig::from(&config)).unwrap_or_default()
    );

    let store = Arc::new(
        SqliteJobStore::new(&config.database.path).context("Failed to open job store")?,
    );
    info!("Job store at {:?}", config.database.path);

    match cli.command {
        Commands::Run { dry_run } => {
            validate_mountpoints(&config).context("Mountpoint check failed")?;
            let runner = build_runner(&config, store)?;
            let report = runner
                .run_once(RunOptions { dry_run })
                .await
                .context("Archival run failed")?;
            print_run(&report, cli.json)?;

            metrics::observe_run(&report);
            if let Some(path) = &config.metrics.textfile_path {
                metrics::write_textfile(path).context("Failed to export metrics")?;
            }
            Ok(report.is_success())
        }
        Commands::Jobs { state, limit } => {
            let mut filter = JobFilter::new().with_limit(limit);
            if let Some(state) = state {
                filter = filter.with_state(state);
            }
            let jobs = store.list(&filter).context("Failed to list jobs")?;
            print_jobs(&jobs, cli.json)?;
            Ok(true)
        }
        Commands::Show { job_id } => {
            let job = store
                .get(&job_id)
                .context("Failed to load job")?
                .with_context(|| format!("Job {} not found", job_id))?;
            let events = store.events(&job_id).context("Failed to load events")?;
            print_job(&job, &events, cli.json)?;
            Ok(true)
        }
        Commands::Resume { job_id } => {
            validate_mountpoints(&config).context("Mountpoint check failed")?;
            let runner = build_runner(&config, store)?;
            let report = runner
                .resume(&job_id)
                .await
                .with_context(|| format!("Failed to resume job {}", job_id))?;
            let ok = !matches!(report.outcome, JobOutcome::Error { .. });
            print_job_report(&report, cli.json)?;
            Ok(ok)
        }
        Commands::Cancel { job_id } => {
            let runner = build_runner(&config, store)?;
            let report = runner
                .cancel(&job_id)
                .with_context(|| format!("Failed to cancel job {}", job_id))?;
            print_job_report(&report, cli.json)?;
            Ok(true)
        }
        Commands::Abandon { job_id, purge } => {
            let runner = build_runner(&config, store)?;
            let report = runner
                .abandon(&job_id, purge)
                .with_context(|| format!("Failed to abandon job {}", job_id))?;
            print_job_report(&report, cli.json)?;
            Ok(true)
        }
    }
}

fn build_runner(config: &Config, store: Arc<SqliteJobStore>) -> Result<ArchivalRunner> {
    let client = create_torrent_client(&config.torrent_client)
        .context("Failed to create torrent client")?;
    info!("Using torrent client: {}", client.name());

    let managers = create_media_managers(config).context("Failed to create media managers")?;
    for manager in [&managers.series, &managers.movies].into_iter().flatten() {
        info!("Using media manager: {}", manager.name());
    }

    let store: Arc<dyn JobStore> = store;
    let workflow = ArchivalWorkflow::new(config, client, managers, store);
    Ok(ArchivalRunner::new(Arc::new(workflow)))
}

// =============================================================================
// Output
// =============================================================================

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn outcome_line(report: &JobReport) -> String {
    match &report.outcome {
        JobOutcome::Degraded { mismatches } => format!("degraded ({} mismatch(es))", mismatches.len()),
        JobOutcome::Error {
            reason,
            resumable,
            message,
        } => format!(
            "error {} (resumable={}): {}",
            reason.as_str(),
            resumable,
            message
        ),
        JobOutcome::Abandoned { reason } => format!("abandoned after {}", reason.as_str()),
        other => other.as_str().to_string(),
    }
}

fn print_job_report(report: &JobReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!("{}  {}  {}", report.job_id, report.primary, outcome_line(report));
    for sibling in &report.siblings {
        println!("    + {}", sibling);
    }
    if report.ambiguous_match {
        println!("    ! ambiguous catalog match");
    }
    if let JobOutcome::Degraded { mismatches } = &report.outcome {
        for mismatch in mismatches {
            println!("    ~ {}: {}", mismatch.path, mismatch.reason);
        }
    }
    Ok(())
}

fn print_run(report: &RunReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!(
        "{}{} candidate(s), {} job(s): {} done, {} degraded, {} error",
        if report.dry_run { "[dry run] " } else { "" },
        report.candidates,
        report.jobs.len(),
        report.count("done"),
        report.count("degraded"),
        report.count("error")
    );
    for job in &report.jobs {
        print_job_report(job, false)?;
    }
    Ok(())
}

fn print_jobs(jobs: &[ArchivalJob], json: bool) -> Result<()> {
    if json {
        return print_json(&jobs);
    }
    for job in jobs {
        println!(
            "{}  {:<16}  {}  {}  (+{} sibling(s), retries {})",
            job.id,
            job.state.state_type(),
            job.updated_at.format("%Y-%m-%d %H:%M"),
            job.primary.name,
            job.siblings.len(),
            job.retry_count
        );
    }
    Ok(())
}

fn print_job(job: &ArchivalJob, events: &[JobEvent], json: bool) -> Result<()> {
    if json {
        #[derive(Serialize)]
        struct Detail<'a> {
            job: &'a ArchivalJob,
            events: &'a [JobEvent],
        }
        return print_json(&Detail { job, events });
    }
    print_job_report(&JobReport::from_job(job), false)?;
    println!("    state: {}", job.state.state_type());
    println!("    destination: {}", job.destination.display());
    for entry in &job.entries {
        println!(
            "    entry {} ({}): {} -> {}",
            entry.entry.id,
            entry.entry.title,
            entry.entry.root_path.display(),
            entry.new_root.display()
        );
    }
    println!("    events:");
    for event in events {
        println!(
            "      {}  {:<18} {:<9} {}{}",
            event.at.format("%Y-%m-%d %H:%M:%S"),
            event.transition,
            event.outcome.as_str(),
            event
                .subject
                .as_deref()
                .map(|s| format!("[{}] ", s))
                .unwrap_or_default(),
            event.message
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_dry_run() {
        let cli = Cli::try_parse_from(["cellar", "-c", "/etc/cellar.toml", "run", "--dry-run"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/cellar.toml"));
        assert!(matches!(cli.command, Commands::Run { dry_run: true }));
        assert!(!cli.json);
    }

    #[test]
    fn test_parse_jobs_filter_after_subcommand() {
        let cli =
            Cli::try_parse_from(["cellar", "jobs", "--state", "error", "--limit", "5", "--json"])
                .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Jobs { state, limit } => {
                assert_eq!(state.as_deref(), Some("error"));
                assert_eq!(limit, 5);
            }
            _ => panic!("expected jobs"),
        }
    }

    #[test]
    fn test_resume_requires_job_id() {
        assert!(Cli::try_parse_from(["cellar", "resume"]).is_err());
        let cli = Cli::try_parse_from(["cellar", "resume", "job-1"]).unwrap();
        assert!(matches!(cli.command, Commands::Resume { job_id } if job_id == "job-1"));
    }

    #[test]
    fn test_parse_abandon_with_purge() {
        let cli = Cli::try_parse_from(["cellar", "abandon", "job-2", "--purge"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Abandon { job_id, purge: true } if job_id == "job-2"
        ));
    }
}
