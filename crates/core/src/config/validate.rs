use std::path::Path;

use super::{types::Config, ConfigError, TorrentClientBackend};

/// Validate configuration values.
///
/// Checks:
/// - qBittorrent section present when selected as backend
/// - mountpoints are absolute and do not nest inside each other
/// - no category is both a series and a movie category
/// - matcher threshold and epsilon are within [0, 1]
/// - polling and concurrency settings are non-zero
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.torrent_client.backend == TorrentClientBackend::QBittorrent
        && config.torrent_client.qbittorrent.is_none()
    {
        return Err(ConfigError::ValidationError(
            "torrent_client.qbittorrent section is required for the qbittorrent backend"
                .to_string(),
        ));
    }

    let mounts = &config.mountpoints;
    for (name, path) in [
        ("source_media", &mounts.source_media),
        ("destination_media", &mounts.destination_media),
        ("destination_torrents", &mounts.destination_torrents),
    ] {
        if !path.is_absolute() {
            return Err(ConfigError::ValidationError(format!(
                "mountpoints.{} must be an absolute path, got {}",
                name,
                path.display()
            )));
        }
    }
    if mounts.destination_media.starts_with(&mounts.source_media)
        || mounts.source_media.starts_with(&mounts.destination_media)
    {
        return Err(ConfigError::ValidationError(
            "mountpoints.source_media and mountpoints.destination_media must not overlap"
                .to_string(),
        ));
    }
    if mounts.destination_torrents.starts_with(&mounts.source_media) {
        return Err(ConfigError::ValidationError(
            "mountpoints.destination_torrents must not be inside mountpoints.source_media"
                .to_string(),
        ));
    }

    if let Some(category) = config
        .selection
        .series_categories
        .iter()
        .find(|c| config.selection.movie_categories.contains(c))
    {
        return Err(ConfigError::ValidationError(format!(
            "category '{}' is listed as both series and movie",
            category
        )));
    }

    if !(0.0..=1.0).contains(&config.matcher.threshold) {
        return Err(ConfigError::ValidationError(
            "matcher.threshold must be between 0.0 and 1.0".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.matcher.ambiguity_epsilon) {
        return Err(ConfigError::ValidationError(
            "matcher.ambiguity_epsilon must be between 0.0 and 1.0".to_string(),
        ));
    }

    for (name, poll) in [
        ("move_poll", &config.workflow.move_poll),
        ("recheck_poll", &config.workflow.recheck_poll),
    ] {
        if poll.initial_interval_ms == 0 || poll.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(format!(
                "workflow.{}: interval and timeout must be greater than 0",
                name
            )));
        }
        if poll.max_interval_ms < poll.initial_interval_ms {
            return Err(ConfigError::ValidationError(format!(
                "workflow.{}: max_interval_ms must be >= initial_interval_ms",
                name
            )));
        }
        if poll.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "workflow.{}: multiplier must be >= 1.0",
                name
            )));
        }
    }

    if config.workflow.max_concurrent_jobs == 0 {
        return Err(ConfigError::ValidationError(
            "workflow.max_concurrent_jobs cannot be 0".to_string(),
        ));
    }

    Ok(())
}

/// Check that every configured mountpoint exists and is a directory.
///
/// Runs at startup, separately from [`validate_config`], since it touches
/// the filesystem.
pub fn validate_mountpoints(config: &Config) -> Result<(), ConfigError> {
    let mounts = &config.mountpoints;
    for (name, path) in [
        ("source_media", mounts.source_media.as_path()),
        ("destination_media", mounts.destination_media.as_path()),
        ("destination_torrents", mounts.destination_torrents.as_path()),
    ] {
        check_directory(name, path)?;
    }
    Ok(())
}

fn check_directory(name: &str, path: &Path) -> Result<(), ConfigError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ConfigError::ValidationError(format!(
            "mountpoints.{} is not a directory: {}",
            name,
            path.display()
        ))),
        Err(e) => Err(ConfigError::ValidationError(format!(
            "mountpoints.{} is unavailable ({}): {}",
            name,
            path.display(),
            e
        ))),
    }
}
