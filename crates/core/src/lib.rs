pub mod config;
pub mod job;
pub mod matcher;
pub mod media_manager;
pub mod metrics;
pub mod restore;
pub mod snapshot;
pub mod testing;
pub mod torrent_client;
pub mod workflow;

pub use config::{
    load_config, load_config_from_str, validate_config, validate_mountpoints, Config,
    ConfigError, SanitizedConfig,
};
pub use job::{
    ArchivalJob, EventOutcome, FailureReason, JobEvent, JobFilter, JobStage, JobState, JobStore,
    JobStoreError, SqliteJobStore,
};
pub use matcher::{FuzzyMatcher, MatchOutcome, TitleScorer, TokenSetScorer};
pub use media_manager::{
    create_media_managers, MediaEntry, MediaKind, MediaManager, MediaManagerError,
    MediaManagers, StarrClient,
};
pub use restore::{RestoreReport, RestoreStrategy, StructureRestorer};
pub use snapshot::{EntrySnapshot, FileNode};
pub use torrent_client::{
    create_torrent_client, QBittorrentClient, TorrentClient, TorrentClientError, TorrentRecord,
    TorrentState,
};
pub use workflow::{
    ArchivalError, ArchivalRunner, ArchivalWorkflow, JobOutcome, JobReport, RunOptions, RunReport,
};
