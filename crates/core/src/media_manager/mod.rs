//! Media manager abstraction (Sonarr for series, Radarr for movies).

mod starr;
mod types;

use std::sync::Arc;

pub use starr::{StarrClient, StarrFlavor};
pub use types::*;

use crate::config::Config;

/// The configured managers, one per media kind.
#[derive(Clone, Default)]
pub struct MediaManagers {
    pub series: Option<Arc<dyn MediaManager>>,
    pub movies: Option<Arc<dyn MediaManager>>,
}

impl MediaManagers {
    pub fn new(
        series: Option<Arc<dyn MediaManager>>,
        movies: Option<Arc<dyn MediaManager>>,
    ) -> Self {
        Self { series, movies }
    }

    pub fn for_kind(&self, kind: MediaKind) -> Option<&Arc<dyn MediaManager>> {
        match kind {
            MediaKind::Series => self.series.as_ref(),
            MediaKind::Movie => self.movies.as_ref(),
        }
    }
}

/// Create clients for every manager present in the configuration.
pub fn create_media_managers(config: &Config) -> Result<MediaManagers, MediaManagerError> {
    let series = config
        .sonarr
        .as_ref()
        .map(|c| StarrClient::sonarr(c).map(|s| Arc::new(s) as Arc<dyn MediaManager>))
        .transpose()?;
    let movies = config
        .radarr
        .as_ref()
        .map(|c| StarrClient::radarr(c).map(|r| Arc::new(r) as Arc<dyn MediaManager>))
        .transpose()?;
    Ok(MediaManagers { series, movies })
}
