//! Torrent client abstraction.
//!
//! This module provides a `TorrentClient` trait covering the operations the
//! archival workflow needs: listing torrents, relocating storage and forcing
//! a data recheck. qBittorrent is the only backend.

mod qbittorrent;
mod types;

use std::sync::Arc;

pub use qbittorrent::QBittorrentClient;
pub use types::*;

use crate::config::{TorrentClientBackend, TorrentClientConfig};

/// Create the configured torrent client backend.
pub fn create_torrent_client(
    config: &TorrentClientConfig,
) -> Result<Arc<dyn TorrentClient>, TorrentClientError> {
    match config.backend {
        TorrentClientBackend::QBittorrent => {
            let qb = config.qbittorrent.clone().ok_or_else(|| {
                TorrentClientError::Internal(
                    "torrent_client.qbittorrent section missing".to_string(),
                )
            })?;
            Ok(Arc::new(QBittorrentClient::new(qb)?))
        }
    }
}
