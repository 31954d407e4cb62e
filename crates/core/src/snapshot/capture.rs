//! Walks a media entry root and records a restorable tree.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tracing::debug;
use walkdir::WalkDir;

use super::types::{EntrySnapshot, FileNode, SnapshotError, TorrentContent, TorrentSource};

/// Bytes read from each sampled region of a file.
pub const SAMPLE_SIZE: u64 = 64 * 1024;

/// Compute the sampled content fingerprint of a file.
///
/// MD5 over the file length followed by 64 KiB from the head, middle and
/// tail. Files no larger than three samples are hashed whole.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut context = md5::Context::new();
    context.consume(len.to_le_bytes());

    if len <= SAMPLE_SIZE * 3 {
        let mut buf = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buf)?;
        context.consume(&buf);
    } else {
        let mut buf = vec![0u8; SAMPLE_SIZE as usize];
        for offset in [0, len / 2 - SAMPLE_SIZE / 2, len - SAMPLE_SIZE] {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
            context.consume(&buf);
        }
    }

    Ok(format!("{:x}", context.compute()))
}

/// Render a relative path with `/` separators.
pub(crate) fn to_slash_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_identity(meta: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

/// Index every data file of the given torrents by device and inode.
fn index_torrent_files(
    torrents: &[TorrentContent],
) -> Result<HashMap<(u64, u64), TorrentSource>, SnapshotError> {
    let mut index = HashMap::new();
    for torrent in torrents {
        if !torrent.content_path.exists() {
            debug!(hash = %torrent.hash, path = %torrent.content_path.display(), "Torrent content not present, skipping inode index");
            continue;
        }
        for entry in WalkDir::new(&torrent.content_path).follow_links(false) {
            let entry = entry
                .map_err(|e| SnapshotError::from_walk("index_torrent", &torrent.content_path, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| SnapshotError::from_walk("index_torrent", entry.path(), e))?;
            let Some(identity) = file_identity(&meta) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&torrent.save_path)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(entry.file_name()));
            index.insert(
                identity,
                TorrentSource {
                    hash: torrent.hash.clone(),
                    relative_path: relative,
                },
            );
        }
    }
    Ok(index)
}

/// Capture the tree under `root` synchronously.
///
/// Any entry that cannot be read aborts the capture: a partial snapshot is
/// never returned.
pub fn capture_blocking(
    entry_id: &str,
    root: &Path,
    torrents: &[TorrentContent],
) -> Result<EntrySnapshot, SnapshotError> {
    fs::metadata(root).map_err(|e| SnapshotError::unreadable("stat_root", root, e))?;
    let sources = index_torrent_files(torrents)?;

    let mut nodes = Vec::new();
    let mut seen = HashSet::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| SnapshotError::from_walk("walk", root, e))?;
        let relative = entry.path().strip_prefix(root).map_err(|_| {
            SnapshotError::unreadable(
                "strip_prefix",
                entry.path(),
                std::io::Error::other("entry outside snapshot root"),
            )
        })?;
        let path = to_slash_path(relative);
        if !seen.insert(path.clone()) {
            return Err(SnapshotError::DuplicatePath(path));
        }

        let file_type = entry.file_type();
        let node = if file_type.is_dir() {
            FileNode::directory(path)
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|e| SnapshotError::unreadable("read_link", entry.path(), e))?;
            FileNode::symlink(path, target)
        } else {
            let meta = fs::metadata(entry.path())
                .map_err(|e| SnapshotError::unreadable("stat", entry.path(), e))?;
            let fingerprint = fingerprint_file(entry.path())
                .map_err(|e| SnapshotError::unreadable("fingerprint", entry.path(), e))?;
            let node = FileNode::file(path, meta.len(), Some(fingerprint));
            match file_identity(&meta).and_then(|id| sources.get(&id)) {
                Some(source) => node.with_torrent_source(source.clone()),
                None => node,
            }
        };
        nodes.push(node);
    }

    nodes.sort_by(FileNode::restore_order);

    debug!(
        entry_id,
        root = %root.display(),
        nodes = nodes.len(),
        linked = nodes.iter().filter(|n| n.torrent_source.is_some()).count(),
        "Captured entry snapshot"
    );

    Ok(EntrySnapshot {
        entry_id: entry_id.to_string(),
        root: root.to_path_buf(),
        nodes,
        captured_at: Utc::now(),
    })
}

/// Capture the tree under `root` on the blocking thread pool.
pub async fn capture(
    entry_id: &str,
    root: &Path,
    torrents: &[TorrentContent],
) -> Result<EntrySnapshot, SnapshotError> {
    let entry_id = entry_id.to_string();
    let root = root.to_path_buf();
    let torrents = torrents.to_vec();
    tokio::task::spawn_blocking(move || capture_blocking(&entry_id, &root, &torrents))
        .await
        .map_err(|e| SnapshotError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::NodeKind;
    use tempfile::TempDir;

    fn write(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_fingerprint_small_file_changes_with_content() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        write(&a, b"hello");
        write(&b, b"hellp");
        let fa = fingerprint_file(&a).unwrap();
        assert_eq!(fa, fingerprint_file(&a).unwrap());
        assert_ne!(fa, fingerprint_file(&b).unwrap());
        assert_eq!(fa.len(), 32);
    }

    #[test]
    fn test_fingerprint_large_file_samples_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big");
        let mut data = vec![7u8; (SAMPLE_SIZE * 5) as usize];
        write(&path, &data);
        let before = fingerprint_file(&path).unwrap();

        let last = data.len() - 1;
        data[last] = 8;
        write(&path, &data);
        assert_ne!(before, fingerprint_file(&path).unwrap());
    }

    #[test]
    fn test_capture_records_tree() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("Show");
        write(&root.join("Season 01/ep1.mkv"), b"episode one");
        write(&root.join("tvshow.nfo"), b"nfo");
        fs::create_dir_all(root.join("extras")).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("Season 01", root.join("latest")).unwrap();

        let snapshot = capture_blocking("42", &root, &[]).unwrap();
        assert_eq!(snapshot.entry_id, "42");

        let ep = snapshot.node("Season 01/ep1.mkv").unwrap();
        assert_eq!(ep.kind, NodeKind::File);
        assert_eq!(ep.size, Some(11));
        assert!(ep.fingerprint.is_some());
        assert!(ep.torrent_source.is_none());

        assert_eq!(snapshot.node("extras").unwrap().kind, NodeKind::Directory);
        #[cfg(unix)]
        assert_eq!(
            snapshot.node("latest").unwrap().link_target,
            Some(PathBuf::from("Season 01"))
        );
        assert_eq!(snapshot.total_bytes(), 14);
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_links_files_to_torrent_by_inode() {
        let temp = TempDir::new().unwrap();
        let save_path = temp.path().join("torrents/tv");
        let content = save_path.join("Show.S01");
        write(&content.join("Show.S01E01.mkv"), b"data");

        let root = temp.path().join("media/tv/Show");
        fs::create_dir_all(root.join("Season 01")).unwrap();
        fs::hard_link(
            content.join("Show.S01E01.mkv"),
            root.join("Season 01/Show - S01E01.mkv"),
        )
        .unwrap();

        let torrents = vec![TorrentContent {
            hash: "abc".to_string(),
            save_path: save_path.clone(),
            content_path: content,
        }];
        let snapshot = capture_blocking("1", &root, &torrents).unwrap();
        let node = snapshot.node("Season 01/Show - S01E01.mkv").unwrap();
        let source = node.torrent_source.as_ref().unwrap();
        assert_eq!(source.hash, "abc");
        assert_eq!(
            source.relative_path,
            PathBuf::from("Show.S01/Show.S01E01.mkv")
        );
    }

    #[test]
    fn test_capture_missing_root_is_unreadable() {
        let temp = TempDir::new().unwrap();
        let err = capture_blocking("1", &temp.path().join("nope"), &[]).unwrap_err();
        assert!(matches!(err, SnapshotError::PathUnreadable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_unreadable_file_aborts() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let root = temp.path().join("Movie");
        let locked = root.join("movie.mkv");
        write(&locked, b"bytes");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root can read anything; the check only means something unprivileged.
        if File::open(&locked).is_ok() {
            return;
        }
        let err = capture_blocking("1", &root, &[]).unwrap_err();
        assert!(matches!(err, SnapshotError::PathUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_capture_async() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("Movie (2020)");
        write(&root.join("Movie (2020).mkv"), b"movie");
        let snapshot = capture("7", &root, &[]).await.unwrap();
        assert_eq!(snapshot.nodes.len(), 1);
    }
}
