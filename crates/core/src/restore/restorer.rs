//! Replays an [`EntrySnapshot`] at a new root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::metrics;
use crate::snapshot::{fingerprint_file, EntrySnapshot, FileNode, NodeKind};

use super::types::{FileRestore, RestoreError, RestoreReport, RestoreSources, RestoreStrategy};

/// Filesystem primitives used to materialize files.
pub trait FileLinker: Send + Sync {
    fn hard_link(&self, source: &Path, destination: &Path) -> io::Result<()>;

    fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64>;
}

/// [`FileLinker`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLinker;

impl FileLinker for FsLinker {
    fn hard_link(&self, source: &Path, destination: &Path) -> io::Result<()> {
        fs::hard_link(source, destination)
    }

    fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64> {
        fs::copy(source, destination)
    }
}

/// Rebuilds captured trees, preferring hardlinks over copies.
#[derive(Clone)]
pub struct StructureRestorer {
    linker: Arc<dyn FileLinker>,
}

impl Default for StructureRestorer {
    fn default() -> Self {
        Self::new()
    }
}

impl StructureRestorer {
    pub fn new() -> Self {
        Self {
            linker: Arc::new(FsLinker),
        }
    }

    pub fn with_linker(linker: Arc<dyn FileLinker>) -> Self {
        Self { linker }
    }

    /// Restore on the blocking thread pool.
    pub async fn restore(
        &self,
        snapshot: &EntrySnapshot,
        new_root: &Path,
        sources: &RestoreSources,
    ) -> Result<RestoreReport, RestoreError> {
        let restorer = self.clone();
        let snapshot = snapshot.clone();
        let new_root = new_root.to_path_buf();
        let sources = sources.clone();
        tokio::task::spawn_blocking(move || {
            restorer.restore_blocking(&snapshot, &new_root, &sources)
        })
        .await
        .map_err(|e| RestoreError::TaskFailed(e.to_string()))?
    }

    /// Recreate `snapshot` under `new_root`.
    ///
    /// Existing entries that already match are left alone, so the call can
    /// be repeated after an interruption. A file that exists but differs is
    /// replaced when a source matching the snapshot is still available, and
    /// reported as a mismatch otherwise.
    pub fn restore_blocking(
        &self,
        snapshot: &EntrySnapshot,
        new_root: &Path,
        sources: &RestoreSources,
    ) -> Result<RestoreReport, RestoreError> {
        let mut report = RestoreReport::new(&snapshot.entry_id, new_root);

        if !new_root.is_dir() {
            fs::create_dir_all(new_root)
                .map_err(|e| RestoreError::unwritable("create_root", new_root, e))?;
            report.directories_created += 1;
        }

        let mut nodes = snapshot.nodes.clone();
        nodes.sort_by(FileNode::restore_order);

        for node in &nodes {
            let destination = new_root.join(&node.path);
            match node.kind {
                NodeKind::Directory => self.restore_directory(node, &destination, &mut report)?,
                NodeKind::File => self.restore_file(node, &destination, sources, &mut report)?,
                NodeKind::Symlink => {
                    self.restore_symlink(node, &destination, sources, &mut report)?
                }
            }
        }

        for file in &report.files {
            metrics::FILES_RESTORED
                .with_label_values(&[file.strategy.as_str()])
                .inc();
        }

        debug!(
            entry_id = %snapshot.entry_id,
            root = %new_root.display(),
            hardlinked = report.count(RestoreStrategy::Hardlinked),
            copied = report.count(RestoreStrategy::Copied),
            already_present = report.count(RestoreStrategy::AlreadyPresent),
            mismatches = report.mismatches.len(),
            "Restored entry structure"
        );

        Ok(report)
    }

    fn restore_directory(
        &self,
        node: &FileNode,
        destination: &Path,
        report: &mut RestoreReport,
    ) -> Result<(), RestoreError> {
        match fs::symlink_metadata(destination) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => {
                report.mismatch(&node.path, "exists but is not a directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(destination)
                    .map_err(|e| RestoreError::unwritable("create_dir", destination, e))?;
                report.directories_created += 1;
                Ok(())
            }
            Err(e) => Err(RestoreError::unreadable("stat", destination, e)),
        }
    }

    fn restore_file(
        &self,
        node: &FileNode,
        destination: &Path,
        sources: &RestoreSources,
        report: &mut RestoreReport,
    ) -> Result<(), RestoreError> {
        let existing = match fs::symlink_metadata(destination) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(RestoreError::unreadable("stat", destination, e)),
        };

        let torrent_source = node
            .torrent_source
            .as_ref()
            .and_then(|s| {
                sources
                    .torrent_save_paths
                    .get(&s.hash)
                    .map(|save| save.join(&s.relative_path))
            })
            .filter(|p| p.is_file());
        let original = Some(sources.original_root.join(&node.path)).filter(|p| p.is_file());

        if let Some(meta) = existing {
            if !meta.is_file() {
                report.mismatch(&node.path, "exists but is not a regular file");
                report.files.push(FileRestore {
                    path: node.path.clone(),
                    strategy: RestoreStrategy::AlreadyPresent,
                });
                return Ok(());
            }
            let Some(reason) = verify_file(node, destination)? else {
                report.files.push(FileRestore {
                    path: node.path.clone(),
                    strategy: RestoreStrategy::AlreadyPresent,
                });
                return Ok(());
            };
            // Only a source that still matches the snapshot may replace it.
            let mut has_good_source = false;
            for source in [torrent_source.as_deref(), original.as_deref()]
                .into_iter()
                .flatten()
            {
                if verify_file(node, source)?.is_none() {
                    has_good_source = true;
                    break;
                }
            }
            if !has_good_source {
                report.mismatch(&node.path, format!("existing file differs: {}", reason));
                report.files.push(FileRestore {
                    path: node.path.clone(),
                    strategy: RestoreStrategy::AlreadyPresent,
                });
                return Ok(());
            }
            debug!(path = %node.path, reason = %reason, "Replacing stale file");
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RestoreError::unwritable("create_parent", parent, e))?;
        }

        // Materialize next to the destination and rename into place, so an
        // interrupted copy never leaves a truncated file under the real name.
        let partial = partial_path(destination);
        remove_partial(&partial)?;

        let strategy = match (torrent_source, original) {
            (Some(source), _) => match self.linker.hard_link(&source, &partial) {
                Ok(()) => RestoreStrategy::Hardlinked,
                Err(e) if link_unsupported(&e) => {
                    debug!(
                        path = %node.path,
                        error = %e,
                        "Hardlink not possible, falling back to copy"
                    );
                    self.copy_partial(&source, &partial, destination)?;
                    RestoreStrategy::Copied
                }
                Err(e) => return Err(RestoreError::unwritable("hard_link", destination, e)),
            },
            (None, Some(source)) => {
                self.copy_partial(&source, &partial, destination)?;
                RestoreStrategy::Copied
            }
            (None, None) => {
                warn!(path = %node.path, "No source left for file, cannot restore");
                report.mismatch(&node.path, "no source available");
                report.files.push(FileRestore {
                    path: node.path.clone(),
                    strategy: RestoreStrategy::Missing,
                });
                return Ok(());
            }
        };

        let verified = match verify_file(node, &partial) {
            Ok(verified) => verified,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        if let Some(reason) = verified {
            warn!(path = %node.path, reason = %reason, "Restored file does not match snapshot");
            report.mismatch(&node.path, reason);
        }

        if let Err(e) = fs::rename(&partial, destination) {
            let _ = fs::remove_file(&partial);
            return Err(RestoreError::unwritable("rename", destination, e));
        }
        report.files.push(FileRestore {
            path: node.path.clone(),
            strategy,
        });
        Ok(())
    }

    fn copy_partial(
        &self,
        source: &Path,
        partial: &Path,
        destination: &Path,
    ) -> Result<(), RestoreError> {
        if let Err(e) = self.linker.copy(source, partial) {
            let _ = fs::remove_file(partial);
            return Err(RestoreError::unwritable("copy", destination, e));
        }
        Ok(())
    }

    fn restore_symlink(
        &self,
        node: &FileNode,
        destination: &Path,
        sources: &RestoreSources,
        report: &mut RestoreReport,
    ) -> Result<(), RestoreError> {
        let Some(target) = node.link_target.as_deref() else {
            report.mismatch(&node.path, "symlink without target in snapshot");
            return Ok(());
        };
        let target = sources.rewrite_target(target);

        match fs::symlink_metadata(destination) {
            Ok(meta) => {
                let current: Option<PathBuf> = if meta.file_type().is_symlink() {
                    fs::read_link(destination).ok()
                } else {
                    None
                };
                if current.as_deref() != Some(target.as_path()) {
                    report.mismatch(&node.path, "existing entry is not the expected symlink");
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                create_symlink(&target, destination)?;
                report.symlinks_created += 1;
                Ok(())
            }
            Err(e) => Err(RestoreError::unreadable("stat", destination, e)),
        }
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, destination: &Path) -> Result<(), RestoreError> {
    std::os::unix::fs::symlink(target, destination)
        .map_err(|e| RestoreError::unwritable("symlink", destination, e))
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, destination: &Path) -> Result<(), RestoreError> {
    Err(RestoreError::unwritable(
        "symlink",
        destination,
        io::Error::new(io::ErrorKind::Unsupported, "symlinks not supported"),
    ))
}

/// Staging path for a file being materialized at `destination`.
fn partial_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.cellar-partial", name))
}

/// Remove a staging file left behind by an interrupted restore.
fn remove_partial(partial: &Path) -> Result<(), RestoreError> {
    match fs::remove_file(partial) {
        Ok(()) => {
            debug!(path = %partial.display(), "Removed leftover partial file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RestoreError::unwritable("remove_partial", partial, e)),
    }
}

/// errno values for a link across volumes and for a filesystem that refuses
/// hardlinks altogether.
const EXDEV: i32 = 18;
const EPERM: i32 = 1;

/// Whether a failed hardlink should fall back to a copy. Any other failure
/// is a real write error.
fn link_unsupported(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::CrossesDevices | io::ErrorKind::Unsupported
    ) || matches!(e.raw_os_error(), Some(EXDEV) | Some(EPERM))
}

/// Compare a file on disk against its snapshot node. Returns the reason for
/// a mismatch, if any.
fn verify_file(node: &FileNode, path: &Path) -> Result<Option<String>, RestoreError> {
    let meta = fs::metadata(path).map_err(|e| RestoreError::unreadable("verify", path, e))?;
    if let Some(expected) = node.size {
        if meta.len() != expected {
            return Ok(Some(format!(
                "size {} does not match snapshot size {}",
                meta.len(),
                expected
            )));
        }
    }
    if let Some(expected) = node.fingerprint.as_deref() {
        let actual =
            fingerprint_file(path).map_err(|e| RestoreError::unreadable("verify", path, e))?;
        if actual != expected {
            return Ok(Some("fingerprint does not match snapshot".to_string()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::capture_blocking;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Refuses hardlinks for files with the given name, like a cross-device link.
    struct CrossDeviceFor(&'static str);

    impl FileLinker for CrossDeviceFor {
        fn hard_link(&self, source: &Path, destination: &Path) -> io::Result<()> {
            if source.file_name().and_then(|n| n.to_str()) == Some(self.0) {
                return Err(io::Error::new(
                    io::ErrorKind::CrossesDevices,
                    "Invalid cross-device link",
                ));
            }
            fs::hard_link(source, destination)
        }

        fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64> {
            fs::copy(source, destination)
        }
    }

    /// Library tree hardlinked to a torrent that has since moved to `archive`.
    struct Fixture {
        _temp: TempDir,
        snapshot: EntrySnapshot,
        sources: RestoreSources,
        new_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let old_save = temp.path().join("torrents/tv");
        let content = old_save.join("Show.S01");
        write(&content.join("episode01.mkv"), b"first episode bytes");
        write(&content.join("episode02.mkv"), b"second episode bytes");

        let root = temp.path().join("media/tv/Show");
        fs::create_dir_all(root.join("Season 01")).unwrap();
        for ep in ["episode01.mkv", "episode02.mkv"] {
            fs::hard_link(content.join(ep), root.join("Season 01").join(ep)).unwrap();
        }
        write(&root.join("tvshow.nfo"), b"<tvshow/>");

        let torrents = vec![crate::snapshot::TorrentContent {
            hash: "abc".to_string(),
            save_path: old_save.clone(),
            content_path: content.clone(),
        }];
        let snapshot = capture_blocking("1", &root, &torrents).unwrap();

        let new_save = temp.path().join("archive/torrents/tv");
        fs::create_dir_all(&new_save).unwrap();
        fs::rename(&content, new_save.join("Show.S01")).unwrap();

        let new_root = temp.path().join("archive/media/tv/Show");
        let sources = RestoreSources {
            torrent_save_paths: HashMap::from([("abc".to_string(), new_save)]),
            original_root: root.clone(),
            path_rewrites: vec![(root, new_root.clone())],
        };
        Fixture {
            _temp: temp,
            snapshot,
            sources,
            new_root,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_hardlinks_torrent_files_and_copies_the_rest() {
        let f = fixture();
        let report = StructureRestorer::new()
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();

        assert!(report.is_clean(), "{:?}", report.mismatches);
        assert_eq!(
            report.strategy_of("Season 01/episode01.mkv"),
            Some(RestoreStrategy::Hardlinked)
        );
        assert_eq!(
            report.strategy_of("Season 01/episode02.mkv"),
            Some(RestoreStrategy::Hardlinked)
        );
        assert_eq!(
            report.strategy_of("tvshow.nfo"),
            Some(RestoreStrategy::Copied)
        );
        assert_eq!(
            fs::read(f.new_root.join("Season 01/episode01.mkv")).unwrap(),
            b"first episode bytes"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_cross_device_hardlink_falls_back_to_copy() {
        let f = fixture();
        let restorer = StructureRestorer::with_linker(Arc::new(CrossDeviceFor("episode01.mkv")));
        let report = restorer
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(
            report.strategy_of("Season 01/episode01.mkv"),
            Some(RestoreStrategy::Copied)
        );
        assert_eq!(
            report.strategy_of("Season 01/episode02.mkv"),
            Some(RestoreStrategy::Hardlinked)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_twice_is_idempotent() {
        let f = fixture();
        let restorer = StructureRestorer::new();
        restorer
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();
        let second = restorer
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();

        assert!(second.is_clean());
        assert_eq!(second.directories_created, 0);
        assert_eq!(
            second.count(RestoreStrategy::AlreadyPresent),
            f.snapshot.files().count()
        );

        let recaptured = capture_blocking("1", &f.new_root, &[]).unwrap();
        assert_eq!(recaptured.nodes.len(), f.snapshot.nodes.len());
    }

    /// Writes half of the file, then fails like a crash mid-copy.
    struct TornCopy;

    impl FileLinker for TornCopy {
        fn hard_link(&self, source: &Path, destination: &Path) -> io::Result<()> {
            fs::hard_link(source, destination)
        }

        fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64> {
            let bytes = fs::read(source)?;
            fs::write(destination, &bytes[..bytes.len() / 2])?;
            Err(io::Error::other("interrupted mid-copy"))
        }
    }

    /// Hardlinks fail with a plain permission error.
    struct LinkDenied;

    impl FileLinker for LinkDenied {
        fn hard_link(&self, _source: &Path, _destination: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        }

        fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64> {
            fs::copy(source, destination)
        }
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[cfg(unix)]
    #[test]
    fn test_interrupted_copy_leaves_nothing_and_resume_completes() {
        let f = fixture();
        let err = StructureRestorer::with_linker(Arc::new(TornCopy))
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap_err();
        assert!(matches!(err, RestoreError::PathUnwritable { operation: "copy", .. }));
        assert!(!f.new_root.join("tvshow.nfo").exists());
        assert!(!entries(&f.new_root).iter().any(|n| n.ends_with(".cellar-partial")));

        let report = StructureRestorer::new()
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();
        assert!(report.is_clean(), "{:?}", report.mismatches);
        assert_eq!(
            report.strategy_of("tvshow.nfo"),
            Some(RestoreStrategy::Copied)
        );
        assert_eq!(fs::read(f.new_root.join("tvshow.nfo")).unwrap(), b"<tvshow/>");

        let again = StructureRestorer::new()
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();
        assert_eq!(
            again.count(RestoreStrategy::AlreadyPresent),
            f.snapshot.files().count()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_truncated_file_is_replaced_from_source() {
        let f = fixture();
        write(&f.new_root.join("tvshow.nfo"), b"<tvs");
        write(&f.new_root.join(".tvshow.nfo.cellar-partial"), b"<t");

        let report = StructureRestorer::new()
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();
        assert!(report.is_clean(), "{:?}", report.mismatches);
        assert_eq!(
            report.strategy_of("tvshow.nfo"),
            Some(RestoreStrategy::Copied)
        );
        assert_eq!(fs::read(f.new_root.join("tvshow.nfo")).unwrap(), b"<tvshow/>");
        assert!(!f.new_root.join(".tvshow.nfo.cellar-partial").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_file_is_kept_when_source_also_differs() {
        let f = fixture();
        write(&f.new_root.join("tvshow.nfo"), b"something else");
        write(&f.sources.original_root.join("tvshow.nfo"), b"edited since");

        let report = StructureRestorer::new()
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].path, "tvshow.nfo");
        assert_eq!(
            report.strategy_of("tvshow.nfo"),
            Some(RestoreStrategy::AlreadyPresent)
        );
        assert_eq!(
            fs::read(f.new_root.join("tvshow.nfo")).unwrap(),
            b"something else"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_error_on_hardlink_is_not_a_copy() {
        let f = fixture();
        let err = StructureRestorer::with_linker(Arc::new(LinkDenied))
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap_err();
        assert!(matches!(
            err,
            RestoreError::PathUnwritable {
                operation: "hard_link",
                ..
            }
        ));
        assert!(!f.new_root.join("Season 01/episode01.mkv").exists());
    }

    #[test]
    fn test_link_fallback_errors() {
        assert!(link_unsupported(&io::Error::new(
            io::ErrorKind::CrossesDevices,
            "x"
        )));
        assert!(link_unsupported(&io::Error::from_raw_os_error(EXDEV)));
        assert!(link_unsupported(&io::Error::from_raw_os_error(EPERM)));
        assert!(!link_unsupported(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "x"
        )));
        assert!(!link_unsupported(&io::Error::new(
            io::ErrorKind::AlreadyExists,
            "x"
        )));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_source_is_reported() {
        let mut f = fixture();
        fs::remove_file(f.sources.original_root.join("tvshow.nfo")).unwrap();
        f.sources.torrent_save_paths.clear();
        fs::remove_file(f.sources.original_root.join("Season 01/episode02.mkv")).unwrap();

        let report = StructureRestorer::new()
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();
        assert_eq!(
            report.strategy_of("tvshow.nfo"),
            Some(RestoreStrategy::Missing)
        );
        assert_eq!(
            report.strategy_of("Season 01/episode01.mkv"),
            Some(RestoreStrategy::Copied)
        );
        assert_eq!(report.mismatches.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_into_old_root_is_rewritten() {
        let mut f = fixture();
        f.snapshot.nodes.push(FileNode::symlink(
            "current",
            f.sources.original_root.join("Season 01"),
        ));
        f.snapshot
            .nodes
            .push(FileNode::symlink("relative", "Season 01"));

        let report = StructureRestorer::new()
            .restore_blocking(&f.snapshot, &f.new_root, &f.sources)
            .unwrap();
        assert_eq!(report.symlinks_created, 2);
        assert_eq!(
            fs::read_link(f.new_root.join("current")).unwrap(),
            f.new_root.join("Season 01")
        );
        assert_eq!(
            fs::read_link(f.new_root.join("relative")).unwrap(),
            PathBuf::from("Season 01")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restore_async() {
        let f = fixture();
        let report = StructureRestorer::new()
            .restore(&f.snapshot, &f.new_root, &f.sources)
            .await
            .unwrap();
        assert!(report.is_clean());
    }
}
