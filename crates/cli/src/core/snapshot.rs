//! # Snapshot Management
//!
//! Pre-batch backups of every path a batch touches, kept under
//! `.editgate/snapshots/<id>/`:
//!
//! ```text
//! .editgate/
//!   LAST                      id of the last committed batch
//!   lock                      advisory lock held during apply and undo
//!   snapshots/
//!     snap-00001712345678901234/
//!       manifest.json         entries, hashes, status
//!       blobs/<sha256>        captured bytes, one file per distinct content
//! ```
//!
//! The manifest is written last, so a directory without one is an
//! interrupted capture and is ignored. Restores verify every blob against the
//! hash in the manifest before touching the project tree.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use editgate_common::fs::{remove_file_if_exists, AtomicWriter};
use editgate_common::paths::{ensure_contained, join_relative, relative_to};
use editgate_common::{SnapshotId, STATE_DIR};

use crate::core::errors::{CoreError, CoreResult};

const SNAPSHOTS_DIR: &str = "snapshots";
const BLOBS_DIR: &str = "blobs";
const MANIFEST_FILE: &str = "manifest.json";
const LAST_FILE: &str = "LAST";
const LOCK_FILE: &str = "lock";

/// Where a snapshot is in its batch's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// Captured; the batch has not finished yet.
    Pending,
    Committed,
    /// Used to roll its batch back. Kept for audit, never an undo target.
    RolledBack,
}

/// Pre-batch state of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryState {
    Present {
        sha256: String,
        size: u64,
        /// Unix permission bits, when the platform has them.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    /// The path was a symbolic link; restore recreates the link itself.
    Symlink { target: PathBuf },
    /// The path did not exist; restore deletes it.
    Absent {
        /// Topmost ancestor directory that did not exist either. Restore
        /// removes the directories up to it again if they are empty.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missing_ancestor: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Project-relative path.
    pub path: PathBuf,
    #[serde(flatten)]
    pub state: EntryState,
}

/// Manifest of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub created_at: DateTime<Utc>,
    pub status: SnapshotStatus,
    pub entries: Vec<SnapshotEntry>,
}

/// Listing row for [`SnapshotStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub created_at: DateTime<Utc>,
    pub status: SnapshotStatus,
    pub path_count: usize,
    /// Whether `undo` would restore this snapshot.
    pub is_last: bool,
}

/// Outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Exclusive advisory lock on the state directory, released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// On-disk snapshot storage for one project root.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    state_dir: PathBuf,
    snapshots_dir: PathBuf,
}

impl SnapshotStore {
    /// `root` must be canonical.
    pub fn new(root: &Path) -> Self {
        let state_dir = root.join(STATE_DIR);
        Self {
            root: root.to_path_buf(),
            snapshots_dir: state_dir.join(SNAPSHOTS_DIR),
            state_dir,
        }
    }

    fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir.join(id.as_str())
    }

    fn ensure_storage_dir(&self) -> CoreResult<()> {
        fs::create_dir_all(&self.snapshots_dir)
            .map_err(|e| CoreError::io(self.snapshots_dir.clone(), "create snapshot dir", e))
    }

    /// Take the state lock, failing immediately if another process holds it.
    pub fn lock(&self) -> CoreResult<StateLock> {
        fs::create_dir_all(&self.state_dir)
            .map_err(|e| CoreError::io(self.state_dir.clone(), "create state dir", e))?;
        let path = self.state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CoreError::io(path.clone(), "open lock file", e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(StateLock { file }),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                Err(CoreError::StateLocked { path })
            }
            Err(err) => Err(CoreError::io(path, "lock state dir", err)),
        }
    }

    /// Capture the current state of `paths` (absolute, inside the root).
    pub fn create(&self, paths: &[PathBuf]) -> CoreResult<Snapshot> {
        self.ensure_storage_dir()?;
        let (id, dir) = self.allocate_dir()?;

        match self.capture(&id, &dir, paths) {
            Ok(snapshot) => {
                info!(
                    target: "editgate::snapshot",
                    snapshot = %snapshot.id,
                    paths = snapshot.entries.len(),
                    "snapshot created"
                );
                Ok(snapshot)
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&dir);
                Err(err)
            }
        }
    }

    /// Reserve a fresh snapshot directory. Ids are strictly increasing even
    /// when the clock stalls or steps back.
    fn allocate_dir(&self) -> CoreResult<(SnapshotId, PathBuf)> {
        let mut micros = Utc::now().timestamp_micros();
        if let Some(newest) = self.snapshot_ids()?.last().and_then(SnapshotId::micros) {
            micros = micros.max(newest + 1);
        }
        loop {
            let id = SnapshotId::from_micros(micros);
            let dir = self.snapshot_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => micros += 1,
                Err(err) => return Err(CoreError::io(dir, "create snapshot", err)),
            }
        }
    }

    fn capture(&self, id: &SnapshotId, dir: &Path, paths: &[PathBuf]) -> CoreResult<Snapshot> {
        let blobs = dir.join(BLOBS_DIR);
        fs::create_dir_all(&blobs).map_err(|e| CoreError::io(blobs.clone(), "create blob dir", e))?;
        let writer = AtomicWriter::new().with_max_size(None);

        let mut entries = Vec::with_capacity(paths.len());
        for full in paths {
            let relative = relative_to(&self.root, full);
            let state = match fs::symlink_metadata(full) {
                Ok(meta) if meta.file_type().is_symlink() => match read_symlink(full) {
                    Some(target) => EntryState::Symlink {
                        target: target.map_err(|e| CoreError::io(full.clone(), "read link", e))?,
                    },
                    None => self.capture_file(&writer, &blobs, full)?,
                },
                Ok(_) => self.capture_file(&writer, &blobs, full)?,
                Err(err) if err.kind() == io::ErrorKind::NotFound => EntryState::Absent {
                    missing_ancestor: self.missing_ancestor(full),
                },
                Err(err) => return Err(CoreError::io(full.clone(), "stat", err)),
            };
            debug!(target: "editgate::snapshot", path = %relative.display(), "captured");
            entries.push(SnapshotEntry {
                path: relative,
                state,
            });
        }

        let snapshot = Snapshot {
            id: id.clone(),
            created_at: Utc::now(),
            status: SnapshotStatus::Pending,
            entries,
        };
        self.write_manifest(&snapshot)?;
        Ok(snapshot)
    }

    fn capture_file(&self, writer: &AtomicWriter, blobs: &Path, full: &Path) -> CoreResult<EntryState> {
        let meta = fs::metadata(full).map_err(|e| CoreError::io(full.to_path_buf(), "stat", e))?;
        if meta.is_dir() {
            return Err(CoreError::io(
                full.to_path_buf(),
                "snapshot",
                io::Error::new(io::ErrorKind::InvalidInput, "path is a directory"),
            ));
        }
        let bytes = fs::read(full).map_err(|e| CoreError::io(full.to_path_buf(), "read", e))?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let blob = blobs.join(&sha256);
        if !blob.exists() {
            writer
                .write(&blob, &bytes)
                .map_err(|e| CoreError::io(blob.clone(), "write blob", into_io(e)))?;
        }
        Ok(EntryState::Present {
            sha256,
            size: bytes.len() as u64,
            mode: file_mode(&meta),
        })
    }

    fn missing_ancestor(&self, full: &Path) -> Option<PathBuf> {
        let mut topmost = None;
        let mut ancestor = full.parent();
        while let Some(dir) = ancestor {
            if dir == self.root.as_path() || dir.exists() {
                break;
            }
            topmost = Some(relative_to(&self.root, dir));
            ancestor = dir.parent();
        }
        topmost
    }

    fn write_manifest(&self, snapshot: &Snapshot) -> CoreResult<()> {
        let path = self.snapshot_dir(&snapshot.id).join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| {
            CoreError::io(path.clone(), "serialize manifest", io::Error::other(e))
        })?;
        AtomicWriter::new()
            .with_max_size(None)
            .write(&path, &json)
            .map_err(|e| CoreError::io(path, "write manifest", into_io(e)))
    }

    /// Load a snapshot manifest.
    pub fn get(&self, id: &SnapshotId) -> CoreResult<Snapshot> {
        let path = self.snapshot_dir(id).join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::corrupt(id.as_str(), "manifest is missing"))
            }
            Err(err) => return Err(CoreError::io(path, "read manifest", err)),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::corrupt(id.as_str(), format!("unreadable manifest: {}", e)))?;
        if &snapshot.id != id {
            return Err(CoreError::corrupt(
                id.as_str(),
                format!("manifest belongs to {}", snapshot.id),
            ));
        }
        Ok(snapshot)
    }

    pub fn set_status(&self, snapshot: &mut Snapshot, status: SnapshotStatus) -> CoreResult<()> {
        snapshot.status = status;
        self.write_manifest(snapshot)
    }

    /// Put every captured path back to its pre-batch state.
    ///
    /// All blobs are verified first; a corrupt snapshot leaves the tree
    /// untouched. After that every entry is attempted even if one fails, and
    /// the first failure is returned.
    pub fn restore(&self, snapshot: &Snapshot) -> CoreResult<RestoreReport> {
        let blobs = self.snapshot_dir(&snapshot.id).join(BLOBS_DIR);
        let mut staged = Vec::with_capacity(snapshot.entries.len());
        for entry in &snapshot.entries {
            let full = join_relative(&self.root, &entry.path).map_err(|violation| {
                CoreError::corrupt(
                    snapshot.id.as_str(),
                    format!("entry '{}' is not restorable: {}", entry.path.display(), violation),
                )
            })?;
            let content = match &entry.state {
                EntryState::Present { sha256, .. } => {
                    Some(self.read_verified(&snapshot.id, &blobs, sha256)?)
                }
                EntryState::Symlink { .. } | EntryState::Absent { .. } => None,
            };
            staged.push((entry, full, content));
        }

        let writer = AtomicWriter::new().with_max_size(None);
        let mut report = RestoreReport::default();
        let mut first_error = None;
        for (entry, full, content) in staged {
            let outcome = self.restore_entry(&writer, entry, &full, content, &mut report);
            if let Err(err) = outcome {
                error!(
                    target: "editgate::snapshot",
                    snapshot = %snapshot.id,
                    path = %entry.path.display(),
                    error = %err,
                    "failed to restore path"
                );
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(
                    target: "editgate::snapshot",
                    snapshot = %snapshot.id,
                    restored = report.restored.len(),
                    removed = report.removed.len(),
                    "snapshot restored"
                );
                Ok(report)
            }
        }
    }

    fn restore_entry(
        &self,
        writer: &AtomicWriter,
        entry: &SnapshotEntry,
        full: &Path,
        content: Option<Vec<u8>>,
        report: &mut RestoreReport,
    ) -> CoreResult<()> {
        // The tree may have changed since capture; never follow a link out.
        ensure_contained(&self.root, full).map_err(|violation| CoreError::PathEscape {
            path: entry.path.clone(),
            violation,
        })?;
        let io_err = |err: io::Error| CoreError::io(full.to_path_buf(), "restore", err);

        match (&entry.state, content) {
            (EntryState::Present { mode, .. }, Some(bytes)) => {
                writer.write(full, &bytes).map_err(|e| io_err(into_io(e)))?;
                set_file_mode(full, *mode).map_err(io_err)?;
                report.restored.push(entry.path.clone());
            }
            (EntryState::Symlink { target }, _) => {
                remove_file_if_exists(full).map_err(io_err)?;
                make_symlink(target, full).map_err(io_err)?;
                report.restored.push(entry.path.clone());
            }
            (EntryState::Absent { missing_ancestor }, _) => {
                if remove_file_if_exists(full).map_err(io_err)? {
                    report.removed.push(entry.path.clone());
                }
                self.remove_created_dirs(&entry.path, missing_ancestor.as_deref());
            }
            (EntryState::Present { .. }, None) => {}
        }
        Ok(())
    }

    fn read_verified(&self, id: &SnapshotId, blobs: &Path, sha256: &str) -> CoreResult<Vec<u8>> {
        let path = blobs.join(sha256);
        let bytes = fs::read(&path)
            .map_err(|e| CoreError::corrupt(id.as_str(), format!("blob {}: {}", sha256, e)))?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != sha256 {
            return Err(CoreError::corrupt(
                id.as_str(),
                format!("blob {} hashes to {}", sha256, actual),
            ));
        }
        Ok(bytes)
    }

    /// Remove now-empty directories between the file and its recorded
    /// missing ancestor.
    fn remove_created_dirs(&self, relative: &Path, missing_ancestor: Option<&Path>) {
        let Some(stop) = missing_ancestor else {
            return;
        };
        let mut dir = relative.parent();
        while let Some(current) = dir {
            if current.as_os_str().is_empty() || fs::remove_dir(self.root.join(current)).is_err() {
                break;
            }
            if current == stop {
                break;
            }
            dir = current.parent();
        }
    }

    /// Snapshot ids on disk, oldest first. Directories without a manifest
    /// are skipped.
    fn snapshot_ids(&self) -> CoreResult<Vec<SnapshotId>> {
        let entries = match fs::read_dir(&self.snapshots_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CoreError::io(self.snapshots_dir.clone(), "read snapshot dir", err))
            }
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| CoreError::io(self.snapshots_dir.clone(), "read snapshot entry", e))?;
            let id = SnapshotId(entry.file_name().to_string_lossy().into_owned());
            if id.is_valid() && entry.path().join(MANIFEST_FILE).is_file() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// All snapshots, newest first.
    pub fn list(&self) -> CoreResult<Vec<SnapshotInfo>> {
        let last = self.last_committed()?;
        let mut infos = Vec::new();
        for id in self.snapshot_ids()?.into_iter().rev() {
            match self.get(&id) {
                Ok(snapshot) => infos.push(SnapshotInfo {
                    is_last: last.as_ref() == Some(&snapshot.id),
                    path_count: snapshot.entries.len(),
                    created_at: snapshot.created_at,
                    status: snapshot.status,
                    id: snapshot.id,
                }),
                Err(err) => {
                    warn!(target: "editgate::snapshot", snapshot = %id, error = %err, "skipping unreadable snapshot")
                }
            }
        }
        Ok(infos)
    }

    /// Delete all but the `retain` newest snapshots. The undo target is
    /// always kept. Returns the removed ids.
    pub fn prune(&self, retain: usize) -> CoreResult<Vec<SnapshotId>> {
        let last = self.last_committed()?;
        let ids = self.snapshot_ids()?;
        let mut removed = Vec::new();
        for id in ids.into_iter().rev().skip(retain) {
            if last.as_ref() == Some(&id) {
                continue;
            }
            let dir = self.snapshot_dir(&id);
            fs::remove_dir_all(&dir).map_err(|e| CoreError::io(dir, "remove snapshot", e))?;
            removed.push(id);
        }
        if !removed.is_empty() {
            info!(target: "editgate::snapshot", removed = removed.len(), retain, "snapshots pruned");
        }
        Ok(removed)
    }

    /// Id of the last committed batch, if its snapshot still exists.
    pub fn last_committed(&self) -> CoreResult<Option<SnapshotId>> {
        let path = self.state_dir.join(LAST_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CoreError::io(path, "read last pointer", err)),
        };
        let id = SnapshotId(raw.trim().to_string());
        if !id.is_valid() {
            return Err(CoreError::corrupt(id.as_str(), "LAST does not hold a snapshot id"));
        }
        if !self.snapshot_dir(&id).join(MANIFEST_FILE).is_file() {
            warn!(target: "editgate::snapshot", snapshot = %id, "last committed snapshot is gone");
            return Ok(None);
        }
        Ok(Some(id))
    }

    pub fn set_last_committed(&self, id: &SnapshotId) -> CoreResult<()> {
        let path = self.state_dir.join(LAST_FILE);
        AtomicWriter::new()
            .write(&path, format!("{}\n", id).as_bytes())
            .map_err(|e| CoreError::io(path, "write last pointer", into_io(e)))
    }
}

fn into_io(err: editgate_common::fs::SafeWriteError) -> io::Error {
    match err {
        editgate_common::fs::SafeWriteError::Io { source, .. } => source,
        other => io::Error::other(other.to_string()),
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

/// Link target of `path`, or `None` where links are followed instead.
#[cfg(unix)]
fn read_symlink(path: &Path) -> Option<io::Result<PathBuf>> {
    Some(fs::read_link(path))
}

#[cfg(not(unix))]
fn read_symlink(_path: &Path) -> Option<io::Result<PathBuf>> {
    None
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot recreate symlink {}", link.display()),
    ))
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}
