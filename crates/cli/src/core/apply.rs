//! # Batch Application
//!
//! Applies an [`EditPlan`] as one all-or-nothing batch:
//!
//! ```text
//! PENDING -> SNAPSHOTTED -> APPLYING -> COMMITTED
//!                                    \-> ROLLED_BACK
//! ```
//!
//! Every path is validated before anything is captured or written. The
//! union of touched paths is snapshotted, actions run in plan order, and the
//! first failing action stops the batch and restores the snapshot. Each write
//! re-checks containment right before it happens and goes through a
//! temporary file plus rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use editgate_common::fs::{remove_file_if_exists, AtomicWriter, SafeWriteError};
use editgate_common::paths::{ensure_contained, resolve_within_root};
use editgate_common::{ActionKind, EditAction, EditKind, EditPlan, SnapshotId};

use crate::core::checks::PostCheckReport;
use crate::core::config::ApplyConfig;
use crate::core::errors::{CoreError, CoreResult};
use crate::core::patch::apply_patch;
use crate::core::snapshot::{Snapshot, SnapshotStatus, SnapshotStore};

/// Lifecycle of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Pending,
    Snapshotted,
    Applying,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Applying,
}

/// Per-session engine state, owned by the caller and threaded through the
/// coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    /// Snapshot `undo` restores.
    pub last_committed: Option<SnapshotId>,
    pub phase: SessionPhase,
}

impl SessionState {
    pub fn with_last_committed(last_committed: Option<SnapshotId>) -> Self {
        Self {
            last_committed,
            phase: SessionPhase::Idle,
        }
    }
}

/// Failure detail for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

impl From<&CoreError> for ActionError {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    pub path: PathBuf,
    pub kind: ActionKind,
    pub success: bool,
    /// The action never ran because an earlier one failed.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl ApplyResult {
    fn applied(action: &EditAction) -> Self {
        Self {
            path: action.path.clone(),
            kind: action.kind(),
            success: true,
            skipped: false,
            error: None,
        }
    }

    fn failed(action: &EditAction, err: &CoreError) -> Self {
        Self {
            success: false,
            error: Some(ActionError::from(err)),
            ..Self::applied(action)
        }
    }

    fn skipped(action: &EditAction) -> Self {
        Self {
            success: false,
            skipped: true,
            ..Self::applied(action)
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// Id of the batch's snapshot.
    pub batch_id: SnapshotId,
    pub state: BatchState,
    /// Committed, and every post-check (if any ran) passed.
    pub success: bool,
    pub actions: Vec<ApplyResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_checks: Option<PostCheckReport>,
    /// Set when restoring the snapshot after a failure went wrong too.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
}

impl BatchResult {
    pub fn committed(&self) -> bool {
        self.state == BatchState::Committed
    }

    /// Attach post-check results and fold them into `success`.
    pub fn with_post_checks(mut self, report: PostCheckReport) -> Self {
        self.success = self.committed() && report.success;
        self.post_checks = Some(report);
        self
    }
}

/// Sequences snapshot, mutation, and commit or rollback for one root.
pub struct ApplyCoordinator<'a> {
    root: &'a Path,
    store: &'a SnapshotStore,
    config: &'a ApplyConfig,
    retain: usize,
}

impl<'a> ApplyCoordinator<'a> {
    /// `root` must be canonical.
    pub fn new(root: &'a Path, store: &'a SnapshotStore, config: &'a ApplyConfig, retain: usize) -> Self {
        Self {
            root,
            store,
            config,
            retain,
        }
    }

    /// Apply `plan`. On commit, `session.last_committed` moves to the new
    /// batch.
    ///
    /// `Err` means nothing was touched: a path escaped the root, the session
    /// is mid-batch, or the snapshot could not be taken. Action failures come
    /// back as a rolled-back [`BatchResult`].
    pub fn apply(&self, session: &mut SessionState, plan: &EditPlan) -> CoreResult<BatchResult> {
        if session.phase == SessionPhase::Applying {
            return Err(CoreError::BatchInProgress);
        }
        session.phase = SessionPhase::Applying;
        let outcome = self.run_batch(plan);
        session.phase = SessionPhase::Idle;

        let result = outcome?;
        if result.committed() {
            session.last_committed = Some(result.batch_id.clone());
        }
        Ok(result)
    }

    fn run_batch(&self, plan: &EditPlan) -> CoreResult<BatchResult> {
        debug!(target: "editgate::apply", state = ?BatchState::Pending, edits = plan.edits.len(), "batch received");
        let resolved = self.validate(plan)?;

        let mut touched: Vec<PathBuf> = Vec::with_capacity(resolved.len());
        for path in &resolved {
            if !touched.contains(path) {
                touched.push(path.clone());
            }
        }
        let mut snapshot = self.store.create(&touched)?;
        info!(target: "editgate::apply", batch = %snapshot.id, state = ?BatchState::Snapshotted, paths = touched.len(), "batch snapshotted");

        info!(target: "editgate::apply", batch = %snapshot.id, state = ?BatchState::Applying, "applying batch");
        let mut actions = Vec::with_capacity(plan.edits.len());
        let mut failure = None;
        for (action, full) in plan.edits.iter().zip(&resolved) {
            if failure.is_some() {
                actions.push(ApplyResult::skipped(action));
                continue;
            }
            match self.apply_action(action, full) {
                Ok(()) => {
                    debug!(target: "editgate::apply", path = %action.path.display(), kind = %action.kind(), "action applied");
                    actions.push(ApplyResult::applied(action));
                }
                Err(err) => {
                    warn!(
                        target: "editgate::apply",
                        batch = %snapshot.id,
                        path = %action.path.display(),
                        kind = %action.kind(),
                        error = %err,
                        "action failed, rolling back"
                    );
                    actions.push(ApplyResult::failed(action, &err));
                    failure = Some(err);
                }
            }
        }

        if failure.is_none() {
            // An unrecorded commit is rolled back like a failed action.
            if let Err(err) = self.commit(&mut snapshot) {
                error!(target: "editgate::apply", batch = %snapshot.id, error = %err, "commit failed");
                failure = Some(err);
            }
        }

        if failure.is_some() {
            let rollback_error = match self.store.restore(&snapshot) {
                Ok(_) => None,
                Err(err) => {
                    error!(target: "editgate::apply", batch = %snapshot.id, error = %err, "rollback failed");
                    Some(err.to_string())
                }
            };
            if let Err(err) = self.store.set_status(&mut snapshot, SnapshotStatus::RolledBack) {
                warn!(target: "editgate::apply", batch = %snapshot.id, error = %err, "could not mark snapshot rolled back");
            }
            info!(target: "editgate::apply", batch = %snapshot.id, state = ?BatchState::RolledBack, "batch rolled back");
            return Ok(BatchResult {
                batch_id: snapshot.id,
                state: BatchState::RolledBack,
                success: false,
                actions,
                post_checks: None,
                rollback_error,
            });
        }

        info!(target: "editgate::apply", batch = %snapshot.id, state = ?BatchState::Committed, "batch committed");
        if let Err(err) = self.store.prune(self.retain) {
            warn!(target: "editgate::apply", error = %err, "snapshot pruning failed");
        }

        Ok(BatchResult {
            batch_id: snapshot.id,
            state: BatchState::Committed,
            success: true,
            actions,
            post_checks: None,
            rollback_error: None,
        })
    }

    fn commit(&self, snapshot: &mut Snapshot) -> CoreResult<()> {
        self.store.set_status(snapshot, SnapshotStatus::Committed)?;
        self.store.set_last_committed(&snapshot.id)
    }

    /// Resolve every planned path, in plan order. Any violation rejects the
    /// whole plan.
    fn validate(&self, plan: &EditPlan) -> CoreResult<Vec<PathBuf>> {
        plan.edits
            .iter()
            .map(|action| {
                resolve_within_root(self.root, &action.path).map_err(|violation| {
                    warn!(target: "editgate::apply", path = %action.path.display(), %violation, "path rejected");
                    CoreError::PathEscape {
                        path: action.path.clone(),
                        violation,
                    }
                })
            })
            .collect()
    }

    fn apply_action(&self, action: &EditAction, full: &Path) -> CoreResult<()> {
        match &action.edit {
            EditKind::Create { content } => {
                if fs::symlink_metadata(full).is_ok() && !self.config.allow_create_overwrite {
                    return Err(CoreError::AlreadyExists {
                        path: action.path.clone(),
                    });
                }
                self.write(action, full, content)
            }
            EditKind::Patch { diff } => {
                let original = match fs::read(full) {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        return Err(CoreError::NotFound {
                            path: action.path.clone(),
                        })
                    }
                    Err(err) => return Err(CoreError::io(full.to_path_buf(), "read", err)),
                };
                let original = String::from_utf8(original).map_err(|_| {
                    CoreError::io(
                        full.to_path_buf(),
                        "read",
                        io::Error::new(io::ErrorKind::InvalidData, "file is not valid UTF-8"),
                    )
                })?;
                let patched = apply_patch(&original, diff)?;
                self.write(action, full, &patched)
            }
            EditKind::Replace { content } => self.write(action, full, content),
            EditKind::Delete => {
                self.recheck(action, full)?;
                let removed = remove_file_if_exists(full)
                    .map_err(|e| CoreError::io(full.to_path_buf(), "delete", e))?;
                if !removed && self.config.strict_delete {
                    return Err(CoreError::NotFound {
                        path: action.path.clone(),
                    });
                }
                Ok(())
            }
        }
    }

    fn recheck(&self, action: &EditAction, full: &Path) -> CoreResult<()> {
        ensure_contained(self.root, full).map_err(|violation| CoreError::PathEscape {
            path: action.path.clone(),
            violation,
        })
    }

    fn write(&self, action: &EditAction, full: &Path, content: &str) -> CoreResult<()> {
        self.recheck(action, full)?;
        AtomicWriter::new()
            .with_max_size(Some(self.config.max_write_bytes))
            .write(full, content.as_bytes())
            .map_err(|err| match err {
                SafeWriteError::TooLarge { size, max } => CoreError::TooLarge {
                    path: action.path.clone(),
                    size,
                    max,
                },
                SafeWriteError::Io {
                    path,
                    operation,
                    source,
                } => CoreError::io(path, operation, source),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use editgate_common::paths::canonical_root;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: SnapshotStore,
        config: ApplyConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = canonical_root(dir.path()).unwrap();
            let store = SnapshotStore::new(&root);
            Self {
                _dir: dir,
                root,
                store,
                config: ApplyConfig::default(),
            }
        }

        fn apply(&self, session: &mut SessionState, plan: &EditPlan) -> CoreResult<BatchResult> {
            ApplyCoordinator::new(&self.root, &self.store, &self.config, 20).apply(session, plan)
        }

        fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.root.join(rel)).unwrap()
        }
    }

    #[test]
    fn create_then_patch_in_one_batch() {
        let fx = Fixture::new();
        let mut session = SessionState::default();
        let plan = EditPlan::new(vec![
            EditAction::create("src/lib.rs", "fn a() {}\n"),
            EditAction::patch("src/lib.rs", "@@ -1 +1,2 @@\n fn a() {}\n+fn b() {}\n"),
        ]);

        let result = fx.apply(&mut session, &plan).unwrap();
        assert_eq!(result.state, BatchState::Committed);
        assert!(result.success);
        assert_eq!(fx.read("src/lib.rs"), "fn a() {}\nfn b() {}\n");
        assert_eq!(session.last_committed, Some(result.batch_id.clone()));
        assert_eq!(fx.store.last_committed().unwrap(), Some(result.batch_id));
        assert_eq!(session.phase, SessionPhase::Idle);
    }

    #[test]
    fn failing_action_rolls_back_and_skips_the_rest() {
        let fx = Fixture::new();
        fs::write(fx.root.join("a.txt"), "a\n").unwrap();
        let mut session = SessionState::default();
        let plan = EditPlan::new(vec![
            EditAction::replace("a.txt", "changed\n"),
            EditAction::create("new.txt", "n\n"),
            EditAction::patch("a.txt", "@@ -1 +1 @@\n-nope\n+x\n"),
            EditAction::delete("a.txt"),
        ]);

        let result = fx.apply(&mut session, &plan).unwrap();
        assert_eq!(result.state, BatchState::RolledBack);
        assert!(!result.success);
        assert!(result.rollback_error.is_none());
        assert_eq!(fx.read("a.txt"), "a\n");
        assert!(!fx.root.join("new.txt").exists());

        let codes: Vec<_> = result
            .actions
            .iter()
            .map(|a| a.error.as_ref().map(|e| e.code.as_str()))
            .collect();
        assert_eq!(codes, vec![None, None, Some("E_PATCH_CONFLICT"), None]);
        assert!(result.actions[3].skipped);
        assert!(session.last_committed.is_none());
        assert_eq!(
            fx.store.get(&result.batch_id).unwrap().status,
            SnapshotStatus::RolledBack
        );
    }

    #[test]
    fn escaping_path_rejects_the_batch_before_any_snapshot() {
        let fx = Fixture::new();
        let mut session = SessionState::default();
        let plan = EditPlan::new(vec![
            EditAction::create("ok.txt", "x"),
            EditAction::replace("../outside.txt", "x"),
        ]);

        let err = fx.apply(&mut session, &plan).unwrap_err();
        assert_eq!(err.error_code(), "E_PATH_ESCAPE");
        assert!(!fx.root.join("ok.txt").exists());
        assert!(fx.store.list().unwrap().is_empty());
        assert_eq!(session.phase, SessionPhase::Idle);
    }

    #[test]
    fn create_over_existing_file_follows_policy() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("a.txt"), "old").unwrap();
        let plan = EditPlan::new(vec![EditAction::create("a.txt", "new")]);

        let result = fx.apply(&mut SessionState::default(), &plan).unwrap();
        assert_eq!(result.actions[0].error.as_ref().unwrap().code, "E_ALREADY_EXISTS");
        assert_eq!(fx.read("a.txt"), "old");

        fx.config.allow_create_overwrite = true;
        let result = fx.apply(&mut SessionState::default(), &plan).unwrap();
        assert!(result.committed());
        assert_eq!(fx.read("a.txt"), "new");
    }

    #[test]
    fn delete_of_missing_file_follows_policy() {
        let mut fx = Fixture::new();
        let plan = EditPlan::new(vec![EditAction::delete("ghost.txt")]);
        assert!(fx.apply(&mut SessionState::default(), &plan).unwrap().success);

        fx.config.strict_delete = true;
        let result = fx.apply(&mut SessionState::default(), &plan).unwrap();
        assert_eq!(result.actions[0].error.as_ref().unwrap().code, "E_NOT_FOUND");
    }

    #[test]
    fn oversized_write_fails_the_action() {
        let mut fx = Fixture::new();
        fx.config.max_write_bytes = 4;
        let plan = EditPlan::new(vec![EditAction::create("big.txt", "12345")]);
        let result = fx.apply(&mut SessionState::default(), &plan).unwrap();
        assert_eq!(result.actions[0].error.as_ref().unwrap().code, "E_TOO_LARGE");
        assert!(!fx.root.join("big.txt").exists());
    }

    #[test]
    fn session_mid_batch_refuses_another() {
        let fx = Fixture::new();
        let mut session = SessionState {
            phase: SessionPhase::Applying,
            ..SessionState::default()
        };
        let err = fx.apply(&mut session, &EditPlan::default()).unwrap_err();
        assert!(matches!(err, CoreError::BatchInProgress));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_swapped_in_after_validation_is_caught_on_write() {
        let fx = Fixture::new();
        let outside = tempfile::tempdir().unwrap();
        fs::create_dir(fx.root.join("dir")).unwrap();
        let action = EditAction::replace("dir/file.txt", "x");
        let full = resolve_within_root(&fx.root, &action.path).unwrap();

        fs::remove_dir(fx.root.join("dir")).unwrap();
        std::os::unix::fs::symlink(outside.path(), fx.root.join("dir")).unwrap();

        let coordinator = ApplyCoordinator::new(&fx.root, &fx.store, &fx.config, 20);
        let err = coordinator.apply_action(&action, &full).unwrap_err();
        assert_eq!(err.error_code(), "E_PATH_ESCAPE");
        assert!(!outside.path().join("file.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn rollback_does_not_follow_a_symlink_out_of_the_root() {
        let fx = Fixture::new();
        let outside = tempfile::tempdir().unwrap();
        fs::create_dir(fx.root.join("dir")).unwrap();
        fs::write(fx.root.join("dir/file.txt"), "original").unwrap();
        let snapshot = fx.store.create(&[fx.root.join("dir/file.txt")]).unwrap();

        fs::remove_dir_all(fx.root.join("dir")).unwrap();
        std::os::unix::fs::symlink(outside.path(), fx.root.join("dir")).unwrap();

        let err = fx.store.restore(&snapshot).unwrap_err();
        assert_eq!(err.error_code(), "E_PATH_ESCAPE");
        assert!(!outside.path().join("file.txt").exists());
    }
}
