//! Session facade over the apply coordinator, snapshot store, command
//! sandbox and post-check runner for one project root.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use editgate_common::paths::canonical_root;
use editgate_common::{EditPlan, ExecResult, PostCheckCommand, SnapshotId};
use editgate_sandbox::{CancelHandle, CommandSandbox, SandboxError};

use crate::core::apply::{ApplyCoordinator, BatchResult, SessionState};
use crate::core::checks::{detect_post_checks, PostCheckReport, PostCheckRunner};
use crate::core::config::EngineConfig;
use crate::core::errors::{CoreError, CoreResult};
use crate::core::snapshot::{RestoreReport, SnapshotInfo, SnapshotStore};

/// What `undo` put back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndoResult {
    pub snapshot_id: SnapshotId,
    #[serde(flatten)]
    pub report: RestoreReport,
}

pub struct Engine {
    root: PathBuf,
    config: EngineConfig,
    store: SnapshotStore,
    sandbox: CommandSandbox,
    session: SessionState,
}

impl Engine {
    /// Open a session on `root`, which must be an existing directory. The
    /// undo target is picked up from disk.
    pub fn open(root: &Path, config: EngineConfig) -> CoreResult<Self> {
        config.validate()?;
        let root = canonical_root(root)
            .map_err(|e| CoreError::io(root.to_path_buf(), "open project root", e))?;
        let store = SnapshotStore::new(&root);
        let sandbox = CommandSandbox::new(&root, config.sandbox.clone()).map_err(|err| match err {
            SandboxError::Policy(policy) => CoreError::Config(policy.to_string()),
            SandboxError::Root { path, source } | SandboxError::Home { path, source } => {
                CoreError::io(path, "prepare sandbox", source)
            }
        })?;
        let session = SessionState::with_last_committed(store.last_committed()?);

        info!(
            target: "editgate::apply",
            root = %root.display(),
            last_committed = ?session.last_committed,
            "session opened"
        );
        Ok(Self {
            root,
            config,
            store,
            sandbox,
            session,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Apply `plan` as one batch, then run its post-checks if it committed.
    pub fn apply(&mut self, plan: &EditPlan) -> CoreResult<BatchResult> {
        let result = {
            let _lock = self.store.lock()?;
            ApplyCoordinator::new(
                &self.root,
                &self.store,
                &self.config.apply,
                self.config.snapshots.retain,
            )
            .apply(&mut self.session, plan)?
        };

        if result.committed() && self.config.apply.run_post_checks && !plan.post_checks.is_empty()
        {
            let report = self.run_post_checks(&plan.post_checks);
            return Ok(result.with_post_checks(report));
        }
        Ok(result)
    }

    /// Restore the last committed batch's snapshot. Repeating it without an
    /// apply in between restores the same snapshot again.
    pub fn undo(&mut self) -> CoreResult<UndoResult> {
        let _lock = self.store.lock()?;
        let id = self
            .session
            .last_committed
            .clone()
            .ok_or(CoreError::NoSnapshotAvailable)?;
        let snapshot = self.store.get(&id)?;
        let report = self.store.restore(&snapshot)?;
        info!(target: "editgate::apply", snapshot = %id, "undo complete");
        Ok(UndoResult {
            snapshot_id: id,
            report,
        })
    }

    /// Run one command in the sandbox. `cwd` is project-relative.
    pub fn exec(&self, command: &str, cwd: Option<&Path>, override_sandbox: bool) -> ExecResult {
        self.sandbox.run(command, cwd, override_sandbox)
    }

    pub fn run_post_checks(&self, commands: &[PostCheckCommand]) -> PostCheckReport {
        PostCheckRunner::new(&self.sandbox).run_all(commands)
    }

    /// Check commands suggested by the project's marker files and config.
    pub fn detect_post_checks(&self) -> Vec<PostCheckCommand> {
        detect_post_checks(&self.root, &self.config.commands)
    }

    /// Handle that aborts the command currently running in [`Engine::exec`]
    /// or a post-check, from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.sandbox.cancel_handle()
    }

    pub fn list_snapshots(&self) -> CoreResult<Vec<SnapshotInfo>> {
        self.store.list()
    }

    pub fn prune_snapshots(&self, retain: usize) -> CoreResult<Vec<SnapshotId>> {
        let _lock = self.store.lock()?;
        self.store.prune(retain)
    }
}
