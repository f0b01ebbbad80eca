//! # editgate Core Engine
//!
//! Turns an edit plan into file mutations that are validated, applied as
//! one batch, and undoable, then runs verification commands in the sandbox.
//!
//! ## Architecture
//!
//! - **Patch Engine** ([`patch`], [`patch_parser`]): apply and create unified diffs
//! - **Snapshot Store** ([`snapshot`]): pre-batch captures, restore, pruning
//! - **Apply Coordinator** ([`apply`]): snapshot, mutate, commit or roll back
//! - **Post-Check Runner** ([`checks`]): verification commands after a commit
//! - **Engine** ([`engine`]): one session over a project root

pub mod apply;
pub mod checks;
pub mod config;
pub mod engine;
pub mod errors;
pub mod patch;
pub mod patch_parser;
pub mod snapshot;

pub use apply::{
    ActionError, ApplyCoordinator, ApplyResult, BatchResult, BatchState, SessionPhase,
    SessionState,
};
pub use checks::{detect_post_checks, PostCheckReport, PostCheckRunner};
pub use config::{ApplyConfig, CommandsConfig, EngineConfig, SnapshotConfig};
pub use engine::{Engine, UndoResult};
pub use errors::{CoreError, CoreResult, ErrorCategory};
pub use patch::{apply_patch, create_patch};
pub use snapshot::{Snapshot, SnapshotInfo, SnapshotStatus, SnapshotStore};
