//! # editgate
//!
//! Library side of the `editgate` binary: the plan-apply-undo engine.

pub mod core;

pub use core::{BatchResult, CoreError, CoreResult, Engine, EngineConfig};
pub use editgate_common::{EditAction, EditKind, EditPlan, ExecResult, PostCheckCommand, SnapshotId};
