// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod fs;
pub mod limits;
pub mod paths;
pub mod plan;

pub use plan::{ActionKind, EditAction, EditKind, EditPlan, PlanError, PostCheckCommand};

use serde::{Deserialize, Serialize};

/// Exit code reported when no real exit status exists: the command was
/// denied, timed out, was cancelled, or never spawned.
///
/// Real exit codes are `0..=255` on unix, and signal terminations are
/// reported as `128 + signal`, so `-1` cannot collide with either.
pub const EXIT_CODE_SENTINEL: i32 = -1;

/// Name of the engine's state directory at the project root.
pub const STATE_DIR: &str = ".editgate";

/// Which bound terminated a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    WallClock,
    CpuTime,
}

/// Outcome of one command run through the sandbox.
///
/// Ordinary failure (non-zero exit, denial, timeout) is data, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_kind: Option<TimeoutKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_by_signal: Option<i32>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub denied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    /// The command matched a denial pattern but ran under an explicit override.
    #[serde(default)]
    pub denial_overridden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
    /// The command ran in its own network namespace, cut off from the host
    /// network.
    #[serde(default)]
    pub network_isolated: bool,
}

impl ExecResult {
    fn blank(command: &str) -> Self {
        Self {
            command: command.to_string(),
            exit_code: EXIT_CODE_SENTINEL,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration_ms: 0,
            timed_out: false,
            timeout_kind: None,
            terminated_by_signal: None,
            cancelled: false,
            denied: false,
            denial_reason: None,
            denial_overridden: false,
            spawn_error: None,
            network_isolated: false,
        }
    }

    /// Result for a command rejected before any process was spawned.
    pub fn denied(command: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            stderr: format!("Command blocked: {}", reason),
            denied: true,
            denial_reason: Some(reason),
            ..Self::blank(command)
        }
    }

    /// Result for a command whose process could not be started.
    pub fn spawn_failed(command: &str, error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            stderr: format!("Execution error: {}", error),
            spawn_error: Some(error),
            duration_ms,
            ..Self::blank(command)
        }
    }

    /// A completed, undisturbed run that exited zero.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
            && !self.denied
            && !self.timed_out
            && !self.cancelled
            && self.spawn_error.is_none()
    }
}

/// Unique identifier for snapshots.
///
/// Ids embed the creation time in microseconds, zero padded so that
/// lexicographic order matches creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    const PREFIX: &'static str = "snap-";

    pub fn from_micros(micros: i64) -> Self {
        SnapshotId(format!("{}{:020}", Self::PREFIX, micros.max(0)))
    }

    /// Creation time encoded in the id, if it is well formed.
    pub fn micros(&self) -> Option<i64> {
        let digits = self.0.strip_prefix(Self::PREFIX)?;
        if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn is_valid(&self) -> bool {
        self.micros().is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_ids_sort_by_creation_time() {
        let early = SnapshotId::from_micros(9_999);
        let late = SnapshotId::from_micros(1_700_000_000_000_000);
        assert!(early < late);
        assert_eq!(late.micros(), Some(1_700_000_000_000_000));
        assert!(!SnapshotId("snap-abc".into()).is_valid());
    }

    #[test]
    fn denied_result_uses_sentinel() {
        let result = ExecResult::denied("sudo ls", "Use of sudo detected");
        assert!(result.denied);
        assert_eq!(result.exit_code, EXIT_CODE_SENTINEL);
        assert!(!result.succeeded());
        assert!(result.stderr.contains("blocked"));
    }
}
