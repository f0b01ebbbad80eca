//! # Engine Error Types
//!
//! Errors returned by the plan-apply-undo engine. Only whole-batch
//! preconditions and undo surface here; per-action and per-command failures
//! are reported as data in [`ApplyResult`](crate::core::apply::ApplyResult)
//! and [`ExecResult`](editgate_common::ExecResult).
//!
//! ## Error Categories
//!
//! - **Validation**: malformed plans and diffs
//! - **Security**: paths escaping the project root
//! - **State**: snapshot and session state problems
//! - **System**: I/O failures and configuration

use std::path::PathBuf;
use thiserror::Error;

use editgate_common::paths::PathViolation;
use editgate_common::PlanError;

/// Error categories for coarse classification and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Input validation failures and malformed data
    Validation,
    /// Containment violations
    Security,
    /// Engine state inconsistencies
    State,
    /// System-level errors (I/O, configuration)
    System,
}

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// E_PATH_ESCAPE - A planned path resolves outside the project root
    #[error("path '{}' escapes the project root: {violation}", .path.display())]
    PathEscape {
        path: PathBuf,
        violation: PathViolation,
    },

    /// E_PATCH_CONFLICT - A hunk does not match the target content
    #[error(
        "patch conflict in hunk {hunk} ({header}) at line {line}: expected {expected:?}, found {}",
        .found.as_deref().map(|f| format!("{:?}", f)).unwrap_or_else(|| "end of file".to_string())
    )]
    PatchConflict {
        /// One-based hunk number within the diff
        hunk: usize,
        /// The hunk's `@@ ... @@` header
        header: String,
        /// One-based line in the target content
        line: usize,
        expected: String,
        found: Option<String>,
    },

    /// E_INVALID_DIFF - Diff text cannot be parsed
    #[error("invalid diff: {reason}")]
    InvalidDiff {
        reason: String,
        /// One-based line in the diff text (if applicable)
        line_number: Option<usize>,
    },

    /// E_IO - Underlying read/write/rename failure
    #[error("I/O error during {operation}{}: {source}", .path.as_ref().map(|p| format!(" on '{}'", p.display())).unwrap_or_default())]
    Io {
        operation: String,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    /// E_NO_SNAPSHOT - Undo with nothing committed
    #[error("no snapshot available to undo")]
    NoSnapshotAvailable,

    /// E_SNAPSHOT_CORRUPT - Snapshot manifest or blob failed verification
    #[error("snapshot {snapshot_id} is corrupt: {reason}")]
    SnapshotCorrupt { snapshot_id: String, reason: String },

    /// E_INVALID_PLAN - Plan violates the payload rules for its action kinds
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    /// E_ALREADY_EXISTS - Create target exists and overwrite is not allowed
    #[error("'{}' already exists", .path.display())]
    AlreadyExists { path: PathBuf },

    /// E_NOT_FOUND - Patch or strict delete target is missing
    #[error("'{}' not found", .path.display())]
    NotFound { path: PathBuf },

    /// E_TOO_LARGE - Content exceeds the configured write limit
    #[error("content for '{}' is {size} bytes, above the {max} byte write limit", .path.display())]
    TooLarge { path: PathBuf, size: usize, max: usize },

    /// E_BATCH_IN_PROGRESS - A batch is still applying
    #[error("a batch is already being applied")]
    BatchInProgress,

    /// E_STATE_LOCKED - Another process holds the state lock
    #[error("engine state at '{}' is locked by another process", .path.display())]
    StateLocked { path: PathBuf },

    /// E_CONFIG - Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn io<P, S>(path: P, operation: S, source: std::io::Error) -> Self
    where
        P: Into<Option<PathBuf>>,
        S: Into<String>,
    {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    pub fn invalid_diff(reason: impl Into<String>, line_number: Option<usize>) -> Self {
        Self::InvalidDiff {
            reason: reason.into(),
            line_number,
        }
    }

    pub fn corrupt(snapshot_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SnapshotCorrupt {
            snapshot_id: snapshot_id.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::PathEscape { .. } => "E_PATH_ESCAPE",
            CoreError::PatchConflict { .. } => "E_PATCH_CONFLICT",
            CoreError::InvalidDiff { .. } => "E_INVALID_DIFF",
            CoreError::Io { .. } => "E_IO",
            CoreError::NoSnapshotAvailable => "E_NO_SNAPSHOT",
            CoreError::SnapshotCorrupt { .. } => "E_SNAPSHOT_CORRUPT",
            CoreError::InvalidPlan(_) => "E_INVALID_PLAN",
            CoreError::AlreadyExists { .. } => "E_ALREADY_EXISTS",
            CoreError::NotFound { .. } => "E_NOT_FOUND",
            CoreError::TooLarge { .. } => "E_TOO_LARGE",
            CoreError::BatchInProgress => "E_BATCH_IN_PROGRESS",
            CoreError::StateLocked { .. } => "E_STATE_LOCKED",
            CoreError::Config(_) => "E_CONFIG",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::PathEscape { .. } => ErrorCategory::Security,
            CoreError::PatchConflict { .. }
            | CoreError::InvalidDiff { .. }
            | CoreError::InvalidPlan(_)
            | CoreError::AlreadyExists { .. }
            | CoreError::NotFound { .. }
            | CoreError::TooLarge { .. } => ErrorCategory::Validation,
            CoreError::NoSnapshotAvailable
            | CoreError::SnapshotCorrupt { .. }
            | CoreError::BatchInProgress
            | CoreError::StateLocked { .. } => ErrorCategory::State,
            CoreError::Io { .. } | CoreError::Config(_) => ErrorCategory::System,
        }
    }

    /// Whether retrying after user action can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CoreError::SnapshotCorrupt { .. } | CoreError::Io { .. }
        )
    }

    /// Short actionable hints for the user.
    pub fn recovery_hints(&self) -> Vec<String> {
        match self {
            CoreError::PathEscape { .. } => {
                vec!["Use a project-relative path without '..' components.".to_string()]
            }
            CoreError::PatchConflict { .. } => vec![
                "Regenerate the diff against the current file content.".to_string(),
                "Use a replace action if the file changed substantially.".to_string(),
            ],
            CoreError::InvalidPlan(_) => vec![
                "Each edit needs a path, an action and that action's payload.".to_string(),
            ],
            CoreError::AlreadyExists { .. } => vec![
                "Use a replace action, or set apply.allow_create_overwrite = true.".to_string(),
            ],
            CoreError::NoSnapshotAvailable => {
                vec!["Apply a plan first; undo restores the last committed batch.".to_string()]
            }
            CoreError::StateLocked { .. } => {
                vec!["Wait for the other editgate process to finish.".to_string()]
            }
            _ => Vec::new(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(source: std::io::Error) -> Self {
        CoreError::io(None, "io", source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_categories_line_up() {
        let err = CoreError::PathEscape {
            path: PathBuf::from("../x"),
            violation: PathViolation::Traversal,
        };
        assert_eq!(err.error_code(), "E_PATH_ESCAPE");
        assert_eq!(err.category(), ErrorCategory::Security);
        assert!(err.to_string().contains("../x"));

        assert_eq!(CoreError::NoSnapshotAvailable.category(), ErrorCategory::State);
        assert!(!CoreError::corrupt("snap-1", "hash mismatch").is_recoverable());
    }

    #[test]
    fn plan_errors_convert_to_invalid_plan() {
        let err = CoreError::from(PlanError::EmptyPath);
        assert_eq!(err.error_code(), "E_INVALID_PLAN");
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.recovery_hints().is_empty());
    }

    #[test]
    fn conflict_message_names_the_hunk_and_line() {
        let err = CoreError::PatchConflict {
            hunk: 2,
            header: "@@ -10,3 +10,4 @@".to_string(),
            line: 11,
            expected: "fn main() {".to_string(),
            found: None,
        };
        let message = err.to_string();
        assert!(message.contains("hunk 2"));
        assert!(message.contains("line 11"));
        assert!(message.contains("end of file"));
    }
}
