//! Edit plans as handed over by the planner.
//!
//! Plans arrive as JSON and are untrusted. Deserialization converts each
//! wire-level edit into the closed [`EditKind`] sum type, so a plan that
//! reaches the coordinator always carries the payload its kind requires.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Discriminant of an [`EditKind`], used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Patch,
    Replace,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Patch => "patch",
            ActionKind::Replace => "replace",
            ActionKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action does to its path, with the payload that kind needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditKind {
    Create { content: String },
    Patch { diff: String },
    Replace { content: String },
    Delete,
}

impl EditKind {
    pub fn kind(&self) -> ActionKind {
        match self {
            EditKind::Create { .. } => ActionKind::Create,
            EditKind::Patch { .. } => ActionKind::Patch,
            EditKind::Replace { .. } => ActionKind::Replace,
            EditKind::Delete => ActionKind::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("edit action has an empty path")]
    EmptyPath,

    #[error("unknown action '{action}' for {path}")]
    UnknownAction { path: String, action: String },

    #[error("{kind} action for {path} requires {field}")]
    MissingPayload {
        path: String,
        kind: ActionKind,
        field: &'static str,
    },

    #[error("{kind} action for {path} must not carry {field}")]
    UnexpectedPayload {
        path: String,
        kind: ActionKind,
        field: &'static str,
    },
}

/// One unit of file mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEditAction", into = "RawEditAction")]
pub struct EditAction {
    /// Project-relative path.
    pub path: PathBuf,
    pub edit: EditKind,
    pub justification: String,
}

impl EditAction {
    pub fn new(path: impl Into<PathBuf>, edit: EditKind) -> Self {
        Self {
            path: path.into(),
            edit,
            justification: String::new(),
        }
    }

    pub fn create(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self::new(
            path,
            EditKind::Create {
                content: content.into(),
            },
        )
    }

    pub fn patch(path: impl Into<PathBuf>, diff: impl Into<String>) -> Self {
        Self::new(path, EditKind::Patch { diff: diff.into() })
    }

    pub fn replace(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self::new(
            path,
            EditKind::Replace {
                content: content.into(),
            },
        )
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self::new(path, EditKind::Delete)
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = justification.into();
        self
    }

    pub fn kind(&self) -> ActionKind {
        self.edit.kind()
    }
}

/// Wire form of an edit action, as emitted by the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEditAction {
    pub path: String,
    pub action: String,
    #[serde(default)]
    pub justification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_unified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TryFrom<RawEditAction> for EditAction {
    type Error = PlanError;

    fn try_from(raw: RawEditAction) -> Result<Self, Self::Error> {
        if raw.path.trim().is_empty() {
            return Err(PlanError::EmptyPath);
        }
        let path = raw.path;
        let kind = match raw.action.trim().to_ascii_lowercase().as_str() {
            "create" => ActionKind::Create,
            "patch" => ActionKind::Patch,
            "replace" => ActionKind::Replace,
            "delete" => ActionKind::Delete,
            _ => {
                return Err(PlanError::UnknownAction {
                    path,
                    action: raw.action,
                })
            }
        };

        let diff = non_blank(raw.patch_unified);
        let edit = match kind {
            ActionKind::Patch => {
                if non_blank(raw.content).is_some() {
                    return Err(PlanError::UnexpectedPayload {
                        path,
                        kind,
                        field: "content",
                    });
                }
                let diff = diff.ok_or_else(|| PlanError::MissingPayload {
                    path: path.clone(),
                    kind,
                    field: "a non-empty patch_unified diff",
                })?;
                EditKind::Patch { diff }
            }
            ActionKind::Create | ActionKind::Replace => {
                if diff.is_some() {
                    return Err(PlanError::UnexpectedPayload {
                        path,
                        kind,
                        field: "patch_unified",
                    });
                }
                let content = raw.content.ok_or_else(|| PlanError::MissingPayload {
                    path: path.clone(),
                    kind,
                    field: "content",
                })?;
                if kind == ActionKind::Create {
                    EditKind::Create { content }
                } else {
                    EditKind::Replace { content }
                }
            }
            ActionKind::Delete => {
                let field = if diff.is_some() {
                    Some("patch_unified")
                } else if non_blank(raw.content).is_some() {
                    Some("content")
                } else {
                    None
                };
                if let Some(field) = field {
                    return Err(PlanError::UnexpectedPayload { path, kind, field });
                }
                EditKind::Delete
            }
        };

        Ok(EditAction {
            path: PathBuf::from(path),
            edit,
            justification: raw.justification,
        })
    }
}

impl From<EditAction> for RawEditAction {
    fn from(action: EditAction) -> Self {
        let mut raw = RawEditAction {
            path: action.path.to_string_lossy().into_owned(),
            action: action.kind().as_str().to_string(),
            justification: action.justification,
            ..RawEditAction::default()
        };
        match action.edit {
            EditKind::Create { content } | EditKind::Replace { content } => {
                raw.content = Some(content)
            }
            EditKind::Patch { diff } => raw.patch_unified = Some(diff),
            EditKind::Delete => {}
        }
        raw
    }
}

/// A verification command to run after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCheckCommand {
    pub command: String,
    /// Project-relative working directory; the project root when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl PostCheckCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Ordered edit actions plus the checks to run once they are committed.
///
/// Action order is application order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default)]
    pub edits: Vec<EditAction>,
    #[serde(default)]
    pub post_checks: Vec<PostCheckCommand>,
}

impl EditPlan {
    pub fn new(edits: Vec<EditAction>) -> Self {
        Self {
            intent: None,
            edits,
            post_checks: Vec::new(),
        }
    }

    pub fn with_post_checks(mut self, post_checks: Vec<PostCheckCommand>) -> Self {
        self.post_checks = post_checks;
        self
    }

    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Short listing of the plan for display before applying it.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if let Some(intent) = &self.intent {
            lines.push(format!("Intent: {}", intent));
            lines.push(String::new());
        }
        lines.push(format!("Edits ({}):", self.edits.len()));
        for edit in &self.edits {
            lines.push(format!("  {:8} {}", edit.kind().as_str(), edit.path.display()));
            if !edit.justification.is_empty() {
                lines.push(format!("           {}", edit.justification));
            }
        }
        if !self.post_checks.is_empty() {
            lines.push(String::new());
            lines.push(format!("Post-checks ({}):", self.post_checks.len()));
            for check in &self.post_checks {
                match &check.cwd {
                    Some(cwd) => lines.push(format!("  $ {} (in {})", check.command, cwd.display())),
                    None => lines.push(format!("  $ {}", check.command)),
                }
            }
        }
        lines.join("\n")
    }
}
