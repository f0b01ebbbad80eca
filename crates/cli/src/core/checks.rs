//! Post-apply verification commands.
//!
//! Checks run one after another through the command sandbox. A failing
//! check never stops the ones after it, and nothing is retried.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use editgate_common::{ExecResult, PostCheckCommand};
use editgate_sandbox::CommandSandbox;

use crate::core::config::CommandsConfig;

const STDERR_PREVIEW_LINES: usize = 5;

/// Results of one post-check run, in command order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostCheckReport {
    pub results: Vec<ExecResult>,
    /// Every command exited zero without being denied, timed out or cancelled.
    pub success: bool,
}

impl PostCheckReport {
    pub fn new(results: Vec<ExecResult>) -> Self {
        let success = results.iter().all(ExecResult::succeeded);
        Self { results, success }
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    /// Human-readable digest with the start of each failure's stderr.
    pub fn summary(&self) -> String {
        if self.results.is_empty() {
            return "No check commands ran".to_string();
        }

        let mut lines = vec![format!(
            "Ran {} check command(s): {} passed, {} failed",
            self.results.len(),
            self.passed(),
            self.failed()
        )];
        for result in &self.results {
            let ok = result.succeeded();
            lines.push(format!("{} {}", if ok { "ok  " } else { "FAIL" }, result.command));
            if !ok {
                for line in result.stderr.lines().take(STDERR_PREVIEW_LINES) {
                    lines.push(format!("  {}", line));
                }
            }
        }
        lines.join("\n")
    }
}

/// Drives check commands through a sandbox.
pub struct PostCheckRunner<'a> {
    sandbox: &'a CommandSandbox,
}

impl<'a> PostCheckRunner<'a> {
    pub fn new(sandbox: &'a CommandSandbox) -> Self {
        Self { sandbox }
    }

    pub fn run_all(&self, commands: &[PostCheckCommand]) -> PostCheckReport {
        let mut results = Vec::with_capacity(commands.len());
        for check in commands {
            let result = self.sandbox.run(&check.command, check.cwd.as_deref(), false);
            if result.succeeded() {
                info!(
                    target: "editgate::checks",
                    command = %check.command,
                    duration_ms = result.duration_ms,
                    "check passed"
                );
            } else {
                warn!(
                    target: "editgate::checks",
                    command = %check.command,
                    exit_code = result.exit_code,
                    timed_out = result.timed_out,
                    denied = result.denied,
                    "check failed"
                );
            }
            results.push(result);
        }
        PostCheckReport::new(results)
    }
}

/// Propose check commands for the project at `root`.
///
/// A configured lint command comes first. A configured test command replaces
/// marker-file detection entirely.
pub fn detect_post_checks(root: &Path, configured: &CommandsConfig) -> Vec<PostCheckCommand> {
    let mut commands = Vec::new();
    if let Some(lint) = non_empty(&configured.lint) {
        commands.push(PostCheckCommand::new(lint));
    }
    if let Some(test) = non_empty(&configured.test) {
        commands.push(PostCheckCommand::new(test));
        return commands;
    }

    if root.join("pytest.ini").exists() || root.join("tests").exists() || root.join("test").exists()
    {
        commands.push(PostCheckCommand::new("pytest -q"));
    }
    if has_npm_test_script(&root.join("package.json")) {
        commands.push(PostCheckCommand::new("npm test --silent"));
    }
    if root.join("go.mod").exists() {
        commands.push(PostCheckCommand::new("go test ./..."));
    }
    if root.join("Cargo.toml").exists() {
        commands.push(PostCheckCommand::new("cargo test --quiet"));
    }
    if root.join("spec").exists() {
        commands.push(PostCheckCommand::new("rspec"));
    } else if root.join("Rakefile").exists() {
        commands.push(PostCheckCommand::new("rake test"));
    }
    commands
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn has_npm_test_script(package_json: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(package_json) else {
        return false;
    };
    serde_json::from_str::<serde_json::Value>(&raw)
        .ok()
        .and_then(|value| value.get("scripts")?.get("test").cloned())
        .is_some()
}
