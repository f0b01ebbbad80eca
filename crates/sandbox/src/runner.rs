use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use editgate_common::paths::{canonical_root, resolve_within_root};
use editgate_common::{ExecResult, TimeoutKind, EXIT_CODE_SENTINEL, STATE_DIR};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{self, ProcessHandle, SandboxBackend};
use crate::capture::{append_within, CapturedOutput, OutputCapture};
use crate::deny::DenyList;
use crate::policy::{PolicyError, SandboxPolicy};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("invalid project root {}: {source}", .path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare sandbox home {}: {source}", .path.display())]
    Home {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Cloneable flag that aborts the command currently running in a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

/// Runs shell commands inside the project root under a [`SandboxPolicy`].
#[derive(Debug)]
pub struct CommandSandbox {
    root: PathBuf,
    home: PathBuf,
    policy: SandboxPolicy,
    deny: DenyList,
    cancel: CancelHandle,
}

impl CommandSandbox {
    pub fn new(root: &Path, policy: SandboxPolicy) -> Result<Self, SandboxError> {
        policy.validate()?;
        let deny = DenyList::new(&policy.extra_deny_patterns)?;
        let root = canonical_root(root).map_err(|source| SandboxError::Root {
            path: root.to_path_buf(),
            source,
        })?;
        let home = root.join(STATE_DIR).join("home");
        create_private_dir(&home).map_err(|source| SandboxError::Home {
            path: home.clone(),
            source,
        })?;

        Ok(Self {
            root,
            home,
            policy,
            deny,
            cancel: CancelHandle::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run `command` through the shell.
    ///
    /// `cwd` is project-relative (or absolute inside the root) and defaults to
    /// the policy's working directory. `override_denial` lets a command that
    /// matches a deny pattern, or a cwd outside the root, run anyway.
    pub fn run(&self, command: &str, cwd: Option<&Path>, override_denial: bool) -> ExecResult {
        self.cancel.reset();
        let started = Instant::now();

        let mut overridden = false;
        if let Some(reason) = self.deny.check(command) {
            if !override_denial {
                info!(target: "editgate::sandbox", command, reason, "command denied");
                return ExecResult::denied(command, reason);
            }
            warn!(
                target: "editgate::sandbox",
                command,
                reason,
                "running denied command under explicit override"
            );
            overridden = true;
        }

        let workdir = match self.resolve_cwd(cwd) {
            Ok(dir) => dir,
            Err(reason) if !override_denial => {
                info!(target: "editgate::sandbox", command, reason = %reason, "working directory denied");
                return ExecResult::denied(command, reason);
            }
            Err(reason) => {
                warn!(
                    target: "editgate::sandbox",
                    command,
                    reason = %reason,
                    "using working directory outside the project root under explicit override"
                );
                overridden = true;
                cwd.or(self.policy.working_dir.as_deref())
                    .map(|dir| self.root.join(dir))
                    .unwrap_or_else(|| self.root.clone())
            }
        };

        let mut result = self.execute(command, &workdir, started);
        result.denial_overridden = overridden;
        result
    }

    fn resolve_cwd(&self, cwd: Option<&Path>) -> Result<PathBuf, String> {
        let requested = match cwd.or(self.policy.working_dir.as_deref()) {
            None => return Ok(self.root.clone()),
            Some(dir) => dir,
        };

        let candidate = if requested.is_absolute() {
            match requested.canonicalize() {
                Ok(dir) if dir.starts_with(&self.root) => dir,
                _ => {
                    return Err(format!(
                        "working directory {} is outside the project root",
                        requested.display()
                    ))
                }
            }
        } else if requested.as_os_str().is_empty() || requested == Path::new(".") {
            self.root.clone()
        } else {
            resolve_within_root(&self.root, requested).map_err(|violation| {
                format!("working directory {}: {}", requested.display(), violation)
            })?
        };

        if !candidate.is_dir() {
            return Err(format!(
                "working directory {} does not exist",
                requested.display()
            ));
        }
        Ok(candidate)
    }

    fn environment(&self) -> Vec<(OsString, OsString)> {
        let mut env = Vec::new();
        for name in &self.policy.env_allowlist {
            if let Some(value) = std::env::var_os(name) {
                env.push((OsString::from(name), value));
            }
        }
        if !env.iter().any(|(k, _)| k == "PATH") {
            env.push(("PATH".into(), DEFAULT_PATH.into()));
        }
        if !env.iter().any(|(k, _)| k == "HOME") {
            env.push(("HOME".into(), self.home.clone().into_os_string()));
        }
        for (name, value) in &self.policy.extra_env {
            env.retain(|(k, _)| k != name.as_str());
            env.push((name.into(), value.into()));
        }
        env
    }

    fn execute(&self, command: &str, workdir: &Path, started: Instant) -> ExecResult {
        let mut cmd = backend::shell_command(command);
        cmd.current_dir(workdir)
            .env_clear()
            .envs(self.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let limits = self.policy.resource_limits();
        let spawned = backend::platform_backend().and_then(|mut b| b.spawn(cmd, &limits));
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(target: "editgate::sandbox", command, error = %err, "spawn failed");
                return ExecResult::spawn_failed(command, err.to_string(), elapsed_ms(started));
            }
        };
        let network_isolated = child.network_isolated();
        debug!(
            target: "editgate::sandbox",
            command,
            pid = child.id(),
            cwd = %workdir.display(),
            network_isolated,
            "spawned"
        );

        let limit = self.policy.max_output_bytes;
        let stdout = child.take_stdout().map(|p| OutputCapture::spawn(p, limit));
        let stderr = child.take_stderr().map(|p| OutputCapture::spawn(p, limit));

        let outcome = self.wait_for(&mut child, started);

        // Descendants that outlived the shell would otherwise keep the pipes
        // open and keep running.
        if let Err(err) = child.terminate_tree() {
            debug!(target: "editgate::sandbox", error = %err, "terminate_tree failed");
        }
        let outcome = match outcome {
            Outcome::Exited(status) => Outcome::Exited(status),
            other => {
                let _ = child.wait();
                other
            }
        };

        let drain_deadline = Instant::now() + self.policy.reap_grace();
        let stdout = collect(stdout, drain_deadline);
        let stderr = collect(stderr, drain_deadline);

        let mut result = ExecResult {
            command: command.to_string(),
            exit_code: EXIT_CODE_SENTINEL,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            stdout: stdout.text,
            stderr: stderr.text,
            duration_ms: elapsed_ms(started),
            timed_out: false,
            timeout_kind: None,
            terminated_by_signal: None,
            cancelled: false,
            denied: false,
            denial_reason: None,
            denial_overridden: false,
            spawn_error: None,
            network_isolated,
        };

        match outcome {
            Outcome::Exited(status) => {
                let info = backend::exit_info(status);
                if info.cpu_limit_hit {
                    result.timed_out = true;
                    result.timeout_kind = Some(TimeoutKind::CpuTime);
                    result.terminated_by_signal = info.signal;
                    let note = format!(
                        "[command exceeded the {}s CPU time limit]",
                        self.policy.cpu_time_secs
                    );
                    append_note(&mut result.stderr, &note, limit);
                } else if let Some(code) = info.code {
                    result.exit_code = code;
                } else if let Some(signal) = info.signal {
                    result.exit_code = 128 + signal;
                    result.terminated_by_signal = Some(signal);
                }
            }
            Outcome::TimedOut => {
                result.timed_out = true;
                result.timeout_kind = Some(TimeoutKind::WallClock);
                let note = format!("[command timed out after {}s]", self.policy.wall_timeout_secs);
                append_note(&mut result.stderr, &note, limit);
            }
            Outcome::Cancelled => {
                result.cancelled = true;
                append_note(&mut result.stderr, "[command cancelled]", limit);
            }
            Outcome::WaitFailed(err) => {
                result.spawn_error = Some(err.to_string());
                append_note(&mut result.stderr, &format!("Execution error: {}", err), limit);
            }
        }

        debug!(
            target: "editgate::sandbox",
            command,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            cancelled = result.cancelled,
            duration_ms = result.duration_ms,
            "finished"
        );
        result
    }

    fn wait_for<C: ProcessHandle>(&self, child: &mut C, started: Instant) -> Outcome {
        let deadline = started + self.policy.wall_timeout();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Outcome::Exited(status),
                Ok(None) => {}
                Err(err) => return Outcome::WaitFailed(err),
            }
            if self.cancel.is_cancelled() {
                info!(target: "editgate::sandbox", pid = child.id(), "cancelling command");
                return Outcome::Cancelled;
            }
            if Instant::now() >= deadline {
                info!(target: "editgate::sandbox", pid = child.id(), "wall-clock timeout");
                return Outcome::TimedOut;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn collect(capture: Option<OutputCapture>, deadline: Instant) -> CapturedOutput {
    match capture {
        Some(capture) => capture.finish(deadline.saturating_duration_since(Instant::now())),
        None => CapturedOutput::empty(),
    }
}

fn append_note(stream: &mut String, note: &str, limit: usize) {
    let note = if stream.is_empty() || stream.ends_with('\n') {
        note.to_string()
    } else {
        format!("\n{}", note)
    };
    append_within(stream, &note, limit);
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
