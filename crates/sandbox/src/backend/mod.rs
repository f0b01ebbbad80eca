use std::io;
use std::process::{ChildStderr, ChildStdout, Command, ExitStatus};

/// Kernel-enforced bounds applied to a spawned command and everything it
/// forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_time_secs: u64,
    pub memory_bytes: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_processes: Option<u64>,
    pub isolate_network: bool,
    /// Fail the spawn instead of running unisolated when `isolate_network`
    /// cannot be honoured.
    pub require_network_isolation: bool,
}

/// Spawns commands inside a platform-specific containment unit (a process
/// group on unix, a job object on windows).
pub trait SandboxBackend: Send {
    type Child: ProcessHandle;

    fn spawn(&mut self, cmd: Command, limits: &ResourceLimits) -> io::Result<Self::Child>;
}

pub trait ProcessHandle: Send {
    fn id(&self) -> u32;

    /// Whether the process was started without host network access.
    fn network_isolated(&self) -> bool;

    /// Kill the command and every descendant sharing its containment unit.
    /// Succeeds when nothing is left to kill.
    fn terminate_tree(&mut self) -> io::Result<()>;

    fn wait(&mut self) -> io::Result<ExitStatus>;
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    fn take_stdout(&mut self) -> Option<ChildStdout>;
    fn take_stderr(&mut self) -> Option<ChildStderr>;
}

/// How a finished process ended, in platform-neutral terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The CPU-time rlimit (or job time limit) ended the process.
    pub cpu_limit_hit: bool,
}

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub type PlatformSandbox = unix::UnixSandbox;

#[cfg(windows)]
pub type PlatformSandbox = windows::WindowsSandbox;

#[cfg(unix)]
pub fn platform_backend() -> io::Result<PlatformSandbox> {
    Ok(unix::UnixSandbox::default())
}

#[cfg(windows)]
pub fn platform_backend() -> io::Result<PlatformSandbox> {
    windows::WindowsSandbox::new()
}

#[cfg(unix)]
pub fn exit_info(status: ExitStatus) -> ExitInfo {
    unix::exit_info(status)
}

#[cfg(windows)]
pub fn exit_info(status: ExitStatus) -> ExitInfo {
    windows::exit_info(status)
}

/// Build the shell invocation for a command string.
pub fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}
