use super::{ExitInfo, ProcessHandle, ResourceLimits, SandboxBackend};
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Runs each command as the leader of a fresh process group with rlimits
/// installed between fork and exec.
#[derive(Debug, Default, Clone)]
pub struct UnixSandbox;

impl SandboxBackend for UnixSandbox {
    type Child = UnixChild;

    fn spawn(&mut self, mut cmd: Command, limits: &ResourceLimits) -> io::Result<Self::Child> {
        let limits = *limits;
        let isolate = limits.isolate_network && NETWORK_NAMESPACES;
        if limits.isolate_network && !isolate {
            if limits.require_network_isolation {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "network isolation is not available on this platform",
                ));
            }
            tracing::warn!(
                target: "editgate::sandbox",
                "network isolation is not available on this platform; running with host network"
            );
        }

        let unshare_net = Arc::new(AtomicBool::new(isolate));
        let hook_flag = Arc::clone(&unshare_net);
        // SAFETY: the hook only issues raw syscalls and an atomic load.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                apply_resource_limits(&limits)?;
                harden(hook_flag.load(Ordering::Relaxed))
            });
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            // A failed pre-exec hook means the command never started, so it
            // is safe to try again without the namespace.
            Err(err) if isolate && !limits.require_network_isolation => {
                tracing::warn!(
                    target: "editgate::sandbox",
                    error = %err,
                    "network namespace unavailable; running with host network"
                );
                unshare_net.store(false, Ordering::Relaxed);
                cmd.spawn()?
            }
            Err(err) => return Err(err),
        };
        let pgid = child.id() as i32;
        Ok(UnixChild {
            child,
            pgid,
            network_isolated: unshare_net.load(Ordering::Relaxed),
        })
    }
}

/// Lower a limit without ever trying to raise the inherited hard ceiling.
fn lower_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let cap = |v: u64| {
        let v = v as libc::rlim_t;
        if current_hard == libc::RLIM_INFINITY || v < current_hard {
            v
        } else {
            current_hard
        }
    };
    setrlimit(resource, cap(soft), cap(hard))?;
    Ok(())
}

fn apply_resource_limits(limits: &ResourceLimits) -> io::Result<()> {
    // SIGXCPU at the soft limit, SIGKILL one second later.
    lower_limit(
        Resource::RLIMIT_CPU,
        limits.cpu_time_secs,
        limits.cpu_time_secs.saturating_add(1),
    )?;

    if let Some(bytes) = limits.memory_bytes {
        lower_limit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(files) = limits.max_open_files {
        lower_limit(Resource::RLIMIT_NOFILE, files, files)?;
    }
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    if let Some(procs) = limits.max_processes {
        lower_limit(Resource::RLIMIT_NPROC, procs, procs)?;
    }
    Ok(())
}

const NETWORK_NAMESPACES: bool = cfg!(target_os = "linux");

#[cfg(target_os = "linux")]
fn harden(unshare_net: bool) -> io::Result<()> {
    unsafe {
        libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0);
        // Unprivileged user namespaces are disabled on some hosts.
        if unshare_net && libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn harden(_unshare_net: bool) -> io::Result<()> {
    Ok(())
}

pub struct UnixChild {
    child: Child,
    pgid: i32,
    network_isolated: bool,
}

impl ProcessHandle for UnixChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn network_isolated(&self) -> bool {
        self.network_isolated
    }

    fn terminate_tree(&mut self) -> io::Result<()> {
        match killpg(Pid::from_raw(self.pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) => self.child.kill().or_else(|err| {
                if err.kind() == io::ErrorKind::InvalidInput {
                    Ok(())
                } else {
                    Err(err)
                }
            }),
            Err(errno) => Err(errno.into()),
        }
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }
}

pub fn exit_info(status: ExitStatus) -> ExitInfo {
    let signal = status.signal();
    ExitInfo {
        code: status.code(),
        signal,
        cpu_limit_hit: signal == Some(libc::SIGXCPU),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_time_secs: 5,
            memory_bytes: None,
            max_open_files: Some(256),
            max_processes: None,
            isolate_network: false,
            require_network_isolation: false,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_leads_its_own_process_group() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("cut -d' ' -f5 /proc/$$/stat")
            .stdout(Stdio::piped());
        let child = UnixSandbox.spawn(cmd, &limits()).unwrap();
        let pid = child.id();
        let output = child.child.wait_with_output().unwrap();
        let pgid: u32 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap_or(pid);
        assert_eq!(pgid, pid);
    }

    #[test]
    fn terminate_tree_kills_background_descendants() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("sleep 30 & sleep 30");
        let mut child = UnixSandbox.spawn(cmd, &limits()).unwrap();
        let started = Instant::now();
        child.terminate_tree().unwrap();
        let status = child.wait().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(exit_info(status).signal, Some(libc::SIGKILL));
        // Group is gone; a second kill is a no-op.
        child.terminate_tree().unwrap();
    }

    #[test]
    fn open_file_limit_reaches_the_child() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("ulimit -n").stdout(Stdio::piped());
        let child = UnixSandbox.spawn(cmd, &limits()).unwrap();
        let output = child.child.wait_with_output().unwrap();
        let reported = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let value: u64 = reported.parse().unwrap();
        assert!(value <= 256);
    }

    #[test]
    fn best_effort_isolation_always_spawns() {
        let mut limits = limits();
        limits.isolate_network = true;
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("exit 0");
        let mut child = UnixSandbox.spawn(cmd, &limits).unwrap();
        assert!(child.wait().unwrap().success());
        if !NETWORK_NAMESPACES {
            assert!(!child.network_isolated());
        }
    }
}
