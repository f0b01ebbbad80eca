use super::{ExitInfo, ProcessHandle, ResourceLimits, SandboxBackend};
use std::io;
use std::mem::{size_of, zeroed};
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus};

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::JobObjects::*;

/// Exit status Windows assigns when a job time limit ends a process.
const ERROR_NOT_ENOUGH_QUOTA: i32 = 1816;

/// Places every spawned command in its own job object; terminating the job
/// takes the whole tree down.
#[derive(Debug, Default, Clone)]
pub struct WindowsSandbox;

fn create_job(limits: &ResourceLimits) -> io::Result<OwnedHandle> {
    let raw_job = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
    if raw_job.is_null() {
        return Err(io::Error::last_os_error());
    }
    let job = unsafe { OwnedHandle::from_raw_handle(raw_job as RawHandle) };

    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { zeroed() };
    let basic = &mut info.BasicLimitInformation;
    basic.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE | JOB_OBJECT_LIMIT_PROCESS_TIME;
    // 100ns units.
    basic.PerProcessUserTimeLimit = (limits.cpu_time_secs as i64).saturating_mul(10_000_000);
    if let Some(procs) = limits.max_processes {
        basic.LimitFlags |= JOB_OBJECT_LIMIT_ACTIVE_PROCESS;
        basic.ActiveProcessLimit = procs.min(u32::MAX as u64) as u32;
    }
    if let Some(bytes) = limits.memory_bytes {
        info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
        info.ProcessMemoryLimit = bytes as usize;
    }

    let result = unsafe {
        SetInformationJobObject(
            job.as_raw_handle() as HANDLE,
            JobObjectExtendedLimitInformation,
            &mut info as *mut _ as *mut _,
            size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(job)
}

impl SandboxBackend for WindowsSandbox {
    type Child = WindowsChild;

    fn spawn(&mut self, mut cmd: Command, limits: &ResourceLimits) -> io::Result<Self::Child> {
        if limits.isolate_network {
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
        let job = create_job(limits)?;
        let mut child = cmd.spawn()?;

        let process_handle = child.as_raw_handle() as HANDLE;
        let result = unsafe { AssignProcessToJobObject(job.as_raw_handle() as HANDLE, process_handle) };
        if result == 0 {
            let err = io::Error::last_os_error();
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        Ok(WindowsChild { job, child })
    }
}

pub struct WindowsChild {
    job: OwnedHandle,
    child: Child,
}

impl ProcessHandle for WindowsChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn network_isolated(&self) -> bool {
        false
    }

    fn terminate_tree(&mut self) -> io::Result<()> {
        let terminated = unsafe { TerminateJobObject(self.job.as_raw_handle() as HANDLE, 1) };
        if terminated != 0 {
            return Ok(());
        }
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err),
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

impl Drop for WindowsChild {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            unsafe {
                TerminateJobObject(self.job.as_raw_handle() as HANDLE, 1);
            }
        }
    }
}

pub fn exit_info(status: ExitStatus) -> ExitInfo {
    let code = status.code();
    ExitInfo {
        code,
        signal: None,
        cpu_limit_hit: code == Some(ERROR_NOT_ENOUGH_QUOTA),
    }
}
