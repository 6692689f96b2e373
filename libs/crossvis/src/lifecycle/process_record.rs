// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Counterpart process records.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use crate::config::Role;
use crate::error::{Result, ShareError};

enum ProcessHandle {
    /// We spawned it and will reap it.
    Spawned {
        child: Child,
        status: Option<ExitStatus>,
    },
    /// Discovered by pid; signalled through a pidfd so a recycled pid is never hit.
    Pidfd(OwnedFd),
    /// Kernel without pidfd support.
    Pid,
}

/// A spawned or discovered cooperating process.
pub struct ProcessRecord {
    pid: u32,
    role: Role,
    handle: ProcessHandle,
}

impl std::fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handle = match self.handle {
            ProcessHandle::Spawned { .. } => "spawned",
            ProcessHandle::Pidfd(_) => "pidfd",
            ProcessHandle::Pid => "pid",
        };
        f.debug_struct("ProcessRecord")
            .field("pid", &self.pid)
            .field("role", &self.role)
            .field("handle", &handle)
            .finish()
    }
}

impl ProcessRecord {
    pub(crate) fn spawned(child: Child, role: Role) -> Self {
        Self {
            pid: child.id(),
            role,
            handle: ProcessHandle::Spawned {
                child,
                status: None,
            },
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this process spawned the record's process.
    pub fn is_child(&self) -> bool {
        matches!(self.handle, ProcessHandle::Spawned { .. })
    }

    /// Check without blocking whether the process has exited.
    pub fn has_exited(&mut self) -> Result<bool> {
        match &mut self.handle {
            ProcessHandle::Spawned { child, status } => {
                if status.is_none() {
                    *status = child.try_wait().map_err(|e| {
                        ShareError::Io(io::Error::new(
                            e.kind(),
                            format!("failed to check {} {} status: {}", self.role, self.pid, e),
                        ))
                    })?;
                }
                Ok(status.is_some())
            }
            ProcessHandle::Pidfd(fd) => Ok(pidfd_readable(fd, Duration::ZERO)?),
            ProcessHandle::Pid => Ok(!pid_alive(self.pid)),
        }
    }

    /// Human-readable exit description, once the process has exited.
    pub fn exit_description(&self) -> String {
        match &self.handle {
            ProcessHandle::Spawned {
                status: Some(status),
                ..
            } => status.to_string(),
            _ => "process gone".to_string(),
        }
    }

    /// Forcibly end the process, then wait up to `timeout` for it to go away.
    /// A process that already exited is not an error.
    pub fn terminate(&mut self, timeout: Duration) -> Result<()> {
        if self.has_exited()? {
            tracing::debug!(pid = self.pid, role = %self.role, "Peer already exited, nothing to terminate");
            return Ok(());
        }

        tracing::warn!(pid = self.pid, role = %self.role, "Force killing peer process");

        match &mut self.handle {
            ProcessHandle::Spawned { child, .. } => {
                if let Err(e) = child.kill() {
                    // InvalidInput: exited between try_wait and kill.
                    if e.kind() != io::ErrorKind::InvalidInput {
                        return Err(e.into());
                    }
                }
            }
            ProcessHandle::Pidfd(fd) => pidfd_send_sigkill(fd)?,
            ProcessHandle::Pid => {
                // SAFETY: plain syscall on a pid we were told about.
                let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) };
                if rc != 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        return Err(err.into());
                    }
                }
            }
        }

        if !self.wait_for_exit(timeout)? {
            tracing::warn!(
                pid = self.pid,
                role = %self.role,
                ?timeout,
                "Peer still present after SIGKILL"
            );
        }
        Ok(())
    }

    /// Wait up to `timeout` for the process to exit. Returns whether it did.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Result<bool> {
        if let ProcessHandle::Pidfd(fd) = &self.handle {
            return pidfd_readable(fd, timeout);
        }

        let start = Instant::now();
        loop {
            if self.has_exited()? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Locate an already-running counterpart by pid.
pub fn discover(role: Role, pid: u32) -> Result<ProcessRecord> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(ShareError::PeerNotFound(pid));
    }

    // SAFETY: pidfd_open takes a pid and flags and returns a new fd or -1.
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::c_long, 0 as libc::c_long) };
    let handle = if rc >= 0 {
        // SAFETY: the kernel just handed us this fd.
        ProcessHandle::Pidfd(unsafe { OwnedFd::from_raw_fd(rc as i32) })
    } else {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => return Err(ShareError::PeerNotFound(pid)),
            Some(libc::ENOSYS) => {
                if !pid_alive(pid) {
                    return Err(ShareError::PeerNotFound(pid));
                }
                ProcessHandle::Pid
            }
            _ => return Err(err.into()),
        }
    };

    tracing::debug!(pid, %role, "Discovered peer process");

    Ok(ProcessRecord { pid, role, handle })
}

fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// A pidfd polls readable once its process has exited.
fn pidfd_readable(fd: &OwnedFd, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc >= 0 {
            return Ok(rc > 0);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err.into());
        }
    }
}

fn pidfd_send_sigkill(fd: &OwnedFd) -> Result<()> {
    // SAFETY: pidfd_send_signal(pidfd, sig, info = NULL, flags = 0).
    let rc = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            fd.as_raw_fd() as libc::c_long,
            libc::SIGKILL as libc::c_long,
            std::ptr::null::<libc::siginfo_t>(),
            0 as libc::c_long,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
    }
    Ok(())
}
