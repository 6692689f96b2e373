// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::config::{PairConfig, Role, WORKER_ROLE_MARKER};
use crate::error::{Result, ShareError};

use super::ProcessRecord;

/// Build the command that launches a process of `role` for this pair.
///
/// The worker gets the forwarded args followed by the role marker, plus the
/// pair's `CROSSVIS_*` environment. Output is inherited so both processes log
/// to the same terminal.
pub fn build_command(role: Role, config: &PairConfig) -> Result<Command> {
    let program = match &config.worker_program {
        Some(program) => program.clone(),
        None => current_exe()?,
    };

    let mut command = Command::new(&program);
    command
        .args(
            config
                .worker_args
                .iter()
                .filter(|arg| arg.as_str() != WORKER_ROLE_MARKER),
        )
        .envs(config.worker_env())
        .stdin(Stdio::null());

    if role == Role::Worker {
        command.arg(WORKER_ROLE_MARKER);
    }

    Ok(command)
}

/// Launch a new instance of the pair's executable in `role`.
///
/// A spawned worker is armed with `PR_SET_PDEATHSIG(SIGKILL)`, so it cannot
/// outlive the thread that spawned it even if the host is killed outright.
pub fn spawn(role: Role, config: &PairConfig) -> Result<ProcessRecord> {
    let mut command = build_command(role, config)?;

    if role == Role::Worker {
        let parent = std::process::id() as libc::pid_t;
        // SAFETY: prctl and getppid are async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                if libc::prctl(
                    libc::PR_SET_PDEATHSIG,
                    libc::SIGKILL as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                ) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::getppid() != parent {
                    return Err(std::io::Error::other("parent exited before exec"));
                }
                Ok(())
            });
        }
    }

    let child = command.spawn().map_err(|e| {
        ShareError::Spawn(format!(
            "failed to launch {} '{}': {}",
            role,
            command.get_program().to_string_lossy(),
            e
        ))
    })?;

    tracing::info!(pid = child.id(), %role, pair_id = %config.pair_id, "Spawned counterpart");

    Ok(ProcessRecord::spawned(child, role))
}

fn current_exe() -> Result<PathBuf> {
    std::env::current_exe()
        .map_err(|e| ShareError::Spawn(format!("cannot locate current executable: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENV_PAIR_ID;
    use std::ffi::OsStr;
    use std::time::Duration;

    #[test]
    fn worker_command_ends_with_the_role_marker() {
        let config = PairConfig::new("cmd")
            .with_worker_program("/bin/true")
            .with_worker_args(["--width", "640", WORKER_ROLE_MARKER]);

        let command = build_command(Role::Worker, &config).unwrap();
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(
            args,
            vec![
                OsStr::new("--width"),
                OsStr::new("640"),
                OsStr::new(WORKER_ROLE_MARKER)
            ]
        );

        let pair_env = command
            .get_envs()
            .find(|(k, _)| *k == OsStr::new(ENV_PAIR_ID))
            .and_then(|(_, v)| v);
        assert_eq!(pair_env, Some(OsStr::new("cmd")));
    }

    #[test]
    fn host_command_has_no_marker() {
        let config = PairConfig::new("cmd").with_worker_program("/bin/true");
        let command = build_command(Role::Host, &config).unwrap();
        assert_eq!(command.get_args().count(), 0);
    }

    #[test]
    fn spawn_failure_is_reported() {
        let config = PairConfig::new("cmd").with_worker_program("/nonexistent/crossvis-worker");
        assert!(matches!(
            spawn(Role::Worker, &config),
            Err(ShareError::Spawn(_))
        ));
    }

    #[test]
    fn spawned_process_is_tracked() {
        let config = PairConfig::new("cmd")
            .with_worker_program("sleep")
            .with_worker_args(["30"]);
        // `sleep 30 --crossvis-worker` is rejected by sleep itself, so spawn
        // it as a host-role process and only exercise tracking.
        let mut record = spawn(Role::Host, &config).unwrap();
        assert_eq!(record.role(), Role::Host);
        assert!(!record.has_exited().unwrap());
        record.terminate(Duration::from_secs(5)).unwrap();
        assert!(record.has_exited().unwrap());
    }
}
