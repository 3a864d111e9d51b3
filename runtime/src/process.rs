//! Process-group control
//!
//! Build commands and native deployments are started as leaders of their own
//! process group so that everything they spawn can be signalled together.

use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::DeployError;

/// Interval between liveness probes while waiting for a group to exit
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Signals the runtime sends to a process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Handle on a process group, identified by its leader's pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: i32,
}

impl ProcessGroup {
    pub fn from_leader(pid: u32) -> Self {
        Self { pgid: pid as i32 }
    }

    pub fn id(&self) -> i32 {
        self.pgid
    }

    /// Send a signal to every member of the group.
    ///
    /// Returns `NotFound` when no member is left.
    #[cfg(unix)]
    pub fn signal(&self, signal: Signal) -> Result<(), DeployError> {
        if self.pgid <= 0 {
            return Err(DeployError::Internal(format!("invalid process group: {}", self.pgid)));
        }
        // SAFETY: kill(2) with a negative pid only targets the group; no memory is touched
        let rc = unsafe { libc::kill(-self.pgid, signal.as_raw()) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(DeployError::NotFound(format!("process group {}", self.pgid)));
        }
        Err(DeployError::IoError(err))
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _signal: Signal) -> Result<(), DeployError> {
        Err(DeployError::Unsupported("process groups require a POSIX host".to_string()))
    }

    /// Whether any member of the group is still alive
    #[cfg(unix)]
    pub fn is_alive(&self) -> bool {
        if self.pgid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs the permission and existence check only
        let rc = unsafe { libc::kill(-self.pgid, 0) };
        if rc == 0 {
            // Orphaned zombies still answer signal 0 until init reaps them
            return live_member(self.pgid).unwrap_or(true);
        }
        // EPERM means the group exists but belongs to someone else
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    pub fn is_alive(&self) -> bool {
        false
    }

    /// Poll until the group is gone or `timeout` elapses.
    ///
    /// `reap` runs before every probe so the caller can collect the leader's
    /// exit status; an unreaped zombie leader keeps the group visible.
    pub async fn wait_gone<F>(&self, timeout: Duration, mut reap: F) -> Result<(), DeployError>
    where
        F: FnMut() + Send,
    {
        let deadline = Instant::now() + timeout;
        loop {
            reap();
            if !self.is_alive() {
                // the leader may have turned zombie after the reap above
                reap();
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeployError::Timeout(format!(
                    "process group {} still running after {:?}",
                    self.pgid, timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Signal the group and wait for it to exit.
    ///
    /// A graceful termination sends SIGTERM, otherwise SIGKILL. A group that
    /// is already gone counts as terminated.
    pub async fn terminate<F>(
        &self,
        graceful: bool,
        timeout: Duration,
        reap: F,
    ) -> Result<(), DeployError>
    where
        F: FnMut() + Send,
    {
        let signal = if graceful { Signal::Terminate } else { Signal::Kill };
        debug!("Sending {:?} to process group {}", signal, self.pgid);
        match self.signal(signal) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        self.wait_gone(timeout, reap).await
    }
}

/// Whether `/proc` lists a group member that is not a zombie; `None` when
/// `/proc` is unavailable
#[cfg(target_os = "linux")]
fn live_member(pgid: i32) -> Option<bool> {
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // comm may contain spaces; fields after the closing paren are fixed
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if let [state, _ppid, pgrp, ..] = fields.as_slice() {
            if pgrp.parse::<i32>().ok() == Some(pgid) && *state != "Z" {
                return Some(true);
            }
        }
    }
    Some(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn live_member(_pgid: i32) -> Option<bool> {
    None
}

/// Kills a process group when dropped unless disarmed
#[derive(Debug)]
pub struct GroupGuard {
    group: Option<ProcessGroup>,
}

impl GroupGuard {
    pub fn new(group: ProcessGroup) -> Self {
        Self { group: Some(group) }
    }

    pub fn disarm(mut self) {
        self.group = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            if let Err(e) = group.signal(Signal::Kill) {
                if !e.is_not_found() {
                    warn!("Failed to kill process group {}: {}", group.id(), e);
                }
            }
        }
    }
}

/// Place the command's child in a new process group led by itself
pub fn isolate_group(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Run `sh -c <script>` to completion in its own process group.
///
/// Stdout and stderr are captured; if the caller's future is dropped the
/// whole group is killed.
pub async fn run_shell<'a, I>(
    script: &str,
    dir: &std::path::Path,
    env: I,
) -> Result<Output, DeployError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .current_dir(dir)
        .envs(env)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    run_captured(cmd, script).await
}

/// Spawn a prepared command in its own process group and collect its output
pub async fn run_captured(mut cmd: Command, label: &str) -> Result<Output, DeployError> {
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    isolate_group(&mut cmd);

    let child = cmd.spawn().map_err(|e| DeployError::CommandFailed {
        command: label.to_string(),
        output: e.to_string(),
    })?;
    let guard = child.id().map(|pid| GroupGuard::new(ProcessGroup::from_leader(pid)));

    let output = child.wait_with_output().await?;
    if let Some(guard) = guard {
        guard.disarm();
    }
    Ok(output)
}

/// Stdout followed by stderr, lossily decoded
pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Run a prepared command and fail with its combined output on a non-zero exit
pub async fn run_checked(cmd: Command, label: &str) -> Result<String, DeployError> {
    let output = run_captured(cmd, label).await?;
    let text = combined_output(&output);
    if !output.status.success() {
        return Err(DeployError::CommandFailed {
            command: label.to_string(),
            output: text,
        });
    }
    Ok(text)
}
