//! Process spawning and teardown for sandboxed commands
//!
//! Every command runs in its own process group so that a timeout can signal
//! the whole tree (launcher plus guest) at once.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, instrument, warn};

use crate::sandbox::SandboxError;

/// Signals sent by the kill path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM, a request to exit
    Terminate,
    /// SIGKILL
    Kill,
}

impl KillSignal {
    fn as_raw(self) -> libc::c_int {
        match self {
            KillSignal::Terminate => libc::SIGTERM,
            KillSignal::Kill => libc::SIGKILL,
        }
    }
}

/// A spawned sandbox or compiler process
#[derive(Debug)]
pub struct SandboxProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    /// Status cached once the child has been reaped
    status: Option<ExitStatus>,
    /// Process group id, recorded at spawn while the pid is known to be live
    pgid: Option<libc::pid_t>,
    /// The group has been sent SIGKILL; it is never signalled again
    group_killed: bool,
}

impl SandboxProcess {
    /// Spawn `args[0]` with `args[1..]` in `cwd`
    ///
    /// stdout and stderr are always piped. stdin is piped when `pipe_stdin` is
    /// set, otherwise it reads from `/dev/null`.
    #[instrument(skip(args), fields(program = args.first().map(String::as_str)))]
    pub fn spawn(args: &[String], cwd: &Path, pipe_stdin: bool) -> Result<Self, SandboxError> {
        let program = args
            .first()
            .ok_or_else(|| SandboxError::CommandFailed("empty command arguments".to_string()))?;

        debug!(?args, cwd = %cwd.display(), "spawning process");

        let mut command = Command::new(program);
        command
            .args(&args[1..])
            .current_dir(cwd)
            .stdin(if pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SandboxError::SpawnFailed {
            program: program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pgid = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok());

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            status: None,
            pgid,
            group_killed: false,
        })
    }

    /// OS process id, `None` once the child has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Check if the child has been reaped
    pub fn has_exited(&self) -> bool {
        self.status.is_some()
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.status = Some(status);
        Ok(status)
    }

    /// Send `signal` to the process group, if the child is still unreaped
    ///
    /// Returns false when there was nothing to signal.
    pub fn signal(&self, signal: KillSignal) -> bool {
        if self.status.is_some() {
            return false;
        }
        if self.child.id().is_none() {
            return false;
        }
        self.pgid.is_some_and(|pgid| killpg(pgid, signal.as_raw()))
    }

    /// SIGKILL every remaining member of the process group
    ///
    /// Works after the leader has been reaped: the group id stays reserved
    /// while any member is alive. Sent at most once; returns false when
    /// there was nothing to signal.
    pub fn kill_group(&mut self) -> bool {
        if self.group_killed {
            return false;
        }
        self.group_killed = true;
        self.pgid.is_some_and(|pgid| killpg(pgid, libc::SIGKILL))
    }

    /// Check if any process is left in the group
    fn group_alive(&self) -> bool {
        !self.group_killed && self.pgid.is_some_and(|pgid| killpg(pgid, 0))
    }

    /// Stop the process: SIGTERM the group, wait up to `grace`, then SIGKILL
    /// whatever is left of the group
    ///
    /// Group members that ignore SIGTERM are killed even when the leader
    /// exits within the grace period. Idempotent: once the child has been
    /// reaped, later calls return the cached status.
    #[instrument(skip(self), fields(pid = self.id()))]
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus, SandboxError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        if let Some(status) = self.child.try_wait()? {
            self.status = Some(status);
            self.kill_group();
            return Ok(status);
        }

        let deadline = tokio::time::Instant::now() + grace;
        self.signal(KillSignal::Terminate);

        let status = match tokio::time::timeout_at(deadline, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(?status, "process exited after SIGTERM");
                if self.group_alive() {
                    debug!("process group outlived its leader, waiting out the grace period");
                    tokio::time::sleep_until(deadline).await;
                }
                status
            }
            Err(_) => {
                debug!("process still alive after grace period, sending SIGKILL");
                self.kill_group();
                // Also kill the direct child in case it left the group
                if let Err(e) = self.child.start_kill() {
                    debug!(error = %e, "start_kill after SIGKILL failed");
                }
                self.child.wait().await?
            }
        };

        if self.kill_group() {
            debug!("killed processes left in the group");
        }
        self.status = Some(status);
        Ok(status)
    }
}

impl Drop for SandboxProcess {
    fn drop(&mut self) {
        if self.kill_group() {
            debug!(pid = self.child.id(), "killed process group on drop");
        }
    }
}

/// Send `signal` to process group `pgid`; false if the group is gone
fn killpg(pgid: libc::pid_t, signal: libc::c_int) -> bool {
    // SAFETY: killpg has no memory-safety preconditions. The group was
    // created by spawning with process_group(0), so `pgid` is our child's pid.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group is already gone
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, signal, error = %err, "failed to signal process group");
        }
        return false;
    }
    true
}

/// Resolve a tool to an absolute path
///
/// Paths that contain a `/` must exist as given. Bare names are looked up on
/// the host `PATH`, and the hit is canonicalized so symlinked toolchains resolve.
pub fn resolve_binary(tool: &'static str, configured: &Path) -> Result<PathBuf, SandboxError> {
    let not_found = || SandboxError::ToolNotFound {
        tool,
        path: configured.to_path_buf(),
    };

    let as_str = configured.to_string_lossy();
    if as_str.is_empty() {
        return Err(not_found());
    }

    if as_str.contains('/') {
        return if configured.is_file() {
            Ok(configured.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(configured);
        if candidate.is_file() {
            return Ok(std::fs::canonicalize(&candidate).unwrap_or(candidate));
        }
    }

    Err(not_found())
}
