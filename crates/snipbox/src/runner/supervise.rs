//! Watchdog and I/O pumps around a spawned process
//!
//! Used for both phases: the compiler and the sandboxed program run through
//! the same timeout and capture logic, only their [`Limits`] differ.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::policy::ExecutionPolicy;
use crate::runner::output::{CappedBuffer, drain};
use crate::sandbox::{SandboxError, SandboxProcess};
use crate::types::exit_code_of;

/// Fixed cap on captured compiler output
pub const COMPILER_OUTPUT_CAP: usize = 1024 * 1024;

/// How long output pipes may stay open after the process has exited
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Time and output bounds for one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Wall-clock budget, measured from the start of supervision
    pub timeout: Duration,

    /// Delay between SIGTERM and SIGKILL
    pub grace: Duration,

    /// Captured stdout bytes kept before truncating
    pub stdout_cap: usize,

    /// Captured stderr bytes kept before truncating
    pub stderr_cap: usize,

    /// Stop the process once either cap is exceeded
    pub abort_on_overflow: bool,
}

impl Limits {
    /// Limits for the sandboxed program
    pub fn for_run(policy: &ExecutionPolicy) -> Self {
        Self {
            timeout: policy.run_timeout(),
            grace: policy.hard_kill_grace(),
            stdout_cap: policy.max_stdout_bytes,
            stderr_cap: policy.max_stderr_bytes,
            abort_on_overflow: policy.abort_on_output_overflow,
        }
    }

    /// Limits for the compiler
    pub fn for_compile(policy: &ExecutionPolicy) -> Self {
        Self {
            timeout: policy.compile_timeout(),
            grace: policy.hard_kill_grace(),
            stdout_cap: COMPILER_OUTPUT_CAP,
            stderr_cap: COMPILER_OUTPUT_CAP,
            abort_on_overflow: false,
        }
    }
}

/// What happened to a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code, or 128 + signal
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub stdout_truncated: bool,

    pub stderr_truncated: bool,

    /// The watchdog fired before the process exited
    pub timed_out: bool,

    /// The process was stopped because an output cap was exceeded
    pub output_overflow_abort: bool,

    /// Wall-clock time until the process was reaped
    pub elapsed: Duration,
}

impl RunOutcome {
    /// Check if the process exited cleanly on its own
    pub fn is_success(&self) -> bool {
        !self.timed_out && !self.output_overflow_abort && self.exit_code == 0
    }
}

/// Why the watchdog stopped waiting
#[derive(Debug)]
enum Stop {
    Exited(Result<ExitStatus, SandboxError>),
    TimedOut,
    Overflow,
}

/// Feed stdin, drain output and enforce `limits` until the process is reaped
///
/// The process is always reaped before this returns, including on timeout.
/// `stdin` is written in full and then closed; a child that exits without
/// reading it is not an error.
#[instrument(skip_all, fields(pid = process.id(), timeout_ms = limits.timeout.as_millis() as u64))]
pub async fn supervise(
    mut process: SandboxProcess,
    stdin: Option<Vec<u8>>,
    limits: &Limits,
) -> Result<RunOutcome, SandboxError> {
    let started = Instant::now();

    let pump = match (stdin, process.take_stdin()) {
        (Some(data), Some(pipe)) => Some(tokio::spawn(pump_stdin(pipe, data))),
        (Some(_), None) => {
            warn!("stdin provided but the process has no stdin pipe");
            None
        }
        // Dropping an unused pipe closes it
        (None, _) => None,
    };

    let overflow = limits.abort_on_overflow.then(|| Arc::new(Notify::new()));
    let stdout = DrainTask::spawn(process.take_stdout(), limits.stdout_cap, overflow.clone());
    let stderr = DrainTask::spawn(process.take_stderr(), limits.stderr_cap, overflow.clone());

    let stop = tokio::select! {
        biased;
        status = process.wait() => Stop::Exited(status),
        () = tokio::time::sleep(limits.timeout) => Stop::TimedOut,
        () = notified(overflow.as_deref()), if overflow.is_some() => Stop::Overflow,
    };

    let (status, timed_out, output_overflow_abort) = match stop {
        Stop::Exited(status) => {
            let status = status?;
            // Background children of the leader would otherwise hold the
            // output pipes open
            if process.kill_group() {
                debug!("killed processes left in the group after exit");
            }
            (status, false, false)
        }
        Stop::TimedOut => {
            debug!("timeout reached, terminating");
            (process.terminate(limits.grace).await?, true, false)
        }
        Stop::Overflow => {
            debug!("output cap exceeded, terminating");
            (process.terminate(limits.grace).await?, false, true)
        }
    };
    let elapsed = started.elapsed();

    if let Some(pump) = pump {
        pump.abort();
    }

    let (stdout, stderr) = tokio::join!(stdout.join("stdout"), stderr.join("stderr"));
    let exit_code = exit_code_of(status);

    debug!(
        exit_code,
        timed_out,
        output_overflow_abort,
        elapsed_ms = elapsed.as_millis() as u64,
        stdout_bytes = stdout.total(),
        stderr_bytes = stderr.total(),
        "process finished"
    );

    Ok(RunOutcome {
        exit_code,
        stdout_truncated: stdout.truncated(),
        stderr_truncated: stderr.truncated(),
        stdout: stdout.into_string(),
        stderr: stderr.into_string(),
        timed_out,
        output_overflow_abort,
        elapsed,
    })
}

async fn notified(notify: Option<&Notify>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

async fn pump_stdin(mut pipe: ChildStdin, data: Vec<u8>) {
    let result = async {
        pipe.write_all(&data).await?;
        pipe.shutdown().await
    }
    .await;

    match result {
        Ok(()) => debug!(len = data.len(), "stdin delivered"),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("stdin closed by the process before all input was written");
        }
        Err(e) => warn!(error = %e, "failed to write stdin"),
    }
}

/// A background drain of one output pipe
struct DrainTask {
    handle: JoinHandle<CappedBuffer>,
    stop: Arc<Notify>,
    cap: usize,
}

impl DrainTask {
    fn spawn<R>(reader: Option<R>, cap: usize, overflow: Option<Arc<Notify>>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();

        let handle = tokio::spawn(async move {
            let mut buffer = CappedBuffer::new(cap);
            if let Some(reader) = reader {
                tokio::select! {
                    () = drain(reader, &mut buffer, overflow.as_deref()) => {}
                    () = stop_signal.notified() => {}
                }
            }
            buffer
        });

        Self { handle, stop, cap }
    }

    /// Wait for EOF, or stop early if a leaked descriptor keeps the pipe open
    async fn join(mut self, stream: &'static str) -> CappedBuffer {
        let waited = tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut self.handle).await;
        let joined = match waited {
            Ok(joined) => joined,
            Err(_) => {
                warn!(stream, "output pipe still open after exit, stopping drain");
                self.stop.notify_one();
                self.handle.await
            }
        };

        joined.unwrap_or_else(|e| {
            warn!(stream, error = %e, "output drain task failed");
            CappedBuffer::new(self.cap)
        })
    }
}
