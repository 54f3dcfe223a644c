use std::process::ExitStatus;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

/// Offset added to a signal number when a process dies from that signal.
///
/// Matches the shell convention: SIGSEGV (11) becomes 139, SIGKILL (9) becomes 137.
pub const SIGNAL_EXIT_OFFSET: i32 = 128;

/// Exit code reported when no guest or compiler process produced a status
/// (guard violations, compile timeouts).
pub const NO_EXIT_CODE: i32 = -1;

/// Isolation mechanism used to run the compiled artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// Native binary under an nsjail namespace/rlimit sandbox
    #[serde(rename = "nsjail")]
    NsJail,

    /// WebAssembly module under wasmtime with WASI capabilities
    #[serde(rename = "wasi")]
    Wasi,
}

impl Backend {
    /// Parse a backend name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "nsjail" => Some(Backend::NsJail),
            "wasi" | "wasmtime" => Some(Backend::Wasi),
            _ => None,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::NsJail => write!(f, "nsjail"),
            Backend::Wasi => write!(f, "wasi"),
        }
    }
}

/// The furthest stage an invocation reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

/// Why an invocation did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A denied or non-allow-listed `#include`; no compiler was started
    GuardViolation,

    /// The compiler exited non-zero
    CompileError,

    /// The compiler exceeded its time budget and was killed
    CompileTimeout,

    /// The program exited non-zero or died from a signal
    RuntimeFault,

    /// The program exceeded its time budget and was killed
    RunTimeout,

    /// The program was stopped early because an output cap was exceeded
    OutputOverflow,
}

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Last phase reached
    pub phase: Phase,

    /// True only if compilation succeeded and the program exited 0 within limits
    pub ok: bool,

    /// Exit code, `128 + signal` for signal deaths, [`NO_EXIT_CODE`] if no process ran
    pub exit_code: i32,

    /// Captured standard output, at most `max_stdout_bytes` long
    pub stdout: String,

    /// Captured standard error (or a diagnostic for compile-phase failures)
    pub stderr: String,

    pub stdout_truncated: bool,

    pub stderr_truncated: bool,

    /// Classification of a failed invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,

    /// Wall time spent compiling
    #[serde(rename = "compileTimeMs", serialize_with = "as_millis")]
    pub compile_time: Duration,

    /// Wall time spent running (zero if the run phase was not reached)
    #[serde(rename = "runTimeMs", serialize_with = "as_millis")]
    pub run_time: Duration,
}

impl ExecutionResult {
    /// Check if the invocation compiled and the program exited with code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.ok
    }

    /// Check if the invocation ended because a watchdog fired
    #[must_use]
    pub fn timed_out(&self) -> bool {
        matches!(
            self.failure,
            Some(FailureKind::CompileTimeout | FailureKind::RunTimeout)
        )
    }
}

fn as_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Map a process exit status to an exit code
///
/// Normal exits keep their code; deaths by signal map to
/// `SIGNAL_EXIT_OFFSET + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return signal_exit_code(signal);
        }
    }

    NO_EXIT_CODE
}

/// Exit code used for a process killed by `signal`
pub fn signal_exit_code(signal: i32) -> i32 {
    SIGNAL_EXIT_OFFSET + signal
}

/// Configuration for a directory mount inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub source: String,

    /// Target path in the sandbox (defaults to the source path)
    #[serde(default)]
    pub target: Option<String>,

    /// Whether this mount is optional (skipped if the source doesn't exist)
    #[serde(default)]
    pub optional: bool,
}

impl MountConfig {
    /// Read-only mount at the same path, skipped if absent on the host
    pub fn optional(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
            optional: true,
        }
    }

    /// Path the mount appears at inside the sandbox
    pub fn target(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}
