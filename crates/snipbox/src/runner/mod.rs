//! Code runner for snipbox
//!
//! Drives one invocation end to end: include guard, backend selection,
//! workspace, compilation, sandboxed run and result construction.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use crate::runner::compile::{CompileOutcome, compile, compile_args};
pub use crate::runner::output::CappedBuffer;
pub use crate::runner::supervise::{COMPILER_OUTPUT_CAP, Limits, RunOutcome, supervise};

mod compile;
mod output;
mod supervise;

use crate::{
    config::Config,
    guard::{GuardError, IncludeGuard},
    policy::{ExecutionOptions, PolicyError},
    result::ResultBuilder,
    sandbox::{Sandbox, SandboxError},
    types::ExecutionResult,
    workspace::{Workspace, WorkspaceError, WorkspaceManager},
};

/// Program compiled and run by [`Runner::health_check`]
const HEALTH_CHECK_PROGRAM: &str = "int main(void) { return 0; }\n";

/// Errors that prevent an invocation from producing a result
///
/// Guest failures (compile errors, timeouts, crashes) are reported through
/// [`ExecutionResult`] instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("{0}")]
    InvalidPattern(#[from] GuardError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// High-level runner for code execution
///
/// Holds only read-only configuration, so clones can run invocations
/// concurrently.
#[derive(Debug, Clone)]
pub struct Runner {
    config: Config,
}

impl Runner {
    /// Create a new runner with the given configuration
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Create a new runner with default configuration
    pub fn with_defaults() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Options for `code` under the configured default policy
    pub fn options(&self, code: impl Into<String>, is_cpp: bool) -> ExecutionOptions {
        let options = if is_cpp {
            ExecutionOptions::cpp(code)
        } else {
            ExecutionOptions::c(code)
        };
        options.with_policy(self.config.policy.clone())
    }

    /// Compile and run one snippet
    ///
    /// Returns `Err` only for setup failures (invalid policy, missing
    /// toolchain, workspace I/O). The workspace is removed on every path,
    /// including when the returned future is dropped.
    #[instrument(skip_all, fields(cpp = options.is_cpp, code_len = options.code.len()))]
    pub async fn execute_once(
        &self,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, EngineError> {
        let policy = &options.policy;
        policy.validate()?;
        let guard = IncludeGuard::new(policy)?;
        let results = ResultBuilder::new();

        debug!(state = "guard_check");
        if let Err(violation) = guard.check(&options.code) {
            debug!(state = "compile_fail", header = violation.header(), "include rejected");
            return Ok(results.guard_violation(&violation));
        }

        let sandbox = Sandbox::select(policy)?;
        let workspace = WorkspaceManager::new(&policy.toolchain.work_root)
            .acquire()
            .await?;

        let result = compile_and_run(&sandbox, &workspace, options, results).await;

        if let Err(e) = workspace.release().await {
            warn!(error = %e, "failed to release workspace");
        }

        if let Ok(ref result) = result {
            debug!(
                state = "done",
                phase = ?result.phase,
                ok = result.ok,
                exit_code = result.exit_code,
                "invocation finished"
            );
        }
        result
    }

    /// Compile and run a trivial program under the configured policy
    ///
    /// Exercises backend detection, the compiler and the sandbox launcher.
    /// The returned result is `ok` when the toolchain works end to end.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<ExecutionResult, EngineError> {
        let options = self.options(HEALTH_CHECK_PROGRAM, false);
        let result = self.execute_once(&options).await?;

        if result.ok {
            info!(
                compile_ms = result.compile_time.as_millis() as u64,
                run_ms = result.run_time.as_millis() as u64,
                "health check passed"
            );
        } else {
            warn!(
                phase = ?result.phase,
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "health check failed"
            );
        }
        Ok(result)
    }
}

async fn compile_and_run(
    sandbox: &Sandbox,
    workspace: &Workspace,
    options: &ExecutionOptions,
    mut results: ResultBuilder,
) -> Result<ExecutionResult, EngineError> {
    let policy = &options.policy;

    debug!(state = "compiling", backend = %sandbox.backend());
    match compile(sandbox, workspace, options).await? {
        CompileOutcome::Success { elapsed, .. } => results.record_compile(elapsed),
        CompileOutcome::Failed {
            exit_code,
            stderr,
            stderr_truncated,
            elapsed,
        } => {
            debug!(state = "compile_fail", exit_code, "compiler failed");
            results.record_compile(elapsed);
            return Ok(results.compile_error(exit_code, stderr, stderr_truncated));
        }
        CompileOutcome::TimedOut { elapsed } => {
            debug!(state = "compile_fail", "compiler timed out");
            results.record_compile(elapsed);
            return Ok(results.compile_timeout(policy.compile_timeout()));
        }
    }

    debug!(state = "spawning");
    let process = sandbox.spawn(workspace, policy, options.stdin.is_some())?;

    debug!(state = "running", pid = process.id());
    let stdin = options.stdin.clone().map(String::into_bytes);
    let outcome = supervise(process, stdin, &Limits::for_run(policy)).await?;

    debug!(
        state = if outcome.timed_out { "run_timeout" } else { "run_exited" },
        exit_code = outcome.exit_code
    );

    // A launcher that failed to build the jail exits non-zero like a guest would
    if !outcome.timed_out && !outcome.output_overflow_abort && outcome.exit_code != 0 {
        let errors = sandbox.launcher_errors(workspace).await?;
        if !errors.is_empty() {
            warn!(errors = errors.len(), "sandbox launcher reported errors");
            return Err(SandboxError::CommandFailed(format!(
                "{} failed to start the program: {}",
                sandbox.backend(),
                errors.join("; ")
            ))
            .into());
        }
    }
    Ok(results.run(outcome))
}
