//! Compilation step
//!
//! Writes the source into the workspace and runs the backend's compiler on
//! the host, under the same watchdog as the program itself.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::policy::ExecutionOptions;
use crate::runner::EngineError;
use crate::runner::supervise::{Limits, supervise};
use crate::sandbox::{Sandbox, SandboxError, SandboxProcess};
use crate::workspace::Workspace;

/// Outcome of the compile phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// The artifact was produced
    Success { artifact: PathBuf, elapsed: Duration },

    /// The compiler exited non-zero
    Failed {
        exit_code: i32,
        stderr: String,
        stderr_truncated: bool,
        elapsed: Duration,
    },

    /// The compiler was killed by the watchdog
    TimedOut { elapsed: Duration },
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Success { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            CompileOutcome::Success { elapsed, .. }
            | CompileOutcome::Failed { elapsed, .. }
            | CompileOutcome::TimedOut { elapsed } => *elapsed,
        }
    }
}

/// Compiler argv, run with `work/` as the current directory
///
/// Order: language, backend flags, user flags, source, backend support
/// source, output.
pub fn compile_args(sandbox: &Sandbox, options: &ExecutionOptions) -> Vec<String> {
    let language = if options.is_cpp { "c++" } else { "c" };

    let mut args = vec![
        sandbox.compiler().to_string_lossy().into_owned(),
        "-x".to_string(),
        language.to_string(),
    ];
    args.extend(sandbox.compile_flags(options.is_cpp));
    args.extend(options.policy.extra_compile_flags.iter().cloned());
    args.push(options.source_name().to_string());
    if let Some((name, _)) = sandbox.support_source() {
        args.push(name.to_string());
    }
    args.push("-o".to_string());
    args.push(sandbox.artifact_name().to_string());
    args
}

/// Compile `options.code` inside `workspace`
#[instrument(skip_all, fields(backend = %sandbox.backend(), cpp = options.is_cpp))]
pub async fn compile(
    sandbox: &Sandbox,
    workspace: &Workspace,
    options: &ExecutionOptions,
) -> Result<CompileOutcome, EngineError> {
    let source_name = options.source_name();
    workspace
        .write_file(source_name, options.code.as_bytes())
        .await?;

    debug!(source_name, "wrote source file");

    if let Some((name, source)) = sandbox.support_source() {
        workspace.write_file(name, source.as_bytes()).await?;
        debug!(name, "wrote support source");
    }

    let args = compile_args(sandbox, options);
    let process = SandboxProcess::spawn(&args, &workspace.work_dir(), false)?;
    let outcome = supervise(process, None, &Limits::for_compile(&options.policy)).await?;

    debug!(
        exit_code = outcome.exit_code,
        timed_out = outcome.timed_out,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "compilation complete"
    );

    if outcome.timed_out {
        return Ok(CompileOutcome::TimedOut {
            elapsed: outcome.elapsed,
        });
    }

    if outcome.exit_code != 0 {
        // Some toolchains report on stdout
        let (stderr, stderr_truncated) = if outcome.stderr.is_empty() {
            (outcome.stdout, outcome.stdout_truncated)
        } else {
            (outcome.stderr, outcome.stderr_truncated)
        };
        return Ok(CompileOutcome::Failed {
            exit_code: outcome.exit_code,
            stderr,
            stderr_truncated,
            elapsed: outcome.elapsed,
        });
    }

    let artifact = workspace.file_path(sandbox.artifact_name())?;
    if !tokio::fs::try_exists(&artifact).await? {
        return Err(SandboxError::CommandFailed(format!(
            "compiler exited successfully but produced no {}",
            sandbox.artifact_name()
        ))
        .into());
    }

    Ok(CompileOutcome::Success {
        artifact,
        elapsed: outcome.elapsed,
    })
}
