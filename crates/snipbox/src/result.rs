//! Construction of [`ExecutionResult`]s from phase outcomes

use std::time::Duration;

use crate::guard::GuardViolation;
use crate::runner::RunOutcome;
use crate::types::{ExecutionResult, FailureKind, NO_EXIT_CODE, Phase};

/// Collects per-phase telemetry and builds the final result
#[derive(Debug, Clone, Default)]
pub struct ResultBuilder {
    compile_time: Duration,
}

impl ResultBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how long the compiler ran
    pub fn record_compile(&mut self, elapsed: Duration) {
        self.compile_time = elapsed;
    }

    pub fn compile_time(&self) -> Duration {
        self.compile_time
    }

    /// The source was rejected before compilation
    pub fn guard_violation(&self, violation: &GuardViolation) -> ExecutionResult {
        self.compile_failure(
            FailureKind::GuardViolation,
            NO_EXIT_CODE,
            format!("error: {violation}\n"),
            false,
        )
    }

    /// The compiler was killed by the watchdog
    pub fn compile_timeout(&self, timeout: Duration) -> ExecutionResult {
        self.compile_failure(
            FailureKind::CompileTimeout,
            NO_EXIT_CODE,
            format!(
                "error: compilation timed out after {} ms\n",
                timeout.as_millis()
            ),
            false,
        )
    }

    /// The compiler exited non-zero; `stderr` is its diagnostics verbatim
    pub fn compile_error(
        &self,
        exit_code: i32,
        stderr: String,
        stderr_truncated: bool,
    ) -> ExecutionResult {
        self.compile_failure(FailureKind::CompileError, exit_code, stderr, stderr_truncated)
    }

    /// The program ran; classify how it ended
    pub fn run(&self, outcome: RunOutcome) -> ExecutionResult {
        let failure = if outcome.timed_out {
            Some(FailureKind::RunTimeout)
        } else if outcome.output_overflow_abort {
            Some(FailureKind::OutputOverflow)
        } else if outcome.exit_code != 0 {
            Some(FailureKind::RuntimeFault)
        } else {
            None
        };

        ExecutionResult {
            phase: Phase::Run,
            ok: failure.is_none(),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            stdout_truncated: outcome.stdout_truncated,
            stderr_truncated: outcome.stderr_truncated,
            failure,
            compile_time: self.compile_time,
            run_time: outcome.elapsed,
        }
    }

    fn compile_failure(
        &self,
        failure: FailureKind,
        exit_code: i32,
        stderr: String,
        stderr_truncated: bool,
    ) -> ExecutionResult {
        ExecutionResult {
            phase: Phase::Compile,
            ok: false,
            exit_code,
            stdout: String::new(),
            stderr,
            stdout_truncated: false,
            stderr_truncated,
            failure: Some(failure),
            compile_time: self.compile_time,
            run_time: Duration::ZERO,
        }
    }
}
