//! A library for compiling and running C/C++ snippets in a sandbox.
//!
//! Snipbox takes a short C or C++ source, rejects dangerous `#include`s,
//! compiles it with clang and runs the result under an external sandbox:
//! [nsjail](https://github.com/google/nsjail) for native binaries or
//! [wasmtime](https://wasmtime.dev) for wasm32-wasi modules. Every invocation
//! gets a fresh workspace and returns a structured [`ExecutionResult`].
//!
//! # Features
//!
//! - **Two backends**: NsJail and WASI, picked explicitly or detected from the host.
//! - **Include guard**: regex allow/deny lists checked before any compiler runs.
//! - **Watchdogs**: separate compile and run timeouts, SIGTERM then SIGKILL to the
//!   whole process group.
//! - **Bounded output**: byte-capped stdout/stderr with truncation flags.
//! - **TOML configuration**: file and environment layers via the `config` crate.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), snipbox::EngineError> {
//! use snipbox::Runner;
//!
//! let runner = Runner::with_defaults();
//! let options = runner.options("#include <stdio.h>\nint main(void) { puts(\"hi\"); }\n", false);
//! let result = runner.execute_once(&options).await?;
//! assert!(result.ok);
//! # Ok(())
//! # }
//! ```

pub use config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};
pub use guard::{GuardError, GuardViolation, IncludeGuard};
pub use policy::{ExecutionOptions, ExecutionPolicy, PolicyError, PolicyOverrides, Toolchain};
pub use result::ResultBuilder;
pub use runner::{EngineError, RunOutcome, Runner};
pub use sandbox::{Sandbox, SandboxError, SandboxProcess};
pub use types::{
    Backend, ExecutionResult, FailureKind, MountConfig, NO_EXIT_CODE, Phase, SIGNAL_EXIT_OFFSET,
};
pub use workspace::{Workspace, WorkspaceError, WorkspaceManager};

pub mod config;
pub mod guard;
pub mod policy;
pub mod result;
pub mod runner;
pub mod sandbox;
pub mod types;
pub mod workspace;
