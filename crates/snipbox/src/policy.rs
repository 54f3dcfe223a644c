//! Per-invocation execution policy
//!
//! An [`ExecutionPolicy`] is an immutable snapshot of every limit, security rule
//! and toolchain path one invocation runs under. Defaults come from
//! [`Config`](crate::Config); callers narrow them with [`PolicyOverrides`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Backend, MountConfig};

/// Errors for policies that violate their invariants
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Resource limits, security rules and backend selection for one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    /// Isolation backend; auto-detected from the host when unset
    pub backend: Option<Backend>,

    /// Run the guest without any network access
    pub disable_network: bool,

    /// Wall-clock budget for the compiler in milliseconds
    pub compile_timeout_ms: u64,

    /// Wall-clock budget for the program in milliseconds
    pub run_timeout_ms: u64,

    /// Delay between SIGTERM and SIGKILL once a watchdog fires
    pub hard_kill_grace_ms: u64,

    /// Cap on captured stdout bytes
    pub max_stdout_bytes: usize,

    /// Cap on captured stderr bytes
    pub max_stderr_bytes: usize,

    /// Stop the program as soon as either output cap is exceeded
    ///
    /// When false (the default) overflow only truncates; the run continues until
    /// exit or timeout.
    pub abort_on_output_overflow: bool,

    /// Compiler flags, in order
    pub extra_compile_flags: Vec<String>,

    /// Regexes a header must match when non-empty
    pub allowed_include_patterns: Vec<String>,

    /// Regexes that reject a header outright; checked before the allow list
    pub denied_include_patterns: Vec<String>,

    /// WASI stack cap in bytes
    pub max_wasm_stack_bytes: u64,

    /// Address space (nsjail) or linear memory (WASI) cap in bytes
    pub max_memory_bytes: u64,

    /// Maximum number of processes/threads (nsjail)
    pub max_processes: u32,

    /// Maximum open file descriptors (nsjail)
    pub max_open_files: u32,

    /// Largest file the guest may write, in bytes (nsjail)
    pub max_file_size_bytes: u64,

    /// Host directories mounted read-only at the same path (nsjail)
    ///
    /// Dynamically linked binaries need the system library directories.
    pub readonly_mounts: Vec<MountConfig>,

    /// Toolchain binaries and directories
    pub toolchain: Toolchain,
}

impl ExecutionPolicy {
    /// 1 kilobyte in bytes
    pub const KB: u64 = 1024;
    /// 1 megabyte in bytes
    pub const MB: u64 = 1024 * 1024;

    /// Create a policy with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the isolation backend
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the run timeout in milliseconds
    pub fn with_run_timeout_ms(mut self, ms: u64) -> Self {
        self.run_timeout_ms = ms;
        self
    }

    /// Set the compile timeout in milliseconds
    pub fn with_compile_timeout_ms(mut self, ms: u64) -> Self {
        self.compile_timeout_ms = ms;
        self
    }

    /// Set the SIGTERM → SIGKILL grace period in milliseconds
    pub fn with_hard_kill_grace_ms(mut self, ms: u64) -> Self {
        self.hard_kill_grace_ms = ms;
        self
    }

    /// Set the stdout capture cap
    pub fn with_max_stdout_bytes(mut self, bytes: usize) -> Self {
        self.max_stdout_bytes = bytes;
        self
    }

    /// Set the stderr capture cap
    pub fn with_max_stderr_bytes(mut self, bytes: usize) -> Self {
        self.max_stderr_bytes = bytes;
        self
    }

    /// Replace the include deny list
    pub fn with_denied_includes(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.denied_include_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the include allow list (empty allows everything not denied)
    pub fn with_allowed_includes(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.allowed_include_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the toolchain
    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn hard_kill_grace(&self) -> Duration {
        Duration::from_millis(self.hard_kill_grace_ms)
    }

    /// Check the policy invariants
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.compile_timeout_ms == 0 {
            return Err(PolicyError::ZeroTimeout("compile_timeout_ms"));
        }
        if self.run_timeout_ms == 0 {
            return Err(PolicyError::ZeroTimeout("run_timeout_ms"));
        }
        if self.max_memory_bytes == 0 {
            return Err(PolicyError::ZeroLimit("max_memory_bytes"));
        }
        if self.max_wasm_stack_bytes == 0 {
            return Err(PolicyError::ZeroLimit("max_wasm_stack_bytes"));
        }
        if self.max_processes == 0 {
            return Err(PolicyError::ZeroLimit("max_processes"));
        }
        Ok(())
    }

    /// Apply overrides, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &PolicyOverrides) -> ExecutionPolicy {
        ExecutionPolicy {
            backend: overrides.backend.or(self.backend),
            disable_network: overrides.disable_network.unwrap_or(self.disable_network),
            compile_timeout_ms: overrides
                .compile_timeout_ms
                .unwrap_or(self.compile_timeout_ms),
            run_timeout_ms: overrides.run_timeout_ms.unwrap_or(self.run_timeout_ms),
            hard_kill_grace_ms: overrides
                .hard_kill_grace_ms
                .unwrap_or(self.hard_kill_grace_ms),
            max_stdout_bytes: overrides.max_stdout_bytes.unwrap_or(self.max_stdout_bytes),
            max_stderr_bytes: overrides.max_stderr_bytes.unwrap_or(self.max_stderr_bytes),
            abort_on_output_overflow: overrides
                .abort_on_output_overflow
                .unwrap_or(self.abort_on_output_overflow),
            extra_compile_flags: overrides
                .extra_compile_flags
                .clone()
                .unwrap_or_else(|| self.extra_compile_flags.clone()),
            allowed_include_patterns: self.allowed_include_patterns.clone(),
            denied_include_patterns: self.denied_include_patterns.clone(),
            max_wasm_stack_bytes: overrides
                .max_wasm_stack_bytes
                .unwrap_or(self.max_wasm_stack_bytes),
            max_memory_bytes: overrides.max_memory_bytes.unwrap_or(self.max_memory_bytes),
            max_processes: self.max_processes,
            max_open_files: self.max_open_files,
            max_file_size_bytes: self.max_file_size_bytes,
            readonly_mounts: self.readonly_mounts.clone(),
            toolchain: self.toolchain.clone(),
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            backend: None,
            disable_network: true,
            compile_timeout_ms: 10_000,
            run_timeout_ms: 5_000,
            hard_kill_grace_ms: 500,
            max_stdout_bytes: 64 * 1024,
            max_stderr_bytes: 64 * 1024,
            abort_on_output_overflow: false,
            extra_compile_flags: vec!["-O2".to_string()],
            allowed_include_patterns: Vec::new(),
            denied_include_patterns: default_denied_includes(),
            max_wasm_stack_bytes: Self::MB,
            max_memory_bytes: 256 * Self::MB,
            max_processes: 16,
            max_open_files: 64,
            max_file_size_bytes: 16 * Self::MB,
            readonly_mounts: default_readonly_mounts(),
            toolchain: Toolchain::default(),
        }
    }
}

/// Headers that give a snippet process, socket or raw filesystem control
fn default_denied_includes() -> Vec<String> {
    [
        r"^sys/",
        r"^(arpa|net|netinet|linux)/",
        r"^(unistd|fcntl|dlfcn|spawn|dirent|pthread|signal|sched|termios)\.h$",
        r"^(csignal|thread|filesystem|future)$",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_readonly_mounts() -> Vec<MountConfig> {
    ["/lib", "/lib64", "/usr/lib", "/usr/lib64"]
        .into_iter()
        .map(MountConfig::optional)
        .collect()
}

/// Paths to the external tools the engine drives
///
/// Bare names (no `/`) are looked up on the host `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    /// Native compiler (clang++ also compiles C with `-x c`)
    pub compiler: PathBuf,

    /// Compiler used for the wasm32-wasi target
    pub wasi_compiler: PathBuf,

    /// WASI sysroot passed as `--sysroot`
    pub wasi_sysroot: PathBuf,

    /// wasmtime CLI
    pub wasmtime: PathBuf,

    /// nsjail launcher
    pub nsjail: PathBuf,

    /// Directory under which per-invocation workspaces are created
    pub work_root: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            compiler: PathBuf::from("clang++"),
            wasi_compiler: PathBuf::from("clang++"),
            wasi_sysroot: PathBuf::from("/opt/wasi-sdk/share/wasi-sysroot"),
            wasmtime: PathBuf::from("wasmtime"),
            nsjail: PathBuf::from("nsjail"),
            work_root: std::env::temp_dir().join("snipbox"),
        }
    }
}

/// Per-invocation overrides of the scalar policy fields
///
/// Only explicitly set values replace the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub backend: Option<Backend>,
    #[serde(default)]
    pub disable_network: Option<bool>,
    #[serde(default)]
    pub compile_timeout_ms: Option<u64>,
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    #[serde(default)]
    pub hard_kill_grace_ms: Option<u64>,
    #[serde(default)]
    pub max_stdout_bytes: Option<usize>,
    #[serde(default)]
    pub max_stderr_bytes: Option<usize>,
    #[serde(default)]
    pub abort_on_output_overflow: Option<bool>,
    #[serde(default)]
    pub extra_compile_flags: Option<Vec<String>>,
    #[serde(default)]
    pub max_wasm_stack_bytes: Option<u64>,
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

impl PolicyOverrides {
    /// Check if no field is overridden
    pub fn is_empty(&self) -> bool {
        *self == PolicyOverrides::default()
    }
}

/// Input of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Source text
    pub code: String,

    /// Compile as C++ (otherwise C)
    pub is_cpp: bool,

    /// Data fed to the program's standard input, followed by EOF
    pub stdin: Option<String>,

    /// Policy the invocation runs under
    pub policy: ExecutionPolicy,
}

impl ExecutionOptions {
    /// C source with the default policy
    pub fn c(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_cpp: false,
            stdin: None,
            policy: ExecutionPolicy::default(),
        }
    }

    /// C++ source with the default policy
    pub fn cpp(code: impl Into<String>) -> Self {
        Self {
            is_cpp: true,
            ..Self::c(code)
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Source file name written into the workspace
    pub fn source_name(&self) -> &'static str {
        if self.is_cpp { "source.cpp" } else { "source.c" }
    }
}
