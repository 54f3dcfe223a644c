//! Command builder for the wasmtime CLI
//!
//! The guest sees only the preopened directories. Network access is switched
//! off through wasmtime's `-S` WASI options unless the policy allows it.
//!
//! Reference for wasmtime's flags: `wasmtime run --help`, `wasmtime run -W help`
//! and `wasmtime run -S help`.

use std::path::{Path, PathBuf};

use crate::policy::ExecutionPolicy;
use crate::sandbox::nsjail::{GUEST_TMP_DIR, GUEST_WORK_DIR};

/// File name of the translation unit linked into every WASI program
pub const WORKDIR_SHIM_NAME: &str = "snipbox_workdir.c";

/// Moves the guest into /work before `main`
///
/// wasi-libc starts every program in `/` whatever the host's cwd or `PWD`,
/// and `/` itself has no preopen, so relative paths would fail to open.
/// Valid as both C and C++, since `-x` applies to every input file.
pub const WORKDIR_SHIM_SOURCE: &str = "#include <unistd.h>\n\
__attribute__((constructor)) static void snipbox_enter_workdir(void) {\n\
    (void)chdir(\"/work\");\n\
}\n";

/// Builder for `wasmtime run` command-line arguments
#[derive(Debug)]
pub struct WasmtimeCommand {
    /// Path to the wasmtime binary
    wasmtime_path: PathBuf,
    /// (host, guest) preopened directories
    dirs: Vec<(PathBuf, String)>,
    /// -W max-wasm-stack
    max_wasm_stack: Option<u64>,
    /// -W max-memory-size
    max_memory_size: Option<u64>,
    allow_network: bool,
    /// --env KEY=VALUE pairs
    env: Vec<(String, String)>,
    /// Module to run
    module: Option<PathBuf>,
}

impl WasmtimeCommand {
    /// Create a new wasmtime command builder
    pub fn new(wasmtime_path: impl Into<PathBuf>) -> Self {
        Self {
            wasmtime_path: wasmtime_path.into(),
            dirs: Vec::new(),
            max_wasm_stack: None,
            max_memory_size: None,
            allow_network: false,
            env: Vec::new(),
            module: None,
        }
    }

    /// Derive limits and network access from `policy`
    pub fn from_policy(wasmtime_path: impl Into<PathBuf>, policy: &ExecutionPolicy) -> Self {
        Self::new(wasmtime_path)
            .max_wasm_stack(policy.max_wasm_stack_bytes)
            .max_memory_size(policy.max_memory_bytes)
            .allow_network(!policy.disable_network)
    }

    /// Expose the workspace's `work/` and `tmp/` as /work and /tmp
    pub fn workspace(self, work_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Self {
        self.dir(work_dir, GUEST_WORK_DIR).dir(tmp_dir, GUEST_TMP_DIR)
    }

    /// Preopen a host directory at `guest`
    pub fn dir(mut self, host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        self.dirs.push((host.into(), guest.into()));
        self
    }

    /// Set the maximum wasm stack in bytes
    pub fn max_wasm_stack(mut self, bytes: u64) -> Self {
        self.max_wasm_stack = Some(bytes);
        self
    }

    /// Set the maximum linear memory in bytes
    pub fn max_memory_size(mut self, bytes: u64) -> Self {
        self.max_memory_size = Some(bytes);
        self
    }

    /// Inherit the host network instead of denying all sockets
    pub fn allow_network(mut self, enable: bool) -> Self {
        self.allow_network = enable;
        self
    }

    /// Add an environment variable visible to the guest
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the module to run
    pub fn module(mut self, path: impl Into<PathBuf>) -> Self {
        self.module = Some(path.into());
        self
    }

    /// Build the command-line arguments
    pub fn build(self) -> Vec<String> {
        let mut args = vec![
            self.wasmtime_path.to_string_lossy().into_owned(),
            "run".to_string(),
        ];

        for (host, guest) in &self.dirs {
            args.push("--dir".to_string());
            args.push(format!("{}::{guest}", host.display()));
        }

        if let Some(bytes) = self.max_wasm_stack {
            args.push("-W".to_string());
            args.push(format!("max-wasm-stack={bytes}"));
        }
        if let Some(bytes) = self.max_memory_size {
            args.push("-W".to_string());
            args.push(format!("max-memory-size={bytes}"));
        }

        if self.allow_network {
            args.push("-S".to_string());
            args.push("inherit-network=y".to_string());
        } else {
            for option in [
                "inherit-network=n",
                "tcp=n",
                "udp=n",
                "allow-ip-name-lookup=n",
            ] {
                args.push("-S".to_string());
                args.push(option.to_string());
            }
        }

        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }

        if let Some(module) = self.module {
            args.push(module.to_string_lossy().into_owned());
        }

        args
    }

    /// Get the wasmtime binary path
    pub fn wasmtime_path(&self) -> &Path {
        &self.wasmtime_path
    }
}
