//! Sandbox backends
//!
//! Two backends share one contract: NsJail runs a native binary inside fresh
//! Linux namespaces, WASI runs a wasm32-wasi module under the wasmtime CLI.
//! Both are external binaries; this module only builds their command lines
//! and owns the resulting processes.
//!
//! References:
//! - https://github.com/google/nsjail
//! - https://docs.wasmtime.dev/cli-options.html

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument};

pub use crate::sandbox::nsjail::{GUEST_TMP_DIR, GUEST_WORK_DIR, NsJailCommand, log_errors};
pub use crate::sandbox::process::{KillSignal, SandboxProcess, resolve_binary};
pub use crate::sandbox::wasi::{WORKDIR_SHIM_NAME, WORKDIR_SHIM_SOURCE, WasmtimeCommand};
use crate::policy::{ExecutionPolicy, Toolchain};
use crate::types::Backend;
use crate::workspace::Workspace;

mod nsjail;
mod process;
mod wasi;

/// nsjail's log, kept in the workspace root outside every guest mount
pub const NSJAIL_LOG_NAME: &str = "nsjail.log";

/// Errors that occur while preparing or driving a sandbox
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox command failed: {0}")]
    CommandFailed(String),

    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} binary not found at {path}")]
    ToolNotFound { tool: &'static str, path: PathBuf },

    #[error("WASI sysroot not found at {0}")]
    SysrootNotFound(PathBuf),

    #[error("no sandbox backend available (install nsjail, or wasmtime with a WASI sysroot)")]
    NoBackendAvailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Native binaries confined by nsjail
#[derive(Debug, Clone)]
pub struct NsJail {
    nsjail: PathBuf,
    compiler: PathBuf,
}

impl NsJail {
    /// Resolve the nsjail launcher and native compiler
    pub fn resolve(toolchain: &Toolchain) -> Result<Self, SandboxError> {
        Ok(Self {
            nsjail: resolve_binary("nsjail", &toolchain.nsjail)?,
            compiler: resolve_binary("compiler", &toolchain.compiler)?,
        })
    }

    pub fn nsjail_path(&self) -> &Path {
        &self.nsjail
    }
}

/// wasm32-wasi modules run by wasmtime
#[derive(Debug, Clone)]
pub struct Wasi {
    wasmtime: PathBuf,
    compiler: PathBuf,
    sysroot: PathBuf,
}

impl Wasi {
    /// Resolve wasmtime, the wasi compiler and the sysroot
    pub fn resolve(toolchain: &Toolchain) -> Result<Self, SandboxError> {
        let wasmtime = resolve_binary("wasmtime", &toolchain.wasmtime)?;
        if !toolchain.wasi_sysroot.is_dir() {
            return Err(SandboxError::SysrootNotFound(toolchain.wasi_sysroot.clone()));
        }
        Ok(Self {
            wasmtime,
            compiler: resolve_binary("wasi compiler", &toolchain.wasi_compiler)?,
            sysroot: toolchain.wasi_sysroot.clone(),
        })
    }

    pub fn wasmtime_path(&self) -> &Path {
        &self.wasmtime
    }

    pub fn sysroot(&self) -> &Path {
        &self.sysroot
    }
}

/// A resolved isolation backend
#[derive(Debug, Clone)]
pub enum Sandbox {
    NsJail(NsJail),
    Wasi(Wasi),
}

impl Sandbox {
    /// Resolve the backend named by `policy`, or detect one from the host
    ///
    /// Detection prefers NsJail on Linux and falls back to WASI when wasmtime
    /// and the sysroot are present.
    #[instrument(skip(policy), fields(requested = ?policy.backend))]
    pub fn select(policy: &ExecutionPolicy) -> Result<Self, SandboxError> {
        let toolchain = &policy.toolchain;
        let sandbox = match policy.backend {
            Some(Backend::NsJail) => Sandbox::NsJail(NsJail::resolve(toolchain)?),
            Some(Backend::Wasi) => Sandbox::Wasi(Wasi::resolve(toolchain)?),
            None => Self::detect(toolchain)?,
        };
        debug!(backend = %sandbox.backend(), "sandbox backend selected");
        Ok(sandbox)
    }

    fn detect(toolchain: &Toolchain) -> Result<Self, SandboxError> {
        if cfg!(target_os = "linux") {
            match NsJail::resolve(toolchain) {
                Ok(nsjail) => return Ok(Sandbox::NsJail(nsjail)),
                Err(e) => debug!(error = %e, "nsjail backend unavailable"),
            }
        }
        match Wasi::resolve(toolchain) {
            Ok(wasi) => Ok(Sandbox::Wasi(wasi)),
            Err(e) => {
                debug!(error = %e, "wasi backend unavailable");
                Err(SandboxError::NoBackendAvailable)
            }
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Sandbox::NsJail(_) => Backend::NsJail,
            Sandbox::Wasi(_) => Backend::Wasi,
        }
    }

    /// File name of the compiled artifact inside `work/`
    pub fn artifact_name(&self) -> &'static str {
        match self {
            Sandbox::NsJail(_) => "program",
            Sandbox::Wasi(_) => "program.wasm",
        }
    }

    /// Resolved compiler binary for this backend
    pub fn compiler(&self) -> &Path {
        match self {
            Sandbox::NsJail(nsjail) => &nsjail.compiler,
            Sandbox::Wasi(wasi) => &wasi.compiler,
        }
    }

    /// Target flags inserted between `-x <lang>` and the user's flags
    pub fn compile_flags(&self, is_cpp: bool) -> Vec<String> {
        match self {
            Sandbox::NsJail(_) => Vec::new(),
            Sandbox::Wasi(wasi) => {
                let mut flags = vec![
                    "--target=wasm32-wasi".to_string(),
                    format!("--sysroot={}", wasi.sysroot.display()),
                ];
                if is_cpp {
                    flags.push("-fno-exceptions".to_string());
                }
                flags
            }
        }
    }

    /// Extra `(file name, source)` compiled alongside the user's source
    pub fn support_source(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Sandbox::NsJail(_) => None,
            Sandbox::Wasi(_) => Some((WORKDIR_SHIM_NAME, WORKDIR_SHIM_SOURCE)),
        }
    }

    /// Full argv that runs the compiled artifact of `workspace`
    pub fn launch_args(&self, workspace: &Workspace, policy: &ExecutionPolicy) -> Vec<String> {
        match self {
            Sandbox::NsJail(nsjail) => NsJailCommand::from_policy(&nsjail.nsjail, policy)
                .work_dir(workspace.work_dir())
                .log_file(workspace.path().join(NSJAIL_LOG_NAME))
                .command([format!("{GUEST_WORK_DIR}/{}", self.artifact_name())])
                .build(),
            Sandbox::Wasi(wasi) => WasmtimeCommand::from_policy(&wasi.wasmtime, policy)
                .workspace(workspace.work_dir(), workspace.tmp_dir())
                .module(workspace.work_dir().join(self.artifact_name()))
                .build(),
        }
    }

    /// Errors the launcher itself reported for the last run in `workspace`
    ///
    /// Empty for WASI, and for NsJail when it wrote no log.
    pub async fn launcher_errors(
        &self,
        workspace: &Workspace,
    ) -> Result<Vec<String>, SandboxError> {
        match self {
            Sandbox::NsJail(_) => {
                let path = workspace.path().join(NSJAIL_LOG_NAME);
                match tokio::fs::read_to_string(&path).await {
                    Ok(log) => Ok(log_errors(&log)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            }
            Sandbox::Wasi(_) => Ok(Vec::new()),
        }
    }

    /// Launch the artifact of `workspace`
    #[instrument(skip(self, workspace, policy), fields(backend = %self.backend()))]
    pub fn spawn(
        &self,
        workspace: &Workspace,
        policy: &ExecutionPolicy,
        pipe_stdin: bool,
    ) -> Result<SandboxProcess, SandboxError> {
        let args = self.launch_args(workspace, policy);
        SandboxProcess::spawn(&args, &workspace.work_dir(), pipe_stdin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;

    fn toolchain_with(nsjail: &str, wasmtime: &str, sysroot: &Path) -> Toolchain {
        Toolchain {
            compiler: PathBuf::from("/bin/sh"),
            wasi_compiler: PathBuf::from("/bin/sh"),
            wasi_sysroot: sysroot.to_path_buf(),
            wasmtime: PathBuf::from(wasmtime),
            nsjail: PathBuf::from(nsjail),
            ..Default::default()
        }
    }

    fn policy(toolchain: Toolchain) -> ExecutionPolicy {
        ExecutionPolicy::new().with_toolchain(toolchain)
    }

    #[test]
    fn explicit_nsjail_missing_binary() {
        let policy = policy(toolchain_with(
            "/nonexistent/nsjail",
            "/bin/true",
            Path::new("/"),
        ))
        .with_backend(Backend::NsJail);
        let err = Sandbox::select(&policy).unwrap_err();
        assert!(matches!(err, SandboxError::ToolNotFound { tool: "nsjail", .. }));
    }

    #[test]
    fn explicit_wasi_missing_sysroot() {
        let policy = policy(toolchain_with(
            "/bin/true",
            "/bin/true",
            Path::new("/nonexistent/sysroot"),
        ))
        .with_backend(Backend::Wasi);
        let err = Sandbox::select(&policy).unwrap_err();
        assert!(matches!(err, SandboxError::SysrootNotFound(_)));
    }

    #[test]
    fn detect_prefers_nsjail_on_linux() {
        let sysroot = tempfile::TempDir::new().unwrap();
        let policy = policy(toolchain_with("/bin/true", "/bin/true", sysroot.path()));
        let sandbox = Sandbox::select(&policy).unwrap();
        if cfg!(target_os = "linux") {
            assert_eq!(sandbox.backend(), Backend::NsJail);
        } else {
            assert_eq!(sandbox.backend(), Backend::Wasi);
        }
    }

    #[test]
    fn detect_falls_back_to_wasi() {
        let sysroot = tempfile::TempDir::new().unwrap();
        let policy = policy(toolchain_with(
            "/nonexistent/nsjail",
            "/bin/true",
            sysroot.path(),
        ));
        let sandbox = Sandbox::select(&policy).unwrap();
        assert_eq!(sandbox.backend(), Backend::Wasi);
        assert_eq!(sandbox.artifact_name(), "program.wasm");
    }

    #[test]
    fn detect_with_nothing_installed() {
        let policy = policy(toolchain_with(
            "/nonexistent/nsjail",
            "/nonexistent/wasmtime",
            Path::new("/nonexistent/sysroot"),
        ));
        let err = Sandbox::select(&policy).unwrap_err();
        assert!(matches!(err, SandboxError::NoBackendAvailable));
    }

    #[test]
    fn nsjail_compile_flags_are_empty() {
        let policy = policy(toolchain_with("/bin/true", "/bin/true", Path::new("/")))
            .with_backend(Backend::NsJail);
        let sandbox = Sandbox::select(&policy).unwrap();
        assert!(sandbox.compile_flags(true).is_empty());
        assert_eq!(sandbox.artifact_name(), "program");
        assert_eq!(sandbox.compiler(), Path::new("/bin/sh"));
    }

    #[test]
    fn wasi_compile_flags() {
        let sysroot = tempfile::TempDir::new().unwrap();
        let policy = policy(toolchain_with("/bin/true", "/bin/true", sysroot.path()))
            .with_backend(Backend::Wasi);
        let sandbox = Sandbox::select(&policy).unwrap();

        let c_flags = sandbox.compile_flags(false);
        assert_eq!(c_flags[0], "--target=wasm32-wasi");
        assert_eq!(c_flags[1], format!("--sysroot={}", sysroot.path().display()));
        assert_eq!(c_flags.len(), 2);

        let cpp_flags = sandbox.compile_flags(true);
        assert_eq!(cpp_flags.last().unwrap(), "-fno-exceptions");
    }

    #[tokio::test]
    async fn nsjail_launch_args_target_workspace() {
        let root = tempfile::TempDir::new().unwrap();
        let workspace = WorkspaceManager::new(root.path()).acquire().await.unwrap();
        let policy = policy(toolchain_with("/bin/true", "/bin/true", Path::new("/")))
            .with_backend(Backend::NsJail);
        let sandbox = Sandbox::select(&policy).unwrap();

        let args = sandbox.launch_args(&workspace, &policy);
        assert_eq!(args[0], "/bin/true");
        let bind = format!("{}:/work", workspace.work_dir().display());
        assert!(args.contains(&bind));
        let log = workspace.path().join(NSJAIL_LOG_NAME);
        assert!(args.contains(&log.to_string_lossy().into_owned()));
        assert!(!log.starts_with(workspace.work_dir()));
        assert_eq!(args.last().unwrap(), "/work/program");

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn wasi_launch_args_target_workspace() {
        let root = tempfile::TempDir::new().unwrap();
        let workspace = WorkspaceManager::new(root.path()).acquire().await.unwrap();
        let policy = policy(toolchain_with("/bin/true", "/bin/true", root.path()))
            .with_backend(Backend::Wasi);
        let sandbox = Sandbox::select(&policy).unwrap();

        let args = sandbox.launch_args(&workspace, &policy);
        assert_eq!(args[0], "/bin/true");
        assert_eq!(args[1], "run");
        let module = workspace.work_dir().join("program.wasm");
        assert_eq!(args.last().unwrap(), &module.to_string_lossy().into_owned());

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn launcher_errors_read_from_nsjail_log() {
        let root = tempfile::TempDir::new().unwrap();
        let workspace = WorkspaceManager::new(root.path()).acquire().await.unwrap();
        let policy = policy(toolchain_with("/bin/true", "/bin/true", Path::new("/")))
            .with_backend(Backend::NsJail);
        let sandbox = Sandbox::select(&policy).unwrap();

        assert!(sandbox.launcher_errors(&workspace).await.unwrap().is_empty());

        std::fs::write(
            workspace.path().join(NSJAIL_LOG_NAME),
            "[I][t][1] Mode: STANDALONE_ONCE\n[E][t][1] mount('/work') failed: EPERM\n",
        )
        .unwrap();
        let errors = sandbox.launcher_errors(&workspace).await.unwrap();
        assert_eq!(errors, vec!["[E][t][1] mount('/work') failed: EPERM"]);

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_runs_launcher_in_work_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let workspace = WorkspaceManager::new(root.path()).acquire().await.unwrap();
        let policy = policy(toolchain_with("/bin/true", "/bin/true", Path::new("/")))
            .with_backend(Backend::NsJail);
        let sandbox = Sandbox::select(&policy).unwrap();

        let mut process = sandbox.spawn(&workspace, &policy, false).unwrap();
        assert!(process.wait().await.unwrap().success());

        workspace.release().await.unwrap();
    }
}
