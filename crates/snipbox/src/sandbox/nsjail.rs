//! Command builder for the nsjail CLI
//!
//! nsjail runs in one-shot mode without `--chroot`, so the guest's root is an
//! empty tmpfs. Only the workspace (`/work`), a fresh tmpfs (`/tmp`) and the
//! configured read-only library directories are mounted into it.
//!
//! Reference for nsjail's flags: https://github.com/google/nsjail

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::ExecutionPolicy;
use crate::types::MountConfig;

/// Mount point of the workspace inside the jail
pub const GUEST_WORK_DIR: &str = "/work";

/// Mount point of the per-run tmpfs inside the jail
pub const GUEST_TMP_DIR: &str = "/tmp";

/// Builder for nsjail command-line arguments
#[derive(Debug)]
pub struct NsJailCommand {
    /// Path to the nsjail binary
    nsjail_path: PathBuf,
    /// Host directory bound read-write at /work
    work_dir: Option<PathBuf>,
    /// --log destination on the host
    log_file: Option<PathBuf>,
    /// --bindmount_ro sources
    readonly_mounts: Vec<MountConfig>,
    /// Keep the host network namespace (--disable_clone_newnet)
    share_network: bool,
    /// --time_limit in seconds
    time_limit: Option<u64>,
    /// --rlimit_cpu in seconds
    cpu_limit: Option<u64>,
    /// --rlimit_as in MiB
    memory_limit_mb: Option<u64>,
    /// --rlimit_fsize in MiB
    file_size_limit_mb: Option<u64>,
    /// --rlimit_nofile
    max_open_files: Option<u32>,
    /// --rlimit_nproc
    max_processes: Option<u32>,
    /// Command executed inside the jail
    command: Vec<String>,
}

impl NsJailCommand {
    /// Create a new nsjail command builder
    pub fn new(nsjail_path: impl Into<PathBuf>) -> Self {
        Self {
            nsjail_path: nsjail_path.into(),
            work_dir: None,
            log_file: None,
            readonly_mounts: Vec::new(),
            share_network: false,
            time_limit: None,
            cpu_limit: None,
            memory_limit_mb: None,
            file_size_limit_mb: None,
            max_open_files: None,
            max_processes: None,
            command: Vec::new(),
        }
    }

    /// Derive mounts, network and rlimits from `policy`
    pub fn from_policy(nsjail_path: impl Into<PathBuf>, policy: &ExecutionPolicy) -> Self {
        let run = policy.run_timeout();
        let backstop = run + policy.hard_kill_grace();

        Self::new(nsjail_path)
            .readonly_mounts(policy.readonly_mounts.iter().cloned())
            .share_network(!policy.disable_network)
            .time_limit(ceil_secs(backstop) + 1)
            .cpu_limit(ceil_secs(run) + 1)
            .memory_limit_mb(bytes_to_mb(policy.max_memory_bytes))
            .file_size_limit_mb(bytes_to_mb(policy.max_file_size_bytes))
            .max_open_files(policy.max_open_files)
            .max_processes(policy.max_processes)
    }

    /// Bind the host workspace directory at /work
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Send nsjail's own warnings and errors to `path` instead of stderr
    ///
    /// Without a log file nsjail runs `--really_quiet` so its messages never
    /// mix with the guest's stderr.
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Add read-only mounts
    pub fn readonly_mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.readonly_mounts.extend(mounts);
        self
    }

    /// Keep the host network namespace instead of an empty one
    pub fn share_network(mut self, enable: bool) -> Self {
        self.share_network = enable;
        self
    }

    /// Set the wall-clock backstop in seconds
    pub fn time_limit(mut self, seconds: u64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    /// Set RLIMIT_CPU in seconds
    pub fn cpu_limit(mut self, seconds: u64) -> Self {
        self.cpu_limit = Some(seconds);
        self
    }

    /// Set RLIMIT_AS in MiB
    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    /// Set RLIMIT_FSIZE in MiB
    pub fn file_size_limit_mb(mut self, mb: u64) -> Self {
        self.file_size_limit_mb = Some(mb);
        self
    }

    /// Set RLIMIT_NOFILE
    pub fn max_open_files(mut self, count: u32) -> Self {
        self.max_open_files = Some(count);
        self
    }

    /// Set RLIMIT_NPROC
    pub fn max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Set the command to run inside the jail
    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Build the command-line arguments
    ///
    /// Consumes self to avoid cloning the command vector.
    pub fn build(self) -> Vec<String> {
        let mut args = vec![
            self.nsjail_path.to_string_lossy().into_owned(),
            "--mode".to_string(),
            "o".to_string(),
        ];
        match self.log_file {
            Some(ref path) => {
                args.push("--quiet".to_string());
                args.push("--log".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
            None => args.push("--really_quiet".to_string()),
        }

        // Filesystem: empty tmpfs root plus explicit mounts
        if let Some(ref dir) = self.work_dir {
            args.push("--bindmount".to_string());
            args.push(format!("{}:{GUEST_WORK_DIR}", dir.display()));
        }
        args.push("--tmpfsmount".to_string());
        args.push(GUEST_TMP_DIR.to_string());
        for mount in &self.readonly_mounts {
            // Skip optional mounts whose source doesn't exist
            if mount.optional && !Path::new(&mount.source).exists() {
                continue;
            }
            args.push("--bindmount_ro".to_string());
            if mount.target() == mount.source {
                args.push(mount.source.clone());
            } else {
                args.push(format!("{}:{}", mount.source, mount.target()));
            }
        }
        args.push("--cwd".to_string());
        args.push(GUEST_WORK_DIR.to_string());
        args.push("--disable_proc".to_string());

        // Network: nsjail clones a new, empty net namespace unless told otherwise
        if self.share_network {
            args.push("--disable_clone_newnet".to_string());
        }

        // Resource limits
        if let Some(seconds) = self.time_limit {
            args.push(format!("--time_limit={seconds}"));
        }
        if let Some(seconds) = self.cpu_limit {
            args.push(format!("--rlimit_cpu={seconds}"));
        }
        if let Some(mb) = self.memory_limit_mb {
            args.push(format!("--rlimit_as={mb}"));
        }
        if let Some(mb) = self.file_size_limit_mb {
            args.push(format!("--rlimit_fsize={mb}"));
        }
        if let Some(count) = self.max_open_files {
            args.push(format!("--rlimit_nofile={count}"));
        }
        if let Some(count) = self.max_processes {
            args.push(format!("--rlimit_nproc={count}"));
        }

        // Separator and command
        args.push("--".to_string());
        args.extend(self.command);

        args
    }

    /// Get the nsjail binary path
    pub fn nsjail_path(&self) -> &Path {
        &self.nsjail_path
    }
}

/// Error and fatal lines from an nsjail log
///
/// nsjail prefixes each line with its level (`[E]`, `[F]`, `[W]`, `[I]`),
/// so these are failures of the jail itself rather than of the guest.
pub fn log_errors(log: &str) -> Vec<String> {
    log.lines()
        .filter(|line| line.starts_with("[E]") || line.starts_with("[F]"))
        .map(str::to_string)
        .collect()
}

/// Whole seconds, rounded up
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Whole MiB, rounded up, at least 1
fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(ExecutionPolicy::MB).max(1)
}
