//! Per-invocation workspace management
//!
//! A [`Workspace`] is a uniquely named directory under the configured work
//! root. Its `work/` subdirectory becomes `/work` inside the sandbox; `tmp/`
//! backs `/tmp` for backends that cannot mount a tmpfs.
//!
//! # Cleanup
//!
//! Call [`Workspace::release`] when done. If the workspace is dropped instead
//! (cancelled future, panic), the directory is removed synchronously in `Drop`.
//! Either way the directory is deleted exactly once.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Prefix of every workspace directory name
pub const WORKSPACE_PREFIX: &str = "snipbox-";

/// Errors that occur while managing workspaces
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace under {root}: {source}")]
    Create {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove workspace {path}: {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates workspaces under a root directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory under which workspaces are created
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, uniquely named workspace
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn acquire(&self) -> Result<Workspace, WorkspaceError> {
        let create_err = |source| WorkspaceError::Create {
            root: self.root.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(create_err)?;

        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.root)
            .map_err(create_err)?;

        let path = dir.path().to_path_buf();
        tokio::fs::create_dir(path.join("work"))
            .await
            .map_err(create_err)?;
        tokio::fs::create_dir(path.join("tmp"))
            .await
            .map_err(create_err)?;

        debug!(path = %path.display(), "workspace acquired");

        Ok(Workspace {
            dir: Some(dir),
            path,
        })
    }
}

/// An ephemeral directory owned by one invocation
#[derive(Debug)]
pub struct Workspace {
    /// Owning handle; `None` once released
    dir: Option<TempDir>,

    path: PathBuf,
}

impl Workspace {
    /// Root of the workspace on the host
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host directory exposed as `/work` in the sandbox
    pub fn work_dir(&self) -> PathBuf {
        self.path.join("work")
    }

    /// Host directory exposed as `/tmp` by the WASI backend
    pub fn tmp_dir(&self) -> PathBuf {
        self.path.join("tmp")
    }

    /// Host path of a file inside `work/`
    ///
    /// Returns an error if the name contains path traversal attempts.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') {
            return Err(WorkspaceError::InvalidPath(format!(
                "path traversal not allowed: {name}"
            )));
        }
        Ok(self.work_dir().join(name))
    }

    /// Write a file into `work/`
    #[instrument(skip(self, content))]
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let path = self.file_path(name)?;
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), len = content.len(), "wrote file to workspace");
        Ok(path)
    }

    /// Read a file from `work/`
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, WorkspaceError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Check if a file exists in `work/`
    pub async fn file_exists(&self, name: &str) -> Result<bool, WorkspaceError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Check if the workspace has not been released yet
    pub fn is_live(&self) -> bool {
        self.dir.is_some()
    }

    /// Recursively delete the workspace
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn release(mut self) -> Result<(), WorkspaceError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        let path = self.path.clone();
        let outcome = tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(|e| WorkspaceError::Release {
                path: path.clone(),
                source: std::io::Error::other(e),
            })?;

        outcome.map_err(|source| WorkspaceError::Release { path, source })?;
        debug!("workspace released");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            debug!(
                path = %self.path.display(),
                "workspace dropped without release, removing synchronously"
            );
            if let Err(e) = dir.close() {
                warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (TempDir, WorkspaceManager) {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("work-root"));
        (root, manager)
    }

    #[tokio::test]
    async fn acquire_creates_layout() {
        let (_root, manager) = manager();
        let workspace = manager.acquire().await.unwrap();

        assert!(workspace.path().starts_with(manager.root()));
        assert!(workspace.work_dir().is_dir());
        assert!(workspace.tmp_dir().is_dir());
        let name = workspace.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(WORKSPACE_PREFIX));

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_removes_directory() {
        let (_root, manager) = manager();
        let workspace = manager.acquire().await.unwrap();
        let path = workspace.path().to_path_buf();
        workspace.write_file("source.c", b"int main(){}").await.unwrap();

        workspace.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_directory() {
        let (_root, manager) = manager();
        let workspace = manager.acquire().await.unwrap();
        let path = workspace.path().to_path_buf();

        drop(workspace);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn concurrent_workspaces_are_distinct() {
        let (_root, manager) = manager();
        let (a, b) = tokio::join!(manager.acquire(), manager.acquire());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.path(), b.path());
        a.release().await.unwrap();
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn file_round_trip() {
        let (_root, manager) = manager();
        let workspace = manager.acquire().await.unwrap();

        assert!(!workspace.file_exists("input.txt").await.unwrap());
        let path = workspace.write_file("input.txt", b"hello").await.unwrap();
        assert_eq!(path, workspace.work_dir().join("input.txt"));
        assert!(workspace.file_exists("input.txt").await.unwrap());
        assert_eq!(workspace.read_file("input.txt").await.unwrap(), b"hello");

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_survives_read_only_contents() {
        let (_root, manager) = manager();
        let workspace = manager.acquire().await.unwrap();
        let path = workspace.write_file("program", b"\x7fELF").await.unwrap();

        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        let root = workspace.path().to_path_buf();
        workspace.release().await.unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn file_path_validation() {
        let workspace = Workspace {
            dir: None,
            path: PathBuf::from("/tmp/snipbox-test"),
        };

        assert!(workspace.file_path("source.cpp").is_ok());
        assert!(workspace.file_path("out/program").is_ok());

        assert!(workspace.file_path("").is_err());
        assert!(workspace.file_path("../escape").is_err());
        assert!(workspace.file_path("foo/../bar").is_err());
        assert!(workspace.file_path("/etc/passwd").is_err());
    }

    #[test]
    fn released_workspace_is_not_live() {
        let workspace = Workspace {
            dir: None,
            path: PathBuf::from("/tmp/snipbox-test"),
        };
        assert!(!workspace.is_live());
    }
}
