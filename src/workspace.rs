//! Per-job scratch directories.
//!
//! A [`Workspace`] is exclusively owned by one packaging job. Unlike a
//! self-cleaning temp dir it has no `Drop` cleanup: whether it is deleted or
//! kept for inspection depends on how the job ends, so disposal is always an
//! explicit call to [`WorkspaceManager::dispose`].

use crate::error::{PackagerError, Result};
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

const WORKSPACE_PREFIX: &str = "winget_pkg_";

/// Scratch directory holding one job's installer and generated scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// Resolves `relative` inside the workspace, rejecting any path that
    /// would escape it through `..` or an absolute component.
    pub fn child(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || relative.as_os_str().is_empty() {
            return Err(PackagerError::ScriptWrite {
                path: relative.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path escapes the workspace",
                ),
            });
        }
        Ok(self.path.join(relative))
    }
}

/// Allocates and disposes of workspaces under a scratch root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Uses the system temp directory as the scratch root.
    pub fn in_system_temp() -> Self {
        Self::new(scratch_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a new, empty, uniquely named directory.
    pub async fn create(&self) -> Result<Workspace> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(PackagerError::WorkspaceCreate)?;

        let path = self
            .root
            .join(format!("{WORKSPACE_PREFIX}{}", Uuid::new_v4().simple()));
        // `create_dir` (not `_all`) fails if the name is somehow taken, which
        // keeps the directory exclusive to this job.
        tokio::fs::create_dir(&path)
            .await
            .map_err(PackagerError::WorkspaceCreate)?;

        info!(path = %path.display(), "Created workspace");
        Ok(Workspace {
            path,
            created_at: Utc::now(),
        })
    }

    /// Deletes the workspace, or keeps it and returns its path when
    /// `preserve` is set. Deletion failures are only logged.
    pub async fn dispose(&self, workspace: &Workspace, preserve: bool) -> Option<PathBuf> {
        if preserve {
            info!(path = %workspace.path.display(), "Keeping workspace for inspection");
            return Some(workspace.path.clone());
        }

        match tokio::fs::remove_dir_all(&workspace.path).await {
            Ok(()) => info!(path = %workspace.path.display(), "Removed workspace"),
            Err(e) => warn!(
                path = %workspace.path.display(),
                error = %e,
                "Failed to remove workspace"
            ),
        }
        None
    }
}

impl Default for WorkspaceManager {
    fn default() -> Self {
        Self::in_system_temp()
    }
}

/// System temp directory, never relative: a relative `TMPDIR` would put
/// workspaces under the current directory.
pub fn scratch_root() -> PathBuf {
    let temp = std::env::temp_dir();
    if temp.is_absolute() {
        return temp;
    }
    #[cfg(windows)]
    {
        std::env::var("TEMP")
            .or_else(|_| std::env::var("TMP"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Windows\\Temp"))
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_empty_and_unique() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());

        let first = manager.create().await.unwrap();
        let second = manager.create().await.unwrap();

        assert_ne!(first.path, second.path);
        assert!(first.path.starts_with(root.path()));
        assert!(first.path.is_dir());
        assert_eq!(std::fs::read_dir(&first.path).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_create_fails_when_root_is_a_file() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let err = WorkspaceManager::new(&blocker).create().await.unwrap_err();
        assert!(matches!(err, PackagerError::WorkspaceCreate(_)));
    }

    #[tokio::test]
    async fn test_dispose_without_preserve_removes_everything() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let workspace = manager.create().await.unwrap();
        std::fs::create_dir(workspace.path.join("nested")).unwrap();
        std::fs::write(workspace.path.join("nested/setup.exe"), b"x").unwrap();

        let kept = manager.dispose(&workspace, false).await;

        assert!(kept.is_none());
        assert!(!workspace.path.exists());
    }

    #[tokio::test]
    async fn test_dispose_with_preserve_leaves_contents() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let workspace = manager.create().await.unwrap();
        std::fs::write(workspace.path.join("install.ps1"), b"x").unwrap();

        let kept = manager.dispose(&workspace, true).await;

        assert_eq!(kept.as_deref(), Some(workspace.path.as_path()));
        assert!(workspace.path.join("install.ps1").exists());
    }

    #[tokio::test]
    async fn test_dispose_of_missing_directory_only_warns() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let workspace = manager.create().await.unwrap();
        std::fs::remove_dir(&workspace.path).unwrap();

        assert!(manager.dispose(&workspace, false).await.is_none());
    }

    #[test]
    fn test_child_rejects_traversal() {
        let workspace = Workspace {
            path: PathBuf::from("/tmp/winget_pkg_test"),
            created_at: Utc::now(),
        };

        assert!(workspace.child("../../etc/passwd").is_err());
        assert!(workspace.child("/etc/passwd").is_err());
        assert!(workspace.child("").is_err());
        assert_eq!(
            workspace.child("install.ps1").unwrap(),
            PathBuf::from("/tmp/winget_pkg_test/install.ps1")
        );
    }

    #[test]
    fn test_scratch_root_is_absolute() {
        assert!(scratch_root().is_absolute());
    }
}
