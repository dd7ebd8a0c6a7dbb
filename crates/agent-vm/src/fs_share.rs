//! Host-side staging directory exposed to the guest over a 9p/virtiofs tag.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use crate::error::FilesystemError;

/// Host-staging tree for one VM's guest share.
///
/// Directory creation happens synchronously at construction (mirroring the
/// original's constructor), before any async method is available to await.
pub struct FilesystemShare {
    root: PathBuf,
    tag: String,
    guest_mount_point: String,
    mounted: bool,
}

impl FilesystemShare {
    /// `tag` defaults to `agent_share`, `guest_mount_point` to `/mnt/agent`.
    pub fn new(host_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = host_path.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            tag: "agent_share".to_string(),
            guest_mount_point: "/mnt/agent".to_string(),
            mounted: false,
        })
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_guest_mount_point(mut self, point: impl Into<String>) -> Self {
        self.guest_mount_point = point.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn guest_mount_point(&self) -> &str {
        &self.guest_mount_point
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Idempotent. A real mount is a 9p/virtiofs transport call, out of
    /// scope here; this flips `is_mounted` and logs.
    pub async fn mount(&mut self) -> Result<(), FilesystemError> {
        if self.mounted {
            return Ok(());
        }
        self.execute_mount().await?;
        self.mounted = true;
        info!(tag = %self.tag, root = %self.root.display(), "share mounted");
        Ok(())
    }

    /// Idempotent.
    pub async fn unmount(&mut self) -> Result<(), FilesystemError> {
        if !self.mounted {
            return Ok(());
        }
        self.execute_unmount().await?;
        self.mounted = false;
        info!(tag = %self.tag, "share unmounted");
        Ok(())
    }

    async fn execute_mount(&self) -> Result<(), FilesystemError> {
        Ok(())
    }

    async fn execute_unmount(&self) -> Result<(), FilesystemError> {
        Ok(())
    }

    /// Resolves `relpath` against the root, rejecting anything that would
    /// escape it.
    fn resolve(&self, relpath: &str) -> Result<PathBuf, FilesystemError> {
        let candidate = self.root.join(relpath);
        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            use std::path::Component::*;
            match component {
                ParentDir => {
                    if !normalized.pop() {
                        return Err(FilesystemError::PathEscapesRoot {
                            path: relpath.to_string(),
                        });
                    }
                }
                Normal(c) => normalized.push(c),
                RootDir | Prefix(_) => normalized.push(component.as_os_str()),
                CurDir => {}
            }
        }
        if !normalized.starts_with(&self.root) {
            return Err(FilesystemError::PathEscapesRoot {
                path: relpath.to_string(),
            });
        }
        Ok(normalized)
    }

    /// Creates missing parent directories and writes `bytes`.
    pub async fn write_file(&self, relpath: &str, bytes: &[u8]) -> Result<(), FilesystemError> {
        let path = self.resolve(relpath)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FilesystemError::WriteFailed {
                    path: relpath.to_string(),
                    reason: e.to_string(),
                })?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| FilesystemError::WriteFailed {
                path: relpath.to_string(),
                reason: e.to_string(),
            })
    }

    /// Empty files are legal. Absent files fail with `FileNotFound`.
    pub async fn read_file(&self, relpath: &str) -> Result<Vec<u8>, FilesystemError> {
        let path = self.resolve(relpath)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FilesystemError::FileNotFound(relpath.to_string()))
            }
            Err(e) => Err(FilesystemError::ReadFailed {
                path: relpath.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Mounts the share. Pairs with `release`, which the caller must call
    /// on every exit path (there is no `Drop`-based guard here — unlike
    /// `Connection::scoped`, `&mut self` access means a caller already
    /// holding the share can't also hand out an owning guard). `execute`'s
    /// release is unconditional: it captures its body's result before
    /// calling `release`, so the share is always unmounted before the
    /// result is returned.
    pub async fn acquire(&mut self) -> Result<(), FilesystemError> {
        self.mount().await
    }

    /// Always call after `acquire`, regardless of whether the work in
    /// between succeeded.
    pub async fn release(&mut self) {
        if let Err(e) = self.unmount().await {
            warn!(error = %e, "error unmounting share during release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mount_unmount_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut share = FilesystemShare::new(dir.path()).unwrap();
        share.mount().await.unwrap();
        assert!(share.is_mounted());
        share.unmount().await.unwrap();
        assert!(!share.is_mounted());
        share.mount().await.unwrap();
        assert!(share.is_mounted());
    }

    #[tokio::test]
    async fn mount_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut share = FilesystemShare::new(dir.path()).unwrap();
        share.mount().await.unwrap();
        share.mount().await.unwrap();
        assert!(share.is_mounted());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let share = FilesystemShare::new(dir.path()).unwrap();
        share.write_file("input/agent.py", b"print(1)").await.unwrap();
        let read = share.read_file("input/agent.py").await.unwrap();
        assert_eq!(read, b"print(1)");
    }

    #[tokio::test]
    async fn read_missing_file_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let share = FilesystemShare::new(dir.path()).unwrap();
        let err = share.read_file("nope.txt").await.unwrap_err();
        assert!(matches!(err, FilesystemError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn empty_file_is_legal() {
        let dir = tempfile::tempdir().unwrap();
        let share = FilesystemShare::new(dir.path()).unwrap();
        share.write_file("empty.txt", b"").await.unwrap();
        assert_eq!(share.read_file("empty.txt").await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn traversal_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let share = FilesystemShare::new(dir.path()).unwrap();
        let err = share.write_file("../../etc/passwd", b"x").await.unwrap_err();
        assert!(matches!(err, FilesystemError::PathEscapesRoot { .. }));
    }
}
