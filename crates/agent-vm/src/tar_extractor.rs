//! Defensive tar extraction: path traversal, link, and size-bomb guards.

use std::io::Read;
use std::path::{Path, PathBuf};

use tar::{Archive, EntryType};
use tracing::warn;

use crate::error::SecurityError;

/// Whether `path` joined to `base` resolves to a descendant of `base`.
/// Purely lexical (`..`/`.` components are collapsed in memory) — this
/// crate never needs to touch the filesystem to decide, since the
/// destination doesn't exist yet at extraction time.
pub fn validate_file_path(path: &Path, base: &Path) -> bool {
    resolve_within(path, base).is_some()
}

fn resolve_within(path: &Path, base: &Path) -> Option<PathBuf> {
    let mut normalized = base.to_path_buf();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Normal(c) => normalized.push(c),
            RootDir | Prefix(_) => return None,
            CurDir => {}
        }
    }
    if normalized.starts_with(base) {
        Some(normalized)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Skip unsafe members with a warning, matching the original's
    /// `safe_extractall`.
    Lenient,
    /// Raise on the first unsafe member. Used for untrusted archives.
    Strict,
}

pub struct SecureTarExtractor {
    pub max_size: u64,
    pub mode: ExtractMode,
}

impl SecureTarExtractor {
    pub fn new(max_size: u64, mode: ExtractMode) -> Self {
        Self { max_size, mode }
    }

    /// Extracts `archive_bytes` under `extract_root`, which is created if
    /// missing. Computes cumulative uncompressed size up front and fails
    /// before writing anything if it would exceed `max_size`.
    pub fn extract_all(
        &self,
        archive_bytes: &[u8],
        extract_root: &Path,
    ) -> Result<Vec<PathBuf>, SecurityError> {
        std::fs::create_dir_all(extract_root)
            .map_err(|e| SecurityError::InvalidArchive(e.to_string()))?;

        self.plan(archive_bytes)?;

        let mut archive = Archive::new(archive_bytes);
        let mut written = Vec::new();
        for entry_result in archive.entries().map_err(|e| SecurityError::InvalidArchive(e.to_string()))? {
            let mut entry = entry_result.map_err(|e| SecurityError::InvalidArchive(e.to_string()))?;
            let path = entry.path().map_err(|e| SecurityError::InvalidArchive(e.to_string()))?.into_owned();
            let name = path.to_string_lossy().into_owned();

            match self.classify(&entry.header().entry_type(), &path, extract_root) {
                Ok(dest) => {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| SecurityError::InvalidArchive(e.to_string()))?;
                    }
                    let mut buf = Vec::new();
                    entry
                        .read_to_end(&mut buf)
                        .map_err(|e| SecurityError::InvalidArchive(e.to_string()))?;
                    std::fs::write(&dest, &buf)
                        .map_err(|e| SecurityError::InvalidArchive(e.to_string()))?;
                    written.push(dest);
                }
                Err(e) => match self.mode {
                    ExtractMode::Strict => return Err(e),
                    ExtractMode::Lenient => {
                        warn!(member = %name, error = %e, "skipping unsafe tar member");
                    }
                },
            }
        }

        Ok(written)
    }

    /// Pre-computes cumulative size across all members before any bytes are
    /// written.
    fn plan(&self, archive_bytes: &[u8]) -> Result<(), SecurityError> {
        let mut archive = Archive::new(archive_bytes);
        let mut total: u64 = 0;
        for entry_result in archive.entries().map_err(|e| SecurityError::InvalidArchive(e.to_string()))? {
            let entry = entry_result.map_err(|e| SecurityError::InvalidArchive(e.to_string()))?;
            let size = entry.header().size().unwrap_or(0);
            let name = entry
                .path()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            if size > self.max_size {
                return Err(SecurityError::MemberTooLarge {
                    name,
                    size,
                    limit: self.max_size,
                });
            }
            total = total.saturating_add(size);
            if total > self.max_size {
                return Err(SecurityError::ArchiveTooLarge {
                    total,
                    limit: self.max_size,
                });
            }
        }
        Ok(())
    }

    fn classify(
        &self,
        entry_type: &EntryType,
        path: &Path,
        extract_root: &Path,
    ) -> Result<PathBuf, SecurityError> {
        if path.is_absolute() {
            return Err(SecurityError::AbsolutePath(path.display().to_string()));
        }
        match entry_type {
            EntryType::Symlink | EntryType::Link => {
                return Err(SecurityError::Link(path.display().to_string()))
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                return Err(SecurityError::DeviceFile(path.display().to_string()))
            }
            _ => {}
        }
        resolve_within(path, extract_root)
            .ok_or_else(|| SecurityError::PathTraversal(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn validate_file_path_rejects_traversal() {
        let base = Path::new("/tmp/x");
        assert!(!validate_file_path(Path::new("../../etc/passwd"), base));
        assert!(validate_file_path(Path::new("a/b/c"), base));
    }

    #[test]
    fn path_traversal_member_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(&[("../../etc/passwd", b"pwned")]);
        let extractor = SecureTarExtractor::new(1024 * 1024, ExtractMode::Strict);
        let err = extractor.extract_all(&archive, dir.path()).unwrap_err();
        assert!(matches!(err, SecurityError::PathTraversal(_) | SecurityError::AbsolutePath(_)));
        assert!(!dir.path().parent().unwrap().join("etc/passwd").exists());
    }

    #[test]
    fn lenient_mode_skips_and_keeps_safe_members() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive_buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut archive_buf);

            let mut good = tar::Header::new_gnu();
            good.set_size(5);
            good.set_mode(0o644);
            good.set_cksum();
            builder.append_data(&mut good, "safe.txt", &b"hello"[..]).unwrap();

            let mut link = tar::Header::new_gnu();
            link.set_entry_type(EntryType::Symlink);
            link.set_size(0);
            link.set_mode(0o644);
            link.set_link_name("/etc/passwd").unwrap();
            link.set_cksum();
            builder.append_data(&mut link, "evil-link", &b""[..]).unwrap();

            builder.finish().unwrap();
        }
        let extractor = SecureTarExtractor::new(1024, ExtractMode::Lenient);
        let written = extractor.extract_all(&archive_buf, dir.path()).unwrap();
        assert_eq!(written.len(), 1);
        assert!(dir.path().join("safe.txt").exists());
        assert!(!dir.path().join("evil-link").exists());
    }

    #[test]
    fn oversized_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(&[("big.bin", &vec![0u8; 2048])]);
        let extractor = SecureTarExtractor::new(1024, ExtractMode::Strict);
        let err = extractor.extract_all(&archive, dir.path()).unwrap_err();
        assert!(matches!(
            err,
            SecurityError::MemberTooLarge { .. } | SecurityError::ArchiveTooLarge { .. }
        ));
    }

}
