//! On-disk workspace layout and capacity accounting.

use crate::error::CycleError;
use common::{MIN_FREE_SPACE, ProofCategory, TAG_EXTENSION};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory layout under the configured workspace root.
///
/// ```text
/// <root>/ledger/                 keyed ledger
/// <root>/idle/data/<hash>        filler data
/// <root>/idle/tag/<hash>.tag     filler tags
/// <root>/files/<root>/<shard>    service shards (tag at <shard>.tag)
/// <root>/proof/{idle,service}.{proof,mu}
/// <root>/tmp/                    in-flight writes
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create every directory of the layout under `root`.
    pub fn create(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let ws = Self { root: root.into() };
        for dir in [
            ws.root.clone(),
            ws.idle_data_dir(),
            ws.idle_tag_dir(),
            ws.file_dir(),
            ws.proof_dir(),
            ws.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join("ledger")
    }

    pub fn idle_data_dir(&self) -> PathBuf {
        self.root.join("idle").join("data")
    }

    pub fn idle_tag_dir(&self) -> PathBuf {
        self.root.join("idle").join("tag")
    }

    pub fn file_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn proof_dir(&self) -> PathBuf {
        self.root.join("proof")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn idle_data_path(&self, hash: &str) -> PathBuf {
        self.idle_data_dir().join(hash)
    }

    pub fn idle_tag_path(&self, hash: &str) -> PathBuf {
        self.idle_tag_dir().join(format!("{hash}.{TAG_EXTENSION}"))
    }

    pub fn service_root_dir(&self, root_hash: &str) -> PathBuf {
        self.file_dir().join(root_hash)
    }

    /// `(bundle, mu bundle)` paths for a category.
    pub fn bundle_paths(&self, category: ProofCategory) -> (PathBuf, PathBuf) {
        let dir = self.proof_dir();
        (
            dir.join(format!("{}.proof", category.as_str())),
            dir.join(format!("{}.mu", category.as_str())),
        )
    }

    /// Bytes used under the workspace root.
    pub fn used_space(&self) -> std::io::Result<u64> {
        dir_size(&self.root)
    }

    /// Free bytes on the filesystem holding the workspace.
    pub fn free_space(&self) -> std::io::Result<u64> {
        fs2::free_space(&self.root)
    }

    /// Fail when free space is below the floor or the quota is already used.
    pub fn check_capacity(&self, quota_bytes: u64) -> Result<(), CycleError> {
        let free = self.free_space()?;
        if free < MIN_FREE_SPACE {
            return Err(CycleError::Capacity(format!(
                "free space {} below floor {}",
                free, MIN_FREE_SPACE
            )));
        }
        let used = self.used_space()?;
        if used >= quota_bytes {
            return Err(CycleError::Capacity(format!(
                "used space {} reached quota {}",
                used, quota_bytes
            )));
        }
        debug!(free, used, quota_bytes, "Capacity check passed");
        Ok(())
    }
}

/// Recursive size of a directory tree. Symlinks are not followed.
pub fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Best-effort delete of a file that may or may not exist.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let dir = tempdir().unwrap();
        let ws = Workspace::create(dir.path().join("ws")).unwrap();

        assert!(ws.idle_data_dir().is_dir());
        assert!(ws.idle_tag_dir().is_dir());
        assert!(ws.proof_dir().is_dir());
        assert!(ws.idle_tag_path("abc").ends_with("idle/tag/abc.tag"));

        let (bundle, mu) = ws.bundle_paths(ProofCategory::Service);
        assert!(bundle.ends_with("proof/service.proof"));
        assert!(mu.ends_with("proof/service.mu"));
    }

    #[test]
    fn test_dir_size() {
        let dir = tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        std::fs::write(ws.idle_data_path("a"), vec![0u8; 1000]).unwrap();
        std::fs::write(ws.idle_tag_path("a"), vec![0u8; 24]).unwrap();
        assert_eq!(ws.used_space().unwrap(), 1024);
    }

    #[test]
    fn test_quota_reached() {
        let dir = tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        std::fs::write(ws.idle_data_path("a"), vec![0u8; 2048]).unwrap();

        assert!(matches!(
            ws.check_capacity(1024),
            Err(CycleError::Capacity(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_quietly_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        remove_quietly(&path).await;
        std::fs::write(&path, b"x").unwrap();
        remove_quietly(&path).await;
        assert!(!path.exists());
    }
}
