//! Per-rank POSIX storage backend (spec §4.6 "Per-rank POSIX").
//!
//! Each rank's artifact is a plain file under `persistent/`; file-mode
//! checkpoints additionally get a symlink back to the user's original path
//! once the copy lands successfully.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::identity::{parse_stem, CheckpointIdentity};
use crate::metadata::checksum_file;

use super::StorageModule;

/// Scratch-to-persistent-directory POSIX copy backend.
pub struct PosixStorage {
    persistent_dir: PathBuf,
}

impl PosixStorage {
    /// Build a backend rooted at `persistent_dir`, creating it if absent.
    pub fn new(persistent_dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let persistent_dir = persistent_dir.into();
        std::fs::create_dir_all(&persistent_dir)?;
        Ok(PosixStorage { persistent_dir })
    }

    fn data_path(&self, id: &CheckpointIdentity) -> PathBuf {
        self.persistent_dir.join(id.stem())
    }

    fn checksum_path(&self, id: &CheckpointIdentity) -> PathBuf {
        self.persistent_dir.join(id.meta_stem())
    }
}

#[async_trait]
impl StorageModule for PosixStorage {
    async fn get_versions(&self, name: &str, rank: i32) -> EngineResult<Vec<u64>> {
        let mut versions = Vec::new();
        let mut entries = match std::fs::read_dir(&self.persistent_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next().transpose()? {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str() else {
                continue;
            };
            if !stem.ends_with(".dat") {
                continue;
            }
            if let Ok((n, r, v)) = parse_stem(stem) {
                if n == name && r == rank {
                    versions.push(v);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn exists(&self, id: &CheckpointIdentity) -> EngineResult<bool> {
        Ok(self.data_path(id).exists())
    }

    async fn flush(&self, id: &CheckpointIdentity, source: &Path) -> EngineResult<u64> {
        let dest = self.data_path(id);
        let bytes = std::fs::copy(source, &dest)?;
        let digest = checksum_file(&dest)?;
        std::fs::write(self.checksum_path(id), digest)?;
        if let Some(original) = &id.original_path {
            let link_path = dest.with_extension("orig_link");
            let _ = std::fs::remove_file(&link_path);
            #[cfg(unix)]
            std::os::unix::fs::symlink(original, &link_path)?;
            #[cfg(not(unix))]
            std::fs::write(&link_path, original.to_string_lossy().as_bytes())?;
        }
        Ok(bytes)
    }

    async fn restore(&self, id: &CheckpointIdentity, dest: &Path) -> EngineResult<u64> {
        let src = self.data_path(id);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::copy(src, dest)?)
    }

    async fn remove(&self, id: &CheckpointIdentity) -> EngineResult<()> {
        let path = self.data_path(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let checksum_path = self.checksum_path(id);
        if checksum_path.exists() {
            std::fs::remove_file(checksum_path)?;
        }
        Ok(())
    }
}
