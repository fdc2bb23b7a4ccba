//! Retention (spec §4.2 "versioning", §6 `max_versions`/`scratch_versions`).
//!
//! Runs after L1 promotion on every checkpoint, trimming older scratch
//! artifacts (L1/L2/L3) down to `scratch_versions` and older persistent
//! (L4) artifacts down to `max_versions`, per `(name, rank)`. Retention is
//! independent per level directory since a rank's L2 directory also holds
//! its neighbors' partner copies under their own rank tokens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::levels::PostProcessContext;

use super::DispatchModule;

/// The versioning dispatch module.
pub struct VersioningModule;

#[async_trait]
impl DispatchModule for VersioningModule {
    fn name(&self) -> &'static str {
        "versioning"
    }

    async fn run(&self, ctx: &PostProcessContext, id: &CheckpointIdentity) -> EngineResult<ModuleStatus> {
        let mut trimmed = 0usize;
        trimmed += trim_scratch_dir(&ctx.scratch.join("l1"), "dat", ctx.scratch_versions)?;
        trimmed += trim_scratch_dir(&ctx.scratch.join("l2"), "pcof", ctx.scratch_versions)?;
        trimmed += trim_scratch_dir(&ctx.scratch.join("l3"), "ec", ctx.scratch_versions)?;
        trimmed += trim_persistent(ctx, id).await?;

        Ok(if trimmed > 0 {
            ModuleStatus::Success
        } else {
            ModuleStatus::Ignored
        })
    }
}

/// Parse `<name>-<rank_token>-<version>.<ext>`, accepting any rank token
/// (`parse_stem` in `identity` only understands the `.dat` suffix and is
/// not reused here for that reason).
fn parse_versioned_name(file_name: &str, ext: &str) -> Option<(String, String, u64)> {
    let rest = file_name.strip_suffix(&format!(".{ext}"))?;
    let mut parts = rest.rsplitn(3, '-');
    let version: u64 = parts.next()?.parse().ok()?;
    let rank_token = parts.next()?.to_string();
    let name = parts.next()?.to_string();
    Some((name, rank_token, version))
}

/// Trim a scratch level directory to the newest `keep` versions per
/// `(name, rank_token)` group found in it.
fn trim_scratch_dir(dir: &Path, ext: &str, keep: usize) -> EngineResult<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut groups: HashMap<(String, String), Vec<(u64, PathBuf)>> = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some((name, rank_token, version)) = parse_versioned_name(file_name, ext) {
            groups.entry((name, rank_token)).or_default().push((version, entry.path()));
        }
    }

    let mut removed = 0;
    for (_, mut versions) in groups {
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in versions.into_iter().skip(keep) {
            std::fs::remove_file(path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Trim the persistent backend's retained versions for `id.name`/`id.rank`
/// down to `ctx.max_versions`, oldest first.
async fn trim_persistent(ctx: &PostProcessContext, id: &CheckpointIdentity) -> EngineResult<usize> {
    let mut versions = ctx.storage.get_versions(&id.name, id.rank).await?;
    if versions.len() <= ctx.max_versions {
        return Ok(0);
    }
    versions.sort_by(|a, b| b.cmp(a));
    let mut removed = 0;
    for version in versions.into_iter().skip(ctx.max_versions) {
        let stale = CheckpointIdentity::new(id.name.clone(), id.rank, version)?;
        ctx.storage.remove(&stale).await?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::comm::LocalCommunicator;
    use crate::config::IoMode;
    use crate::levels::l1::L1Level;
    use crate::levels::l4::L4Level;
    use crate::levels::LevelEngine;
    use crate::metadata::MetadataStore;
    use crate::storage::posix::PosixStorage;
    use crate::topology::BoundTopology;

    fn ctx_for(dir: &std::path::Path, scratch_versions: usize, max_versions: usize) -> PostProcessContext {
        let comm = LocalCommunicator::build_group(1).remove(0);
        let topology = BoundTopology::new(comm, vec!["node0".into()], false).unwrap();
        PostProcessContext {
            scratch: dir.join("scratch"),
            persistent: dir.join("persistent"),
            meta: Arc::new(MetadataStore::new(&dir.join("meta"), "exec-1")),
            topology,
            sector: 0,
            block_size: 1024,
            io_mode: IoMode::Posix,
            storage: Arc::new(PosixStorage::new(dir.join("persistent")).unwrap()),
            chksum_enabled: true,
            max_versions,
            scratch_versions,
        }
    }

    #[tokio::test]
    async fn trims_scratch_l1_to_newest_n_versions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), 2, 2);
        for version in 0..4u64 {
            let id = CheckpointIdentity::new("job", 0, version).unwrap();
            std::fs::create_dir_all(ctx.scratch.join("tmp")).unwrap();
            std::fs::write(ctx.scratch.join("tmp").join(id.stem()), b"payload").unwrap();
            L1Level.post_process(&ctx, &id).await.unwrap();
        }
        let latest = CheckpointIdentity::new("job", 0, 3).unwrap();
        VersioningModule.run(&ctx, &latest).await.unwrap();

        let remaining: Vec<_> = std::fs::read_dir(ctx.scratch.join("l1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"job-0-3.dat".to_string()));
        assert!(remaining.contains(&"job-0-2.dat".to_string()));
    }

    #[tokio::test]
    async fn trims_persistent_backend_to_max_versions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), 2, 1);
        for version in 0..3u64 {
            let id = CheckpointIdentity::new("job", 0, version).unwrap();
            std::fs::create_dir_all(ctx.scratch.join("l1")).unwrap();
            std::fs::write(ctx.scratch.join("l1").join(id.stem()), b"durable").unwrap();
            L4Level.post_process(&ctx, &id).await.unwrap();
        }
        let latest = CheckpointIdentity::new("job", 0, 2).unwrap();
        VersioningModule.run(&ctx, &latest).await.unwrap();

        let remaining = ctx.storage.get_versions("job", 0).await.unwrap();
        assert_eq!(remaining, vec![2]);
    }
}
