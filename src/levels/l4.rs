//! Level 4: persistent flush (spec §4.6).
//!
//! Delegates the actual write/read to whichever [`StorageModule`] the
//! orchestrator wired up for the configured [`IoMode`] (POSIX per-rank
//! copy, or an aggregated single-object writer for `Mpi`/`Library`); this
//! engine only decides when to call it and what metadata to publish.

use async_trait::async_trait;

use crate::error::{EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::metadata::{checksum_file, verify_checksum, Level, LevelMeta};

use super::{LevelEngine, PostProcessContext};

/// The persistent-storage level engine.
pub struct L4Level;

#[async_trait]
impl LevelEngine for L4Level {
    fn level(&self) -> Level {
        Level::L4
    }

    async fn post_process(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus> {
        let source = ctx.scratch.join("l1").join(id.stem());
        let checksum = checksum_file(&source)?;
        let bytes = ctx.storage.flush(id, &source).await?;

        let meta = LevelMeta {
            exists: true,
            local_file_size: bytes,
            partner_file_size: 0,
            max_file_size_in_group: ctx.group_max_size(bytes).await?,
            checkpoint_file_name: id.stem(),
            checksum,
        };
        ctx.meta.publish(ctx.sector, ctx.group(), Level::L4, id.rank, &meta)?;
        Ok(ModuleStatus::Success)
    }

    async fn recover(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus> {
        let Some(meta) = ctx.meta.read(ctx.sector, ctx.group(), Level::L4, id.rank)? else {
            return Ok(ModuleStatus::Ignored);
        };
        if !meta.exists || !ctx.storage.exists(id).await? {
            return Ok(ModuleStatus::Failure);
        }

        let l1_dir = ctx.scratch.join("l1");
        std::fs::create_dir_all(&l1_dir)?;
        let dest = l1_dir.join(id.stem());
        ctx.storage.restore(id, &dest).await?;

        match verify_checksum(&dest, &meta.checksum) {
            Ok(()) => Ok(ModuleStatus::Success),
            Err(_) => Ok(ModuleStatus::Failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::comm::LocalCommunicator;
    use crate::config::IoMode;
    use crate::metadata::MetadataStore;
    use crate::storage::posix::PosixStorage;
    use crate::topology::BoundTopology;

    fn ctx_for(dir: &std::path::Path) -> PostProcessContext {
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
            max_versions: 2,
            scratch_versions: 2,
        }
    }

    #[tokio::test]
    async fn flushes_and_restores_through_posix_storage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let id = CheckpointIdentity::new("job", 0, 1).unwrap();
        std::fs::create_dir_all(ctx.scratch.join("l1")).unwrap();
        std::fs::write(ctx.scratch.join("l1").join(id.stem()), b"durable-payload").unwrap();

        let level = L4Level;
        assert_eq!(
            level.post_process(&ctx, &id).await.unwrap(),
            ModuleStatus::Success
        );

        std::fs::remove_file(ctx.scratch.join("l1").join(id.stem())).unwrap();
        assert_eq!(level.recover(&ctx, &id).await.unwrap(), ModuleStatus::Success);
        assert_eq!(
            std::fs::read(ctx.scratch.join("l1").join(id.stem())).unwrap(),
            b"durable-payload"
        );
    }

    #[tokio::test]
    async fn recover_fails_when_nothing_was_ever_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let id = CheckpointIdentity::new("job", 0, 1).unwrap();
        assert_eq!(L4Level.recover(&ctx, &id).await.unwrap(), ModuleStatus::Ignored);
    }
}
