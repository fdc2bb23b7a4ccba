//! Level 1: node-local (spec §4.3).
//!
//! Post-process does nothing beyond the scratch write already performed by
//! the client except promote it into the level's own directory with an
//! atomic rename; recovery is present iff the local file exists, its size
//! matches metadata, and its checksum verifies.

use async_trait::async_trait;

use crate::error::{EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::metadata::{checksum_file, verify_checksum, Level, LevelMeta};

use super::{LevelEngine, PostProcessContext};

/// The node-local level engine.
pub struct L1Level;

#[async_trait]
impl LevelEngine for L1Level {
    fn level(&self) -> Level {
        Level::L1
    }

    async fn post_process(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus> {
        let tmp_path = ctx.scratch.join("tmp").join(id.stem());
        let l1_dir = ctx.scratch.join("l1");
        std::fs::create_dir_all(&l1_dir)?;
        let dest = l1_dir.join(id.stem());
        std::fs::rename(&tmp_path, &dest)?;

        let size = std::fs::metadata(&dest)?.len();
        let checksum = checksum_file(&dest)?;
        let max_file_size_in_group = ctx.group_max_size(size).await?;

        let meta = LevelMeta {
            exists: true,
            local_file_size: size,
            partner_file_size: 0,
            max_file_size_in_group,
            checkpoint_file_name: id.stem(),
            checksum,
        };
        ctx.meta.publish(ctx.sector, ctx.group(), Level::L1, id.rank, &meta)?;
        Ok(ModuleStatus::Success)
    }

    async fn recover(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus> {
        let Some(meta) = ctx.meta.read(ctx.sector, ctx.group(), Level::L1, id.rank)? else {
            return Ok(ModuleStatus::Ignored);
        };
        if !meta.exists {
            return Ok(ModuleStatus::Ignored);
        }
        let path = ctx.scratch.join("l1").join(&meta.checkpoint_file_name);
        if !path.exists() {
            return Ok(ModuleStatus::Failure);
        }
        let actual_size = std::fs::metadata(&path)?.len();
        if actual_size != meta.local_file_size {
            return Ok(ModuleStatus::Failure);
        }
        match verify_checksum(&path, &meta.checksum) {
            Ok(()) => Ok(ModuleStatus::Success),
            Err(_) => Ok(ModuleStatus::Failure),
        }
    }
}

/// Whether rank `id.rank`'s own L1 copy currently verifies, used by L2/L3
/// recovery to decide whether they even need to act.
pub fn l1_is_valid(ctx: &PostProcessContext, id: &CheckpointIdentity) -> EngineResult<bool> {
    let Some(meta) = ctx.meta.read(ctx.sector, ctx.group(), Level::L1, id.rank)? else {
        return Ok(false);
    };
    if !meta.exists {
        return Ok(false);
    }
    let path = ctx.scratch.join("l1").join(&meta.checkpoint_file_name);
    Ok(path.exists()
        && std::fs::metadata(&path).map(|m| m.len()).ok() == Some(meta.local_file_size)
        && verify_checksum(&path, &meta.checksum).is_ok())
}
