//! Checksum gate (spec §4.2 "checksum", §6 `chksum`).
//!
//! Every level engine already computes and verifies its own digest
//! independently (L1/L2/L3/L4 each publish a [`LevelMeta::checksum`]); this
//! module is the single on/off switch the orchestrator consults before
//! trusting any of them, and re-verifies the just-promoted L1 copy as a
//! pre-flight check before the rest of the pipeline builds on it.
//!
//! [`LevelMeta::checksum`]: crate::metadata::LevelMeta::checksum

use async_trait::async_trait;

use crate::error::{EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::levels::l1::l1_is_valid;
use crate::levels::PostProcessContext;

use super::DispatchModule;

/// The checksum dispatch module.
pub struct ChecksumModule;

#[async_trait]
impl DispatchModule for ChecksumModule {
    fn name(&self) -> &'static str {
        "checksum"
    }

    async fn run(&self, ctx: &PostProcessContext, id: &CheckpointIdentity) -> EngineResult<ModuleStatus> {
        if !ctx.chksum_enabled {
            return Ok(ModuleStatus::Ignored);
        }
        if l1_is_valid(ctx, id)? {
            Ok(ModuleStatus::Success)
        } else {
            Ok(ModuleStatus::Failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::comm::LocalCommunicator;
    use crate::config::IoMode;
    use crate::levels::l1::L1Level;
    use crate::levels::LevelEngine;
    use crate::metadata::MetadataStore;
    use crate::storage::posix::PosixStorage;
    use crate::topology::BoundTopology;

    fn ctx_for(dir: &std::path::Path, chksum_enabled: bool) -> PostProcessContext {
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
            chksum_enabled,
            max_versions: 2,
            scratch_versions: 2,
        }
    }

    #[tokio::test]
    async fn disabled_module_is_ignored_even_without_a_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), false);
        let id = CheckpointIdentity::new("job", 0, 0).unwrap();
        assert_eq!(ChecksumModule.run(&ctx, &id).await.unwrap(), ModuleStatus::Ignored);
    }

    #[tokio::test]
    async fn enabled_module_confirms_a_freshly_promoted_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), true);
        let id = CheckpointIdentity::new("job", 0, 0).unwrap();
        std::fs::create_dir_all(ctx.scratch.join("tmp")).unwrap();
        std::fs::write(ctx.scratch.join("tmp").join(id.stem()), b"payload").unwrap();
        L1Level.post_process(&ctx, &id).await.unwrap();

        assert_eq!(ChecksumModule.run(&ctx, &id).await.unwrap(), ModuleStatus::Success);
    }
}
