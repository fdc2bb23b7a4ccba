//! Level engines (spec §4 component 5: L1 node-local, L2 partner ring, L3
//! Reed-Solomon group, L4 persistent flush).
//!
//! Each engine implements [`LevelEngine`], the module the orchestrator
//! dispatches through in registration order on checkpoint (§4.2 step 3) and
//! probes in ascending level order on restart (§4.7). All four share one
//! [`PostProcessContext`] built by the orchestrator per call.
//!
//! Addressing note: `PostProcessContext::topology.comm` is a communicator
//! scoped to this rank's group (size `G`); `GroupTopology::right()`/`left()`
//! give communicator-local indices into it. `CheckpointIdentity::rank`
//! (not the communicator's own `rank()`) is the stable identifier used for
//! metadata lookups and persistent/scratch file naming, since that is the
//! identity the client and storage layer already key on.

pub mod l1;
pub mod l2;
pub mod l3;
pub mod l4;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::IoMode;
use crate::error::{EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::metadata::{Level, MetadataStore};
use crate::storage::StorageModule;
use crate::topology::BoundTopology;

/// Shared state every level module needs to post-process a checkpoint or
/// attempt a recovery.
pub struct PostProcessContext {
    /// Fast, node-local staging root (`tmp/`, `l1/`, `l2/`, `l3/`).
    pub scratch: PathBuf,
    /// Durable root backing L4.
    pub persistent: PathBuf,
    /// Metadata store rooted at this execution's `meta/<execution-id>`.
    pub meta: Arc<MetadataStore>,
    /// This rank's group topology and group-scoped communicator.
    pub topology: BoundTopology,
    /// Sector this group's metadata lives under.
    pub sector: u32,
    /// Reed-Solomon block size (L3).
    pub block_size: u64,
    /// L4 flush strategy.
    pub io_mode: IoMode,
    /// L4 storage backend.
    pub storage: Arc<dyn StorageModule>,
    /// Whether the checksum dispatch module is active for this command.
    pub chksum_enabled: bool,
    /// Maximum persistent versions retained per name (spec §6 `max_versions`).
    pub max_versions: usize,
    /// Maximum scratch versions retained per name (spec §6 `scratch_versions`).
    pub scratch_versions: usize,
}

impl PostProcessContext {
    pub(crate) fn group(&self) -> usize {
        self.topology.topo.group_id
    }

    /// Group-wide maximum of a per-rank size, used to pad L2/L3 artifacts
    /// to one common size (spec §3 `LevelMeta::max_file_size_in_group`).
    pub async fn group_max_size(&self, local: u64) -> EngineResult<u64> {
        let sizes = self.topology.comm.all_gather(&local.to_le_bytes()).await?;
        Ok(sizes
            .iter()
            .map(|b| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&b[..8]);
                u64::from_le_bytes(arr)
            })
            .max()
            .unwrap_or(local))
    }
}

/// One level's contribution to the checkpoint/restart pipeline (spec §4.2
/// "the backend walks an ordered list of modules").
#[async_trait]
pub trait LevelEngine: Send + Sync {
    /// Which level this engine implements.
    fn level(&self) -> Level;

    /// Run this level's post-process step for a just-written checkpoint.
    async fn post_process(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus>;

    /// Attempt to make this level's artifact available at the scratch L1
    /// slot so `recover_mem` can stream from it (spec §4.7).
    async fn recover(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus>;
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(arr)
}
