//! Level 2: partner ring (spec §4.4).
//!
//! Each rank exchanges its L1 file with its ring neighbors: send to `right`,
//! receive from `left`, writing the received bytes to `scratch/l2/` as the
//! partner copy. Odd/even group-rank ordering sequences the send/recv pair
//! so a strictly blocking transport doesn't deadlock.

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::metadata::{checksum_bytes, verify_checksum, Level, LevelMeta};

use super::l1::l1_is_valid;
use super::{decode_u64, LevelEngine, PostProcessContext};

/// The partner-ring level engine.
pub struct L2Level;

impl L2Level {
    fn pcof_path(
        ctx: &PostProcessContext,
        name: &str,
        owner_rank: i32,
        version: u64,
    ) -> std::path::PathBuf {
        ctx.scratch
            .join("l2")
            .join(format!("{name}-{owner_rank}-{version}.pcof"))
    }
}

#[async_trait]
impl LevelEngine for L2Level {
    fn level(&self) -> Level {
        Level::L2
    }

    async fn post_process(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus> {
        let group_size = ctx.topology.topo.group_size;
        if group_size <= 1 {
            return Ok(ModuleStatus::Ignored);
        }

        let l1_path = ctx.scratch.join("l1").join(id.stem());
        let my_bytes = std::fs::read(&l1_path)?;

        let right = ctx.topology.topo.right() as i32;
        let left = ctx.topology.topo.left() as i32;

        let sizes = ctx
            .topology
            .comm
            .all_gather(&(my_bytes.len() as u64).to_le_bytes())
            .await?;
        let left_len = decode_u64(&sizes[left as usize]) as usize;

        let group_rank = ctx.topology.topo.group_rank;
        let received = if group_rank % 2 == 0 {
            ctx.topology.comm.send(right, &my_bytes).await?;
            ctx.topology.comm.recv(left, left_len).await?
        } else {
            let incoming = ctx.topology.comm.recv(left, left_len).await?;
            ctx.topology.comm.send(right, &my_bytes).await?;
            incoming
        };

        // The owner of the data we just received is our left neighbor; we
        // don't know its `CheckpointIdentity::rank` directly (only its
        // group-local position), so the file is named by group position
        // and resolved back to a real rank only through published L1
        // metadata, same as the owner published it under its own rank.
        let owner_rank = ctx.topology.topo.group_member_rank(left as usize, &ctx.topology.node_ids)
            .unwrap_or(left);
        let l2_dir = ctx.scratch.join("l2");
        std::fs::create_dir_all(&l2_dir)?;
        let pcof_path = Self::pcof_path(ctx, &id.name, owner_rank, id.version);
        std::fs::write(&pcof_path, &received)?;

        let meta = LevelMeta {
            exists: true,
            local_file_size: my_bytes.len() as u64,
            partner_file_size: received.len() as u64,
            max_file_size_in_group: ctx.group_max_size(my_bytes.len() as u64).await?,
            checkpoint_file_name: pcof_path
                .file_name()
                .expect("pcof path has a file name")
                .to_string_lossy()
                .into_owned(),
            checksum: checksum_bytes(&received),
        };
        ctx.meta.publish(ctx.sector, ctx.group(), Level::L2, id.rank, &meta)?;
        Ok(ModuleStatus::Success)
    }

    async fn recover(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus> {
        let group_size = ctx.topology.topo.group_size;
        if group_size <= 1 {
            return Ok(ModuleStatus::Ignored);
        }

        let right = ctx.topology.topo.right() as i32;
        let left = ctx.topology.topo.left() as i32;

        let my_l1_ok = l1_is_valid(ctx, id)?;

        let l2_meta = ctx.meta.read(ctx.sector, ctx.group(), Level::L2, id.rank)?;
        let my_partner_ok = match &l2_meta {
            Some(m) if m.exists => {
                let path = ctx.scratch.join("l2").join(&m.checkpoint_file_name);
                path.exists() && verify_checksum(&path, &m.checksum).is_ok()
            }
            _ => false,
        };

        // Every rank calls the same three collectives unconditionally and
        // in the same order, regardless of its own need/holder status —
        // the lockstep collective model requires every participant to
        // step through identical rounds even when a round's result only
        // matters to some of them.
        let need_flags = ctx.topology.comm.all_gather(&[!my_l1_ok as u8]).await?;
        let holder_valid = ctx.topology.comm.all_gather(&[my_partner_ok as u8]).await?;
        let backup_len_flags = ctx
            .topology
            .comm
            .all_gather(&local_backup_len(ctx, id)?.to_le_bytes())
            .await?;

        let my_pos = ctx.topology.topo.group_rank;
        let i_need_recovery = need_flags[my_pos].first() == Some(&1);
        // `right(my_pos)` is the rank that holds my backup copy.
        let my_backup_is_valid = holder_valid[right as usize].first() == Some(&1);

        // Sender role runs unconditionally, before any early return for
        // this rank's own recoverability: another rank may be waiting on
        // us regardless of whether we ourselves can be recovered.
        let left_needs = need_flags[left as usize].first() == Some(&1);
        if left_needs && my_partner_ok {
            let meta = l2_meta.as_ref().expect("checked above");
            let path = ctx.scratch.join("l2").join(&meta.checkpoint_file_name);
            let bytes = std::fs::read(path)?;
            ctx.topology.comm.send(left, &bytes).await?;
        }

        if i_need_recovery && !my_backup_is_valid {
            return Err(EngineError::GroupUnrecoverable {
                level: 2,
                reason: format!(
                    "rank {} lost its L1 file and its partner copy at {right} is also missing",
                    id.rank
                ),
            });
        }

        if i_need_recovery {
            let len = decode_u64(&backup_len_flags[right as usize]) as usize;
            let recovered = ctx.topology.comm.recv(right, len).await?;
            let l1_dir = ctx.scratch.join("l1");
            std::fs::create_dir_all(&l1_dir)?;
            std::fs::write(l1_dir.join(id.stem()), recovered)?;
            Ok(ModuleStatus::Success)
        } else if my_l1_ok {
            Ok(ModuleStatus::Ignored)
        } else {
            Ok(ModuleStatus::Failure)
        }
    }
}

/// The length of the backup copy this rank holds for its left neighbor (0
/// if none), reported into the all-gather that lets the needing rank on
/// the other side of the ring learn how many bytes to expect.
fn local_backup_len(ctx: &PostProcessContext, id: &CheckpointIdentity) -> EngineResult<u64> {
    let l2_meta = ctx.meta.read(ctx.sector, ctx.group(), Level::L2, id.rank)?;
    Ok(l2_meta.map(|m| m.partner_file_size).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::comm::{Communicator, LocalCommunicator};
    use crate::config::IoMode;
    use crate::levels::l1::L1Level;
    use crate::metadata::MetadataStore;
    use crate::storage::posix::PosixStorage;
    use crate::topology::BoundTopology;

    fn node_ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node{i}")).collect()
    }

    async fn write_and_promote(ctx: &PostProcessContext, id: &CheckpointIdentity, payload: &[u8]) {
        std::fs::create_dir_all(ctx.scratch.join("tmp")).unwrap();
        std::fs::write(ctx.scratch.join("tmp").join(id.stem()), payload).unwrap();
        L1Level.post_process(ctx, id).await.unwrap();
    }

    fn ctx_for(root: &std::path::Path, comm: std::sync::Arc<LocalCommunicator>, nodes: Vec<String>) -> PostProcessContext {
        let dir = root.join(format!("rank{}", comm.rank()));
        let topology = BoundTopology::new(comm, nodes, false).unwrap();
        PostProcessContext {
            scratch: dir.join("scratch"),
            persistent: dir.join("persistent"),
            meta: Arc::new(MetadataStore::new(&root.join("meta"), "exec-1")),
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
    async fn partner_exchange_round_trip_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let comms = LocalCommunicator::build_group(4);
        let nodes = node_ids(4);

        let mut handles = Vec::new();
        for comm in comms {
            let root = dir.path().to_path_buf();
            let nodes = nodes.clone();
            handles.push(tokio::spawn(async move {
                let rank = comm.rank();
                let ctx = ctx_for(&root, comm, nodes);
                let id = CheckpointIdentity::new("job", rank, 0).unwrap();
                write_and_promote(&ctx, &id, format!("rank-{rank}-payload").as_bytes()).await;
                L2Level.post_process(&ctx, &id).await.unwrap();
                (rank, ctx)
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        // Delete rank 2's L1 file; its left neighbor (rank 1) holds the
        // backup, so L2 recovery should succeed.
        let (_, victim_ctx) = &results[2];
        let id2 = CheckpointIdentity::new("job", 2, 0).unwrap();
        std::fs::remove_file(victim_ctx.scratch.join("l1").join(id2.stem())).unwrap();

        let mut handles = Vec::new();
        for (rank, ctx) in results {
            handles.push(tokio::spawn(async move {
                let id = CheckpointIdentity::new("job", rank, 0).unwrap();
                L2Level.recover(&ctx, &id).await
            }));
        }
        let mut statuses = Vec::new();
        for h in handles {
            statuses.push(h.await.unwrap().unwrap());
        }
        assert_eq!(statuses[2], ModuleStatus::Success);
    }
}
