//! Level 3: Reed-Solomon over the group (spec §4.5).
//!
//! `k = m = group_size`. Encode streams one block at a time: every rank
//! all-gathers its own data block for that block index, then folds the `k`
//! gathered blocks into its own parity row via [`reed_solomon::encode_row`]
//! (spec §4.5 "all-gathers are used to stream per-block shard data across
//! the group" — used here for both encode and decode instead of the
//! literal `k-1`-step pairwise ring exchange the spec also describes; noted
//! as a deliberate simplification in `DESIGN.md`).

use async_trait::async_trait;

use crate::codec::reed_solomon::{self, Generator};
use crate::error::{EngineError, EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::metadata::{checksum_bytes, verify_checksum, Level, LevelMeta};

use super::l1::l1_is_valid;
use super::{LevelEngine, PostProcessContext};

/// The erasure-coded group level engine.
pub struct L3Level;

fn pad_up(size: u64, block_size: u64) -> u64 {
    if block_size == 0 || size % block_size == 0 {
        size
    } else {
        size + (block_size - size % block_size)
    }
}

fn read_padded(path: &std::path::Path, padded_size: u64) -> EngineResult<Vec<u8>> {
    let mut bytes = std::fs::read(path)?;
    bytes.resize(padded_size as usize, 0);
    Ok(bytes)
}

#[async_trait]
impl LevelEngine for L3Level {
    fn level(&self) -> Level {
        Level::L3
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
        let original_size = std::fs::metadata(&l1_path)?.len();
        let max_size = ctx.group_max_size(original_size).await?;
        let block_size = ctx.block_size;
        let padded_size = pad_up(max_size, block_size);
        let bytes = read_padded(&l1_path, padded_size)?;

        let generator = Generator::new(group_size);
        let my_pos = ctx.topology.topo.group_rank;
        let num_blocks = if block_size == 0 { 0 } else { (padded_size / block_size) as usize };
        let mut parity = Vec::with_capacity(padded_size as usize);

        for b in 0..num_blocks {
            let start = b * block_size as usize;
            let end = start + block_size as usize;
            let my_block = bytes[start..end].to_vec();
            let gathered = ctx.topology.comm.all_gather(&my_block).await?;
            let parity_block = reed_solomon::encode_row(&generator, my_pos, &gathered)?;
            parity.extend_from_slice(&parity_block);
        }

        let l3_dir = ctx.scratch.join("l3");
        std::fs::create_dir_all(&l3_dir)?;
        let ec_path = l3_dir.join(format!("{}-{}-{}.ec", id.name, id.rank, id.version));
        std::fs::write(&ec_path, &parity)?;

        let meta = LevelMeta {
            exists: true,
            local_file_size: original_size,
            partner_file_size: 0,
            max_file_size_in_group: max_size,
            checkpoint_file_name: ec_path
                .file_name()
                .expect("ec path has a file name")
                .to_string_lossy()
                .into_owned(),
            checksum: checksum_bytes(&parity),
        };
        ctx.meta.publish(ctx.sector, ctx.group(), Level::L3, id.rank, &meta)?;
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

        let my_l1_ok = l1_is_valid(ctx, id)?;
        let l3_meta = ctx.meta.read(ctx.sector, ctx.group(), Level::L3, id.rank)?;
        let my_parity_ok = match &l3_meta {
            Some(m) if m.exists => {
                let path = ctx.scratch.join("l3").join(&m.checkpoint_file_name);
                path.exists() && verify_checksum(&path, &m.checksum).is_ok()
            }
            _ => false,
        };

        // Every rank calls the same two collectives regardless of its own
        // status, matching the L2 lockstep discipline.
        let data_ok = ctx.topology.comm.all_gather(&[my_l1_ok as u8]).await?;
        let parity_ok = ctx.topology.comm.all_gather(&[my_parity_ok as u8]).await?;

        let erased_count = data_ok.iter().filter(|b| b[0] == 0).count()
            + parity_ok.iter().filter(|b| b[0] == 0).count();
        if erased_count > group_size {
            return Err(EngineError::GroupUnrecoverable {
                level: 3,
                reason: format!("{erased_count} erasures exceed k={group_size}"),
            });
        }
        if my_l1_ok {
            return Ok(ModuleStatus::Ignored);
        }
        if erased_count == 0 {
            return Ok(ModuleStatus::Ignored);
        }

        let l1_meta = ctx
            .meta
            .read(ctx.sector, ctx.group(), Level::L1, id.rank)?
            .ok_or_else(|| EngineError::GroupUnrecoverable {
                level: 3,
                reason: "no L1 metadata available to size the reconstruction".into(),
            })?;
        let block_size = ctx.block_size;
        let padded_size = pad_up(l1_meta.max_file_size_in_group, block_size);
        let num_blocks = if block_size == 0 { 0 } else { (padded_size / block_size) as usize };

        let my_data_buf = if my_l1_ok {
            read_padded(&ctx.scratch.join("l1").join(id.stem()), padded_size)?
        } else {
            vec![0u8; padded_size as usize]
        };
        let my_parity_buf = if my_parity_ok {
            let meta = l3_meta.as_ref().expect("checked above");
            read_padded(&ctx.scratch.join("l3").join(&meta.checkpoint_file_name), padded_size)?
        } else {
            vec![0u8; padded_size as usize]
        };

        let generator = Generator::new(group_size);
        let my_pos = ctx.topology.topo.group_rank;
        let mut recovered = Vec::with_capacity(padded_size as usize);

        for b in 0..num_blocks {
            let start = b * block_size as usize;
            let end = start + block_size as usize;

            let gathered_data = ctx.topology.comm.all_gather(&my_data_buf[start..end]).await?;
            let gathered_parity = ctx.topology.comm.all_gather(&my_parity_buf[start..end]).await?;

            let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(2 * group_size);
            for p in 0..group_size {
                shards.push((data_ok[p][0] == 1).then(|| gathered_data[p].clone()));
            }
            for p in 0..group_size {
                shards.push((parity_ok[p][0] == 1).then(|| gathered_parity[p].clone()));
            }

            reed_solomon::decode(&generator, &mut shards)?;
            recovered.extend_from_slice(shards[my_pos].as_ref().expect("own position recovered"));
        }

        recovered.truncate(l1_meta.local_file_size as usize);
        let l1_dir = ctx.scratch.join("l1");
        std::fs::create_dir_all(&l1_dir)?;
        std::fs::write(l1_dir.join(id.stem()), recovered)?;
        Ok(ModuleStatus::Success)
    }
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

    fn ctx_for(
        root: &std::path::Path,
        comm: std::sync::Arc<LocalCommunicator>,
        nodes: Vec<String>,
    ) -> PostProcessContext {
        let dir = root.join(format!("rank{}", comm.rank()));
        let topology = BoundTopology::new(comm, nodes, false).unwrap();
        PostProcessContext {
            scratch: dir.join("scratch"),
            persistent: dir.join("persistent"),
            meta: Arc::new(MetadataStore::new(&root.join("meta"), "exec-1")),
            topology,
            sector: 0,
            block_size: 8,
            io_mode: IoMode::Posix,
            storage: Arc::new(PosixStorage::new(dir.join("persistent")).unwrap()),
            chksum_enabled: true,
            max_versions: 2,
            scratch_versions: 2,
        }
    }

    async fn write_and_promote(ctx: &PostProcessContext, id: &CheckpointIdentity, payload: &[u8]) {
        std::fs::create_dir_all(ctx.scratch.join("tmp")).unwrap();
        std::fs::write(ctx.scratch.join("tmp").join(id.stem()), payload).unwrap();
        L1Level.post_process(ctx, id).await.unwrap();
    }

    #[tokio::test]
    async fn encode_then_recover_two_lost_shards() {
        let dir = tempfile::tempdir().unwrap();
        let comms = LocalCommunicator::build_group(5);
        let nodes = node_ids(5);

        let mut handles = Vec::new();
        for comm in comms {
            let root = dir.path().to_path_buf();
            let nodes = nodes.clone();
            handles.push(tokio::spawn(async move {
                let rank = comm.rank();
                let ctx = ctx_for(&root, comm, nodes);
                let id = CheckpointIdentity::new("job", rank, 0).unwrap();
                write_and_promote(&ctx, &id, format!("payload-from-rank-{rank:02}").as_bytes()).await;
                L3Level.post_process(&ctx, &id).await.unwrap();
                (rank, ctx)
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        // Lose rank 1's L1 file and rank 3's parity file (distinct
        // positions, total erasures = 2 <= k = 5).
        let id1 = CheckpointIdentity::new("job", 1, 0).unwrap();
        std::fs::remove_file(results[1].1.scratch.join("l1").join(id1.stem())).unwrap();
        let id3 = CheckpointIdentity::new("job", 3, 0).unwrap();
        let ec_name = format!("job-{}-0.ec", 3);
        std::fs::remove_file(results[3].1.scratch.join("l3").join(&ec_name)).unwrap();
        let _ = id3;

        let mut handles = Vec::new();
        for (rank, ctx) in results {
            handles.push(tokio::spawn(async move {
                let id = CheckpointIdentity::new("job", rank, 0).unwrap();
                let status = L3Level.recover(&ctx, &id).await.unwrap();
                (rank, status, ctx)
            }));
        }
        let mut outcomes = Vec::new();
        for h in handles {
            outcomes.push(h.await.unwrap());
        }

        let (_, status1, ctx1) = &outcomes[1];
        assert_eq!(*status1, ModuleStatus::Success);
        let id1 = CheckpointIdentity::new("job", 1, 0).unwrap();
        let recovered = std::fs::read(ctx1.scratch.join("l1").join(id1.stem())).unwrap();
        assert_eq!(recovered, b"payload-from-rank-01");
    }
}
