//! Per-rank, per-level metadata and checksums (spec §3 `LevelMeta`, §4
//! component 2).
//!
//! One file per `(sector, group)`, readable independently of the checkpoint
//! data itself, so the recovery cascade (§4.7) can probe what exists
//! without touching potentially large data files.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// One rank's metadata for one checkpoint level (spec §3 `LevelMeta`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelMeta {
    /// Whether the rank believes this level's artifact exists.
    pub exists: bool,
    /// Size of this rank's own checkpoint file at this level.
    pub local_file_size: u64,
    /// Size of the partner-held copy (L2 only; 0 otherwise).
    pub partner_file_size: u64,
    /// Maximum file size across the whole group at this level (used to
    /// pad L3 blocks to a common size).
    pub max_file_size_in_group: u64,
    /// The checkpoint file name this rank wrote at this level.
    pub checkpoint_file_name: String,
    /// Digest of the local file, hex-encoded.
    pub checksum: String,
}

impl LevelMeta {
    /// Metadata for a level this rank has nothing to report for.
    pub fn absent() -> Self {
        LevelMeta {
            exists: false,
            local_file_size: 0,
            partner_file_size: 0,
            max_file_size_in_group: 0,
            checkpoint_file_name: String::new(),
            checksum: String::new(),
        }
    }
}

/// Compute an MD5-class digest of a file, sufficient for error detection
/// (spec §1 "Non-goals: strong cryptographic integrity" explicitly waived).
pub fn checksum_file(path: &Path) -> EngineResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Compute an MD5-class digest of an in-memory buffer.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Verify that `path`'s on-disk digest matches `expected`. Any mismatch is
/// treated as an erasure at the affected level (spec §4.7, §7
/// `ChecksumMismatch`).
pub fn verify_checksum(path: &Path, expected: &str) -> EngineResult<()> {
    let actual = checksum_file(path)?;
    if actual != expected {
        return Err(EngineError::ChecksumMismatch(format!(
            "{}: expected {expected}, got {actual}",
            path.display()
        )));
    }
    Ok(())
}

/// Level numbers used to namespace metadata directories (spec §6
/// `meta/<execution-id>/l1..l4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Level {
    /// Node-local.
    L1 = 1,
    /// Partner ring.
    L2 = 2,
    /// Erasure-coded group.
    L3 = 3,
    /// Persistent file system.
    L4 = 4,
}

impl Level {
    /// Directory name for this level under a sector's metadata root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Level::L1 => "l1",
            Level::L2 => "l2",
            Level::L3 => "l3",
            Level::L4 => "l4",
        }
    }
}

/// Metadata store rooted at `meta/<execution-id>/`.
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// Open (without creating) a metadata store at `meta_dir/<execution_id>`.
    pub fn new(meta_dir: &Path, execution_id: &str) -> Self {
        MetadataStore {
            root: meta_dir.join(execution_id),
        }
    }

    fn level_dir(&self, sector: u32, group: usize, level: Level) -> PathBuf {
        self.root
            .join(level.dir_name())
            .join(format!("sector{sector}"))
            .join(format!("group{group}"))
    }

    fn meta_path(&self, sector: u32, group: usize, level: Level, rank: i32) -> PathBuf {
        self.level_dir(sector, group, level)
            .join(format!("rank{rank}.json"))
    }

    /// Publish one rank's metadata for a level (spec §4.2 step 4 "on
    /// `SUCCESS`, metadata is published").
    pub fn publish(
        &self,
        sector: u32,
        group: usize,
        level: Level,
        rank: i32,
        meta: &LevelMeta,
    ) -> EngineResult<()> {
        let dir = self.level_dir(sector, group, level);
        std::fs::create_dir_all(&dir)?;
        let path = self.meta_path(sector, group, level, rank);
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read one rank's metadata for a level, if published.
    pub fn read(
        &self,
        sector: u32,
        group: usize,
        level: Level,
        rank: i32,
    ) -> EngineResult<Option<LevelMeta>> {
        let path = self.meta_path(sector, group, level, rank);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let meta: LevelMeta = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        Ok(Some(meta))
    }

    /// Read every rank's metadata for a level across a group of `group_size`
    /// ranks, in rank order within the group (absent entries become
    /// `LevelMeta::absent()`).
    pub fn read_group(
        &self,
        sector: u32,
        group: usize,
        level: Level,
        group_ranks: &[i32],
    ) -> EngineResult<Vec<LevelMeta>> {
        group_ranks
            .iter()
            .map(|&r| Ok(self.read(sector, group, level, r)?.unwrap_or_else(LevelMeta::absent)))
            .collect()
    }

    /// Move the metadata directory for `level` up to the L1 slot, unifying
    /// subsequent queries after an L4-origin recovery (spec §4.2 step 5,
    /// §4.7 "if the adopted level is L4 the persisted metadata directory
    /// is moved to the L1 metadata slot").
    pub fn promote_to_l1(&self, sector: u32, group: usize, from: Level) -> EngineResult<()> {
        let src = self.level_dir(sector, group, from);
        let dst = self.level_dir(sector, group, Level::L1);
        if src.exists() {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if dst.exists() {
                std::fs::remove_dir_all(&dst)?;
            }
            std::fs::rename(&src, &dst)?;
        }
        Ok(())
    }

    /// Root directory for this execution id, for callers that need to
    /// lay out additional artifacts alongside (e.g. the topology file).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List every checkpoint this store currently has published metadata
    /// for, across all levels/sectors/groups, without touching any
    /// scratch or persistent data file (spec §11 SUPPLEMENT, grounded on
    /// `veloc-inspect`'s read-only metadata walk). Entries with
    /// `exists: false` (a rank that published "nothing here") are skipped.
    pub fn inspect(&self) -> EngineResult<Vec<InspectEntry>> {
        let mut entries = Vec::new();
        for level in [Level::L1, Level::L2, Level::L3, Level::L4] {
            let level_root = self.root.join(level.dir_name());
            if !level_root.exists() {
                continue;
            }
            for sector_dir in read_dir_entries(&level_root)? {
                let Some(sector) = strip_prefix_number(&sector_dir, "sector") else { continue };
                for group_dir in read_dir_entries(&sector_dir)? {
                    let Some(group) = strip_prefix_number(&group_dir, "group") else { continue };
                    for rank_file in read_dir_entries(&group_dir)? {
                        let Some(rank) = rank_file
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .and_then(|s| s.strip_prefix("rank"))
                            .and_then(|s| s.parse::<i32>().ok())
                        else {
                            continue;
                        };
                        let bytes = std::fs::read(&rank_file)?;
                        let meta: LevelMeta = serde_json::from_slice(&bytes)
                            .map_err(|e| EngineError::Serialization(e.to_string()))?;
                        if !meta.exists {
                            continue;
                        }
                        let (name, _, version) = crate::identity::parse_stem(&meta.checkpoint_file_name)
                            .unwrap_or_else(|_| (meta.checkpoint_file_name.clone(), rank, 0));
                        entries.push(InspectEntry {
                            level,
                            sector: sector as u32,
                            group: group as usize,
                            rank,
                            name,
                            version,
                            checksum: meta.checksum.clone(),
                        });
                    }
                }
            }
        }
        Ok(entries)
    }
}

/// One row of [`MetadataStore::inspect`]'s report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectEntry {
    /// Which level this metadata was published under.
    pub level: Level,
    /// Sector this entry belongs to.
    pub sector: u32,
    /// Group-local index within the sector.
    pub group: usize,
    /// Rank that published this entry.
    pub rank: i32,
    /// Checkpoint name, parsed from the published file name.
    pub name: String,
    /// Checkpoint version, parsed from the published file name.
    pub version: u64,
    /// Hex-encoded digest recorded for this rank's file at this level.
    pub checksum: String,
}

fn read_dir_entries(dir: &Path) -> EngineResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        out.push(entry?.path());
    }
    Ok(out)
}

fn strip_prefix_number(path: &Path, prefix: &str) -> Option<u64> {
    path.file_name()?.to_str()?.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.dat");
        std::fs::write(&path, b"hello world").unwrap();
        let digest = checksum_file(&path).unwrap();
        verify_checksum(&path, &digest).unwrap();

        std::fs::write(&path, b"hello world!").unwrap();
        assert!(verify_checksum(&path, &digest).is_err());
    }

    #[test]
    fn publish_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path(), "exec-1");
        let meta = LevelMeta {
            exists: true,
            local_file_size: 128,
            partner_file_size: 0,
            max_file_size_in_group: 128,
            checkpoint_file_name: "t-0-0.dat".into(),
            checksum: "abc".into(),
        };
        store.publish(0, 0, Level::L1, 0, &meta).unwrap();
        let read_back = store.read(0, 0, Level::L1, 0).unwrap().unwrap();
        assert_eq!(read_back, meta);
        assert!(store.read(0, 0, Level::L1, 1).unwrap().is_none());
    }

    #[test]
    fn promote_moves_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path(), "exec-1");
        let meta = LevelMeta::absent();
        store.publish(0, 0, Level::L4, 0, &meta).unwrap();
        store.promote_to_l1(0, 0, Level::L4).unwrap();
        assert!(store.read(0, 0, Level::L1, 0).unwrap().is_some());
    }

    #[test]
    fn inspect_lists_published_entries_and_skips_absent_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path(), "exec-1");
        let present = LevelMeta {
            exists: true,
            local_file_size: 128,
            partner_file_size: 0,
            max_file_size_in_group: 128,
            checkpoint_file_name: "sim-2-5.dat".into(),
            checksum: "abc123".into(),
        };
        store.publish(0, 0, Level::L1, 2, &present).unwrap();
        store.publish(0, 0, Level::L2, 3, &LevelMeta::absent()).unwrap();

        let report = store.inspect().unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].level, Level::L1);
        assert_eq!(report[0].rank, 2);
        assert_eq!(report[0].name, "sim");
        assert_eq!(report[0].version, 5);
        assert_eq!(report[0].checksum, "abc123");
    }
}
