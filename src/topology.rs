//! Node/group topology (spec §3 `GroupTopology`, §4 component 1).
//!
//! Builds the node list, per-node body of ranks, optional head rank, and the
//! failure-domain-aware group ring that L2/L3 depend on, from a ranked
//! communicator plus a node identifier supplied per rank by the caller
//! (the engine never discovers node identity itself — that is host
//! environment's job, out of scope per spec §1).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::error::{EngineError, EngineResult};

/// The group topology derived from a communicator and per-rank node ids
/// (spec §3).
#[derive(Debug, Clone)]
pub struct GroupTopology {
    /// Node names in rank order of their first-seen member, i.e. node
    /// list index order (persisted across restarts).
    pub node_list: Vec<String>,
    /// For each node index, the ranks whose process runs on that node,
    /// in ascending rank order.
    pub node_body: Vec<Vec<i32>>,
    /// Head rank for each node, if the deployment elects one
    /// (spec §9 "heads optional").
    pub head_of_node: Vec<Option<i32>>,
    /// This process's node index.
    pub my_node_id: usize,
    /// This process's position within `node_body[my_node_id]`.
    pub my_rank_within_node: usize,
    /// This process's column index across nodes — its position in the
    /// failure-domain ring (the "group").
    pub group_id: usize,
    /// Number of members in the group ring.
    pub group_size: usize,
    /// This process's position within the ring, `0..group_size`.
    pub group_rank: usize,
}

impl GroupTopology {
    /// Build the topology for `rank`, given every rank's node id (an
    /// ordered list, `node_ids[rank]`) and whether this deployment uses
    /// dedicated head processes.
    ///
    /// Ranks are grouped into the ring by position-within-node: the group
    /// ring is the set of ranks holding the same `my_rank_within_node`
    /// index across distinct nodes, guaranteeing (spec §3 invariant) that
    /// ring members live on distinct nodes.
    pub fn build(rank: i32, node_ids: &[String], use_heads: bool) -> EngineResult<GroupTopology> {
        if node_ids.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "topology requires at least one rank".into(),
            ));
        }
        if rank < 0 || rank as usize >= node_ids.len() {
            return Err(EngineError::ConfigInvalid(format!(
                "rank {rank} out of range for {} ranks",
                node_ids.len()
            )));
        }

        // Stable node list: first-seen order of distinct node ids.
        let mut node_list: Vec<String> = Vec::new();
        let mut node_index: BTreeMap<&str, usize> = BTreeMap::new();
        for id in node_ids {
            if !node_index.contains_key(id.as_str()) {
                node_index.insert(id.as_str(), node_list.len());
                node_list.push(id.clone());
            }
        }

        let mut node_body: Vec<Vec<i32>> = vec![Vec::new(); node_list.len()];
        for (r, id) in node_ids.iter().enumerate() {
            let idx = node_index[id.as_str()];
            node_body[idx].push(r as i32);
        }

        let head_of_node: Vec<Option<i32>> = node_body
            .iter()
            .map(|ranks| if use_heads { ranks.first().copied() } else { None })
            .collect();

        let my_node_id = node_index[node_ids[rank as usize].as_str()];
        let my_rank_within_node = node_body[my_node_id]
            .iter()
            .position(|&r| r == rank)
            .expect("rank is a member of its own node body");

        // The group ring: one rank per node at the same within-node
        // position, skipping nodes that don't have a member at that
        // position (uneven node populations).
        let mut group_members: Vec<i32> = node_body
            .iter()
            .filter_map(|ranks| ranks.get(my_rank_within_node).copied())
            .collect();
        group_members.sort_unstable();
        let group_size = group_members.len();
        let group_rank = group_members
            .iter()
            .position(|&r| r == rank)
            .expect("rank participates in its own group");
        let group_id = my_rank_within_node;

        Ok(GroupTopology {
            node_list,
            node_body,
            head_of_node,
            my_node_id,
            my_rank_within_node,
            group_id,
            group_size,
            group_rank,
        })
    }

    /// `(group_rank + 1) mod group_size`.
    pub fn right(&self) -> usize {
        (self.group_rank + 1) % self.group_size
    }

    /// `(group_rank - 1 + group_size) mod group_size`.
    pub fn left(&self) -> usize {
        (self.group_rank + self.group_size - 1) % self.group_size
    }

    /// The global rank at a given position in this topology's group ring.
    pub fn group_member_rank(&self, group_position: usize, node_ids: &[String]) -> Option<i32> {
        // Recompute group membership the same way `build` did, reusable
        // for any position without rebuilding the whole topology.
        let mut node_index: BTreeMap<&str, usize> = BTreeMap::new();
        let mut node_body: Vec<Vec<i32>> = Vec::new();
        for (r, id) in node_ids.iter().enumerate() {
            let idx = *node_index.entry(id.as_str()).or_insert_with(|| {
                node_body.push(Vec::new());
                node_body.len() - 1
            });
            node_body[idx].push(r as i32);
        }
        let mut group_members: Vec<i32> = node_body
            .iter()
            .filter_map(|ranks| ranks.get(self.group_id).copied())
            .collect();
        group_members.sort_unstable();
        group_members.get(group_position).copied()
    }

    /// This node's right/left peer's global rank, recomputed directly
    /// from the group membership captured at build time. Prefer this over
    /// [`GroupTopology::group_member_rank`] in hot paths; it is provided
    /// here so L2/L3 don't need to keep their own copy of node ids.
    pub fn ring_neighbors(&self, all_node_ids: &[String]) -> EngineResult<(i32, i32)> {
        let right = self
            .group_member_rank(self.right(), all_node_ids)
            .ok_or_else(|| EngineError::ConfigInvalid("ring has no right neighbor".into()))?;
        let left = self
            .group_member_rank(self.left(), all_node_ids)
            .ok_or_else(|| EngineError::ConfigInvalid("ring has no left neighbor".into()))?;
        Ok((right, left))
    }

    /// Persist the node name list so that on restart ranks can be remapped
    /// to the same logical slots even if the physical nodes changed
    /// (spec §4 component 1, `meta/<execution-id>/topology`).
    pub fn save_node_list(meta_dir: &Path, node_ids: &[String]) -> EngineResult<()> {
        std::fs::create_dir_all(meta_dir)?;
        let path = meta_dir.join("topology");
        let contents = node_ids.join("\n");
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Load a previously persisted node name list.
    pub fn load_node_list(meta_dir: &Path) -> EngineResult<Vec<String>> {
        let path = meta_dir.join("topology");
        let contents = std::fs::read_to_string(&path)?;
        Ok(contents.lines().map(str::to_string).collect())
    }
}

/// A topology bound to a live communicator, the form level engines consume.
#[derive(Clone)]
pub struct BoundTopology {
    /// The communicator carrying this topology's rank.
    pub comm: Arc<dyn Communicator>,
    /// The structural topology.
    pub topo: Arc<GroupTopology>,
    /// Every rank's node id, needed to resolve ring neighbors.
    pub node_ids: Arc<Vec<String>>,
}

impl BoundTopology {
    /// Build a `BoundTopology` for `comm`'s rank from `node_ids`.
    pub fn new(
        comm: Arc<dyn Communicator>,
        node_ids: Vec<String>,
        use_heads: bool,
    ) -> EngineResult<Self> {
        let topo = GroupTopology::build(comm.rank(), &node_ids, use_heads)?;
        Ok(BoundTopology {
            comm,
            topo: Arc::new(topo),
            node_ids: Arc::new(node_ids),
        })
    }

    /// This rank's right/left ring neighbor ranks.
    pub fn ring_neighbors(&self) -> EngineResult<(i32, i32)> {
        self.topo.ring_neighbors(&self.node_ids)
    }
}

/// Metadata describing shared config (node ids, node-use-head flag) used
/// only for serialized config-driven topology construction, e.g. loaded
/// alongside `EngineConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Node id string for every rank, indexed by rank.
    pub node_ids: Vec<String>,
    /// Whether each node elects a dedicated head process.
    #[serde(default)]
    pub use_heads: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_ids_for(nodes: usize, ranks_per_node: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for n in 0..nodes {
            for _ in 0..ranks_per_node {
                ids.push(format!("node{n}"));
            }
        }
        ids
    }

    #[test]
    fn group_ring_spans_distinct_nodes() {
        let node_ids = node_ids_for(4, 2);
        for rank in 0..node_ids.len() as i32 {
            let topo = GroupTopology::build(rank, &node_ids, false).unwrap();
            assert_eq!(topo.group_size, 4);
            // Every member of the group must be on a distinct node.
            let members: Vec<i32> = (0..topo.group_size)
                .map(|p| topo.group_member_rank(p, &node_ids).unwrap())
                .collect();
            let node_names: std::collections::HashSet<&str> = members
                .iter()
                .map(|&r| node_ids[r as usize].as_str())
                .collect();
            assert_eq!(node_names.len(), topo.group_size);
        }
    }

    #[test]
    fn ring_wraps_around() {
        let node_ids = node_ids_for(4, 1);
        let topo = GroupTopology::build(3, &node_ids, false).unwrap();
        assert_eq!(topo.group_rank, 3);
        assert_eq!(topo.right(), 0);
        assert_eq!(topo.left(), 2);
    }

    #[test]
    fn head_rank_is_first_of_node_body_when_enabled() {
        let node_ids = node_ids_for(2, 3);
        let topo = GroupTopology::build(1, &node_ids, true).unwrap();
        assert_eq!(topo.head_of_node[0], Some(0));
        assert_eq!(topo.head_of_node[1], Some(3));
    }

    #[test]
    fn heads_absent_by_default() {
        let node_ids = node_ids_for(2, 3);
        let topo = GroupTopology::build(1, &node_ids, false).unwrap();
        assert!(topo.head_of_node.iter().all(Option::is_none));
    }

    #[test]
    fn node_list_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ids = node_ids_for(3, 2);
        GroupTopology::save_node_list(dir.path(), &ids).unwrap();
        let loaded = GroupTopology::load_node_list(dir.path()).unwrap();
        assert_eq!(loaded, ids);
    }
}
