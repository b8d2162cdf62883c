//! The fixed overlay topology, fetched from rank 0 and cached for the
//! lifetime of one tool invocation.

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use flux_core::{Handle, RpcFlags};

use crate::hosts::HostMap;
use crate::idset::IdSet;

#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    pub rank: u32,
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub children: Vec<Topology>,
}

impl Topology {
    /// The subtree rooted at `rank`, if present.
    pub fn subtree(&self, rank: u32) -> Option<&Topology> {
        if self.rank == rank {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.subtree(rank))
    }

    /// Every rank in this subtree, including the root.
    pub fn subtree_ranks(&self) -> IdSet {
        let mut ids = IdSet::new();
        self.collect_ranks(&mut ids);
        ids
    }

    fn collect_ranks(&self, ids: &mut IdSet) {
        ids.insert(self.rank);
        for child in &self.children {
            child.collect_ranks(ids);
        }
    }

    /// The parent of `rank` within this subtree.
    pub fn parent_of(&self, rank: u32) -> Option<u32> {
        if self.children.iter().any(|c| c.rank == rank) {
            return Some(self.rank);
        }
        self.children.iter().find_map(|c| c.parent_of(rank))
    }
}

/// Per-invocation context: the handle plus cached topology and host map.
pub struct OverlayCtx {
    handle: Handle,
    topology: Mutex<Option<Topology>>,
    hostmap: Mutex<Option<HostMap>>,
}

impl OverlayCtx {
    pub fn new(handle: Handle) -> Self {
        OverlayCtx {
            handle,
            topology: Mutex::new(None),
            hostmap: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The full topology from rank 0, fetched once.
    pub async fn topology(&self) -> Result<Topology> {
        if let Some(topo) = self.topology.lock().clone() {
            return Ok(topo);
        }
        let rpc = self
            .handle
            .rpc_pack("overlay.topology", &json!({ "rank": 0 }), 0, RpcFlags::empty())
            .await
            .context("error fetching overlay topology")?;
        let topo: Topology = rpc
            .get_unpack()
            .await
            .context("error fetching overlay topology")?;
        *self.topology.lock() = Some(topo.clone());
        Ok(topo)
    }

    pub async fn hostmap(&self) -> Result<HostMap> {
        if let Some(map) = self.hostmap.lock().clone() {
            return Ok(map);
        }
        let hostlist = self
            .handle
            .attr_fetch("hostlist")
            .await
            .context("could not fetch hostlist")?;
        let map = HostMap::decode(&hostlist)?;
        *self.hostmap.lock() = Some(map.clone());
        Ok(map)
    }

    pub async fn host_by_rank(&self, rank: u32) -> String {
        match self.hostmap().await {
            Ok(map) => map
                .host_by_rank(rank)
                .unwrap_or("unknown")
                .to_string(),
            Err(_) => "unknown".to_string(),
        }
    }

    /// All ranks in the subtree rooted at `rank`.
    pub async fn subtree_ranks(&self, rank: u32) -> Result<IdSet> {
        let topo = self.topology().await?;
        let subtree = topo
            .subtree(rank)
            .ok_or_else(|| anyhow!("rank {} is not in the topology", rank))?;
        Ok(subtree.subtree_ranks())
    }

    pub async fn size(&self) -> Result<u32> {
        let topo = self.topology().await?;
        match topo.size {
            Some(size) => Ok(size),
            None => Ok(topo.subtree_ranks().len() as u32),
        }
    }

    /// Resolve a numeric rank or a hostname to a rank (first rank on the
    /// host).
    pub async fn resolve_rank(&self, target: &str) -> Result<u32> {
        if let Ok(rank) = target.parse::<u32>() {
            return Ok(rank);
        }
        let hostmap = self.hostmap().await?;
        hostmap
            .rank_by_host(target)
            .ok_or_else(|| anyhow!("TARGET must be a valid rank or hostname"))
    }

    /// Parent of `rank` per the instance topology.  Rank 0 has none.
    pub async fn parent_of(&self, rank: u32) -> Result<u32> {
        let topo = self.topology().await?;
        let size = self.size().await?;
        if rank >= size {
            anyhow::bail!("{} is not a valid rank in this instance", rank);
        }
        if rank == 0 {
            anyhow::bail!("0 has no parent");
        }
        topo.parent_of(rank)
            .ok_or_else(|| anyhow!("parent of {} not found in topology", rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Topology {
        serde_json::from_value(json!({
            "rank": 0,
            "size": 5,
            "children": [
                { "rank": 1, "children": [
                    { "rank": 3, "children": [] },
                    { "rank": 4, "children": [] },
                ]},
                { "rank": 2, "children": [] },
            ],
        }))
        .unwrap()
    }

    #[test]
    fn subtree_lookup() {
        let topo = sample();
        assert_eq!(topo.subtree(1).unwrap().children.len(), 2);
        assert_eq!(topo.subtree(4).unwrap().children.len(), 0);
        assert!(topo.subtree(9).is_none());
    }

    #[test]
    fn subtree_ranks_includes_root() {
        let topo = sample();
        assert_eq!(topo.subtree_ranks().encode(), "0-4");
        assert_eq!(topo.subtree(1).unwrap().subtree_ranks().encode(), "1,3-4");
    }

    #[test]
    fn parent_lookup() {
        let topo = sample();
        assert_eq!(topo.parent_of(3), Some(1));
        assert_eq!(topo.parent_of(2), Some(0));
        assert_eq!(topo.parent_of(0), None);
    }
}
