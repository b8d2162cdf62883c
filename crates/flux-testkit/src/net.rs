//! Scripted overlay state: a k-ary tree of ranks with per-node health.

use std::collections::HashMap;

use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct NodeSim {
    pub status: String,
    pub duration: f64,
    pub error: Option<String>,
    /// An unreachable rank never answers a health probe; the client's
    /// timeout budget decides how that surfaces.
    pub unreachable: bool,
}

impl Default for NodeSim {
    fn default() -> Self {
        NodeSim {
            status: "full".to_string(),
            duration: 0.0,
            error: None,
            unreachable: false,
        }
    }
}

/// A k-ary overlay of `size` ranks with scripted per-rank health.
#[derive(Debug, Clone)]
pub struct TestNet {
    size: u32,
    fanout: u32,
    nodes: HashMap<u32, NodeSim>,
}

impl TestNet {
    /// All ranks healthy.
    pub fn kary(size: u32, fanout: u32) -> Self {
        assert!(size > 0 && fanout > 0);
        let nodes = (0..size).map(|r| (r, NodeSim::default())).collect();
        TestNet {
            size,
            fanout,
            nodes,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_status(mut self, rank: u32, status: &str) -> Self {
        self.node_mut(rank).status = status.to_string();
        self
    }

    pub fn set_error(mut self, rank: u32, error: &str) -> Self {
        self.node_mut(rank).error = Some(error.to_string());
        self
    }

    pub fn set_duration(mut self, rank: u32, duration: f64) -> Self {
        self.node_mut(rank).duration = duration;
        self
    }

    pub fn set_unreachable(mut self, rank: u32) -> Self {
        self.node_mut(rank).unreachable = true;
        self
    }

    fn node_mut(&mut self, rank: u32) -> &mut NodeSim {
        self.nodes.get_mut(&rank).expect("rank within net size")
    }

    pub fn node(&self, rank: u32) -> Option<&NodeSim> {
        self.nodes.get(&rank)
    }

    pub fn children(&self, rank: u32) -> Vec<u32> {
        (1..=self.fanout)
            .map(|i| rank * self.fanout + i)
            .filter(|&c| c < self.size)
            .collect()
    }

    pub fn parent(&self, rank: u32) -> Option<u32> {
        if rank == 0 || rank >= self.size {
            None
        } else {
            Some((rank - 1) / self.fanout)
        }
    }

    /// Comma-separated host map, `hostN` for rank N.
    pub fn hostlist(&self) -> String {
        (0..self.size)
            .map(|r| format!("host{}", r))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Nested `{rank, size, children}` topology rooted at `rank`.
    pub fn topology_value(&self, rank: u32) -> Value {
        let children: Vec<Value> = self
            .children(rank)
            .into_iter()
            .map(|c| self.topology_value(c))
            .collect();
        json!({ "rank": rank, "size": self.size, "children": children })
    }

    /// The health payload rank `rank` would report.
    pub fn health_value(&self, rank: u32) -> Option<Value> {
        let node = self.nodes.get(&rank)?;
        let children: Vec<Value> = self
            .children(rank)
            .into_iter()
            .filter_map(|c| {
                let sim = self.nodes.get(&c)?;
                let mut entry = json!({
                    "rank": c,
                    "status": sim.status,
                    "duration": sim.duration,
                });
                if let Some(error) = &sim.error {
                    entry["error"] = json!(error);
                }
                Some(entry)
            })
            .collect();
        Some(json!({
            "rank": rank,
            "status": node.status,
            "duration": node.duration,
            "children": children,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kary_tree_shape() {
        let net = TestNet::kary(7, 2);
        assert_eq!(net.children(0), vec![1, 2]);
        assert_eq!(net.children(1), vec![3, 4]);
        assert_eq!(net.children(2), vec![5, 6]);
        assert_eq!(net.children(3), Vec::<u32>::new());
        assert_eq!(net.parent(0), None);
        assert_eq!(net.parent(5), Some(2));
        assert_eq!(net.parent(6), Some(2));
    }

    #[test]
    fn health_reports_children_with_errors() {
        let net = TestNet::kary(3, 2)
            .set_status(2, "lost")
            .set_error(2, "socket closed");
        let health = net.health_value(0).unwrap();
        assert_eq!(health["children"][1]["status"], "lost");
        assert_eq!(health["children"][1]["error"], "socket closed");
        assert!(health["children"][0].get("error").is_none());
    }

    #[test]
    fn topology_nests() {
        let net = TestNet::kary(3, 2);
        let topo = net.topology_value(0);
        assert_eq!(topo["rank"], 0);
        assert_eq!(topo["children"][0]["rank"], 1);
        assert_eq!(topo["children"][1]["rank"], 2);
    }
}
