//! Cluster topology snapshots.
//!
//! The wire topology carries node ids only; handles are resolved through
//! the orchestrator's pool, which keeps the peer graph acyclic in memory.

use crate::device::DeviceCapabilities;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// A directed edge in the peer graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEdge {
    pub to: String,
    pub description: String,
}

/// A snapshot of which nodes exist in the cluster and how they are
/// pairwise connected. Edges may be unidirectional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Capabilities per node id
    pub nodes: HashMap<String, DeviceCapabilities>,

    /// Outgoing edges per node id
    pub peer_graph: HashMap<String, Vec<PeerEdge>>,
}

impl Topology {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.peer_graph.is_empty()
    }

    pub fn add_node(&mut self, id: impl Into<String>, capabilities: DeviceCapabilities) {
        self.nodes.insert(id.into(), capabilities);
    }

    pub fn add_edge(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        description: impl Into<String>,
    ) {
        let edge = PeerEdge {
            to: to.into(),
            description: description.into(),
        };
        let edges = self.peer_graph.entry(from.into()).or_default();
        if !edges.iter().any(|e| e.to == edge.to) {
            edges.push(edge);
        }
    }

    /// Merge another collection result into this one.
    ///
    /// Duplicate node ids keep the later writer (with a warning); edges
    /// are deduplicated on (from, to).
    pub fn merge(&mut self, other: Topology) {
        for (id, capabilities) in other.nodes {
            if self.nodes.insert(id.clone(), capabilities).is_some() {
                warn!(node_id = %id, "duplicate node in topology merge, keeping later entry");
            }
        }
        for (from, edges) in other.peer_graph {
            for edge in edges {
                self.add_edge(from.clone(), edge.to, edge.description);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities::unknown()
    }

    #[test]
    fn test_add_edge_dedupes() {
        let mut topo = Topology::default();
        topo.add_edge("a", "b", "RPC peer");
        topo.add_edge("a", "b", "RPC peer");
        topo.add_edge("a", "c", "RPC peer");
        assert_eq!(topo.peer_graph["a"].len(), 2);
    }

    #[test]
    fn test_merge_unions_nodes() {
        let mut left = Topology::default();
        left.add_node("a", caps());
        left.add_edge("a", "b", "RPC peer");

        let mut right = Topology::default();
        right.add_node("b", caps());
        right.add_edge("b", "a", "RPC peer");

        left.merge(right);
        assert_eq!(left.nodes.len(), 2);
        assert_eq!(left.peer_graph.len(), 2);
    }

    #[test]
    fn test_merge_later_writer_wins() {
        let mut left = Topology::default();
        left.add_node("a", caps());

        let mut newer = DeviceCapabilities::unknown();
        newer.memory_mib = 4096;
        let mut right = Topology::default();
        right.add_node("a", newer.clone());

        left.merge(right);
        assert_eq!(left.nodes["a"], newer);
    }

    #[test]
    fn test_merge_dedupes_edges() {
        let mut left = Topology::default();
        left.add_edge("a", "b", "RPC peer");

        let mut right = Topology::default();
        right.add_edge("a", "b", "RPC peer");
        right.add_edge("a", "c", "RPC peer");

        left.merge(right);
        assert_eq!(left.peer_graph["a"].len(), 2);
    }

    #[test]
    fn test_cbor_roundtrip() {
        let mut topo = Topology::default();
        topo.add_node("a", caps());
        topo.add_edge("a", "b", "RPC peer");

        let mut buf = Vec::new();
        ciborium::into_writer(&topo, &mut buf).unwrap();
        let decoded: Topology = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(decoded, topo);
    }
}
