//! Activation spreading and co-activation strengthening
//!
//! Activation is the transient counterpart of importance: it spreads along
//! edges, decays every iteration, and is the substrate for relevance
//! realization and dream-time edge strengthening.
//!
//! # Double buffering
//!
//! Each iteration computes every node's new activation from a snapshot of
//! the previous values, then swaps the buffers, so the result is
//! independent of node iteration order.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::types::{clamp01, NodeId};
use crate::memory::types::{BinaryEdge, EdgeType};
use crate::memory::HypergraphMemory;

/// Outcome of a spreading pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpreadReport {
    /// Nodes at or above the activation threshold after the final iteration
    pub active_nodes: usize,
    /// Iterations actually run
    pub iterations: usize,
    /// Seeds that were present in the store
    pub seeds_found: usize,
}

impl HypergraphMemory {
    /// Seed the given nodes at full activation and spread for `iterations`
    /// rounds with per-iteration `decay`.
    ///
    /// Per iteration every node's activation becomes
    /// `clamp(own * (1 - decay) + sum(neighbor * edge_weight * type_gain))`,
    /// computed double-buffered. Contradicts edges contribute negatively;
    /// the clamp floors the result at zero. Nodes ending at or above the
    /// configured activation threshold get their access time updated.
    pub fn spread_activation(
        &self,
        seeds: &[NodeId],
        iterations: usize,
        decay: f32,
    ) -> SpreadReport {
        let threshold = self.config().activation_threshold;
        let decay = decay.clamp(0.0, 1.0);
        let mut inner = self.write();

        let mut seeds_found = 0;
        for seed in seeds {
            if let Some(node) = inner.nodes.get_mut(seed) {
                node.set_activation(1.0);
                seeds_found += 1;
            }
        }
        if seeds_found == 0 {
            return SpreadReport::default();
        }

        for iteration in 0..iterations {
            // old buffer: snapshot of current activations
            let previous: BTreeMap<NodeId, f32> = inner
                .nodes
                .iter()
                .map(|(id, n)| (*id, n.activation))
                .collect();

            let mut next: BTreeMap<NodeId, f32> = BTreeMap::new();
            for (id, own) in &previous {
                let mut incoming = 0.0f32;
                if let Some(keys) = inner.incident.get(id) {
                    for key in keys {
                        let Some(edge) = inner.edges.get(key) else {
                            continue;
                        };
                        let Some(other) = edge.opposite(*id) else {
                            continue;
                        };
                        let neighbor = previous.get(&other).copied().unwrap_or(0.0);
                        incoming += neighbor * edge.weight * edge.edge_type.spread_gain();
                    }
                }
                next.insert(*id, clamp01(own * (1.0 - decay) + incoming));
            }

            for (id, activation) in next {
                if let Some(node) = inner.nodes.get_mut(&id) {
                    node.set_activation(activation);
                }
            }
            trace!(iteration, "activation spread iteration complete");
        }

        let now = Utc::now();
        let mut active_nodes = 0;
        for node in inner.nodes.values_mut() {
            if node.activation >= threshold {
                node.touch(now);
                active_nodes += 1;
            }
        }

        SpreadReport {
            active_nodes,
            iterations,
            seeds_found,
        }
    }

    /// Multiply every activation by `1 - decay`. Used by pivotal steps to
    /// relax focus between spreads.
    pub fn decay_activation(&self, decay: f32) {
        let decay = decay.clamp(0.0, 1.0);
        let mut inner = self.write();
        for node in inner.nodes.values_mut() {
            let next = node.activation * (1.0 - decay);
            node.set_activation(next);
        }
    }

    /// Strengthen the connection between every pair of co-activated nodes.
    ///
    /// For each pair simultaneously at or above the activation threshold,
    /// an existing connecting edge is strengthened asymptotically
    /// (`w += alpha * (1 - w)`); absent any edge, a new `Association` edge
    /// is created with weight `alpha`. Returns the number of edges touched.
    pub fn strengthen_coactivated(&self) -> usize {
        let threshold = self.config().activation_threshold;
        let alpha = self.config().alpha;
        let mut inner = self.write();

        let active: Vec<NodeId> = inner
            .nodes
            .values()
            .filter(|n| n.activation >= threshold)
            .map(|n| n.id)
            .collect();

        let mut touched = 0;
        for (i, &a) in active.iter().enumerate() {
            for &b in &active[i + 1..] {
                // strongest existing edge between the pair, either direction
                let existing = inner
                    .incident
                    .get(&a)
                    .map(|keys| {
                        keys.iter()
                            .filter_map(|k| inner.edges.get(k))
                            .filter(|e| e.opposite(a) == Some(b))
                            .max_by(|x, y| {
                                x.weight
                                    .partial_cmp(&y.weight)
                                    .unwrap_or(std::cmp::Ordering::Equal)
                            })
                            .map(BinaryEdge::key)
                    })
                    .unwrap_or(None);

                match existing {
                    Some(key) => {
                        if let Some(edge) = inner.edges.get_mut(&key) {
                            let next = edge.weight + alpha * (1.0 - edge.weight);
                            edge.set_weight(next);
                            touched += 1;
                        }
                    }
                    None => {
                        inner.link_edge(BinaryEdge::new(a, b, EdgeType::Association, alpha));
                        touched += 1;
                    }
                }
            }
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use crate::config::CoreConfig;
    use crate::memory::types::{BinaryEdge, EdgeType, MemoryNode, NodeType};
    use crate::memory::HypergraphMemory;

    fn store() -> HypergraphMemory {
        HypergraphMemory::new(CoreConfig::default().memory)
    }

    #[test]
    fn spreading_reaches_neighbors() {
        let mem = store();
        let a = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "a"))
            .unwrap();
        let b = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "b"))
            .unwrap();
        mem.add_edge(BinaryEdge::new(a, b, EdgeType::Similarity, 0.9))
            .unwrap();

        let report = mem.spread_activation(&[a], 2, 0.2);
        assert_eq!(report.seeds_found, 1);
        assert!(report.active_nodes >= 1);

        let b_node = mem.get_node(b).unwrap();
        assert!(b_node.activation > 0.0, "activation should have spread to b");
    }

    #[test]
    fn spreading_is_order_independent() {
        // A chain a-b-c: after one iteration, b receives only a's and c's
        // OLD activations, independent of map order.
        let mem = store();
        let a = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "a").with_activation(1.0))
            .unwrap();
        let b = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "b"))
            .unwrap();
        let c = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "c"))
            .unwrap();
        mem.add_edge(BinaryEdge::new(a, b, EdgeType::Similarity, 1.0))
            .unwrap();
        mem.add_edge(BinaryEdge::new(b, c, EdgeType::Similarity, 1.0))
            .unwrap();

        mem.spread_activation(&[a], 1, 0.0);

        // c's only neighbor is b, whose old activation was 0 in iteration 1
        let c_node = mem.get_node(c).unwrap();
        assert_eq!(c_node.activation, 0.0);
    }

    #[test]
    fn contradicts_pulls_activation_down_but_not_below_zero() {
        let mem = store();
        let a = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "a"))
            .unwrap();
        let b = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "b").with_activation(0.3))
            .unwrap();
        mem.add_edge(BinaryEdge::new(a, b, EdgeType::Contradicts, 1.0))
            .unwrap();

        mem.spread_activation(&[a], 1, 0.0);
        let b_node = mem.get_node(b).unwrap();
        assert!(b_node.activation >= 0.0);
        assert!(b_node.activation < 0.3, "contradicts should reduce activation");
    }

    #[test]
    fn missing_seeds_are_a_no_op() {
        let mem = store();
        let report = mem.spread_activation(&[crate::core::types::NodeId::new()], 3, 0.1);
        assert_eq!(report.seeds_found, 0);
        assert_eq!(report.active_nodes, 0);
    }

    #[test]
    fn strengthen_creates_association_when_absent() {
        let mem = store();
        let a = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "a").with_activation(0.9))
            .unwrap();
        let b = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "b").with_activation(0.8))
            .unwrap();

        let touched = mem.strengthen_coactivated();
        assert_eq!(touched, 1);

        let alpha = mem.config().alpha;
        let edge = mem.connecting_edge(a, b).expect("edge created");
        assert!((edge.weight - alpha).abs() < 1e-6);
    }

    #[test]
    fn strengthen_is_asymptotic() {
        let mem = store();
        let alpha = mem.config().alpha;
        let a = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "a").with_activation(0.9))
            .unwrap();
        let b = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "b").with_activation(0.9))
            .unwrap();

        mem.strengthen_coactivated();
        mem.strengthen_coactivated();

        // two reinforcements: alpha + alpha*(1-alpha) = 2a - a^2
        let expected = 2.0 * alpha - alpha * alpha;
        let edge = mem.connecting_edge(a, b).expect("edge");
        assert!((edge.weight - expected).abs() < 1e-6);
        assert!(edge.weight < 1.0);
    }

    #[test]
    fn inactive_pairs_are_untouched() {
        let mem = store();
        let a = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "a").with_activation(0.9))
            .unwrap();
        let b = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "b").with_activation(0.1))
            .unwrap();

        let touched = mem.strengthen_coactivated();
        assert_eq!(touched, 0);
        assert!(mem.connecting_edge(a, b).is_none());
    }

    #[test]
    fn decay_activation_relaxes_everything() {
        let mem = store();
        let a = mem
            .add_node(MemoryNode::new(NodeType::Semantic, "a").with_activation(1.0))
            .unwrap();
        mem.decay_activation(0.5);
        assert!((mem.get_node(a).unwrap().activation - 0.5).abs() < 1e-6);
    }
}
