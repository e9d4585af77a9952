//! Hypergraph memory types
//!
//! The memory store owns typed nodes, binary edges, and n-ary hyperedges.
//! Numeric fields (`importance`, `activation`, `weight`,
//! `consolidation_level`) are clamped to [0,1] at every write, so the store
//! never holds an out-of-range value regardless of caller input.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::types::{clamp01, NodeId};

/// Memory node kinds. A node's type is immutable after creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum NodeType {
    Episodic,
    Semantic,
    Procedural,
    Working,
    Intentional,
    Pattern,
    Insight,
    Thought,
    KnowledgeGap,
}

impl NodeType {
    /// Node types that survive orphan pruning.
    #[must_use]
    pub const fn protected_from_orphan_prune(self) -> bool {
        matches!(self, Self::Intentional | Self::Pattern | Self::Insight)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Working => "working",
            Self::Intentional => "intentional",
            Self::Pattern => "pattern",
            Self::Insight => "insight",
            Self::Thought => "thought",
            Self::KnowledgeGap => "knowledge_gap",
        };
        write!(f, "{name}")
    }
}

/// A typed memory node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: NodeId,
    pub node_type: NodeType,
    /// Opaque payload; the store never interprets it beyond token matching
    pub content: String,
    /// Optional dense vector; absence is permitted everywhere
    pub embedding: Option<Vec<f32>>,
    pub importance: f32,
    /// Transient excitation, spread along edges; distinct from importance
    pub activation: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub tags: BTreeSet<String>,
    /// How settled this memory is, raised by consolidation
    pub consolidation_level: f32,
}

impl MemoryNode {
    /// Create a node with neutral defaults.
    #[must_use]
    pub fn new(node_type: NodeType, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            node_type,
            content: content.into(),
            embedding: None,
            importance: 0.5,
            activation: 0.0,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            tags: BTreeSet::new(),
            consolidation_level: 0.0,
        }
    }

    #[must_use]
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = clamp01(importance);
        self
    }

    #[must_use]
    pub fn with_activation(mut self, activation: f32) -> Self {
        self.activation = clamp01(activation);
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Record an access, keeping `last_accessed_at >= created_at`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now.max(self.created_at);
        self.access_count += 1;
    }

    /// Set activation, clamped.
    pub fn set_activation(&mut self, activation: f32) {
        self.activation = clamp01(activation);
    }

    /// Set consolidation level, clamped.
    pub fn set_consolidation_level(&mut self, level: f32) {
        self.consolidation_level = clamp01(level);
    }
}

/// Binary edge kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum EdgeType {
    Association,
    Causal,
    Temporal,
    Similarity,
    LeadsTo,
    PartOf,
    Enables,
    Contradicts,
}

impl EdgeType {
    /// Fixed per-type gain applied during activation spreading.
    ///
    /// Similarity propagates strongest; Contradicts is negative-going, with
    /// the resulting activation floored at 0 after summation.
    #[must_use]
    pub const fn spread_gain(self) -> f32 {
        match self {
            Self::Similarity => 1.0,
            Self::Association => 0.8,
            Self::Causal | Self::LeadsTo => 0.7,
            Self::Enables => 0.6,
            Self::Temporal | Self::PartOf => 0.5,
            Self::Contradicts => -0.4,
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Association => "association",
            Self::Causal => "causal",
            Self::Temporal => "temporal",
            Self::Similarity => "similarity",
            Self::LeadsTo => "leads_to",
            Self::PartOf => "part_of",
            Self::Enables => "enables",
            Self::Contradicts => "contradicts",
        };
        write!(f, "{name}")
    }
}

/// Identifying key of a binary edge: one edge per (src, dst, type) triple.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EdgeKey {
    pub src: NodeId,
    pub dst: NodeId,
    pub edge_type: EdgeType,
}

/// A weighted, directed binary edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryEdge {
    pub src: NodeId,
    pub dst: NodeId,
    pub edge_type: EdgeType,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl BinaryEdge {
    #[must_use]
    pub fn new(src: NodeId, dst: NodeId, edge_type: EdgeType, weight: f32) -> Self {
        Self {
            src,
            dst,
            edge_type,
            weight: clamp01(weight),
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn key(&self) -> EdgeKey {
        EdgeKey {
            src: self.src,
            dst: self.dst,
            edge_type: self.edge_type,
        }
    }

    /// The other endpoint when seen from `node`, if incident.
    #[must_use]
    pub fn opposite(&self, node: NodeId) -> Option<NodeId> {
        if self.src == node {
            Some(self.dst)
        } else if self.dst == node {
            Some(self.src)
        } else {
            None
        }
    }

    pub fn set_weight(&mut self, weight: f32) {
        self.weight = clamp01(weight);
    }
}

/// Unique identifier for a hyperedge
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HyperEdgeId(pub Uuid);

impl HyperEdgeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HyperEdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HyperEdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hyperedge kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum HyperEdgeType {
    Context,
    Pattern,
    Scene,
    Cluster,
}

/// An n-ary edge over at least two member nodes.
///
/// Membership is a set; duplicate member ids collapse, and construction
/// fails if fewer than two distinct members remain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperEdge {
    pub id: HyperEdgeId,
    pub members: BTreeSet<NodeId>,
    pub hyper_type: HyperEdgeType,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl HyperEdge {
    #[must_use]
    pub fn new(
        members: impl IntoIterator<Item = NodeId>,
        hyper_type: HyperEdgeType,
        weight: f32,
    ) -> Self {
        Self {
            id: HyperEdgeId::new(),
            members: members.into_iter().collect(),
            hyper_type,
            weight: clamp01(weight),
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Predicate over edges used by neighbor queries and traversal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeFilter {
    /// Restrict to these edge types; None accepts all
    pub types: Option<BTreeSet<EdgeType>>,
    /// Minimum edge weight to follow
    pub min_weight: f32,
}

impl EdgeFilter {
    #[must_use]
    pub fn of_types(types: impl IntoIterator<Item = EdgeType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            min_weight: 0.0,
        }
    }

    #[must_use]
    pub fn min_weight(mut self, min_weight: f32) -> Self {
        self.min_weight = min_weight;
        self
    }

    #[must_use]
    pub fn accepts(&self, edge: &BinaryEdge) -> bool {
        if edge.weight < self.min_weight {
            return false;
        }
        match &self.types {
            Some(types) => types.contains(&edge.edge_type),
            None => true,
        }
    }
}

/// Predicate over nodes used by similarity queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    pub types: Option<BTreeSet<NodeType>>,
    pub min_importance: f32,
    pub tag: Option<String>,
}

impl NodeFilter {
    #[must_use]
    pub fn of_types(types: impl IntoIterator<Item = NodeType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn accepts(&self, node: &MemoryNode) -> bool {
        if node.importance < self.min_importance {
            return false;
        }
        if let Some(types) = &self.types {
            if !types.contains(&node.node_type) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !node.tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_fields_are_clamped() {
        let node = MemoryNode::new(NodeType::Semantic, "x")
            .with_importance(2.0)
            .with_activation(-1.0);
        assert_eq!(node.importance, 1.0);
        assert_eq!(node.activation, 0.0);
    }

    #[test]
    fn touch_never_precedes_creation() {
        let mut node = MemoryNode::new(NodeType::Thought, "t");
        let past = node.created_at - chrono::Duration::hours(1);
        node.touch(past);
        assert!(node.last_accessed_at >= node.created_at);
        assert_eq!(node.access_count, 1);
    }

    #[test]
    fn edge_weight_clamped() {
        let a = NodeId::new();
        let b = NodeId::new();
        let edge = BinaryEdge::new(a, b, EdgeType::Association, 1.7);
        assert_eq!(edge.weight, 1.0);
    }

    #[test]
    fn edge_opposite_endpoint() {
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();
        let edge = BinaryEdge::new(a, b, EdgeType::Causal, 0.5);
        assert_eq!(edge.opposite(a), Some(b));
        assert_eq!(edge.opposite(b), Some(a));
        assert_eq!(edge.opposite(c), None);
    }

    #[test]
    fn hyperedge_members_dedup() {
        let a = NodeId::new();
        let b = NodeId::new();
        let h = HyperEdge::new([a, b, a], HyperEdgeType::Context, 0.5);
        assert_eq!(h.members.len(), 2);
    }

    #[test]
    fn spread_gains_ordering() {
        assert!(EdgeType::Similarity.spread_gain() > EdgeType::Association.spread_gain());
        assert!(EdgeType::Contradicts.spread_gain() < 0.0);
    }

    #[test]
    fn edge_filter_by_type_and_weight() {
        let a = NodeId::new();
        let b = NodeId::new();
        let edge = BinaryEdge::new(a, b, EdgeType::Temporal, 0.3);
        let filter = EdgeFilter::of_types([EdgeType::Temporal]).min_weight(0.2);
        assert!(filter.accepts(&edge));
        let strict = EdgeFilter::of_types([EdgeType::Temporal]).min_weight(0.5);
        assert!(!strict.accepts(&edge));
        let other = EdgeFilter::of_types([EdgeType::Causal]);
        assert!(!other.accepts(&edge));
    }

    #[test]
    fn node_filter_by_tag() {
        let node = MemoryNode::new(NodeType::Episodic, "d").with_tag("dream");
        let filter = NodeFilter {
            tag: Some("dream".to_string()),
            ..NodeFilter::default()
        };
        assert!(filter.accepts(&node));
        let other = NodeFilter {
            tag: Some("awake".to_string()),
            ..NodeFilter::default()
        };
        assert!(!other.accepts(&node));
    }

    #[test]
    fn protected_types() {
        assert!(NodeType::Pattern.protected_from_orphan_prune());
        assert!(NodeType::Insight.protected_from_orphan_prune());
        assert!(NodeType::Intentional.protected_from_orphan_prune());
        assert!(!NodeType::Episodic.protected_from_orphan_prune());
    }
}
