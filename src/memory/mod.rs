//! Hypergraph Memory
//!
//! The long-lived graph store at the center of the core: typed nodes,
//! weighted binary edges, and n-ary hyperedges, with activation spreading,
//! co-activation strengthening, episodic consolidation, and pruning.
//!
//! # Concurrency
//!
//! The store uses reader-writer semantics: any number of concurrent reads,
//! serialized atomic mutations. Every operation takes the lock once and
//! releases it before returning, so traversals observe a snapshot that is
//! consistent for the duration of the call. The lock is never held across an
//! await point.
//!
//! # Determinism
//!
//! All internal indices are B-tree ordered, so neighbor sets, traversal
//! orders, and similarity results are stable functions of graph state.

pub mod activation;
pub mod types;


use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MemoryConfig;
use crate::core::types::{clamp01, cosine_similarity, EpisodicId, NodeId};
use crate::episodic::EpisodicRecord;
use crate::error::{CoreError, CoreResult};

pub use activation::SpreadReport;
pub use types::{
    BinaryEdge, EdgeFilter, EdgeKey, EdgeType, HyperEdge, HyperEdgeId, HyperEdgeType, MemoryNode,
    NodeFilter, NodeType,
};

/// A neighbor reached by `neighbors`, carrying the path score and the type
/// of the first edge on the best path (used for the deterministic
/// tie-break).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: NodeId,
    pub weight: f32,
    pub via: EdgeType,
}

/// What a pruning pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub weak_edges_removed: usize,
    pub consolidated_episodics_removed: usize,
    pub orphans_removed: usize,
}

impl PruneReport {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.weak_edges_removed + self.consolidated_episodics_removed + self.orphans_removed
    }
}

/// Serializable image of the store, used by snapshot/restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    pub nodes: Vec<MemoryNode>,
    pub edges: Vec<BinaryEdge>,
    pub hyperedges: Vec<HyperEdge>,
    pub consolidated: Vec<(EpisodicId, NodeId)>,
}

#[derive(Debug, Default)]
struct GraphInner {
    nodes: BTreeMap<NodeId, MemoryNode>,
    edges: BTreeMap<EdgeKey, BinaryEdge>,
    /// Incident binary edges per node, both directions
    incident: BTreeMap<NodeId, BTreeSet<EdgeKey>>,
    hyperedges: BTreeMap<HyperEdgeId, HyperEdge>,
    hyper_incident: BTreeMap<NodeId, BTreeSet<HyperEdgeId>>,
    /// Episodic records already consolidated, for idempotence
    consolidated: BTreeMap<EpisodicId, NodeId>,
}

impl GraphInner {
    fn link_edge(&mut self, edge: BinaryEdge) {
        let key = edge.key();
        self.incident.entry(edge.src).or_default().insert(key);
        self.incident.entry(edge.dst).or_default().insert(key);
        self.edges.insert(key, edge);
    }

    fn unlink_edge(&mut self, key: EdgeKey) {
        if self.edges.remove(&key).is_some() {
            if let Some(set) = self.incident.get_mut(&key.src) {
                set.remove(&key);
            }
            if let Some(set) = self.incident.get_mut(&key.dst) {
                set.remove(&key);
            }
        }
    }
}

/// The hypergraph memory store.
pub struct HypergraphMemory {
    cfg: MemoryConfig,
    inner: RwLock<GraphInner>,
}

impl HypergraphMemory {
    #[must_use]
    pub fn new(cfg: MemoryConfig) -> Self {
        Self {
            cfg,
            inner: RwLock::new(GraphInner::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.cfg
    }

    // =========================================================================
    // Structural operations
    // =========================================================================

    /// Insert a node. Fails with `Conflict` if the id is already present;
    /// content equality is not deduplicated.
    pub fn add_node(&self, mut node: MemoryNode) -> CoreResult<NodeId> {
        node.importance = clamp01(node.importance);
        node.activation = clamp01(node.activation);
        node.consolidation_level = clamp01(node.consolidation_level);
        if node.last_accessed_at < node.created_at {
            node.last_accessed_at = node.created_at;
        }

        let mut inner = self.write();
        if inner.nodes.contains_key(&node.id) {
            return Err(CoreError::Conflict(format!("duplicate node id {}", node.id)));
        }
        let id = node.id;
        inner.nodes.insert(id, node);
        Ok(id)
    }

    /// Fetch a node by id.
    pub fn get_node(&self, id: NodeId) -> CoreResult<MemoryNode> {
        self.read()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("node {id}")))
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.read().nodes.contains_key(&id)
    }

    /// Record an access on a node; no-op when absent.
    pub fn touch(&self, id: NodeId) {
        let mut inner = self.write();
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.touch(Utc::now());
        }
    }

    /// Insert or update a binary edge.
    ///
    /// Fails with `NotFound` when an endpoint is missing and `InvalidArg`
    /// for self-loops. Re-adding an existing `(src, dst, type)` triple
    /// updates its weight and metadata in place.
    pub fn add_edge(&self, edge: BinaryEdge) -> CoreResult<()> {
        if edge.src == edge.dst {
            return Err(CoreError::InvalidArg(format!(
                "self-loop edge on {}",
                edge.src
            )));
        }
        let mut inner = self.write();
        if !inner.nodes.contains_key(&edge.src) {
            return Err(CoreError::NotFound(format!("edge source {}", edge.src)));
        }
        if !inner.nodes.contains_key(&edge.dst) {
            return Err(CoreError::NotFound(format!("edge target {}", edge.dst)));
        }
        let mut edge = edge;
        edge.weight = clamp01(edge.weight);
        inner.link_edge(edge);
        Ok(())
    }

    /// Insert a hyperedge over at least two distinct existing members.
    pub fn add_hyper_edge(&self, h: HyperEdge) -> CoreResult<HyperEdgeId> {
        if h.members.len() < 2 {
            return Err(CoreError::InvalidArg(format!(
                "hyperedge needs >= 2 distinct members, got {}",
                h.members.len()
            )));
        }
        let mut inner = self.write();
        for member in &h.members {
            if !inner.nodes.contains_key(member) {
                return Err(CoreError::NotFound(format!("hyperedge member {member}")));
            }
        }
        let mut h = h;
        h.weight = clamp01(h.weight);
        let id = h.id;
        for member in h.members.clone() {
            inner.hyper_incident.entry(member).or_default().insert(id);
        }
        inner.hyperedges.insert(id, h);
        Ok(id)
    }

    /// Remove a node together with every incident edge and hyperedge
    /// membership. Hyperedges shrinking below two members are dropped.
    /// No-op when the node is absent.
    pub fn remove_node(&self, id: NodeId) {
        let mut inner = self.write();
        if inner.nodes.remove(&id).is_none() {
            return;
        }

        if let Some(keys) = inner.incident.remove(&id) {
            for key in keys {
                inner.unlink_edge(key);
            }
        }

        if let Some(hyper_ids) = inner.hyper_incident.remove(&id) {
            for hid in hyper_ids {
                let drop_edge = match inner.hyperedges.get_mut(&hid) {
                    Some(h) => {
                        h.members.remove(&id);
                        h.members.len() < 2
                    }
                    None => false,
                };
                if drop_edge {
                    if let Some(h) = inner.hyperedges.remove(&hid) {
                        for member in h.members {
                            if let Some(set) = inner.hyper_incident.get_mut(&member) {
                                set.remove(&hid);
                            }
                        }
                    }
                }
            }
        }

        inner.consolidated.retain(|_, node| *node != id);
    }

    /// Remove a single binary edge; no-op when absent.
    pub fn remove_edge(&self, key: EdgeKey) {
        self.write().unlink_edge(key);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Neighbors within `hops` of `id`, scored by the strongest path
    /// (product of edge weights), ordered by descending score with a
    /// deterministic `(type, id)` tie-break.
    #[must_use]
    pub fn neighbors(&self, id: NodeId, hops: usize, filter: &EdgeFilter) -> Vec<Neighbor> {
        let inner = self.read();
        if !inner.nodes.contains_key(&id) || hops == 0 {
            return Vec::new();
        }

        // best score per reached node, plus the first-hop edge type
        let mut best: BTreeMap<NodeId, (f32, EdgeType)> = BTreeMap::new();
        let mut frontier: Vec<(NodeId, f32, Option<EdgeType>)> = vec![(id, 1.0, None)];

        for _ in 0..hops {
            let mut next: Vec<(NodeId, f32, Option<EdgeType>)> = Vec::new();
            for (current, score, via) in frontier {
                let Some(keys) = inner.incident.get(&current) else {
                    continue;
                };
                for key in keys {
                    let Some(edge) = inner.edges.get(key) else {
                        continue;
                    };
                    if !filter.accepts(edge) {
                        continue;
                    }
                    let Some(other) = edge.opposite(current) else {
                        continue;
                    };
                    if other == id {
                        continue;
                    }
                    let path_score = score * edge.weight;
                    let first_hop = via.unwrap_or(edge.edge_type);
                    let improved = match best.get(&other) {
                        Some((existing, _)) => path_score > *existing,
                        None => true,
                    };
                    if improved {
                        best.insert(other, (path_score, first_hop));
                        next.push((other, path_score, Some(first_hop)));
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let mut result: Vec<Neighbor> = best
            .into_iter()
            .map(|(node, (weight, via))| Neighbor {
                id: node,
                weight,
                via,
            })
            .collect();
        result.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.via.cmp(&b.via))
                .then_with(|| a.id.cmp(&b.id))
        });
        result
    }

    /// Breadth-first traversal from `start` up to `max_depth`, following
    /// edges accepted by `edge_filter`. Visit order is stable given
    /// identical graph state: per node, edges are explored by descending
    /// weight with a `(type, id)` tie-break.
    #[must_use]
    pub fn traverse(
        &self,
        start: NodeId,
        max_depth: usize,
        edge_filter: &EdgeFilter,
    ) -> Vec<NodeId> {
        let inner = self.read();
        if !inner.nodes.contains_key(&start) {
            return Vec::new();
        }

        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        let mut order: Vec<NodeId> = Vec::new();
        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
        visited.insert(start);
        order.push(start);
        queue.push_back((start, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(keys) = inner.incident.get(&current) else {
                continue;
            };
            let mut outgoing: Vec<&BinaryEdge> = keys
                .iter()
                .filter_map(|k| inner.edges.get(k))
                .filter(|e| edge_filter.accepts(e))
                .collect();
            outgoing.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.edge_type.cmp(&b.edge_type))
                    .then_with(|| a.key().cmp(&b.key()))
            });
            for edge in outgoing {
                let Some(other) = edge.opposite(current) else {
                    continue;
                };
                if visited.insert(other) {
                    order.push(other);
                    queue.push_back((other, depth + 1));
                }
            }
        }
        order
    }

    /// Top-k nodes by cosine similarity to `embedding`. Nodes without
    /// embeddings are skipped. Ties break on
    /// `(importance desc, created_at asc, id)`.
    #[must_use]
    pub fn similarity_query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &NodeFilter,
    ) -> Vec<(NodeId, f32)> {
        let inner = self.read();
        let mut scored: Vec<(&MemoryNode, f32)> = inner
            .nodes
            .values()
            .filter(|n| filter.accepts(n))
            .filter_map(|n| {
                n.embedding
                    .as_ref()
                    .map(|e| (n, cosine_similarity(embedding, e)))
            })
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.importance
                        .partial_cmp(&a.importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored
            .into_iter()
            .take(k)
            .map(|(n, s)| (n.id, s))
            .collect()
    }

    /// Nodes currently at or above the configured activation threshold.
    #[must_use]
    pub fn active_nodes(&self) -> Vec<NodeId> {
        let threshold = self.cfg.activation_threshold;
        self.read()
            .nodes
            .values()
            .filter(|n| n.activation >= threshold)
            .map(|n| n.id)
            .collect()
    }

    /// The `k` most activated nodes, activation descending with an id
    /// tie-break. Used by pivotal steps to recompute the focus set.
    #[must_use]
    pub fn top_activated(&self, k: usize) -> Vec<NodeId> {
        let inner = self.read();
        let mut scored: Vec<(f32, NodeId)> = inner
            .nodes
            .values()
            .filter(|n| n.activation > 0.0)
            .map(|n| (n.activation, n.id))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        scored.into_iter().take(k).map(|(_, id)| id).collect()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.read().nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.read().edges.len()
    }

    #[must_use]
    pub fn hyper_edge_count(&self) -> usize {
        self.read().hyperedges.len()
    }

    /// Weight of a specific edge, if present.
    #[must_use]
    pub fn edge_weight(&self, src: NodeId, dst: NodeId, edge_type: EdgeType) -> Option<f32> {
        let key = EdgeKey {
            src,
            dst,
            edge_type,
        };
        self.read().edges.get(&key).map(|e| e.weight)
    }

    /// Any connecting edge between two nodes, regardless of direction or
    /// type, preferring the strongest.
    #[must_use]
    pub fn connecting_edge(&self, a: NodeId, b: NodeId) -> Option<BinaryEdge> {
        let inner = self.read();
        let keys = inner.incident.get(&a)?;
        keys.iter()
            .filter_map(|k| inner.edges.get(k))
            .filter(|e| e.opposite(a) == Some(b))
            .max_by(|x, y| {
                x.weight
                    .partial_cmp(&y.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Nodes matching a filter, ordered by id (deterministic).
    #[must_use]
    pub fn nodes_matching(&self, filter: &NodeFilter) -> Vec<MemoryNode> {
        self.read()
            .nodes
            .values()
            .filter(|n| filter.accepts(n))
            .cloned()
            .collect()
    }

    // =========================================================================
    // Consolidation
    // =========================================================================

    /// Ingest an episodic record: create an `Episodic` node and link it to
    /// each existing association target with a default-weight `Association`
    /// edge. Calling twice with the same episodic id is a no-op that
    /// returns the original node id.
    pub fn consolidate(&self, record: &EpisodicRecord) -> CoreResult<NodeId> {
        let default_weight = self.cfg.default_association_weight;
        let mut inner = self.write();

        if let Some(existing) = inner.consolidated.get(&record.id) {
            return Ok(*existing);
        }

        let mut node = MemoryNode::new(NodeType::Episodic, record.content.clone())
            .with_importance(record.importance);
        node.created_at = record.timestamp;
        node.last_accessed_at = record.timestamp;
        node.tags.insert(record.source.clone());
        if record.emotional_valence.abs() > 0.5 {
            node.tags.insert("emotional".to_string());
        }
        node.set_consolidation_level(1.0);
        let node_id = node.id;
        inner.nodes.insert(node_id, node);

        for target in &record.associations {
            if inner.nodes.contains_key(target) && *target != node_id {
                inner.link_edge(BinaryEdge::new(
                    node_id,
                    *target,
                    EdgeType::Association,
                    default_weight,
                ));
            } else {
                debug!(episodic = %record.id, target = %target, "skipping missing association target");
            }
        }

        inner.consolidated.insert(record.id, node_id);
        Ok(node_id)
    }

    /// Whether an episodic record has already been consolidated.
    #[must_use]
    pub fn is_consolidated(&self, id: EpisodicId) -> bool {
        self.read().consolidated.contains_key(&id)
    }

    /// Node created for a consolidated episodic record, if any.
    #[must_use]
    pub fn consolidated_node(&self, id: EpisodicId) -> Option<NodeId> {
        self.read().consolidated.get(&id).copied()
    }

    // =========================================================================
    // Pruning
    // =========================================================================

    /// Apply the pruning policy:
    ///
    /// (a) binary edges with `weight < w_min` older than `t_min_edge`,
    /// (b) episodic nodes with `importance < i_min` that are consolidated
    ///     to at least `c_consolidated`,
    /// (c) nodes that *became* orphans through (a) or (b) — no remaining
    ///     incident edges or hyperedge memberships — unless their type is
    ///     protected. Nodes that never had a connection are left alone.
    pub fn prune(&self) -> PruneReport {
        let now = Utc::now();
        let min_age =
            chrono::Duration::from_std(Duration::from_secs(self.cfg.t_min_edge_secs))
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut report = PruneReport::default();
        let mut inner = self.write();

        // nodes that lose a connection in this pass
        let mut disturbed: BTreeSet<NodeId> = BTreeSet::new();

        // (a) stale weak edges
        let weak: Vec<EdgeKey> = inner
            .edges
            .values()
            .filter(|e| e.weight < self.cfg.w_min && now - e.created_at >= min_age)
            .map(BinaryEdge::key)
            .collect();
        for key in weak {
            disturbed.insert(key.src);
            disturbed.insert(key.dst);
            inner.unlink_edge(key);
            report.weak_edges_removed += 1;
        }

        // (b) consolidated low-importance episodics
        let spent: Vec<NodeId> = inner
            .nodes
            .values()
            .filter(|n| {
                n.node_type == NodeType::Episodic
                    && n.importance < self.cfg.i_min
                    && n.consolidation_level >= self.cfg.c_consolidated
            })
            .map(|n| n.id)
            .collect();
        for id in spent {
            if let Some(keys) = inner.incident.get(&id) {
                for key in keys {
                    disturbed.insert(key.src);
                    disturbed.insert(key.dst);
                }
            }
            Self::remove_node_locked(&mut inner, id);
            disturbed.remove(&id);
            report.consolidated_episodics_removed += 1;
        }

        // (c) disturbed nodes now fully disconnected
        let orphans: Vec<NodeId> = disturbed
            .into_iter()
            .filter(|id| {
                inner.nodes.get(id).map_or(false, |n| {
                    !n.node_type.protected_from_orphan_prune()
                }) && inner
                    .incident
                    .get(id)
                    .map_or(true, BTreeSet::is_empty)
                    && inner
                        .hyper_incident
                        .get(id)
                        .map_or(true, BTreeSet::is_empty)
            })
            .collect();
        for id in orphans {
            Self::remove_node_locked(&mut inner, id);
            report.orphans_removed += 1;
        }

        if report.total() > 0 {
            debug!(
                weak_edges = report.weak_edges_removed,
                episodics = report.consolidated_episodics_removed,
                orphans = report.orphans_removed,
                "pruned memory"
            );
        }
        report
    }

    fn remove_node_locked(inner: &mut GraphInner, id: NodeId) {
        if inner.nodes.remove(&id).is_none() {
            return;
        }
        if let Some(keys) = inner.incident.remove(&id) {
            for key in keys {
                inner.unlink_edge(key);
            }
        }
        if let Some(hyper_ids) = inner.hyper_incident.remove(&id) {
            for hid in hyper_ids {
                let drop_edge = match inner.hyperedges.get_mut(&hid) {
                    Some(h) => {
                        h.members.remove(&id);
                        h.members.len() < 2
                    }
                    None => false,
                };
                if drop_edge {
                    if let Some(h) = inner.hyperedges.remove(&hid) {
                        for member in h.members {
                            if let Some(set) = inner.hyper_incident.get_mut(&member) {
                                set.remove(&hid);
                            }
                        }
                    }
                }
            }
        }
        inner.consolidated.retain(|_, node| *node != id);
    }

    // =========================================================================
    // Snapshot support
    // =========================================================================

    /// Export a serializable image of the store.
    #[must_use]
    pub fn export(&self) -> MemoryState {
        let inner = self.read();
        MemoryState {
            nodes: inner.nodes.values().cloned().collect(),
            edges: inner.edges.values().cloned().collect(),
            hyperedges: inner.hyperedges.values().cloned().collect(),
            consolidated: inner
                .consolidated
                .iter()
                .map(|(e, n)| (*e, *n))
                .collect(),
        }
    }

    /// Replace the store contents from an exported image, rebuilding all
    /// indices. Numeric fields are re-clamped on the way in.
    pub fn import(&self, state: MemoryState) -> CoreResult<()> {
        let mut fresh = GraphInner::default();
        for mut node in state.nodes {
            node.importance = clamp01(node.importance);
            node.activation = clamp01(node.activation);
            node.consolidation_level = clamp01(node.consolidation_level);
            if node.last_accessed_at < node.created_at {
                node.last_accessed_at = node.created_at;
            }
            if fresh.nodes.insert(node.id, node).is_some() {
                return Err(CoreError::Fatal("duplicate node in snapshot".to_string()));
            }
        }
        for mut edge in state.edges {
            if edge.src == edge.dst {
                return Err(CoreError::Fatal("self-loop edge in snapshot".to_string()));
            }
            if !fresh.nodes.contains_key(&edge.src) || !fresh.nodes.contains_key(&edge.dst) {
                return Err(CoreError::Fatal(
                    "dangling edge endpoint in snapshot".to_string(),
                ));
            }
            edge.weight = clamp01(edge.weight);
            fresh.link_edge(edge);
        }
        for mut h in state.hyperedges {
            if h.members.len() < 2 {
                return Err(CoreError::Fatal(
                    "undersized hyperedge in snapshot".to_string(),
                ));
            }
            for member in &h.members {
                if !fresh.nodes.contains_key(member) {
                    return Err(CoreError::Fatal(
                        "dangling hyperedge member in snapshot".to_string(),
                    ));
                }
            }
            h.weight = clamp01(h.weight);
            let id = h.id;
            for member in h.members.clone() {
                fresh.hyper_incident.entry(member).or_default().insert(id);
            }
            fresh.hyperedges.insert(id, h);
        }
        for (episodic, node) in state.consolidated {
            if !fresh.nodes.contains_key(&node) {
                return Err(CoreError::Fatal(
                    "dangling consolidation mapping in snapshot".to_string(),
                ));
            }
            fresh.consolidated.insert(episodic, node);
        }

        *self.write() = fresh;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GraphInner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, GraphInner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
