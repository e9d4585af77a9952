//! Dream Consolidator
//!
//! Offline processing that runs while the lifecycle is in `Dreaming`. Five
//! sub-phases execute in order, each under its own timeout; a failing
//! sub-phase is logged and the next one still runs:
//!
//! 1. memory consolidation (episodic drain into the hypergraph, then a
//!    short activation spread with co-activation strengthening)
//! 2. pattern extraction (similarity/temporal clustering into `Pattern`
//!    hyperedges and summary nodes)
//! 3. wisdom extraction (capability call over the episodic sample)
//! 4. insight integration (insights become goals and `Insight` nodes)
//! 5. pruning
//!
//! The run is summarized in a `DreamRecord`, which is itself written back
//! into memory as an `Episodic` node tagged `"dream"`.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::types::{clamp01, cosine_similarity, token_set, DreamId, EpisodicId, NodeId};
use crate::core::Components;
use crate::episodic::{EpisodeKind, EpisodicRecord};
use crate::error::{CoreError, CoreResult};
use crate::goals::{Goal, GoalSource, TimeHorizon};
use crate::llm::{generate_with_retry, GenerateOptions};
use crate::memory::{
    BinaryEdge, EdgeType, HyperEdge, HyperEdgeType, MemoryNode, NodeFilter, NodeType, PruneReport,
};
use crate::wisdom::Wisdom;

/// Outcome of one dream sub-phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub ok: bool,
    pub items: usize,
    pub detail: String,
}

impl PhaseReport {
    fn ok(name: &str, items: usize, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            items,
            detail: detail.into(),
        }
    }

    fn failed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            items: 0,
            detail: detail.into(),
        }
    }
}

/// Summary of one complete dream cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamRecord {
    pub id: DreamId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseReport>,
    pub episodics_consolidated: usize,
    pub patterns_created: usize,
    pub wisdom_added: usize,
    pub goals_pushed: usize,
    pub pruned: PruneReport,
}

/// A wisdom candidate parsed from capability output.
#[derive(Debug, Clone, PartialEq)]
pub struct WisdomCandidate {
    pub content: String,
    pub confidence: f32,
    pub applicability: f32,
}

/// Parse capability output into wisdom candidates.
///
/// The expected line format is
/// `INSIGHT: <text> | confidence=<0..1> | applicability=<0..1>`;
/// plain `- ` bullet lines are accepted with default scores.
#[must_use]
pub fn parse_wisdom_candidates(text: &str) -> Vec<WisdomCandidate> {
    let mut candidates = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("INSIGHT:") {
            let mut content = rest.trim().to_string();
            let mut confidence = 0.6;
            let mut applicability = 0.5;
            if let Some((head, tail)) = rest.split_once('|') {
                content = head.trim().to_string();
                for field in tail.split('|') {
                    let field = field.trim();
                    if let Some(value) = field.strip_prefix("confidence=") {
                        confidence = value.trim().parse().unwrap_or(confidence);
                    } else if let Some(value) = field.strip_prefix("applicability=") {
                        applicability = value.trim().parse().unwrap_or(applicability);
                    }
                }
            }
            if !content.is_empty() {
                candidates.push(WisdomCandidate {
                    content,
                    confidence: clamp01(confidence),
                    applicability: clamp01(applicability),
                });
            }
        } else if let Some(rest) = line.strip_prefix("- ") {
            if !rest.trim().is_empty() {
                candidates.push(WisdomCandidate {
                    content: rest.trim().to_string(),
                    confidence: 0.6,
                    applicability: 0.5,
                });
            }
        }
    }
    candidates
}

/// An item being clustered during pattern extraction.
struct ClusterItem {
    node: NodeId,
    tokens: BTreeSet<String>,
    embedding: Option<Vec<f32>>,
    created_at: DateTime<Utc>,
}

impl ClusterItem {
    fn similarity(&self, other: &Self, temporal_horizon_secs: f32) -> f32 {
        let semantic = match (&self.embedding, &other.embedding) {
            (Some(a), Some(b)) => cosine_similarity(a, b).max(0.0),
            _ => {
                if self.tokens.is_empty() || other.tokens.is_empty() {
                    0.0
                } else {
                    let hits = self.tokens.intersection(&other.tokens).count() as f32;
                    let union = self.tokens.union(&other.tokens).count() as f32;
                    hits / union
                }
            }
        };
        let gap = (self.created_at - other.created_at).num_seconds().abs() as f32;
        let temporal = (1.0 - gap / temporal_horizon_secs).clamp(0.0, 1.0);
        0.8 * semantic + 0.2 * temporal
    }
}

/// The dream consolidator.
pub struct DreamConsolidator {
    comps: Arc<Components>,
    records: Mutex<Vec<DreamRecord>>,
}

impl DreamConsolidator {
    #[must_use]
    pub fn new(comps: Arc<Components>) -> Self {
        Self {
            comps,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Run a full dream cycle. Never returns an error: sub-phase failures
    /// are recorded in the returned `DreamRecord`.
    pub async fn run(&self) -> DreamRecord {
        let started_at = Utc::now();
        let timeout = self.comps.config.dream.phase_timeout();
        let mut phases = Vec::with_capacity(5);

        let mut consolidated_nodes: Vec<NodeId> = Vec::new();
        let mut sample: Vec<EpisodicRecord> = Vec::new();
        let mut episodics_consolidated = 0;
        let mut patterns_created = 0;
        let mut wisdom_added: Vec<Wisdom> = Vec::new();
        let mut goals_pushed = 0;
        let mut pruned = PruneReport::default();

        // 1. memory consolidation
        match tokio::time::timeout(timeout, self.consolidate_phase()).await {
            Ok(Ok((report, nodes, drained))) => {
                episodics_consolidated = report.items;
                consolidated_nodes = nodes;
                sample = drained;
                phases.push(report);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "dream consolidation phase failed");
                phases.push(PhaseReport::failed("consolidation", e.to_string()));
            }
            Err(_) => phases.push(PhaseReport::failed("consolidation", "timed out")),
        }

        // 2. pattern extraction
        match tokio::time::timeout(timeout, self.pattern_phase(&consolidated_nodes)).await {
            Ok(Ok(report)) => {
                patterns_created = report.items;
                phases.push(report);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "pattern extraction failed");
                phases.push(PhaseReport::failed("patterns", e.to_string()));
            }
            Err(_) => phases.push(PhaseReport::failed("patterns", "timed out")),
        }

        // 3. wisdom extraction
        match tokio::time::timeout(timeout, self.wisdom_phase(&sample)).await {
            Ok(Ok((report, added))) => {
                wisdom_added = added;
                phases.push(report);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "wisdom extraction failed");
                phases.push(PhaseReport::failed("wisdom", e.to_string()));
            }
            Err(_) => phases.push(PhaseReport::failed("wisdom", "timed out")),
        }

        // 4. insight integration
        match tokio::time::timeout(timeout, self.insight_phase(&wisdom_added)).await {
            Ok(Ok(report)) => {
                goals_pushed = report.items;
                phases.push(report);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "insight integration failed");
                phases.push(PhaseReport::failed("insights", e.to_string()));
            }
            Err(_) => phases.push(PhaseReport::failed("insights", "timed out")),
        }

        // 5. pruning
        match tokio::time::timeout(timeout, async { self.comps.memory.prune() }).await {
            Ok(report) => {
                pruned = report;
                phases.push(PhaseReport::ok(
                    "pruning",
                    report.total(),
                    format!(
                        "{} weak edges, {} episodics, {} orphans",
                        report.weak_edges_removed,
                        report.consolidated_episodics_removed,
                        report.orphans_removed
                    ),
                ));
            }
            Err(_) => phases.push(PhaseReport::failed("pruning", "timed out")),
        }

        let record = DreamRecord {
            id: DreamId::new(),
            started_at,
            finished_at: Utc::now(),
            phases,
            episodics_consolidated,
            patterns_created,
            wisdom_added: wisdom_added.len(),
            goals_pushed,
            pruned,
        };

        self.store_record(&record);
        info!(
            dream = %record.id,
            consolidated = record.episodics_consolidated,
            patterns = record.patterns_created,
            wisdom = record.wisdom_added,
            goals = record.goals_pushed,
            "dream cycle complete"
        );
        record
    }

    /// Phase 1: drain the episodic buffer into the hypergraph. Each record
    /// gets its own short activation spread seeded by its fresh node,
    /// followed by co-activation strengthening, so repeated experience of
    /// the same pair reinforces their edge once per occurrence.
    async fn consolidate_phase(
        &self,
    ) -> CoreResult<(PhaseReport, Vec<NodeId>, Vec<EpisodicRecord>)> {
        let comps = &self.comps;
        let dream_cfg = &comps.config.dream;
        let drained = comps.episodic.drain();
        let mut nodes = Vec::with_capacity(drained.len());
        let mut strengthened = 0;

        for record in &drained {
            match comps.memory.consolidate(record) {
                Ok(node_id) => {
                    comps.episodic.mark_consolidated(record.id);
                    comps.memory.spread_activation(
                        &[node_id],
                        dream_cfg.spread_iterations,
                        dream_cfg.spread_decay,
                    );
                    strengthened += comps.memory.strengthen_coactivated();
                    comps.memory.decay_activation(1.0);
                    nodes.push(node_id);
                }
                Err(e) => debug!(episodic = %record.id, error = %e, "consolidation skipped"),
            }
        }
        // purge the records whose consolidation just completed
        let _ = comps.episodic.drain();

        Ok((
            PhaseReport::ok(
                "consolidation",
                nodes.len(),
                format!("{strengthened} edges strengthened"),
            ),
            nodes,
            drained,
        ))
    }

    /// Phase 2: cluster the fresh nodes together with recent episodic and
    /// semantic memory; coherent clusters become `Pattern` structure.
    async fn pattern_phase(&self, fresh: &[NodeId]) -> CoreResult<PhaseReport> {
        let comps = &self.comps;
        let cfg = &comps.config.dream;

        let mut candidates: BTreeSet<NodeId> = fresh.iter().copied().collect();
        let filter = NodeFilter::of_types([NodeType::Episodic, NodeType::Semantic]);
        for node in comps.memory.nodes_matching(&filter) {
            candidates.insert(node.id);
        }

        let items: Vec<ClusterItem> = candidates
            .into_iter()
            .filter_map(|id| comps.memory.get_node(id).ok())
            .map(|n| ClusterItem {
                node: n.id,
                tokens: token_set(&n.content),
                embedding: n.embedding,
                created_at: n.created_at,
            })
            .collect();

        let clusters = cluster(&items, cfg.k_cluster, cfg.rho_cluster);
        let mut created = 0;
        for cluster in clusters {
            let members: Vec<NodeId> = cluster.iter().map(|i| items[*i].node).collect();
            let summary = summarize_cluster(&cluster, &items);
            let pattern = MemoryNode::new(NodeType::Pattern, summary)
                .with_importance(0.6)
                .with_tag("dream_pattern");
            let pattern_id = pattern.id;
            if comps.memory.add_node(pattern).is_err() {
                continue;
            }
            if comps
                .memory
                .add_hyper_edge(HyperEdge::new(
                    members.iter().copied(),
                    HyperEdgeType::Pattern,
                    0.6,
                ))
                .is_err()
            {
                continue;
            }
            for member in &members {
                let _ = comps.memory.add_edge(BinaryEdge::new(
                    *member,
                    pattern_id,
                    EdgeType::PartOf,
                    0.5,
                ));
            }
            created += 1;
        }

        Ok(PhaseReport::ok(
            "patterns",
            created,
            format!("{} items considered", items.len()),
        ))
    }

    /// Phase 3: ask the capability for wisdom candidates over the episodic
    /// sample; keep confident, novel ones.
    async fn wisdom_phase(
        &self,
        sample: &[EpisodicRecord],
    ) -> CoreResult<(PhaseReport, Vec<Wisdom>)> {
        let comps = &self.comps;
        let cfg = &comps.config.dream;
        if sample.is_empty() {
            return Ok((PhaseReport::ok("wisdom", 0, "no sample"), Vec::new()));
        }

        let mut experiences = String::new();
        for record in sample.iter().take(24) {
            experiences.push_str("- ");
            experiences.push_str(&record.content);
            experiences.push('\n');
        }
        let system = comps.identity.wrap(
            "You are dreaming. Distill durable insights from the recent experiences below. \
             Answer only with lines of the form \
             `INSIGHT: <text> | confidence=<0..1> | applicability=<0..1>`.",
            &crate::identity::StateSummary::default(),
        );
        let opts = GenerateOptions::default()
            .with_deadline(comps.config.llm.deadline())
            .with_temperature(0.9);
        let text = generate_with_retry(
            comps.llm.as_ref(),
            &system,
            &experiences,
            &opts,
            &comps.config.llm,
        )
        .await
        .map_err(CoreError::from)?;

        let source_ids: Vec<EpisodicId> = sample.iter().map(|r| r.id).collect();
        let mut added = Vec::new();
        for candidate in parse_wisdom_candidates(&text) {
            if candidate.confidence < cfg.wisdom_min_confidence {
                debug!(content = %candidate.content, "wisdom candidate below confidence floor");
                continue;
            }
            if comps
                .wisdom
                .is_near_duplicate(&candidate.content, cfg.sigma_dup)
            {
                debug!(content = %candidate.content, "wisdom candidate near-duplicate");
                continue;
            }
            let wisdom = Wisdom::new(
                candidate.content,
                candidate.confidence,
                candidate.applicability,
            )
            .with_depth(0.4 + 0.2 * candidate.confidence)
            .with_sources(source_ids.iter().copied());
            comps.wisdom.add(wisdom.clone());
            added.push(wisdom);
        }

        let report = PhaseReport::ok("wisdom", added.len(), format!("{} sampled", sample.len()));
        Ok((report, added))
    }

    /// Phase 4: the strongest fresh insights become goals tagged
    /// `dream_insight` and `Insight` nodes linked to their sources.
    async fn insight_phase(&self, fresh_wisdom: &[Wisdom]) -> CoreResult<PhaseReport> {
        let comps = &self.comps;
        let cfg = &comps.config.dream;

        let mut ranked: Vec<&Wisdom> = fresh_wisdom.iter().collect();
        ranked.sort_by(|a, b| {
            b.rank()
                .partial_cmp(&a.rank())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut pushed = 0;
        for wisdom in ranked.into_iter().take(cfg.max_insight_goals) {
            let insight_node = MemoryNode::new(NodeType::Insight, wisdom.content.clone())
                .with_importance(wisdom.rank())
                .with_tag("dream_insight");
            let insight_id = insight_node.id;
            if comps.memory.add_node(insight_node).is_err() {
                continue;
            }
            for source in &wisdom.source_experiences {
                if let Some(source_node) = comps.memory.consolidated_node(*source) {
                    let _ = comps.memory.add_edge(BinaryEdge::new(
                        source_node,
                        insight_id,
                        EdgeType::Enables,
                        0.5,
                    ));
                }
            }
            comps.goals.push(Goal::new(
                format!("Act on the insight: {}", wisdom.content),
                clamp01(0.4 + 0.6 * wisdom.rank()),
                TimeHorizon::Medium,
                GoalSource::DreamInsight,
            ));
            pushed += 1;
        }

        Ok(PhaseReport::ok("insights", pushed, ""))
    }

    /// Write the dream record into memory and the episodic stream.
    fn store_record(&self, record: &DreamRecord) {
        let comps = &self.comps;
        let summary = format!(
            "Dream {}: consolidated {}, {} patterns, {} wisdom, {} goals, pruned {}.",
            record.id,
            record.episodics_consolidated,
            record.patterns_created,
            record.wisdom_added,
            record.goals_pushed,
            record.pruned.total()
        );
        let node = MemoryNode::new(NodeType::Episodic, summary.clone())
            .with_importance(0.6)
            .with_tag("dream");
        let _ = comps.memory.add_node(node);
        comps.episodic.append(
            EpisodicRecord::new(EpisodeKind::Dream, summary, "dream")
                .with_importance(0.6)
                .with_metadata("dream_id", record.id.to_string()),
        );
        self.lock_records().push(record.clone());
    }

    #[must_use]
    pub fn records(&self) -> Vec<DreamRecord> {
        self.lock_records().clone()
    }

    pub fn import_records(&self, records: Vec<DreamRecord>) {
        *self.lock_records() = records;
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Vec<DreamRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Greedy clustering over pairwise similarity. Returns index sets of
/// clusters meeting the size floor whose mean pairwise similarity reaches
/// the coherence floor.
fn cluster(items: &[ClusterItem], k_cluster: usize, rho_cluster: f32) -> Vec<Vec<usize>> {
    const TEMPORAL_HORIZON_SECS: f32 = 3600.0;
    let mut assigned = vec![false; items.len()];
    let mut clusters = Vec::new();

    for seed in 0..items.len() {
        if assigned[seed] {
            continue;
        }
        let mut members = vec![seed];
        for other in (seed + 1)..items.len() {
            if assigned[other] {
                continue;
            }
            let linked = members.iter().all(|&m| {
                items[m].similarity(&items[other], TEMPORAL_HORIZON_SECS) >= rho_cluster
            });
            if linked {
                members.push(other);
            }
        }
        if members.len() >= k_cluster.max(2) {
            let coherence = mean_pairwise_similarity(&members, items, TEMPORAL_HORIZON_SECS);
            if coherence >= rho_cluster {
                for &m in &members {
                    assigned[m] = true;
                }
                clusters.push(members);
            }
        }
    }
    clusters
}

fn mean_pairwise_similarity(members: &[usize], items: &[ClusterItem], horizon: f32) -> f32 {
    if members.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut pairs = 0;
    for (i, &a) in members.iter().enumerate() {
        for &b in &members[i + 1..] {
            total += items[a].similarity(&items[b], horizon);
            pairs += 1;
        }
    }
    total / pairs as f32
}

fn summarize_cluster(members: &[usize], items: &[ClusterItem]) -> String {
    use std::collections::BTreeMap;
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for &m in members {
        for token in &items[m].tokens {
            *counts.entry(token.as_str()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let keywords: Vec<&str> = ranked.into_iter().take(5).map(|(t, _)| t).collect();
    if keywords.is_empty() {
        format!("A recurring pattern across {} memories", members.len())
    } else {
        format!(
            "A recurring pattern across {} memories: {}",
            members.len(),
            keywords.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_insight_lines() {
        let text = "INSIGHT: rest deepens memory | confidence=0.8 | applicability=0.7\n\
                    noise line\n\
                    INSIGHT: attention is a garden | confidence=0.4 | applicability=0.9";
        let parsed = parse_wisdom_candidates(text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].content, "rest deepens memory");
        assert!((parsed[0].confidence - 0.8).abs() < 1e-6);
        assert!((parsed[1].applicability - 0.9).abs() < 1e-6);
    }

    #[test]
    fn parses_bullet_fallback_with_default_scores() {
        let parsed = parse_wisdom_candidates("- patterns repeat when unexamined");
        assert_eq!(parsed.len(), 1);
        assert!((parsed[0].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn malformed_scores_fall_back_to_defaults() {
        let parsed = parse_wisdom_candidates("INSIGHT: something | confidence=not_a_number");
        assert_eq!(parsed.len(), 1);
        assert!((parsed[0].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn empty_output_yields_no_candidates() {
        assert!(parse_wisdom_candidates("").is_empty());
        assert!(parse_wisdom_candidates("INSIGHT:").is_empty());
    }

    fn item(content: &str, at_secs: i64) -> ClusterItem {
        let created_at = Utc::now() + chrono::Duration::seconds(at_secs);
        ClusterItem {
            node: NodeId::new(),
            tokens: token_set(content),
            embedding: None,
            created_at,
        }
    }

    #[test]
    fn clustering_groups_similar_contemporaneous_items() {
        let items = vec![
            item("garden memory pattern growth", 0),
            item("memory pattern garden tending", 10),
            item("pattern garden memory roots", 20),
            item("entirely unrelated quantum paperwork", 30),
        ];
        let clusters = cluster(&items, 3, 0.5);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
    }

    #[test]
    fn small_or_incoherent_groups_are_not_clusters() {
        let items = vec![
            item("alpha beta gamma", 0),
            item("delta epsilon zeta", 10),
            item("eta theta iota", 20),
        ];
        assert!(cluster(&items, 3, 0.5).is_empty());
    }

    #[test]
    fn cluster_summary_names_common_tokens() {
        let items = vec![
            item("garden memory pattern", 0),
            item("memory pattern tending", 5),
            item("pattern memory roots", 9),
        ];
        let summary = summarize_cluster(&[0, 1, 2], &items);
        assert!(summary.contains("memory"));
        assert!(summary.contains("pattern"));
        assert!(summary.contains("3 memories"));
    }

}
