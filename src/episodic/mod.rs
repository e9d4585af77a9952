//! Episodic Buffer
//!
//! A bounded ring of recent experience. Everything the core does — thoughts,
//! dialogue, dreams, assessments — lands here first and waits for the next
//! dream cycle to be consolidated into the hypergraph.
//!
//! Eviction protects important records: when the ring is full and the oldest
//! record is protected, the lowest-importance record is evicted instead.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EpisodicConfig;
use crate::core::types::{clamp01, EpisodicId, NodeId};

/// What kind of experience a record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    Thought,
    Observation,
    Dialogue,
    Dream,
    Assessment,
    System,
}

impl std::fmt::Display for EpisodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Thought => "thought",
            Self::Observation => "observation",
            Self::Dialogue => "dialogue",
            Self::Dream => "dream",
            Self::Assessment => "assessment",
            Self::System => "system",
        };
        write!(f, "{name}")
    }
}

/// A timestamped experience pending consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicRecord {
    pub id: EpisodicId,
    pub content: String,
    pub kind: EpisodeKind,
    pub timestamp: DateTime<Utc>,
    pub importance: f32,
    /// Emotional valence in [-1, 1]
    pub emotional_valence: f32,
    /// Origin tag, e.g. `stream:1`, `dialogue:alice`, `dream`
    pub source: String,
    /// Memory nodes this experience relates to
    pub associations: BTreeSet<NodeId>,
    pub metadata: BTreeMap<String, String>,
}

impl EpisodicRecord {
    #[must_use]
    pub fn new(kind: EpisodeKind, content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: EpisodicId::new(),
            content: content.into(),
            kind,
            timestamp: Utc::now(),
            importance: 0.5,
            emotional_valence: 0.0,
            source: source.into(),
            associations: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = clamp01(importance);
        self
    }

    #[must_use]
    pub fn with_valence(mut self, valence: f32) -> Self {
        self.emotional_valence = valence.clamp(-1.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_association(mut self, node: NodeId) -> Self {
        self.associations.insert(node);
        self
    }

    #[must_use]
    pub fn with_associations(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.associations.extend(nodes);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Serializable buffer contents for snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodicState {
    pub records: Vec<EpisodicRecord>,
    pub consolidated: BTreeSet<EpisodicId>,
}

#[derive(Debug, Default)]
struct BufferInner {
    records: VecDeque<EpisodicRecord>,
    /// Records whose consolidation completed; cleared on the next drain
    consolidated: BTreeSet<EpisodicId>,
}

/// Bounded ring of episodic records.
pub struct EpisodicBuffer {
    cfg: EpisodicConfig,
    inner: Mutex<BufferInner>,
}

impl EpisodicBuffer {
    #[must_use]
    pub fn new(cfg: EpisodicConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BufferInner::default()),
        }
    }

    /// Append a record, evicting per the protection policy when full.
    ///
    /// Returns the id of the evicted record, if any.
    pub fn append(&self, record: EpisodicRecord) -> Option<EpisodicId> {
        let mut inner = self.lock();
        let mut evicted = None;

        if inner.records.len() >= self.cfg.capacity {
            let oldest_protected = inner
                .records
                .front()
                .map_or(false, |r| r.importance >= self.cfg.i_protected);

            let victim_index = if oldest_protected {
                // lowest importance wins eviction; oldest among ties
                inner
                    .records
                    .iter()
                    .enumerate()
                    .min_by(|(ia, a), (ib, b)| {
                        a.importance
                            .partial_cmp(&b.importance)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| ia.cmp(ib))
                    })
                    .map_or(0, |(i, _)| i)
            } else {
                0
            };

            if let Some(victim) = inner.records.remove(victim_index) {
                inner.consolidated.remove(&victim.id);
                evicted = Some(victim.id);
            }
        }

        inner.records.push_back(record);
        evicted
    }

    /// Snapshot the buffer for consolidation, clearing records whose
    /// consolidation has already completed.
    pub fn drain(&self) -> Vec<EpisodicRecord> {
        let mut inner = self.lock();
        let consolidated = std::mem::take(&mut inner.consolidated);
        inner.records.retain(|r| !consolidated.contains(&r.id));
        inner.records.iter().cloned().collect()
    }

    /// Mark a record as consolidated; it will be dropped on the next drain.
    pub fn mark_consolidated(&self, id: EpisodicId) {
        let mut inner = self.lock();
        if inner.records.iter().any(|r| r.id == id) {
            inner.consolidated.insert(id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Current fill as a ratio of capacity, in [0,1].
    #[must_use]
    pub fn fill_ratio(&self) -> f32 {
        let len = self.len() as f32;
        len / self.cfg.capacity.max(1) as f32
    }

    /// Most recent records, newest last.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<EpisodicRecord> {
        let inner = self.lock();
        let skip = inner.records.len().saturating_sub(n);
        inner.records.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn export(&self) -> EpisodicState {
        let inner = self.lock();
        EpisodicState {
            records: inner.records.iter().cloned().collect(),
            consolidated: inner.consolidated.clone(),
        }
    }

    pub fn import(&self, state: EpisodicState) {
        let mut inner = self.lock();
        inner.records = state.records.into_iter().collect();
        inner.consolidated = state.consolidated;
        while inner.records.len() > self.cfg.capacity {
            inner.records.pop_front();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity: usize, i_protected: f32) -> EpisodicBuffer {
        EpisodicBuffer::new(EpisodicConfig {
            capacity,
            i_protected,
        })
    }

    fn record(content: &str, importance: f32) -> EpisodicRecord {
        EpisodicRecord::new(EpisodeKind::Thought, content, "test").with_importance(importance)
    }

    #[test]
    fn append_within_capacity_keeps_everything() {
        let buf = buffer(4, 0.8);
        for i in 0..4 {
            assert!(buf.append(record(&format!("r{i}"), 0.5)).is_none());
        }
        assert_eq!(buf.len(), 4);
        assert!((buf.fill_ratio() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn full_buffer_evicts_oldest() {
        let buf = buffer(2, 0.8);
        let first = record("first", 0.3);
        let first_id = first.id;
        buf.append(first);
        buf.append(record("second", 0.4));

        let evicted = buf.append(record("third", 0.5));
        assert_eq!(evicted, Some(first_id));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn protected_oldest_deflects_eviction_to_lowest_importance() {
        let buf = buffer(3, 0.8);
        buf.append(record("keep", 0.9)); // protected oldest
        let weak = record("weak", 0.1);
        let weak_id = weak.id;
        buf.append(weak);
        buf.append(record("mid", 0.5));

        let evicted = buf.append(record("new", 0.6));
        assert_eq!(evicted, Some(weak_id), "lowest-importance record evicted");

        let contents: Vec<String> = buf.drain().into_iter().map(|r| r.content).collect();
        assert!(contents.contains(&"keep".to_string()));
        assert!(!contents.contains(&"weak".to_string()));
    }

    #[test]
    fn drain_clears_consolidated_records() {
        let buf = buffer(8, 0.8);
        let a = record("a", 0.5);
        let a_id = a.id;
        buf.append(a);
        buf.append(record("b", 0.5));

        let first = buf.drain();
        assert_eq!(first.len(), 2);

        buf.mark_consolidated(a_id);
        let second = buf.drain();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content, "b");
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn mark_consolidated_ignores_unknown_ids() {
        let buf = buffer(4, 0.8);
        buf.append(record("a", 0.5));
        buf.mark_consolidated(EpisodicId::new());
        assert_eq!(buf.drain().len(), 1);
    }

    #[test]
    fn recent_returns_newest_last() {
        let buf = buffer(8, 0.8);
        for i in 0..5 {
            buf.append(record(&format!("r{i}"), 0.5));
        }
        let recent = buf.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].content, "r4");
    }

    #[test]
    fn valence_is_clamped() {
        let r = EpisodicRecord::new(EpisodeKind::Dialogue, "x", "t").with_valence(-3.0);
        assert_eq!(r.emotional_valence, -1.0);
    }

    #[test]
    fn export_import_roundtrip() {
        let buf = buffer(4, 0.8);
        buf.append(record("a", 0.5));
        buf.append(record("b", 0.6));
        let state = buf.export();

        let restored = buffer(4, 0.8);
        restored.import(state.clone());
        assert_eq!(restored.export(), state);
    }
}
