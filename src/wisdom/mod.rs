//! Wisdom Store
//!
//! Abstracted insights distilled from experience, each carrying confidence,
//! applicability, and depth. Wisdom is consulted when composing engagement
//! responses and when evaluating anticipated scenarios; outcomes feed back
//! into confidence asymmetrically (failures cost more than successes earn)
//! to keep the store honest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::WisdomConfig;
use crate::core::types::{clamp01, token_overlap, EpisodicId, WisdomId};
use crate::error::{CoreError, CoreResult};

/// A distilled insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wisdom {
    pub id: WisdomId,
    pub content: String,
    pub confidence: f32,
    pub applicability: f32,
    pub depth: f32,
    pub source_experiences: BTreeSet<EpisodicId>,
    pub application_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Wisdom {
    #[must_use]
    pub fn new(content: impl Into<String>, confidence: f32, applicability: f32) -> Self {
        Self {
            id: WisdomId::new(),
            content: content.into(),
            confidence: clamp01(confidence),
            applicability: clamp01(applicability),
            depth: 0.5,
            source_experiences: BTreeSet::new(),
            application_count: 0,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_depth(mut self, depth: f32) -> Self {
        self.depth = clamp01(depth);
        self
    }

    #[must_use]
    pub fn with_sources(mut self, sources: impl IntoIterator<Item = EpisodicId>) -> Self {
        self.source_experiences.extend(sources);
        self
    }

    /// Ranking key: how trustworthy and how widely usable.
    #[must_use]
    pub fn rank(&self) -> f32 {
        self.confidence * self.applicability
    }
}

/// Serializable store contents for snapshots.
pub type WisdomState = Vec<Wisdom>;

/// The wisdom store.
pub struct WisdomStore {
    cfg: WisdomConfig,
    inner: Mutex<BTreeMap<WisdomId, Wisdom>>,
}

impl WisdomStore {
    #[must_use]
    pub fn new(cfg: WisdomConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add(&self, wisdom: Wisdom) -> WisdomId {
        let id = wisdom.id;
        self.lock().insert(id, wisdom);
        id
    }

    pub fn get(&self, id: WisdomId) -> CoreResult<Wisdom> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("wisdom {id}")))
    }

    /// Wisdom relevant to a context, ordered by `confidence * applicability`
    /// descending. Only entries whose content shares vocabulary with the
    /// context are returned.
    #[must_use]
    pub fn applicable_to(&self, context: &str) -> Vec<Wisdom> {
        let inner = self.lock();
        let mut matched: Vec<Wisdom> = inner
            .values()
            .filter(|w| token_overlap(&w.content, context) > 0.0)
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.rank()
                .partial_cmp(&a.rank())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matched
    }

    /// Record an application outcome. Success nudges confidence up by the
    /// configured step; failure pulls it down by the (larger) failure step.
    pub fn record_application(&self, id: WisdomId, success: bool) -> CoreResult<()> {
        let mut inner = self.lock();
        let wisdom = inner
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("wisdom {id}")))?;
        wisdom.application_count += 1;
        if success {
            wisdom.confidence = clamp01(wisdom.confidence + self.cfg.success_step);
        } else {
            wisdom.confidence = clamp01(wisdom.confidence - self.cfg.failure_step);
        }
        debug!(
            wisdom = %id,
            success,
            confidence = wisdom.confidence,
            "wisdom application recorded"
        );
        Ok(())
    }

    /// Whether a candidate is a near-duplicate of existing wisdom at the
    /// given similarity threshold.
    #[must_use]
    pub fn is_near_duplicate(&self, content: &str, sigma: f32) -> bool {
        self.lock()
            .values()
            .any(|w| token_overlap(&w.content, content) >= sigma)
    }

    /// All wisdom ordered by rank descending.
    #[must_use]
    pub fn ranked(&self) -> Vec<Wisdom> {
        let mut all: Vec<Wisdom> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| {
            b.rank()
                .partial_cmp(&a.rank())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn export(&self) -> WisdomState {
        self.lock().values().cloned().collect()
    }

    pub fn import(&self, state: WisdomState) {
        let mut inner = self.lock();
        inner.clear();
        for mut w in state {
            w.confidence = clamp01(w.confidence);
            w.applicability = clamp01(w.applicability);
            w.depth = clamp01(w.depth);
            inner.insert(w.id, w);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<WisdomId, Wisdom>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    fn store() -> WisdomStore {
        WisdomStore::new(CoreConfig::default().wisdom)
    }

    #[test]
    fn applicable_to_orders_by_rank() {
        let s = store();
        s.add(Wisdom::new(
            "patience rewards careful memory consolidation",
            0.9,
            0.8,
        ));
        s.add(Wisdom::new(
            "memory consolidation benefits from rest",
            0.5,
            0.5,
        ));
        s.add(Wisdom::new("gardening needs water", 0.99, 0.99));

        let applicable = s.applicable_to("how should memory consolidation be scheduled?");
        assert_eq!(applicable.len(), 2, "unrelated wisdom excluded");
        assert!(applicable[0].rank() >= applicable[1].rank());
    }

    #[test]
    fn record_application_is_asymmetric() {
        let s = store();
        let cfg = CoreConfig::default().wisdom;
        let id = s.add(Wisdom::new("test insight", 0.5, 0.5));

        s.record_application(id, true).unwrap();
        let after_success = s.get(id).unwrap().confidence;
        assert!((after_success - (0.5 + cfg.success_step)).abs() < 1e-6);

        s.record_application(id, false).unwrap();
        let after_failure = s.get(id).unwrap().confidence;
        assert!(after_failure < 0.5, "failure outweighs prior success");
        assert_eq!(s.get(id).unwrap().application_count, 2);
    }

    #[test]
    fn record_application_unknown_id_fails() {
        let s = store();
        assert!(s.record_application(WisdomId::new(), true).is_err());
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let s = store();
        let id = s.add(Wisdom::new("x", 0.99, 0.5));
        for _ in 0..10 {
            s.record_application(id, true).unwrap();
        }
        assert!(s.get(id).unwrap().confidence <= 1.0);
        for _ in 0..50 {
            s.record_application(id, false).unwrap();
        }
        assert!(s.get(id).unwrap().confidence >= 0.0);
    }

    #[test]
    fn near_duplicate_detection() {
        let s = store();
        s.add(Wisdom::new(
            "rest deepens understanding of recent experience",
            0.8,
            0.7,
        ));
        assert!(s.is_near_duplicate("rest deepens understanding of recent experience", 0.85));
        assert!(!s.is_near_duplicate("entirely different proposition", 0.85));
    }

    #[test]
    fn export_import_roundtrip() {
        let s = store();
        s.add(Wisdom::new("a", 0.6, 0.7).with_depth(0.9));
        let state = s.export();
        let restored = store();
        restored.import(state.clone());
        assert_eq!(restored.export(), state);
    }
}
