//! Interest Model
//!
//! Scored topic affinities with reinforcement and decay. Interests drive
//! both the engagement decision (does this message touch something the
//! agent cares about?) and autonomous initiation (is there something worth
//! bringing up?).
//!
//! Matching is token-containment based: how much of an interest's topic
//! vocabulary appears in the probe text. Embedding-based matching can layer
//! on top; token overlap is the floor that always works.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::InterestConfig;
use crate::core::types::{clamp01, token_set};

/// A single topic affinity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interest {
    pub topic: String,
    pub strength: f32,
    pub salience: f32,
    pub last_engaged: DateTime<Utc>,
    /// Per-interest decay multiplier applied on top of the model rate
    pub decay_rate: f32,
    pub engagement_count: u64,
    /// Core interests never decay below the configured floor
    pub core: bool,
}

impl Interest {
    #[must_use]
    pub fn new(topic: impl Into<String>, strength: f32) -> Self {
        Self {
            topic: topic.into(),
            strength: clamp01(strength),
            salience: 0.5,
            last_engaged: Utc::now(),
            decay_rate: 1.0,
            engagement_count: 0,
            core: false,
        }
    }

    #[must_use]
    pub fn core(mut self) -> Self {
        self.core = true;
        self
    }

    /// How much of this interest's vocabulary the probe text covers, [0,1].
    #[must_use]
    pub fn coverage(&self, text: &str) -> f32 {
        let own = token_set(&self.topic);
        if own.is_empty() {
            return 0.0;
        }
        let probe = token_set(text);
        let hits = own.intersection(&probe).count() as f32;
        hits / own.len() as f32
    }
}

/// Serializable model contents for snapshots.
pub type InterestState = Vec<Interest>;

/// The interest model.
pub struct InterestModel {
    cfg: InterestConfig,
    inner: Mutex<BTreeMap<String, Interest>>,
}

impl InterestModel {
    #[must_use]
    pub fn new(cfg: InterestConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Seed an interest directly (startup, snapshot restore, operator
    /// injection). Re-seeding an existing topic raises its strength to at
    /// least the given value.
    pub fn seed(&self, interest: Interest) {
        let key = normalize(&interest.topic);
        let mut inner = self.lock();
        match inner.get_mut(&key) {
            Some(existing) => {
                existing.strength = existing.strength.max(interest.strength);
                existing.core |= interest.core;
            }
            None => {
                inner.insert(key, interest);
            }
        }
    }

    /// Reinforce a topic. Unknown topics are created; known topics are
    /// strengthened asymptotically so strength stays bounded by 1.
    pub fn note(&self, topic: &str, weight: f32, context: &str) {
        let weight = clamp01(weight);
        let key = normalize(topic);
        let now = Utc::now();
        let mut inner = self.lock();
        let entry = inner
            .entry(key)
            .or_insert_with(|| Interest::new(topic, 0.0));
        entry.strength = clamp01(entry.strength + weight * (1.0 - entry.strength));
        entry.salience = clamp01(0.5 * entry.salience + 0.5 * weight);
        entry.last_engaged = now;
        entry.engagement_count += 1;
        debug!(topic, strength = entry.strength, context, "interest reinforced");
    }

    /// Decay all interests toward zero for `elapsed` time. Core interests
    /// never drop below the configured floor.
    pub fn decay(&self, elapsed: Duration) {
        let hours = elapsed.as_secs_f32() / 3600.0;
        if hours <= 0.0 {
            return;
        }
        let floor = self.cfg.core_floor;
        let base = (1.0 - self.cfg.decay_per_hour).clamp(0.0, 1.0);
        let mut inner = self.lock();
        for interest in inner.values_mut() {
            let factor = base.powf(hours * interest.decay_rate);
            let decayed = interest.strength * factor;
            interest.strength = if interest.core {
                decayed.max(floor.min(interest.strength))
            } else {
                decayed
            };
            interest.salience = clamp01(interest.salience * factor);
        }
    }

    /// Strength of the best match for a topic, 0.0 when nothing matches.
    #[must_use]
    pub fn score(&self, topic: &str) -> f32 {
        let key = normalize(topic);
        let inner = self.lock();
        if let Some(exact) = inner.get(&key) {
            return exact.strength;
        }
        inner
            .values()
            .map(|i| i.strength * i.coverage(topic))
            .fold(0.0, f32::max)
    }

    /// Strongest `k` interests, strength descending with topic tie-break.
    #[must_use]
    pub fn top_k(&self, k: usize) -> Vec<Interest> {
        let inner = self.lock();
        let mut all: Vec<Interest> = inner.values().cloned().collect();
        all.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.topic.cmp(&b.topic))
        });
        all.truncate(k);
        all
    }

    /// Combined interest/recency score for a probe text, in [0,1]:
    /// `0.6 * matched_strength + 0.4 * recency_factor`.
    #[must_use]
    pub fn engagement_score(&self, text: &str) -> f32 {
        let now = Utc::now();
        let horizon = self.cfg.recency_horizon_secs.max(1) as f32;
        let inner = self.lock();

        let best = inner
            .values()
            .map(|i| {
                let matched = i.strength * i.coverage(text);
                let age = (now - i.last_engaged).num_seconds().max(0) as f32;
                let recency = (1.0 - age / horizon).clamp(0.0, 1.0);
                (matched, recency)
            })
            .max_by(|(ma, _), (mb, _)| {
                ma.partial_cmp(mb).unwrap_or(std::cmp::Ordering::Equal)
            });

        match best {
            Some((matched, recency)) if matched > 0.0 => {
                clamp01(0.6 * matched + 0.4 * recency)
            }
            _ => 0.0,
        }
    }

    /// Best-matching topic name for a probe text, if any vocabulary overlaps.
    #[must_use]
    pub fn best_match(&self, text: &str) -> Option<String> {
        let inner = self.lock();
        inner
            .values()
            .map(|i| (i.strength * i.coverage(text), i.topic.clone()))
            .filter(|(score, _)| *score > 0.0)
            .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, topic)| topic)
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
    pub fn export(&self) -> InterestState {
        self.lock().values().cloned().collect()
    }

    pub fn import(&self, state: InterestState) {
        let mut inner = self.lock();
        inner.clear();
        for mut interest in state {
            interest.strength = clamp01(interest.strength);
            interest.salience = clamp01(interest.salience);
            inner.insert(normalize(&interest.topic), interest);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Interest>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn normalize(topic: &str) -> String {
    topic.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    fn model() -> InterestModel {
        InterestModel::new(CoreConfig::default().interests)
    }

    #[test]
    fn note_creates_and_reinforces() {
        let m = model();
        m.note("cognitive architecture", 0.5, "test");
        let first = m.score("cognitive architecture");
        assert!(first > 0.0);

        m.note("cognitive architecture", 0.5, "test");
        let second = m.score("cognitive architecture");
        assert!(second > first);
        assert!(second <= 1.0, "strength bounded by 1.0");
    }

    #[test]
    fn reinforcement_is_asymptotic() {
        let m = model();
        for _ in 0..100 {
            m.note("echoes", 0.9, "test");
        }
        let score = m.score("echoes");
        assert!(score > 0.99 && score <= 1.0);
    }

    #[test]
    fn decay_lowers_strength() {
        let m = model();
        m.seed(Interest::new("gardening", 0.6));
        m.decay(Duration::from_secs(3600 * 24));
        assert!(m.score("gardening") < 0.6);
    }

    #[test]
    fn core_interests_never_drop_below_floor() {
        let m = model();
        m.seed(Interest::new("cognitive architecture", 0.9).core());
        m.decay(Duration::from_secs(3600 * 24 * 365));
        let floor = CoreConfig::default().interests.core_floor;
        assert!(m.score("cognitive architecture") >= floor);
    }

    #[test]
    fn core_floor_does_not_raise_weak_interests() {
        let m = model();
        m.seed(Interest::new("faint", 0.1).core());
        m.decay(Duration::from_secs(3600));
        // floor never lifts strength above where it already was
        assert!(m.score("faint") <= 0.1);
    }

    #[test]
    fn engagement_score_favors_matching_interests() {
        let m = model();
        m.seed(Interest::new("cognitive architecture", 0.9).core());
        m.seed(Interest::new("gardening", 0.1));

        let on_topic = m.engagement_score("Let's discuss cognitive architecture design");
        let off_topic = m.engagement_score("thoughts on competitive baking");
        assert!(on_topic > 0.5, "got {on_topic}");
        assert_eq!(off_topic, 0.0);
    }

    #[test]
    fn engagement_score_is_clamped() {
        let m = model();
        m.seed(Interest::new("everything", 1.0));
        let score = m.engagement_score("everything");
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn top_k_orders_by_strength() {
        let m = model();
        m.seed(Interest::new("alpha", 0.3));
        m.seed(Interest::new("beta", 0.9));
        m.seed(Interest::new("gamma", 0.6));

        let top = m.top_k(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].topic, "beta");
        assert_eq!(top[1].topic, "gamma");
    }

    #[test]
    fn best_match_picks_strongest_overlap() {
        let m = model();
        m.seed(Interest::new("memory consolidation", 0.8));
        m.seed(Interest::new("gardening", 0.9));
        let best = m.best_match("how does memory consolidation work during sleep");
        assert_eq!(best.as_deref(), Some("memory consolidation"));
    }

    #[test]
    fn export_import_roundtrip() {
        let m = model();
        m.seed(Interest::new("alpha", 0.5).core());
        m.note("beta", 0.4, "test");
        let state = m.export();

        let restored = model();
        restored.import(state.clone());
        assert_eq!(restored.export(), state);
    }
}
