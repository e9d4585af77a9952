//! Skill Registry
//!
//! Named capabilities with proficiency that grows under practice with
//! diminishing returns. Cognitive operations look up their skill tier to
//! pick an implementation branch: a novice reflection is shallower than an
//! expert one.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SkillConfig;
use crate::core::types::clamp01;
use crate::error::{CoreError, CoreResult};

/// Proficiency band, derived from proficiency with stable thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillTier {
    Novice,
    Intermediate,
    Expert,
}

impl SkillTier {
    /// Tier boundaries: novice < 0.3 <= intermediate < 0.7 <= expert.
    #[must_use]
    pub fn from_proficiency(proficiency: f32) -> Self {
        if proficiency >= 0.7 {
            Self::Expert
        } else if proficiency >= 0.3 {
            Self::Intermediate
        } else {
            Self::Novice
        }
    }
}

impl std::fmt::Display for SkillTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Novice => "novice",
            Self::Intermediate => "intermediate",
            Self::Expert => "expert",
        };
        write!(f, "{name}")
    }
}

/// A named capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub proficiency: f32,
    pub last_practiced: DateTime<Utc>,
    pub practice_count: u64,
    pub prerequisites: Vec<String>,
}

impl Skill {
    #[must_use]
    pub fn new(name: impl Into<String>, proficiency: f32) -> Self {
        Self {
            name: name.into(),
            proficiency: clamp01(proficiency),
            last_practiced: Utc::now(),
            practice_count: 0,
            prerequisites: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_prerequisite(mut self, name: impl Into<String>) -> Self {
        self.prerequisites.push(name.into());
        self
    }

    #[must_use]
    pub fn tier(&self) -> SkillTier {
        SkillTier::from_proficiency(self.proficiency)
    }
}

/// Serializable registry contents for snapshots.
pub type SkillState = Vec<Skill>;

/// The skill registry.
pub struct SkillRegistry {
    cfg: SkillConfig,
    inner: Mutex<BTreeMap<String, Skill>>,
}

impl SkillRegistry {
    #[must_use]
    pub fn new(cfg: SkillConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, skill: Skill) {
        let mut inner = self.lock();
        inner.entry(skill.name.clone()).or_insert(skill);
    }

    pub fn get(&self, name: &str) -> CoreResult<Skill> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("skill {name}")))
    }

    /// Tier for an operation; unregistered skills act at novice level.
    #[must_use]
    pub fn tier(&self, name: &str) -> SkillTier {
        self.lock()
            .get(name)
            .map_or(SkillTier::Novice, Skill::tier)
    }

    #[must_use]
    pub fn proficiency(&self, name: &str) -> f32 {
        self.lock().get(name).map_or(0.0, |s| s.proficiency)
    }

    /// Run a practice session: proficiency increases by
    /// `beta * (1 - proficiency)`, so gains diminish toward mastery.
    ///
    /// Every prerequisite must sit at or above the configured floor for the
    /// session to count.
    pub fn practice(&self, name: &str) -> CoreResult<f32> {
        let mut inner = self.lock();
        let prerequisites = inner
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("skill {name}")))?
            .prerequisites
            .clone();

        for prereq in &prerequisites {
            let level = inner.get(prereq).map_or(0.0, |s| s.proficiency);
            if level < self.cfg.prerequisite_floor {
                return Err(CoreError::InvalidArg(format!(
                    "prerequisite {prereq} at {level:.2} below floor {:.2}",
                    self.cfg.prerequisite_floor
                )));
            }
        }

        let skill = inner.get_mut(name).expect("presence checked above");
        let delta = self.cfg.beta * (1.0 - skill.proficiency);
        skill.proficiency = clamp01(skill.proficiency + delta);
        skill.practice_count += 1;
        skill.last_practiced = Utc::now();
        Ok(skill.proficiency)
    }

    #[must_use]
    pub fn all(&self) -> Vec<Skill> {
        self.lock().values().cloned().collect()
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
    pub fn export(&self) -> SkillState {
        self.lock().values().cloned().collect()
    }

    pub fn import(&self, state: SkillState) {
        let mut inner = self.lock();
        inner.clear();
        for mut skill in state {
            skill.proficiency = clamp01(skill.proficiency);
            inner.insert(skill.name.clone(), skill);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Skill>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    fn registry() -> SkillRegistry {
        SkillRegistry::new(CoreConfig::default().skills)
    }

    #[test]
    fn tier_thresholds_are_stable() {
        assert_eq!(SkillTier::from_proficiency(0.0), SkillTier::Novice);
        assert_eq!(SkillTier::from_proficiency(0.29), SkillTier::Novice);
        assert_eq!(SkillTier::from_proficiency(0.3), SkillTier::Intermediate);
        assert_eq!(SkillTier::from_proficiency(0.69), SkillTier::Intermediate);
        assert_eq!(SkillTier::from_proficiency(0.7), SkillTier::Expert);
        assert_eq!(SkillTier::from_proficiency(1.0), SkillTier::Expert);
    }

    #[test]
    fn practice_has_diminishing_returns() {
        let r = registry();
        r.register(Skill::new("Reflection", 0.0));

        let first = r.practice("Reflection").unwrap();
        let gain_one = first;
        let second = r.practice("Reflection").unwrap();
        let gain_two = second - first;
        assert!(gain_two < gain_one, "later gains are smaller");
    }

    #[test]
    fn practice_is_monotone_and_bounded() {
        let r = registry();
        r.register(Skill::new("PatternRecognition", 0.5));
        let mut previous = 0.5;
        for _ in 0..200 {
            let next = r.practice("PatternRecognition").unwrap();
            assert!(next >= previous);
            previous = next;
        }
        assert!(previous <= 1.0);
    }

    #[test]
    fn unmet_prerequisite_blocks_practice() {
        let r = registry();
        r.register(Skill::new("Reflection", 0.2));
        r.register(Skill::new("MetaReflection", 0.0).with_prerequisite("Reflection"));

        let err = r.practice("MetaReflection").unwrap_err();
        assert!(matches!(err, CoreError::InvalidArg(_)));
        assert_eq!(r.proficiency("MetaReflection"), 0.0);
    }

    #[test]
    fn met_prerequisite_allows_practice() {
        let r = registry();
        r.register(Skill::new("Reflection", 0.6));
        r.register(Skill::new("MetaReflection", 0.0).with_prerequisite("Reflection"));
        assert!(r.practice("MetaReflection").is_ok());
        assert_eq!(r.get("MetaReflection").unwrap().practice_count, 1);
    }

    #[test]
    fn unregistered_skill_acts_as_novice() {
        let r = registry();
        assert_eq!(r.tier("Unknown"), SkillTier::Novice);
        assert_eq!(r.proficiency("Unknown"), 0.0);
    }

    #[test]
    fn register_does_not_clobber_existing_progress() {
        let r = registry();
        r.register(Skill::new("Reflection", 0.5));
        r.practice("Reflection").unwrap();
        let progressed = r.proficiency("Reflection");
        r.register(Skill::new("Reflection", 0.0));
        assert_eq!(r.proficiency("Reflection"), progressed);
    }

    #[test]
    fn export_import_roundtrip() {
        let r = registry();
        r.register(Skill::new("Reflection", 0.4));
        let state = r.export();
        let restored = registry();
        restored.import(state.clone());
        assert_eq!(restored.export(), state);
    }
}
