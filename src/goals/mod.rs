//! Goal Queue
//!
//! Prioritized, decayable goals. Goals arrive from dreams (insight
//! integration), from anticipatory simulation, from curiosity about
//! knowledge gaps, and from the operator; every goal carries its source.
//! The scheduler consults active goals to bias step handlers, never to
//! preempt the cycle structure.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GoalConfig;
use crate::core::types::{clamp01, GoalId};
use crate::error::{CoreError, CoreResult};

/// How far out a goal looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Short,
    Medium,
    Long,
}

/// Where a goal came from. Required on every goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalSource {
    DreamInsight,
    External,
    Curiosity,
    Anticipation,
    Reflection,
    System,
}

impl std::fmt::Display for GoalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DreamInsight => "dream_insight",
            Self::External => "external",
            Self::Curiosity => "curiosity",
            Self::Anticipation => "anticipation",
            Self::Reflection => "reflection",
            Self::System => "system",
        };
        write!(f, "{name}")
    }
}

/// Goal lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Active,
    Completed,
    Abandoned,
}

/// A prioritized goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub description: String,
    pub priority: f32,
    pub time_horizon: TimeHorizon,
    pub source: GoalSource,
    pub created_at: DateTime<Utc>,
    pub status: GoalStatus,
}

impl Goal {
    #[must_use]
    pub fn new(
        description: impl Into<String>,
        priority: f32,
        time_horizon: TimeHorizon,
        source: GoalSource,
    ) -> Self {
        Self {
            id: GoalId::new(),
            description: description.into(),
            priority: clamp01(priority),
            time_horizon,
            source,
            created_at: Utc::now(),
            status: GoalStatus::Pending,
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.status, GoalStatus::Pending | GoalStatus::Active)
    }
}

/// Serializable queue contents for snapshots.
pub type GoalState = Vec<Goal>;

/// The goal queue.
pub struct GoalQueue {
    cfg: GoalConfig,
    inner: Mutex<BTreeMap<GoalId, Goal>>,
}

impl GoalQueue {
    #[must_use]
    pub fn new(cfg: GoalConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn push(&self, goal: Goal) -> GoalId {
        let id = goal.id;
        debug!(goal = %id, source = %goal.source, priority = goal.priority, "goal queued");
        self.lock().insert(id, goal);
        id
    }

    pub fn get(&self, id: GoalId) -> CoreResult<Goal> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("goal {id}")))
    }

    /// Promote the top `n` pending goals to Active. Returns the promoted ids.
    pub fn activate(&self, n: usize) -> Vec<GoalId> {
        let mut inner = self.lock();
        let mut pending: Vec<(f32, DateTime<Utc>, GoalId)> = inner
            .values()
            .filter(|g| g.status == GoalStatus::Pending)
            .map(|g| (g.priority, g.created_at, g.id))
            .collect();
        pending.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut promoted = Vec::new();
        for (_, _, id) in pending.into_iter().take(n) {
            if let Some(goal) = inner.get_mut(&id) {
                goal.status = GoalStatus::Active;
                promoted.push(id);
            }
        }
        promoted
    }

    pub fn complete(&self, id: GoalId) -> CoreResult<()> {
        self.transition(id, GoalStatus::Completed)
    }

    pub fn abandon(&self, id: GoalId) -> CoreResult<()> {
        self.transition(id, GoalStatus::Abandoned)
    }

    fn transition(&self, id: GoalId, status: GoalStatus) -> CoreResult<()> {
        let mut inner = self.lock();
        let goal = inner
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("goal {id}")))?;
        if !goal.is_open() {
            return Err(CoreError::Conflict(format!(
                "goal {id} already {:?}",
                goal.status
            )));
        }
        goal.status = status;
        Ok(())
    }

    /// Decay priorities for elapsed time. Active goals and Long-horizon
    /// goals decay at the configured slow factor; pending goals that sink
    /// below the drop floor are abandoned.
    pub fn decay(&self, elapsed: Duration) {
        let hours = elapsed.as_secs_f32() / 3600.0;
        if hours <= 0.0 {
            return;
        }
        let base_loss = self.cfg.decay_per_hour * hours;
        let mut inner = self.lock();
        for goal in inner.values_mut() {
            if !goal.is_open() {
                continue;
            }
            let slow = goal.status == GoalStatus::Active || goal.time_horizon == TimeHorizon::Long;
            let loss = if slow {
                base_loss * self.cfg.slow_decay_factor
            } else {
                base_loss
            };
            goal.priority = clamp01(goal.priority - loss);
            if goal.status == GoalStatus::Pending && goal.priority < self.cfg.drop_floor {
                goal.status = GoalStatus::Abandoned;
            }
        }
    }

    /// Open goals ordered by priority descending, then age ascending.
    #[must_use]
    pub fn top(&self, n: usize) -> Vec<Goal> {
        let inner = self.lock();
        let mut open: Vec<Goal> = inner.values().filter(|g| g.is_open()).cloned().collect();
        open.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        open.truncate(n);
        open
    }

    /// Currently active goals, same ordering as `top`.
    #[must_use]
    pub fn active(&self) -> Vec<Goal> {
        self.top(usize::MAX)
            .into_iter()
            .filter(|g| g.status == GoalStatus::Active)
            .collect()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.lock().values().filter(|g| g.is_open()).count()
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
    pub fn export(&self) -> GoalState {
        self.lock().values().cloned().collect()
    }

    pub fn import(&self, state: GoalState) {
        let mut inner = self.lock();
        inner.clear();
        for mut goal in state {
            goal.priority = clamp01(goal.priority);
            inner.insert(goal.id, goal);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<GoalId, Goal>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    fn queue() -> GoalQueue {
        GoalQueue::new(CoreConfig::default().goals)
    }

    fn goal(desc: &str, priority: f32) -> Goal {
        Goal::new(desc, priority, TimeHorizon::Short, GoalSource::System)
    }

    #[test]
    fn top_orders_by_priority_then_age() {
        let q = queue();
        let mut older = goal("older", 0.5);
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        let older_id = older.id;
        q.push(older);
        let newer_id = q.push(goal("newer", 0.5));
        let high_id = q.push(goal("high", 0.9));

        let top = q.top(3);
        assert_eq!(top[0].id, high_id);
        assert_eq!(top[1].id, older_id, "same priority: older first");
        assert_eq!(top[2].id, newer_id);
    }

    #[test]
    fn activate_promotes_top_n_pending() {
        let q = queue();
        q.push(goal("low", 0.2));
        let mid_id = q.push(goal("mid", 0.5));
        let high_id = q.push(goal("high", 0.9));

        let promoted = q.activate(2);
        assert_eq!(promoted, vec![high_id, mid_id]);
        assert_eq!(q.get(high_id).unwrap().status, GoalStatus::Active);
        assert_eq!(q.active().len(), 2);
    }

    #[test]
    fn complete_and_abandon_are_terminal() {
        let q = queue();
        let id = q.push(goal("done", 0.5));
        q.complete(id).unwrap();
        assert_eq!(q.get(id).unwrap().status, GoalStatus::Completed);

        let err = q.abandon(id).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn unknown_goal_is_not_found() {
        let q = queue();
        assert!(matches!(
            q.complete(GoalId::new()).unwrap_err(),
            CoreError::NotFound(_)
        ));
    }

    #[test]
    fn decay_slows_for_active_and_long_horizon() {
        let q = queue();
        let active_id = q.push(goal("becomes active", 0.9));
        q.activate(1);
        let pending_id = q.push(goal("pending short", 0.5));
        let long_id = q.push(Goal::new(
            "long horizon",
            0.5,
            TimeHorizon::Long,
            GoalSource::System,
        ));

        q.decay(Duration::from_secs(3600 * 4));
        let cfg = CoreConfig::default().goals;
        let fast_loss = cfg.decay_per_hour * 4.0;
        let slow_loss = fast_loss * cfg.slow_decay_factor;

        let pending = q.get(pending_id).unwrap();
        let long = q.get(long_id).unwrap();
        let active = q.get(active_id).unwrap();
        assert!((pending.priority - (0.5 - fast_loss)).abs() < 1e-5);
        assert!((long.priority - (0.5 - slow_loss)).abs() < 1e-5);
        assert!((active.priority - (0.9 - slow_loss)).abs() < 1e-5);
    }

    #[test]
    fn decayed_pending_goals_below_floor_are_abandoned() {
        let q = queue();
        let id = q.push(goal("fading", 0.06));
        q.decay(Duration::from_secs(3600 * 10));
        assert_eq!(q.get(id).unwrap().status, GoalStatus::Abandoned);
    }

    #[test]
    fn dream_insight_source_is_tagged() {
        let q = queue();
        let id = q.push(Goal::new(
            "explore the recurring pattern",
            0.7,
            TimeHorizon::Medium,
            GoalSource::DreamInsight,
        ));
        assert_eq!(q.get(id).unwrap().source, GoalSource::DreamInsight);
        assert_eq!(GoalSource::DreamInsight.to_string(), "dream_insight");
    }

    #[test]
    fn export_import_roundtrip() {
        let q = queue();
        q.push(goal("a", 0.4));
        q.push(goal("b", 0.8));
        let state = q.export();
        let restored = queue();
        restored.import(state.clone());
        assert_eq!(restored.export(), state);
    }
}
