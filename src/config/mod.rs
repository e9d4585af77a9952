//! Core Configuration
//!
//! Every recognized tuning option of the cognitive core, grouped per
//! subsystem. All thresholds and gains the components consult live here so
//! that concrete "variants" of the agent are alternative configurations,
//! never alternative types.
//!
//! Two named profiles exist:
//!
//! - `CoreConfig::default()`: production pacing (250ms base step)
//! - `CoreConfig::fast()`: millisecond pacing for tests and simulations
//!
//! The ratios between step period, sync window, and lifecycle thresholds are
//! what matter; both profiles keep them aligned.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Scheduler timing and stream topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Base step period in milliseconds
    pub t_step_ms: u64,
    /// Adaptive floor for the step period
    pub t_min_ms: u64,
    /// Adaptive ceiling for the step period
    pub t_max_ms: u64,
    /// Number of concurrent inference streams (>= 3)
    pub n_streams: usize,
    /// Maximum wait at a sync barrier in milliseconds
    pub t_sync_max_ms: u64,
    /// Step handler budget as a multiple of the step period
    pub safety_factor: f64,
    /// Cycles between automatic self-assessments
    pub assess_interval_cycles: u64,
}

impl SchedulerConfig {
    #[must_use]
    pub fn t_step(&self) -> Duration {
        Duration::from_millis(self.t_step_ms)
    }

    #[must_use]
    pub fn t_sync_max(&self) -> Duration {
        Duration::from_millis(self.t_sync_max_ms)
    }

    /// Handler cancellation budget: `T_step * safety_factor`.
    #[must_use]
    pub fn step_budget(&self) -> Duration {
        Duration::from_secs_f64(self.t_step_ms as f64 / 1000.0 * self.safety_factor)
    }

    /// Scale the base period by observed cognitive load.
    ///
    /// Higher load stretches the period toward `t_max_ms`; idle load relaxes
    /// it toward the base. Clamped to `[t_min_ms, t_max_ms]`.
    #[must_use]
    pub fn adaptive_period(&self, load: f32) -> Duration {
        let base = self.t_step_ms as f64;
        let max = self.t_max_ms as f64;
        let scaled = base + (max - base) * f64::from(load.clamp(0.0, 1.0));
        let clamped = scaled.clamp(self.t_min_ms as f64, self.t_max_ms as f64);
        Duration::from_secs_f64(clamped / 1000.0)
    }
}

/// Hypergraph memory: strengthening, spreading, and pruning thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Asymptotic strengthening rate for co-activated edges, in (0,1)
    pub alpha: f32,
    /// Prune binary edges below this weight
    pub w_min: f32,
    /// ...but only once they are older than this many seconds
    pub t_min_edge_secs: u64,
    /// Prune episodic nodes below this importance
    pub i_min: f32,
    /// ...when their consolidation level is at least this
    pub c_consolidated: f32,
    /// Activation level counting as "active" for co-activation and access
    pub activation_threshold: f32,
    /// Default weight for association edges created during consolidation
    pub default_association_weight: f32,
}

/// Dream consolidation: pattern and wisdom acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamConfig {
    /// Minimum cluster size for pattern extraction
    pub k_cluster: usize,
    /// Minimum cluster coherence (mean pairwise similarity)
    pub rho_cluster: f32,
    /// Similarity above which a wisdom candidate is a near-duplicate
    pub sigma_dup: f32,
    /// Minimum confidence to accept a wisdom candidate
    pub wisdom_min_confidence: f32,
    /// Budget per dream sub-phase in milliseconds
    pub phase_timeout_ms: u64,
    /// Spreading iterations run after consolidation
    pub spread_iterations: usize,
    /// Per-iteration activation decay during the post-consolidation spread
    pub spread_decay: f32,
    /// How many insights become goals per dream
    pub max_insight_goals: usize,
}

impl DreamConfig {
    #[must_use]
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }
}

/// Wake/rest/dream thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Cognitive load level considered "high"
    pub l_high: f32,
    /// High load must be sustained this long before resting (ms)
    pub t_load_ms: u64,
    /// Fatigue level that forces rest
    pub f_rest: f32,
    /// Episodic buffer fill ratio that forces rest
    pub b_high: f32,
    /// Minimum time in Resting before Dreaming (ms)
    pub t_rest_min_ms: u64,
    /// Hard ceiling on a dream cycle (ms)
    pub t_dream_max_ms: u64,
    /// Fatigue accumulated per executed step at full load
    pub fatigue_per_step: f32,
    /// Fatigue recovered per second while Resting
    pub rest_recovery_per_sec: f32,
}

impl LifecycleConfig {
    #[must_use]
    pub fn t_load(&self) -> Duration {
        Duration::from_millis(self.t_load_ms)
    }

    #[must_use]
    pub fn t_rest_min(&self) -> Duration {
        Duration::from_millis(self.t_rest_min_ms)
    }

    #[must_use]
    pub fn t_dream_max(&self) -> Duration {
        Duration::from_millis(self.t_dream_max_ms)
    }
}

/// Engagement decision thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementConfig {
    /// Engage when the combined score reaches this
    pub theta_engage: f32,
    /// Disengage when the score stays below this (< theta_engage)
    pub theta_disengage: f32,
    /// Threshold penalty while Resting
    pub delta_rest: f32,
    /// Threshold penalty under high fatigue
    pub delta_fat: f32,
    /// Sustained low score window before disengaging (ms)
    pub t_disengage_ms: u64,
    /// Bounded incoming queue capacity
    pub queue_capacity: usize,
    /// Interest strength above which the core may initiate contact
    pub initiation_threshold: f32,
    /// Fatigue level at which `delta_fat` applies
    pub fatigue_high: f32,
}

impl EngagementConfig {
    #[must_use]
    pub fn t_disengage(&self) -> Duration {
        Duration::from_millis(self.t_disengage_ms)
    }
}

/// Episodic buffer sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicConfig {
    /// Ring capacity
    pub capacity: usize,
    /// Records at or above this importance are protected from age eviction
    pub i_protected: f32,
}

/// Interest decay and matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterestConfig {
    /// Strength decay per hour of elapsed time
    pub decay_per_hour: f32,
    /// Floor below which core interests never decay
    pub core_floor: f32,
    /// Recency horizon for the engagement recency factor (secs)
    pub recency_horizon_secs: u64,
}

/// Skill practice curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillConfig {
    /// Practice gain rate: delta = beta * (1 - proficiency)
    pub beta: f32,
    /// Prerequisite proficiency required for practice to count
    pub prerequisite_floor: f32,
}

/// Wisdom confidence adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WisdomConfig {
    /// Confidence gained on a successful application
    pub success_step: f32,
    /// Confidence lost on a failed application (larger than success_step)
    pub failure_step: f32,
}

/// Goal priority decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalConfig {
    /// Priority lost per hour for pending goals
    pub decay_per_hour: f32,
    /// Multiplier applied to decay for Active and Long-horizon goals
    pub slow_decay_factor: f32,
    /// Pending goals below this priority are dropped by decay sweeps
    pub drop_floor: f32,
}

/// LLM retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Maximum retries for RateLimited / Unavailable
    pub retry_max: u32,
    /// Exponential backoff base (ms)
    pub backoff_base_ms: u64,
    /// Default per-call deadline (ms)
    pub deadline_ms: u64,
    /// Force non-streaming calls even when the provider streams
    pub disable_streaming: bool,
}

impl LlmConfig {
    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Snapshot persistence behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Interval between periodic snapshots (ms); 0 disables the timer
    pub snapshot_interval_ms: u64,
    /// Snapshot file path
    pub snapshot_path: PathBuf,
    /// Fail startup when no restorable snapshot exists
    pub require_restore: bool,
}

impl PersistenceConfig {
    #[must_use]
    pub fn snapshot_interval(&self) -> Option<Duration> {
        if self.snapshot_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.snapshot_interval_ms))
        }
    }
}

/// Top-level configuration for the cognitive core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub scheduler: SchedulerConfig,
    pub memory: MemoryConfig,
    pub dream: DreamConfig,
    pub lifecycle: LifecycleConfig,
    pub engagement: EngagementConfig,
    pub episodic: EpisodicConfig,
    pub interests: InterestConfig,
    pub skills: SkillConfig,
    pub wisdom: WisdomConfig,
    pub goals: GoalConfig,
    pub llm: LlmConfig,
    pub persistence: PersistenceConfig,
    /// Seed for all stochastic policies; None draws from the OS
    pub rng_seed: Option<u64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig {
                t_step_ms: 250,
                t_min_ms: 50,
                t_max_ms: 2000,
                n_streams: 3,
                t_sync_max_ms: 500,
                safety_factor: 3.0,
                assess_interval_cycles: 100,
            },
            memory: MemoryConfig {
                alpha: 0.25,
                w_min: 0.05,
                t_min_edge_secs: 600,
                i_min: 0.2,
                c_consolidated: 0.8,
                activation_threshold: 0.5,
                default_association_weight: 0.6,
            },
            dream: DreamConfig {
                k_cluster: 3,
                rho_cluster: 0.55,
                sigma_dup: 0.85,
                wisdom_min_confidence: 0.5,
                phase_timeout_ms: 5000,
                spread_iterations: 3,
                spread_decay: 0.3,
                max_insight_goals: 3,
            },
            lifecycle: LifecycleConfig {
                l_high: 0.8,
                t_load_ms: 5000,
                f_rest: 0.75,
                b_high: 0.9,
                t_rest_min_ms: 2000,
                t_dream_max_ms: 30_000,
                fatigue_per_step: 0.002,
                rest_recovery_per_sec: 0.05,
            },
            engagement: EngagementConfig {
                theta_engage: 0.5,
                theta_disengage: 0.3,
                delta_rest: 0.2,
                delta_fat: 0.15,
                t_disengage_ms: 60_000,
                queue_capacity: 64,
                initiation_threshold: 0.85,
                fatigue_high: 0.6,
            },
            episodic: EpisodicConfig {
                capacity: 256,
                i_protected: 0.8,
            },
            interests: InterestConfig {
                decay_per_hour: 0.02,
                core_floor: 0.4,
                recency_horizon_secs: 3600,
            },
            skills: SkillConfig {
                beta: 0.1,
                prerequisite_floor: 0.5,
            },
            wisdom: WisdomConfig {
                success_step: 0.02,
                failure_step: 0.05,
            },
            goals: GoalConfig {
                decay_per_hour: 0.05,
                slow_decay_factor: 0.25,
                drop_floor: 0.05,
            },
            llm: LlmConfig {
                retry_max: 3,
                backoff_base_ms: 250,
                deadline_ms: 30_000,
                disable_streaming: false,
            },
            persistence: PersistenceConfig {
                snapshot_interval_ms: 300_000,
                snapshot_path: PathBuf::from("echo-state.json"),
                require_restore: false,
            },
            rng_seed: None,
        }
    }
}

impl CoreConfig {
    /// Millisecond pacing for tests and simulations.
    ///
    /// Keeps the same threshold ratios as the default profile but shrinks
    /// every duration so a full wake/rest/dream round fits in a test.
    #[must_use]
    pub fn fast() -> Self {
        let mut cfg = Self::default();
        cfg.scheduler.t_step_ms = 10;
        cfg.scheduler.t_min_ms = 2;
        cfg.scheduler.t_max_ms = 80;
        cfg.scheduler.t_sync_max_ms = 40;
        cfg.scheduler.assess_interval_cycles = 10;
        cfg.lifecycle.t_load_ms = 100;
        cfg.lifecycle.t_rest_min_ms = 50;
        cfg.lifecycle.t_dream_max_ms = 2000;
        cfg.dream.phase_timeout_ms = 500;
        cfg.engagement.t_disengage_ms = 500;
        cfg.llm.deadline_ms = 1000;
        cfg.llm.backoff_base_ms = 5;
        cfg.persistence.snapshot_interval_ms = 0;
        cfg.rng_seed = Some(7);
        cfg
    }

    /// Parse a TOML configuration file merged over defaults.
    pub fn from_toml(text: &str) -> CoreResult<Self> {
        let cfg: Self = toml::from_str(text)
            .map_err(|e| CoreError::InvalidArg(format!("config parse: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> CoreResult<()> {
        if self.scheduler.n_streams < 3 {
            return Err(CoreError::InvalidArg(format!(
                "n_streams must be >= 3, got {}",
                self.scheduler.n_streams
            )));
        }
        if self.scheduler.t_min_ms > self.scheduler.t_max_ms {
            return Err(CoreError::InvalidArg(
                "t_min_ms must not exceed t_max_ms".to_string(),
            ));
        }
        if !(self.memory.alpha > 0.0 && self.memory.alpha < 1.0) {
            return Err(CoreError::InvalidArg(format!(
                "alpha must be in (0,1), got {}",
                self.memory.alpha
            )));
        }
        if self.engagement.theta_disengage >= self.engagement.theta_engage {
            return Err(CoreError::InvalidArg(
                "theta_disengage must be below theta_engage".to_string(),
            ));
        }
        if self.wisdom.failure_step <= self.wisdom.success_step {
            return Err(CoreError::InvalidArg(
                "wisdom failure_step must exceed success_step".to_string(),
            ));
        }
        if self.episodic.capacity == 0 {
            return Err(CoreError::InvalidArg(
                "episodic capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CoreConfig::default().validate().expect("default valid");
    }

    #[test]
    fn fast_config_is_valid() {
        CoreConfig::fast().validate().expect("fast valid");
    }

    #[test]
    fn adaptive_period_scales_with_load() {
        let cfg = CoreConfig::default().scheduler;
        let idle = cfg.adaptive_period(0.0);
        let busy = cfg.adaptive_period(1.0);
        assert_eq!(idle, Duration::from_millis(250));
        assert_eq!(busy, Duration::from_millis(2000));
        assert!(cfg.adaptive_period(0.5) > idle);
        assert!(cfg.adaptive_period(0.5) < busy);
    }

    #[test]
    fn adaptive_period_respects_bounds() {
        let mut cfg = CoreConfig::default().scheduler;
        cfg.t_max_ms = 300;
        assert!(cfg.adaptive_period(1.0) <= Duration::from_millis(300));
        assert!(cfg.adaptive_period(-2.0) >= Duration::from_millis(cfg.t_min_ms));
    }

    #[test]
    fn step_budget_uses_safety_factor() {
        let cfg = CoreConfig::default().scheduler;
        assert_eq!(cfg.step_budget(), Duration::from_millis(750));
    }

    #[test]
    fn too_few_streams_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.scheduler.n_streams = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_engagement_thresholds_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.engagement.theta_disengage = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn alpha_out_of_range_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.memory.alpha = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = CoreConfig::default();
        let text = toml::to_string(&cfg).expect("serialize");
        let parsed = CoreConfig::from_toml(&text).expect("parse");
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn snapshot_interval_zero_disables_timer() {
        let mut cfg = CoreConfig::default();
        cfg.persistence.snapshot_interval_ms = 0;
        assert!(cfg.persistence.snapshot_interval().is_none());
    }
}
