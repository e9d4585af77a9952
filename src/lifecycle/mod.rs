//! Lifecycle Controller
//!
//! Wake / rest / dream state machine. Transitions follow one direction:
//! `Awake -> Resting -> Dreaming -> Awake`. There is no direct path from
//! Awake to Dreaming, and emergency handling only expedites the cycle, it
//! never skips Dreaming.
//!
//! The controller owns fatigue: it accumulates per executed step weighted
//! by load, recovers while Resting, and resets when a dream completes.

use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::LifecycleConfig;
use crate::error::{CoreError, CoreResult};

/// The three lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Awake,
    Resting,
    Dreaming,
}

impl LifecycleState {
    /// Whether a transition between two states is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Awake, Self::Resting)
                | (Self::Resting, Self::Dreaming)
                | (Self::Dreaming, Self::Awake)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Awake => "awake",
            Self::Resting => "resting",
            Self::Dreaming => "dreaming",
        };
        write!(f, "{name}")
    }
}

/// Why the last transition happened; kept for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    SustainedLoad,
    Fatigue,
    ConsolidationBacklog,
    Requested,
    RestComplete,
    DreamComplete,
    DreamTimeout,
}

#[derive(Debug)]
struct LifecycleInner {
    state: LifecycleState,
    entered_at: Instant,
    load_high_since: Option<Instant>,
    fatigue: f32,
    rest_requested: bool,
    wake_requested: bool,
    last_cause: Option<TransitionCause>,
}

/// The lifecycle controller.
pub struct LifecycleController {
    cfg: LifecycleConfig,
    inner: Mutex<LifecycleInner>,
    tx: watch::Sender<LifecycleState>,
}

impl LifecycleController {
    #[must_use]
    pub fn new(cfg: LifecycleConfig) -> Self {
        let (tx, _) = watch::channel(LifecycleState::Awake);
        Self {
            cfg,
            inner: Mutex::new(LifecycleInner {
                state: LifecycleState::Awake,
                entered_at: Instant::now(),
                load_high_since: None,
                fatigue: 0.0,
                rest_requested: false,
                wake_requested: false,
                last_cause: None,
            }),
            tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// Watch receiver for state broadcasts.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn fatigue(&self) -> f32 {
        self.lock().fatigue
    }

    #[must_use]
    pub fn last_cause(&self) -> Option<TransitionCause> {
        self.lock().last_cause
    }

    /// Accumulate fatigue for one executed step, weighted by load.
    pub fn note_step(&self, load: f32) {
        let mut inner = self.lock();
        inner.fatigue = (inner.fatigue
            + self.cfg.fatigue_per_step * (0.5 + load.clamp(0.0, 1.0)))
        .clamp(0.0, 1.0);
    }

    /// Caller-requested rest; takes effect at the next evaluation.
    pub fn request_rest(&self) {
        self.lock().rest_requested = true;
    }

    /// Caller-requested wake. Never skips Dreaming: while Resting it
    /// expedites the dream instead.
    pub fn request_wake(&self) {
        self.lock().wake_requested = true;
    }

    /// Signal from the dream consolidator that its run finished.
    pub fn dream_completed(&self) {
        let mut transitioned = false;
        {
            let mut inner = self.lock();
            if inner.state == LifecycleState::Dreaming {
                inner.state = LifecycleState::Awake;
                inner.entered_at = Instant::now();
                inner.fatigue = 0.0;
                inner.wake_requested = false;
                inner.last_cause = Some(TransitionCause::DreamComplete);
                transitioned = true;
            }
        }
        if transitioned {
            info!(state = %LifecycleState::Awake, "dream complete, waking");
            let _ = self.tx.send(LifecycleState::Awake);
        }
    }

    /// Evaluate the transition policy against current load and episodic
    /// backlog. Returns the new state when a transition fired.
    pub fn evaluate(
        &self,
        load: f32,
        buffer_fill: f32,
        buffer_empty: bool,
        now: Instant,
    ) -> Option<LifecycleState> {
        let mut inner = self.lock();

        // track sustained high load
        if load >= self.cfg.l_high {
            if inner.load_high_since.is_none() {
                inner.load_high_since = Some(now);
            }
        } else {
            inner.load_high_since = None;
        }

        let (next, cause) = match inner.state {
            LifecycleState::Awake => {
                let sustained = inner
                    .load_high_since
                    .map_or(false, |since| now.duration_since(since) >= self.cfg.t_load());
                if inner.rest_requested {
                    (Some(LifecycleState::Resting), TransitionCause::Requested)
                } else if inner.fatigue >= self.cfg.f_rest {
                    (Some(LifecycleState::Resting), TransitionCause::Fatigue)
                } else if buffer_fill >= self.cfg.b_high {
                    (
                        Some(LifecycleState::Resting),
                        TransitionCause::ConsolidationBacklog,
                    )
                } else if sustained {
                    (Some(LifecycleState::Resting), TransitionCause::SustainedLoad)
                } else {
                    (None, TransitionCause::RestComplete)
                }
            }
            LifecycleState::Resting => {
                let rested = now.duration_since(inner.entered_at) >= self.cfg.t_rest_min();
                // wake requests expedite the dream; they never skip it
                if rested && (!buffer_empty || inner.wake_requested) {
                    (Some(LifecycleState::Dreaming), TransitionCause::RestComplete)
                } else {
                    (None, TransitionCause::RestComplete)
                }
            }
            LifecycleState::Dreaming => {
                if now.duration_since(inner.entered_at) >= self.cfg.t_dream_max() {
                    (Some(LifecycleState::Awake), TransitionCause::DreamTimeout)
                } else {
                    (None, TransitionCause::RestComplete)
                }
            }
        };

        let next = next?;
        debug_assert!(inner.state.can_transition_to(next));
        info!(from = %inner.state, to = %next, cause = ?cause, "lifecycle transition");
        inner.state = next;
        inner.entered_at = now;
        inner.last_cause = Some(cause);
        if next == LifecycleState::Resting {
            inner.rest_requested = false;
        }
        if next == LifecycleState::Awake {
            inner.fatigue = 0.0;
            inner.wake_requested = false;
        }
        drop(inner);
        let _ = self.tx.send(next);
        Some(next)
    }

    /// Recover fatigue for elapsed rest time.
    pub fn recover(&self, elapsed: std::time::Duration) {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Resting {
            let recovered = self.cfg.rest_recovery_per_sec * elapsed.as_secs_f32();
            inner.fatigue = (inner.fatigue - recovered).clamp(0.0, 1.0);
        }
    }

    /// Force a state during snapshot restore. Restoring into Resting or
    /// Dreaming is collapsed to the nearest legal resume point.
    pub fn restore_state(&self, state: LifecycleState) -> CoreResult<()> {
        let resumed = match state {
            // a restored dream did not finish; resume at Resting so it
            // re-enters Dreaming through the legal path
            LifecycleState::Dreaming | LifecycleState::Resting => LifecycleState::Resting,
            LifecycleState::Awake => LifecycleState::Awake,
        };
        let mut inner = self.lock();
        if resumed == LifecycleState::Resting && inner.state == LifecycleState::Awake {
            inner.state = LifecycleState::Resting;
        } else if resumed == LifecycleState::Awake {
            inner.state = LifecycleState::Awake;
        } else if inner.state != resumed {
            warn!(from = %inner.state, to = %resumed, "unusual lifecycle restore");
            return Err(CoreError::Fatal(format!(
                "cannot restore lifecycle from {} to {resumed}",
                inner.state
            )));
        }
        inner.entered_at = Instant::now();
        drop(inner);
        let _ = self.tx.send(resumed);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifecycleInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller() -> LifecycleController {
        let mut cfg = crate::config::CoreConfig::default().lifecycle;
        cfg.t_load_ms = 500;
        cfg.t_rest_min_ms = 200;
        LifecycleController::new(cfg)
    }

    #[test]
    fn legal_transitions_only() {
        use LifecycleState::*;
        assert!(Awake.can_transition_to(Resting));
        assert!(Resting.can_transition_to(Dreaming));
        assert!(Dreaming.can_transition_to(Awake));
        assert!(!Awake.can_transition_to(Dreaming), "no direct awake -> dreaming");
        assert!(!Resting.can_transition_to(Awake));
        assert!(!Dreaming.can_transition_to(Resting));
    }

    #[test]
    fn sustained_load_forces_rest() {
        let ctl = controller();
        let start = Instant::now();
        assert_eq!(ctl.evaluate(0.9, 0.1, false, start), None, "not yet sustained");
        let later = start + Duration::from_millis(600);
        assert_eq!(
            ctl.evaluate(0.9, 0.1, false, later),
            Some(LifecycleState::Resting)
        );
        assert_eq!(ctl.last_cause(), Some(TransitionCause::SustainedLoad));
    }

    #[test]
    fn load_dip_resets_sustained_window() {
        let ctl = controller();
        let start = Instant::now();
        ctl.evaluate(0.9, 0.1, false, start);
        ctl.evaluate(0.1, 0.1, false, start + Duration::from_millis(300));
        let verdict = ctl.evaluate(0.9, 0.1, false, start + Duration::from_millis(700));
        assert_eq!(verdict, None, "window restarted after the dip");
    }

    #[test]
    fn backlog_forces_rest() {
        let ctl = controller();
        assert_eq!(
            ctl.evaluate(0.1, 0.95, false, Instant::now()),
            Some(LifecycleState::Resting)
        );
        assert_eq!(ctl.last_cause(), Some(TransitionCause::ConsolidationBacklog));
    }

    #[test]
    fn fatigue_forces_rest() {
        let ctl = controller();
        for _ in 0..10_000 {
            ctl.note_step(1.0);
        }
        assert!(ctl.fatigue() >= 0.75);
        assert_eq!(
            ctl.evaluate(0.1, 0.1, false, Instant::now()),
            Some(LifecycleState::Resting)
        );
        assert_eq!(ctl.last_cause(), Some(TransitionCause::Fatigue));
    }

    #[test]
    fn requested_rest_takes_effect() {
        let ctl = controller();
        ctl.request_rest();
        assert_eq!(
            ctl.evaluate(0.0, 0.0, true, Instant::now()),
            Some(LifecycleState::Resting)
        );
        assert_eq!(ctl.last_cause(), Some(TransitionCause::Requested));
    }

    #[test]
    fn resting_waits_for_minimum_then_dreams() {
        let ctl = controller();
        ctl.request_rest();
        let t0 = Instant::now();
        ctl.evaluate(0.0, 0.5, false, t0);
        assert_eq!(ctl.state(), LifecycleState::Resting);

        assert_eq!(ctl.evaluate(0.0, 0.5, false, t0 + Duration::from_millis(50)), None);
        assert_eq!(
            ctl.evaluate(0.0, 0.5, false, t0 + Duration::from_millis(250)),
            Some(LifecycleState::Dreaming)
        );
    }

    #[test]
    fn resting_with_empty_buffer_stays_unless_wake_requested() {
        let ctl = controller();
        ctl.request_rest();
        let t0 = Instant::now();
        ctl.evaluate(0.0, 0.0, true, t0);

        let after_min = t0 + Duration::from_millis(300);
        assert_eq!(ctl.evaluate(0.0, 0.0, true, after_min), None);

        ctl.request_wake();
        assert_eq!(
            ctl.evaluate(0.0, 0.0, true, after_min),
            Some(LifecycleState::Dreaming),
            "wake request expedites the dream, never skips it"
        );
    }

    #[test]
    fn dream_completion_wakes_and_resets_fatigue() {
        let ctl = controller();
        for _ in 0..10_000 {
            ctl.note_step(1.0);
        }
        ctl.request_rest();
        let t0 = Instant::now();
        ctl.evaluate(0.0, 0.5, false, t0);
        ctl.evaluate(0.0, 0.5, false, t0 + Duration::from_millis(250));
        assert_eq!(ctl.state(), LifecycleState::Dreaming);

        ctl.dream_completed();
        assert_eq!(ctl.state(), LifecycleState::Awake);
        assert_eq!(ctl.fatigue(), 0.0);
    }

    #[test]
    fn dream_timeout_wakes() {
        let mut cfg = crate::config::CoreConfig::default().lifecycle;
        cfg.t_rest_min_ms = 0;
        cfg.t_dream_max_ms = 100;
        let ctl = LifecycleController::new(cfg);
        ctl.request_rest();
        let t0 = Instant::now();
        ctl.evaluate(0.0, 0.5, false, t0);
        ctl.evaluate(0.0, 0.5, false, t0);
        assert_eq!(ctl.state(), LifecycleState::Dreaming);

        assert_eq!(
            ctl.evaluate(0.0, 0.5, false, t0 + Duration::from_millis(150)),
            Some(LifecycleState::Awake)
        );
        assert_eq!(ctl.last_cause(), Some(TransitionCause::DreamTimeout));
    }

    #[test]
    fn recovery_lowers_fatigue_while_resting() {
        let ctl = controller();
        for _ in 0..1000 {
            ctl.note_step(0.5);
        }
        let before = ctl.fatigue();
        ctl.recover(Duration::from_secs(1)); // awake: no effect
        assert_eq!(ctl.fatigue(), before);

        ctl.request_rest();
        ctl.evaluate(0.0, 0.5, false, Instant::now());
        ctl.recover(Duration::from_secs(2));
        assert!(ctl.fatigue() < before);
    }

    #[test]
    fn watch_subscribers_see_transitions() {
        let ctl = controller();
        let rx = ctl.subscribe();
        ctl.request_rest();
        ctl.evaluate(0.0, 0.5, false, Instant::now());
        assert_eq!(*rx.borrow(), LifecycleState::Resting);
    }

    #[test]
    fn restore_collapses_dreaming_to_resting() {
        let ctl = controller();
        ctl.restore_state(LifecycleState::Dreaming).unwrap();
        assert_eq!(ctl.state(), LifecycleState::Resting);
        ctl.restore_state(LifecycleState::Awake).unwrap();
        assert_eq!(ctl.state(), LifecycleState::Awake);
    }
}
