//! Phase Scheduler
//!
//! Owns the monotonic 12-step tick and the sync barriers; the workers own
//! everything else. Per tick the scheduler dispatches every stream's step
//! concurrently, bounds each by its cancellation budget, and at every
//! fourth global step opens a sync barrier where completed streams publish
//! cross-stream perceptions. Late streams are cancelled for that sync and
//! counted, never blocked on.
//!
//! The scheduler itself is fatal-failure-free: a panicked or overrunning
//! handler is recorded and the cycle continues.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::core::Components;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::streams::{
    GoalBias, StepContext, StepOutcome, StreamMode, StreamPerception, StreamWorker,
};

/// Steps between sync barriers.
const SYNC_INTERVAL: u64 = 4;
/// Goals consulted for the per-cycle bias.
const BIAS_GOALS: usize = 4;

/// Half-cycle interpretation of the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Steps 0..=5: the expressive half
    Expressive,
    /// Steps 6..=11: the reflective half
    Reflective,
}

impl CyclePhase {
    #[must_use]
    pub const fn from_step(step: u8) -> Self {
        if step % 12 < 6 {
            Self::Expressive
        } else {
            Self::Reflective
        }
    }
}

/// Public scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleState {
    pub cycle_number: u64,
    pub step_index: u8,
    pub phase: CyclePhase,
    pub active_streams: usize,
}

/// Compute the fixed offsets for `n` streams: `i * (12 / n)` rounded to
/// integers, pairwise distinct modulo 12.
pub fn offsets_for(n: usize) -> CoreResult<Vec<u8>> {
    if n < 3 {
        return Err(CoreError::InvalidArg(format!(
            "need at least 3 streams, got {n}"
        )));
    }
    if n > 12 {
        return Err(CoreError::InvalidArg(format!(
            "cannot place {n} distinct offsets in a 12-step cycle"
        )));
    }
    let mut offsets = Vec::with_capacity(n);
    for i in 0..n {
        let offset = ((i as f64) * 12.0 / (n as f64)).round() as u64 % 12;
        offsets.push(offset as u8);
    }
    let mut seen = std::collections::BTreeSet::new();
    for &offset in &offsets {
        if !seen.insert(offset) {
            return Err(CoreError::InvalidArg(format!(
                "offsets for {n} streams collide modulo 12"
            )));
        }
    }
    Ok(offsets)
}

/// Monotonic counters, exported into snapshots.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub ticks: AtomicU64,
    pub missed_sync: AtomicU64,
    pub cancelled_steps: AtomicU64,
    pub completed_steps: AtomicU64,
    pub failed_steps: AtomicU64,
    pub suspended_steps: AtomicU64,
}

/// Serializable snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerCounters {
    pub ticks: u64,
    pub missed_sync: u64,
    pub cancelled_steps: u64,
    pub completed_steps: u64,
    pub failed_steps: u64,
    pub suspended_steps: u64,
}

impl SchedulerMetrics {
    #[must_use]
    pub fn snapshot(&self) -> SchedulerCounters {
        SchedulerCounters {
            ticks: self.ticks.load(Ordering::Relaxed),
            missed_sync: self.missed_sync.load(Ordering::Relaxed),
            cancelled_steps: self.cancelled_steps.load(Ordering::Relaxed),
            completed_steps: self.completed_steps.load(Ordering::Relaxed),
            failed_steps: self.failed_steps.load(Ordering::Relaxed),
            suspended_steps: self.suspended_steps.load(Ordering::Relaxed),
        }
    }

    pub fn restore(&self, counters: &SchedulerCounters) {
        self.ticks.store(counters.ticks, Ordering::Relaxed);
        self.missed_sync.store(counters.missed_sync, Ordering::Relaxed);
        self.cancelled_steps
            .store(counters.cancelled_steps, Ordering::Relaxed);
        self.completed_steps
            .store(counters.completed_steps, Ordering::Relaxed);
        self.failed_steps
            .store(counters.failed_steps, Ordering::Relaxed);
        self.suspended_steps
            .store(counters.suspended_steps, Ordering::Relaxed);
    }
}

/// Exponentially weighted cognitive load in [0,1].
#[derive(Debug, Default)]
struct LoadMonitor {
    ewma: Mutex<f32>,
}

impl LoadMonitor {
    fn update(&self, busy_ratio: f32) -> f32 {
        let mut ewma = self
            .ewma
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *ewma = (*ewma * 0.8 + busy_ratio.clamp(0.0, 1.0) * 0.2).clamp(0.0, 1.0);
        *ewma
    }

    fn load(&self) -> f32 {
        *self
            .ewma
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Cross-stream perception board, refreshed at sync barriers.
#[derive(Debug, Default)]
struct PerceptionBoard {
    slots: RwLock<Vec<Option<StreamPerception>>>,
}

impl PerceptionBoard {
    fn with_streams(n: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; n]),
        }
    }

    fn publish(&self, perception: StreamPerception) {
        let mut slots = self
            .slots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let stream = perception.stream;
        if stream < slots.len() {
            slots[stream] = Some(perception);
        }
    }

    fn read_others(&self, stream: usize) -> Vec<StreamPerception> {
        self.slots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != stream)
            .filter_map(|(_, p)| p.clone())
            .collect()
    }
}

/// What one tick did; consumed by tests and status reporting.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub global_step: u64,
    pub cycle_number: u64,
    pub sync: bool,
    pub period: Duration,
    pub load: f32,
    pub outcomes: Vec<StepOutcome>,
}

#[derive(Debug)]
struct SchedulerState {
    global_step: u64,
    last_cycle_boundary: Instant,
}

/// The phase scheduler.
pub struct PhaseScheduler {
    comps: Arc<Components>,
    lifecycle: Arc<LifecycleController>,
    workers: Vec<Arc<StreamWorker>>,
    board: PerceptionBoard,
    pub metrics: SchedulerMetrics,
    load: LoadMonitor,
    state: Mutex<SchedulerState>,
}

impl PhaseScheduler {
    /// Build the scheduler and its workers. Stream offsets are fixed here
    /// and never change for the life of the process.
    pub fn new(
        comps: Arc<Components>,
        lifecycle: Arc<LifecycleController>,
    ) -> CoreResult<Self> {
        let n = comps.config.scheduler.n_streams;
        let offsets = offsets_for(n)?;
        let workers = offsets
            .iter()
            .enumerate()
            .map(|(index, &offset)| {
                // every third stream interprets its non-pivotal steps
                // reflectively instead of expressively
                let mode = if index % 3 == 2 {
                    StreamMode::Reflective
                } else {
                    StreamMode::Expressive
                };
                Arc::new(StreamWorker::new(index, offset, mode, Arc::clone(&comps)))
            })
            .collect();

        info!(streams = n, offsets = ?offsets, "phase scheduler ready");
        Ok(Self {
            comps,
            lifecycle,
            workers,
            board: PerceptionBoard::with_streams(n),
            metrics: SchedulerMetrics::default(),
            load: LoadMonitor::default(),
            state: Mutex::new(SchedulerState {
                global_step: 0,
                last_cycle_boundary: Instant::now(),
            }),
        })
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<StreamWorker>] {
        &self.workers
    }

    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.lock_state().global_step
    }

    /// Restore the tick position from a snapshot.
    pub fn restore_global_step(&self, global_step: u64) {
        self.lock_state().global_step = global_step;
    }

    #[must_use]
    pub fn load(&self) -> f32 {
        self.load.load()
    }

    /// Perceptions currently visible to a stream (everyone else's last
    /// published summary).
    #[must_use]
    pub fn perceptions_for(&self, stream: usize) -> Vec<StreamPerception> {
        self.board.read_others(stream)
    }

    #[must_use]
    pub fn cycle_state(&self) -> CycleState {
        let state = self.lock_state();
        let step_index = (state.global_step % 12) as u8;
        CycleState {
            cycle_number: state.global_step / 12,
            step_index,
            phase: CyclePhase::from_step(step_index),
            active_streams: self.workers.len(),
        }
    }

    /// Execute one global step across all streams.
    pub async fn tick(&self) -> TickReport {
        let cfg = &self.comps.config.scheduler;
        let (global_step, cycle_boundary_elapsed) = {
            let mut state = self.lock_state();
            let step = state.global_step;
            let boundary = if step % 12 == 0 {
                let elapsed = state.last_cycle_boundary.elapsed();
                state.last_cycle_boundary = Instant::now();
                Some(elapsed)
            } else {
                None
            };
            (step, boundary)
        };
        let cycle_number = global_step / 12;
        let sync = global_step % SYNC_INTERVAL == 0;
        let load = self.load.load();
        let period = cfg.adaptive_period(load);
        let lifecycle_state = self.lifecycle.state();

        // cycle boundary housekeeping: goal/interest decay scaled by the
        // real elapsed time since the previous boundary
        if let Some(elapsed) = cycle_boundary_elapsed {
            if cycle_number > 0 {
                self.comps.goals.decay(elapsed);
                self.comps.interests.decay(elapsed);
            }
        }

        // goal-directed modulation: a scoring bias, not preemption
        let goal_bias = GoalBias::from_goals(&self.comps.goals.top(BIAS_GOALS));

        let budget = if sync {
            cfg.t_sync_max().min(cfg.step_budget())
        } else {
            cfg.step_budget()
        };
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + budget;

        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let local_step = worker.local_step(global_step);
            let ctx = StepContext {
                cycle_number,
                global_step,
                local_step,
                lifecycle: lifecycle_state,
                load,
                goal_bias: goal_bias.clone(),
                perceptions: self.board.read_others(worker.index()),
            };
            let task_worker = Arc::clone(worker);
            let handle = tokio::spawn(async move { task_worker.execute_step(ctx).await });
            handles.push((Arc::clone(worker), local_step, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (worker, local_step, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(join_error)) => {
                    // a panicked handler is isolated; the cycle continues
                    error!(
                        stream = worker.index(),
                        step = local_step,
                        error = %join_error,
                        "step handler panicked"
                    );
                    self.metrics.failed_steps.fetch_add(1, Ordering::Relaxed);
                    outcomes.push(StepOutcome {
                        stream: worker.index(),
                        global_step,
                        local_step,
                        status: crate::streams::StepStatus::Failed,
                        reason: Some("handler panicked".to_string()),
                        perception: None,
                        writes: 0,
                    });
                }
                Err(_) => {
                    abort.abort();
                    worker.note_cancellation(local_step);
                    self.metrics.cancelled_steps.fetch_add(1, Ordering::Relaxed);
                    if sync {
                        self.metrics.missed_sync.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(
                        stream = worker.index(),
                        step = local_step,
                        sync,
                        "step cancelled at budget"
                    );
                    outcomes.push(StepOutcome::cancelled(
                        worker.index(),
                        global_step,
                        local_step,
                    ));
                }
            }
        }

        for outcome in &outcomes {
            match outcome.status {
                crate::streams::StepStatus::Completed => {
                    self.metrics.completed_steps.fetch_add(1, Ordering::Relaxed);
                }
                crate::streams::StepStatus::Suspended => {
                    self.metrics.suspended_steps.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }

        // sync barrier: completed streams publish their perceptions; a
        // cancelled stream's summary for this step is never visible
        if sync {
            for outcome in &outcomes {
                if let Some(perception) = &outcome.perception {
                    self.board.publish(perception.clone());
                }
            }
        }

        // load and lifecycle bookkeeping
        let busy_ratio =
            (started.elapsed().as_secs_f32() / period.as_secs_f32().max(1e-6)).min(1.0);
        let load = self.load.update(busy_ratio);
        self.lifecycle.note_step(load);
        if lifecycle_state == LifecycleState::Resting {
            self.lifecycle.recover(started.elapsed().max(period));
        }
        self.lifecycle.evaluate(
            load,
            self.comps.episodic.fill_ratio(),
            self.comps.episodic.is_empty(),
            Instant::now(),
        );

        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        self.lock_state().global_step += 1;

        TickReport {
            global_step,
            cycle_number,
            sync,
            period,
            load,
            outcomes,
        }
    }

    /// Tick until shutdown is signalled, pacing ticks to the adaptive
    /// period.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler loop starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            let report = self.tick().await;
            let elapsed = started.elapsed();
            if elapsed < report.period {
                tokio::select! {
                    () = tokio::time::sleep(report.period - elapsed) => {}
                    _ = shutdown.changed() => {}
                }
            } else {
                // stay responsive to cancellation even when behind schedule
                tokio::task::yield_now().await;
            }
        }
        info!("scheduler loop stopped");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
