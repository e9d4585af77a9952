//! Composition root
//!
//! `CognitiveCore` wires every component together with explicit dependency
//! passing: each part takes only the capabilities it needs, a single
//! `Components` bundle carries the shared state, and all lifetimes end
//! when the core stops. The host process talks to the core exclusively
//! through the control surface here plus the message channels.

pub mod types;


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CoreConfig;
use crate::dream::DreamConsolidator;
use crate::engagement::{EngagementController, IncomingMessage, OutgoingMessage};
use crate::episodic::{EpisodeKind, EpisodicBuffer, EpisodicRecord};
use crate::error::{CoreError, CoreResult};
use crate::goals::{Goal, GoalQueue, GoalSource, TimeHorizon};
use crate::identity::{IdentityKernel, SelfAssessInputs, SelfAssessment};
use crate::interests::{Interest, InterestModel};
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::llm::LanguageModel;
use crate::memory::{HypergraphMemory, NodeFilter, NodeType};
use crate::persistence::{
    SchedulerMeta, Snapshot, SnapshotCounters, SnapshotStore, SNAPSHOT_VERSION,
};
use crate::scheduler::{offsets_for, CycleState, PhaseScheduler, SchedulerCounters};
use crate::skills::{Skill, SkillRegistry};
use crate::wisdom::WisdomStore;

/// Shared component bundle handed to workers, the dream consolidator, and
/// the engagement controller.
pub struct Components {
    pub memory: Arc<HypergraphMemory>,
    pub episodic: Arc<EpisodicBuffer>,
    pub interests: Arc<InterestModel>,
    pub wisdom: Arc<WisdomStore>,
    pub skills: Arc<SkillRegistry>,
    pub goals: Arc<GoalQueue>,
    pub identity: Arc<IdentityKernel>,
    pub llm: Arc<dyn LanguageModel>,
    pub config: CoreConfig,
}

impl Components {
    /// Build the bundle with baseline skills registered.
    #[must_use]
    pub fn new(config: CoreConfig, llm: Arc<dyn LanguageModel>) -> Arc<Self> {
        let skills = SkillRegistry::new(config.skills.clone());
        skills.register(Skill::new("Reflection", 0.35));
        skills.register(Skill::new("PatternRecognition", 0.4));
        skills.register(
            Skill::new("ScenarioSimulation", 0.25).with_prerequisite("PatternRecognition"),
        );

        Arc::new(Self {
            memory: Arc::new(HypergraphMemory::new(config.memory.clone())),
            episodic: Arc::new(EpisodicBuffer::new(config.episodic.clone())),
            interests: Arc::new(InterestModel::new(config.interests.clone())),
            wisdom: Arc::new(WisdomStore::new(config.wisdom.clone())),
            skills: Arc::new(skills),
            goals: Arc::new(GoalQueue::new(config.goals.clone())),
            identity: Arc::new(IdentityKernel::new()),
            llm,
            config,
        })
    }
}

/// Structured status reported to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreStatus {
    pub lifecycle: LifecycleState,
    pub cycle: CycleState,
    pub load: f32,
    pub fatigue: f32,
    pub counters: SchedulerCounters,
    pub episodic_fill: f32,
    pub pending_messages: usize,
    pub open_goals: usize,
    pub memory_nodes: usize,
    pub memory_edges: usize,
    pub coherence: Option<f32>,
    pub last_error_class: Option<String>,
}

/// The autonomous cognitive core.
pub struct CognitiveCore {
    comps: Arc<Components>,
    lifecycle: Arc<LifecycleController>,
    scheduler: Arc<PhaseScheduler>,
    dream: Arc<DreamConsolidator>,
    engagement: Arc<EngagementController>,
    store: SnapshotStore,
    shutdown_tx: watch::Sender<bool>,
    out_rx: Mutex<Option<mpsc::Receiver<OutgoingMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_error: Mutex<Option<String>>,
    last_assessment: Arc<Mutex<Option<SelfAssessment>>>,
    assessments_run: AtomicU64,
}

impl std::fmt::Debug for CognitiveCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CognitiveCore").finish_non_exhaustive()
    }
}

impl CognitiveCore {
    /// Build a fresh core. No background work starts until `start`.
    pub fn new(config: CoreConfig, llm: Arc<dyn LanguageModel>) -> CoreResult<Self> {
        config.validate()?;
        let store = SnapshotStore::new(config.persistence.snapshot_path.clone());
        let comps = Components::new(config, llm);
        let lifecycle = Arc::new(LifecycleController::new(comps.config.lifecycle.clone()));
        let scheduler = Arc::new(PhaseScheduler::new(
            Arc::clone(&comps),
            Arc::clone(&lifecycle),
        )?);
        let dream = Arc::new(DreamConsolidator::new(Arc::clone(&comps)));
        let (out_tx, out_rx) = mpsc::channel(64);
        let engagement = Arc::new(EngagementController::new(
            Arc::clone(&comps),
            Arc::clone(&lifecycle),
            out_tx,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            comps,
            lifecycle,
            scheduler,
            dream,
            engagement,
            store,
            shutdown_tx,
            out_rx: Mutex::new(Some(out_rx)),
            tasks: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            last_assessment: Arc::new(Mutex::new(None)),
            assessments_run: AtomicU64::new(0),
        })
    }

    /// Build a core and restore the persisted snapshot if one exists.
    ///
    /// A failed restore leaves the core freshly initialized — unless
    /// `require_restore` is set, in which case startup fails fatally.
    pub fn bootstrap(config: CoreConfig, llm: Arc<dyn LanguageModel>) -> CoreResult<Self> {
        let require_restore = config.persistence.require_restore;
        let core = Self::new(config, llm)?;

        match core.store.load() {
            Ok(snapshot) => match core.restore(snapshot) {
                Ok(()) => info!("core restored from snapshot"),
                Err(e) if require_restore => {
                    return Err(CoreError::Fatal(format!("restore required but failed: {e}")));
                }
                Err(e) => {
                    warn!(error = %e, "restore failed, starting fresh");
                }
            },
            Err(CoreError::NotFound(_)) if !require_restore => {
                info!("no snapshot found, starting fresh");
            }
            Err(e) if require_restore => {
                return Err(CoreError::Fatal(format!("restore required but failed: {e}")));
            }
            Err(e) => {
                warn!(error = %e, "snapshot unreadable, starting fresh");
            }
        }
        Ok(core)
    }

    #[must_use]
    pub fn components(&self) -> &Arc<Components> {
        &self.comps
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<PhaseScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    #[must_use]
    pub fn engagement(&self) -> &Arc<EngagementController> {
        &self.engagement
    }

    #[must_use]
    pub fn dream_consolidator(&self) -> &Arc<DreamConsolidator> {
        &self.dream
    }

    /// Take the outgoing message receiver. Yields `None` after the first
    /// call; there is exactly one out-channel.
    pub fn take_outgoing(&self) -> Option<mpsc::Receiver<OutgoingMessage>> {
        self.out_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Queue an inbound message for the engagement controller.
    pub fn ingest(&self, message: IncomingMessage) -> CoreResult<()> {
        self.engagement.ingest(message)
    }

    /// Start all background tasks: scheduler loop, engagement loop, dream
    /// watcher, periodic snapshots, periodic self-assessment.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            warn!("core already started");
            return;
        }
        info!("cognitive core starting");

        let scheduler = Arc::clone(&self.scheduler);
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            scheduler.run(shutdown).await;
        }));

        let engagement = Arc::clone(&self.engagement);
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            engagement.run(shutdown).await;
        }));

        // dream watcher: entering Dreaming triggers a consolidation run
        let lifecycle = Arc::clone(&self.lifecycle);
        let dream = Arc::clone(&self.dream);
        let dream_max = self.comps.config.lifecycle.t_dream_max();
        let mut state_rx = self.lifecycle.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *state_rx.borrow_and_update();
                        if state == LifecycleState::Dreaming {
                            let run = dream.run();
                            match tokio::time::timeout(dream_max, run).await {
                                Ok(_record) => lifecycle.dream_completed(),
                                Err(_) => {
                                    warn!("dream exceeded its ceiling, waking anyway");
                                    lifecycle.dream_completed();
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        // periodic snapshots
        if let Some(interval) = self.comps.config.persistence.snapshot_interval() {
            let comps = Arc::clone(&self.comps);
            let scheduler = Arc::clone(&self.scheduler);
            let lifecycle = Arc::clone(&self.lifecycle);
            let dream = Arc::clone(&self.dream);
            let store = SnapshotStore::new(self.comps.config.persistence.snapshot_path.clone());
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {
                            let snapshot =
                                assemble_snapshot(&comps, &scheduler, &lifecycle, &dream);
                            if let Err(e) = store.save(&snapshot) {
                                error!(error = %e, "periodic snapshot failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // periodic self-assessment, paced by the assess interval in cycles
        let core_comps = Arc::clone(&self.comps);
        let scheduler = Arc::clone(&self.scheduler);
        let engagement = Arc::clone(&self.engagement);
        let assess_every = Duration::from_millis(
            self.comps.config.scheduler.t_step_ms
                * self.comps.config.scheduler.assess_interval_cycles.max(1),
        );
        let shared_assessment = Arc::clone(&self.last_assessment);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(assess_every) => {
                        let assessment = run_assessment(&core_comps, &scheduler, &engagement);
                        *shared_assessment
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner) =
                            Some(assessment);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Graceful stop: signal shutdown, wait for tasks, write the final
    /// snapshot.
    pub async fn stop(&self) -> CoreResult<()> {
        info!("cognitive core stopping");
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "background task ended abnormally");
                }
            }
        }
        let result = self.save_snapshot();
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    // =========================================================================
    // Operational controls
    // =========================================================================

    pub fn request_rest(&self) {
        self.lifecycle.request_rest();
    }

    pub fn request_wake(&self) {
        self.lifecycle.request_wake();
    }

    /// Inject an external goal.
    pub fn inject_goal(
        &self,
        description: impl Into<String>,
        priority: f32,
        horizon: TimeHorizon,
    ) -> crate::core::types::GoalId {
        self.comps
            .goals
            .push(Goal::new(description, priority, horizon, GoalSource::External))
    }

    /// Inject or reinforce an interest.
    pub fn inject_interest(&self, topic: &str, weight: f32) {
        self.comps
            .interests
            .seed(Interest::new(topic, weight));
    }

    /// Run a self-assessment now and record it.
    pub fn trigger_self_assessment(&self) -> SelfAssessment {
        let assessment = run_assessment(&self.comps, &self.scheduler, &self.engagement);
        self.assessments_run.fetch_add(1, Ordering::Relaxed);
        *self
            .last_assessment
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(assessment);
        assessment
    }

    /// Structured status for the host.
    #[must_use]
    pub fn status(&self) -> CoreStatus {
        let assessment = *self
            .last_assessment
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        CoreStatus {
            lifecycle: self.lifecycle.state(),
            cycle: self.scheduler.cycle_state(),
            load: self.scheduler.load(),
            fatigue: self.lifecycle.fatigue(),
            counters: self.scheduler.metrics.snapshot(),
            episodic_fill: self.comps.episodic.fill_ratio(),
            pending_messages: self.engagement.pending(),
            open_goals: self.comps.goals.open_count(),
            memory_nodes: self.comps.memory.node_count(),
            memory_edges: self.comps.memory.edge_count(),
            coherence: assessment.map(|a| a.overall),
            last_error_class: self
                .last_error
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }

    // =========================================================================
    // Snapshot / restore
    // =========================================================================

    /// Assemble the logical snapshot under the fixed component order:
    /// Identity, Memory, Interests, Goals, Skills, Wisdom.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        assemble_snapshot(&self.comps, &self.scheduler, &self.lifecycle, &self.dream)
    }

    pub fn save_snapshot(&self) -> CoreResult<()> {
        self.store.save(&self.snapshot())
    }

    /// All-or-nothing restore. On any failure the core is reset to a
    /// freshly initialized state and the error is returned.
    pub fn restore(&self, snapshot: Snapshot) -> CoreResult<()> {
        let result = self.try_restore(snapshot);
        if let Err(e) = &result {
            warn!(error = %e, "restore failed, resetting to fresh state");
            self.reset_fresh();
            self.record_error(e);
        }
        result
    }

    fn try_restore(&self, snapshot: Snapshot) -> CoreResult<()> {
        let expected = offsets_for(self.comps.config.scheduler.n_streams)?;
        if snapshot.scheduler.stream_offsets != expected {
            return Err(CoreError::Fatal(format!(
                "snapshot stream offsets {:?} do not match configured {:?}",
                snapshot.scheduler.stream_offsets, expected
            )));
        }

        // memory import validates referential integrity; it goes first so
        // a corrupt graph aborts before anything else is touched
        self.comps.memory.import(snapshot.memory)?;
        self.comps.identity.import(snapshot.identity);
        self.comps.episodic.import(snapshot.episodic);
        self.comps.interests.import(snapshot.interests);
        self.comps.goals.import(snapshot.goals);
        self.comps.skills.import(snapshot.skills);
        self.comps.wisdom.import(snapshot.wisdom);

        self.scheduler.restore_global_step(snapshot.scheduler.global_step);
        self.scheduler.metrics.restore(&snapshot.counters.scheduler);
        for (worker, counters) in self
            .scheduler
            .workers()
            .iter()
            .zip(snapshot.counters.degradation)
        {
            worker.restore_degradation(counters);
        }
        self.dream.import_records(snapshot.counters.dream_records);
        self.lifecycle.restore_state(snapshot.scheduler.lifecycle)?;
        Ok(())
    }

    fn reset_fresh(&self) {
        let _ = self.comps.memory.import(crate::memory::MemoryState::default());
        self.comps.episodic.import(crate::episodic::EpisodicState::default());
        self.comps.interests.import(Vec::new());
        self.comps.goals.import(Vec::new());
        self.comps.skills.import(Vec::new());
        self.comps.wisdom.import(Vec::new());
        self.comps
            .identity
            .import(crate::identity::IdentityState::default());
        self.scheduler.restore_global_step(0);
        self.scheduler
            .metrics
            .restore(&SchedulerCounters::default());
        self.dream.import_records(Vec::new());
    }

    fn record_error(&self, error: &CoreError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(error.class().to_string());
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Gather the snapshot from every component in the canonical order.
fn assemble_snapshot(
    comps: &Arc<Components>,
    scheduler: &Arc<PhaseScheduler>,
    lifecycle: &Arc<LifecycleController>,
    dream: &Arc<DreamConsolidator>,
) -> Snapshot {
    // fixed read order: Identity -> Memory -> Interests -> Goals -> Skills
    // -> Wisdom, then the buffers and counters
    let identity = comps.identity.export();
    let memory = comps.memory.export();
    let interests = comps.interests.export();
    let goals = comps.goals.export();
    let skills = comps.skills.export();
    let wisdom = comps.wisdom.export();
    let episodic = comps.episodic.export();

    let global_step = scheduler.global_step();
    Snapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        identity,
        memory,
        episodic,
        interests,
        wisdom,
        skills,
        goals,
        scheduler: SchedulerMeta {
            cycle_number: global_step / 12,
            global_step,
            stream_offsets: scheduler.workers().iter().map(|w| w.offset()).collect(),
            lifecycle: lifecycle.state(),
        },
        counters: SnapshotCounters {
            scheduler: scheduler.metrics.snapshot(),
            degradation: scheduler
                .workers()
                .iter()
                .map(|w| w.degradation_counters())
                .collect(),
            dream_records: dream.records(),
        },
    }
}

/// Build assessment inputs from every subcomponent and score them.
fn run_assessment(
    comps: &Arc<Components>,
    scheduler: &Arc<PhaseScheduler>,
    engagement: &Arc<EngagementController>,
) -> SelfAssessment {
    let pattern_nodes = comps
        .memory
        .nodes_matching(&NodeFilter::of_types([NodeType::Pattern]))
        .len();
    let core_interest_strength = comps
        .interests
        .top_k(8)
        .into_iter()
        .filter(|i| i.core)
        .map(|i| i.strength)
        .fold(0.0f32, f32::max);
    let counters = scheduler.metrics.snapshot();

    let assessments_so_far = comps
        .episodic
        .export()
        .records
        .iter()
        .filter(|r| r.kind == EpisodeKind::Assessment)
        .count() as u64;

    let inputs = SelfAssessInputs {
        memory_nodes: comps.memory.node_count(),
        memory_edges: comps.memory.edge_count(),
        pattern_nodes,
        dangling_ratio: 0.0,
        interest_count: comps.interests.len(),
        core_interest_strength,
        open_goals: comps.goals.open_count(),
        wisdom_count: comps.wisdom.len(),
        skill_count: comps.skills.len(),
        recent_coherence_failures: engagement.coherence_failures(),
        reflections_recorded: assessments_so_far + 1,
        cycles_completed: counters.ticks / 12,
    };
    let assessment = comps.identity.self_assess(&inputs);

    comps.episodic.append(
        EpisodicRecord::new(
            EpisodeKind::Assessment,
            format!(
                "Self-assessment: overall {:.2} (identity {:.2}, memory {:.2})",
                assessment.overall, assessment.identity_alignment, assessment.memory_coherence
            ),
            "self_assessment",
        )
        .with_importance(0.5),
    );

    assessment
}
