//! Inference Streams
//!
//! A stream is one of N >= 3 concurrent workers walking the 12-step cycle
//! at a fixed phase offset. Per step a worker reads a minimal cognitive
//! context, dispatches a pure handler, and applies the handler's writes as
//! a batch at step end.
//!
//! # Per-step atomicity
//!
//! Handlers never touch shared components directly; they return a
//! `StepOutput` describing every intended write. The apply phase runs
//! without a single await point, so a cancellation (task abort) can only
//! land before it starts — a cancelled step contributes nothing.

pub mod handlers;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::NodeId;
use crate::core::Components;
use crate::episodic::EpisodicRecord;
use crate::goals::Goal;
use crate::interests::Interest;
use crate::lifecycle::LifecycleState;
use crate::memory::{BinaryEdge, EdgeFilter, EdgeType, MemoryNode};
use crate::noise::SalienceModulator;
use crate::skills::SkillTier;

/// The three step kinds of the 12-step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Steps 0 and 6: relevance realization (pivotal)
    RelevanceRealization,
    /// Steps 1..=5: affordance interaction (expressive)
    AffordanceInteraction,
    /// Steps 7..=11: salience simulation (anticipatory)
    SalienceSimulation,
}

impl StepKind {
    /// Partition of step indices 0..11.
    #[must_use]
    pub const fn from_step(step: u8) -> Self {
        match step % 12 {
            0 | 6 => Self::RelevanceRealization,
            1..=5 => Self::AffordanceInteraction,
            _ => Self::SalienceSimulation,
        }
    }
}

/// Interpretation a stream applies at its non-pivotal steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Emit candidate thoughts and actions
    Expressive,
    /// Evaluate and appraise instead of emitting
    Reflective,
}

/// Compact cross-stream summary published at sync barriers.
///
/// Side-effect free and small: a headline, up to eight focus ids, and a
/// salience figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPerception {
    pub stream: usize,
    pub step: u8,
    pub kind: StepKind,
    pub headline: String,
    pub focus: Vec<NodeId>,
    pub salience: f32,
}

impl StreamPerception {
    const MAX_HEADLINE: usize = 200;
    const MAX_FOCUS: usize = 8;

    #[must_use]
    pub fn new(stream: usize, step: u8, headline: &str, focus: &[NodeId], salience: f32) -> Self {
        let mut headline = headline.to_string();
        headline.truncate(Self::MAX_HEADLINE);
        Self {
            stream,
            step,
            kind: StepKind::from_step(step),
            headline,
            focus: focus.iter().copied().take(Self::MAX_FOCUS).collect(),
            salience: salience.clamp(0.0, 1.0),
        }
    }
}

/// Goal-directed scoring bias distributed by the scheduler each cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalBias {
    /// Descriptions of the currently leading goals
    pub descriptions: Vec<String>,
    /// Token vocabulary of those goals, for cheap matching
    pub vocabulary: BTreeSet<String>,
}

impl GoalBias {
    #[must_use]
    pub fn from_goals(goals: &[Goal]) -> Self {
        let mut vocabulary = BTreeSet::new();
        let mut descriptions = Vec::new();
        for goal in goals {
            vocabulary.extend(crate::core::types::token_set(&goal.description));
            descriptions.push(goal.description.clone());
        }
        Self {
            descriptions,
            vocabulary,
        }
    }

    /// How strongly a text matches the goal vocabulary, [0,1].
    #[must_use]
    pub fn affinity(&self, text: &str) -> f32 {
        if self.vocabulary.is_empty() {
            return 0.0;
        }
        let tokens = crate::core::types::token_set(text);
        if tokens.is_empty() {
            return 0.0;
        }
        let hits = tokens.intersection(&self.vocabulary).count() as f32;
        (hits / tokens.len() as f32).clamp(0.0, 1.0)
    }
}

/// Scheduler-provided context for one step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub cycle_number: u64,
    pub global_step: u64,
    pub local_step: u8,
    pub lifecycle: LifecycleState,
    pub load: f32,
    pub goal_bias: GoalBias,
    pub perceptions: Vec<StreamPerception>,
}

/// Everything a handler may read, gathered up front under read-only access.
#[derive(Debug, Clone)]
pub struct HandlerSnapshot {
    pub stream_index: usize,
    pub local_step: u8,
    pub cycle_number: u64,
    pub load: f32,
    /// Current focus: node ids with content previews
    pub focus: Vec<(NodeId, String)>,
    /// Content previews of the focus neighborhood
    pub focus_neighborhood: Vec<String>,
    pub recent_thoughts: Vec<String>,
    pub top_goals: Vec<Goal>,
    pub open_goal_count: usize,
    pub top_interests: Vec<Interest>,
    /// Matching memory volume per top interest (for gap detection)
    pub interest_node_counts: Vec<(String, usize, f32)>,
    /// Gap topics this stream has already flagged
    pub flagged_gaps: BTreeSet<String>,
    pub applicable_wisdom: Vec<String>,
    pub goal_bias: GoalBias,
    pub perceptions: Vec<StreamPerception>,
    pub reflection_tier: SkillTier,
    pub pattern_tier: SkillTier,
}

/// A planned edge; endpoints may reference nodes created in the same step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedEdge {
    pub src: NodeId,
    pub dst: NodeId,
    pub edge_type: EdgeType,
    pub weight: f32,
}

/// A planned interest reinforcement.
#[derive(Debug, Clone, PartialEq)]
pub struct InterestNote {
    pub topic: String,
    pub weight: f32,
    pub context: String,
}

/// Activation spread requested by a pivotal step.
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadDirective {
    pub seeds: Vec<NodeId>,
    pub iterations: usize,
    pub decay: f32,
}

/// How a step wants the focus set changed.
#[derive(Debug, Clone, PartialEq)]
pub enum FocusDirective {
    /// Replace the focus outright
    Set(Vec<NodeId>),
    /// Recompute from post-spread activation, keeping the top k
    Recompute { k: usize },
}

/// Batched writes produced by one step handler.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub new_nodes: Vec<MemoryNode>,
    pub new_edges: Vec<PlannedEdge>,
    pub episodics: Vec<EpisodicRecord>,
    pub goals: Vec<Goal>,
    pub interest_notes: Vec<InterestNote>,
    /// Skills practiced this step
    pub practice: Vec<String>,
    pub spread: Option<SpreadDirective>,
    pub focus: Option<FocusDirective>,
    /// Headline for the next sync perception
    pub headline: String,
    pub salience: f32,
}

/// Terminal status of one step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    /// Lifecycle gating suspended this handler for this step
    Suspended,
    /// The scheduler cancelled the handler; no writes landed
    Cancelled,
    Failed,
}

/// Structured outcome; expected errors become `Failed` with a reason and
/// never propagate out of the worker loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub stream: usize,
    pub global_step: u64,
    pub local_step: u8,
    pub status: StepStatus,
    pub reason: Option<String>,
    pub perception: Option<StreamPerception>,
    pub writes: usize,
}

impl StepOutcome {
    #[must_use]
    pub fn cancelled(stream: usize, global_step: u64, local_step: u8) -> Self {
        Self {
            stream,
            global_step,
            local_step,
            status: StepStatus::Cancelled,
            reason: Some("step budget exceeded".to_string()),
            perception: None,
            writes: 0,
        }
    }
}

/// Cancellations observed per local step; drives adaptive throttling.
pub type DegradationCounters = BTreeMap<u8, u32>;

const RECENT_THOUGHTS_KEPT: usize = 16;
const FOCUS_LIMIT: usize = 8;
/// Cancellations of one handler before it is throttled to a light variant.
const DEGRADATION_THROTTLE: u32 = 3;

#[derive(Debug)]
struct WorkerState {
    focus: Vec<NodeId>,
    recent_thoughts: VecDeque<String>,
    degradation: DegradationCounters,
    /// Interest topics already flagged as knowledge gaps
    flagged_gaps: BTreeSet<String>,
    rng: StdRng,
    modulator: SalienceModulator,
}

/// One concurrent inference stream.
pub struct StreamWorker {
    index: usize,
    offset: u8,
    mode: StreamMode,
    comps: std::sync::Arc<Components>,
    state: Mutex<WorkerState>,
    /// Test hook: force a delay at a given local step to exercise the
    /// cancellation path.
    #[cfg(test)]
    pub(crate) forced_delay: Mutex<Option<(u8, std::time::Duration)>>,
}

impl StreamWorker {
    #[must_use]
    pub fn new(
        index: usize,
        offset: u8,
        mode: StreamMode,
        comps: std::sync::Arc<Components>,
    ) -> Self {
        let seed = comps
            .config
            .rng_seed
            .map(|s| s ^ (index as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            index,
            offset,
            mode,
            comps,
            state: Mutex::new(WorkerState {
                focus: Vec::new(),
                recent_thoughts: VecDeque::new(),
                degradation: BTreeMap::new(),
                flagged_gaps: BTreeSet::new(),
                rng,
                modulator: SalienceModulator::default(),
            }),
            #[cfg(test)]
            forced_delay: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn offset(&self) -> u8 {
        self.offset
    }

    #[must_use]
    pub const fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Derive the local step for a global step.
    #[must_use]
    pub const fn local_step(&self, global_step: u64) -> u8 {
        ((global_step + self.offset as u64) % 12) as u8
    }

    /// Record a cancellation for adaptive throttling.
    pub fn note_cancellation(&self, local_step: u8) {
        let mut state = self.lock();
        *state.degradation.entry(local_step).or_insert(0) += 1;
    }

    #[must_use]
    pub fn degradation_counters(&self) -> DegradationCounters {
        self.lock().degradation.clone()
    }

    pub fn restore_degradation(&self, counters: DegradationCounters) {
        self.lock().degradation = counters;
    }

    #[must_use]
    pub fn focus(&self) -> Vec<NodeId> {
        self.lock().focus.clone()
    }

    /// Execute one step: gate, read, dispatch, apply.
    ///
    /// All expected failures are folded into the returned outcome; nothing
    /// propagates out of the worker loop.
    pub async fn execute_step(&self, ctx: StepContext) -> StepOutcome {
        let local_step = ctx.local_step;
        let kind = StepKind::from_step(local_step);

        // lifecycle gating: expressive handlers are suspended outside Awake
        if kind == StepKind::AffordanceInteraction && ctx.lifecycle != LifecycleState::Awake {
            return StepOutcome {
                stream: self.index,
                global_step: ctx.global_step,
                local_step,
                status: StepStatus::Suspended,
                reason: Some(format!("expressive handlers suspended in {}", ctx.lifecycle)),
                perception: None,
                writes: 0,
            };
        }

        #[cfg(test)]
        {
            let delay = *self
                .forced_delay
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((step, duration)) = delay {
                if step == local_step {
                    tokio::time::sleep(duration).await;
                }
            }
        }

        let snapshot = self.read_context(&ctx);
        // cancellation point between read and dispatch
        tokio::task::yield_now().await;

        let degraded = self
            .lock()
            .degradation
            .get(&local_step)
            .copied()
            .unwrap_or(0)
            >= DEGRADATION_THROTTLE;

        let output = {
            let mut state = self.lock();
            let WorkerState {
                rng, modulator, ..
            } = &mut *state;
            match kind {
                StepKind::RelevanceRealization => handlers::pivotal(&snapshot, rng),
                StepKind::AffordanceInteraction => {
                    if degraded || self.mode == StreamMode::Reflective {
                        handlers::reflective(&snapshot, rng)
                    } else {
                        handlers::expressive(&snapshot, rng, modulator)
                    }
                }
                StepKind::SalienceSimulation => handlers::anticipatory(&snapshot, rng, degraded),
            }
        };

        // final cancellation point; the apply below never awaits
        tokio::task::yield_now().await;
        self.apply_output(&ctx, output)
    }

    /// Gather the read-only context a handler may see.
    fn read_context(&self, ctx: &StepContext) -> HandlerSnapshot {
        let comps = &self.comps;
        let state = self.lock();

        let focus: Vec<(NodeId, String)> = state
            .focus
            .iter()
            .filter_map(|id| {
                comps
                    .memory
                    .get_node(*id)
                    .ok()
                    .map(|n| (*id, preview(&n.content)))
            })
            .collect();

        let mut focus_neighborhood = Vec::new();
        if let Some((anchor, _)) = focus.first() {
            for neighbor in comps
                .memory
                .neighbors(*anchor, 1, &EdgeFilter::default())
                .into_iter()
                .take(4)
            {
                if let Ok(node) = comps.memory.get_node(neighbor.id) {
                    focus_neighborhood.push(preview(&node.content));
                }
            }
        }

        let top_interests = comps.interests.top_k(5);
        let all_nodes = comps
            .memory
            .nodes_matching(&crate::memory::NodeFilter::default());
        let interest_node_counts = top_interests
            .iter()
            .map(|interest| {
                let matches = all_nodes
                    .iter()
                    .filter(|n| interest.coverage(&n.content) > 0.5)
                    .count();
                (interest.topic.clone(), matches, interest.strength)
            })
            .collect();

        let top_goals = comps.goals.top(4);
        let context_text: String = top_goals
            .iter()
            .map(|g| g.description.as_str())
            .chain(top_interests.iter().map(|i| i.topic.as_str()))
            .collect::<Vec<_>>()
            .join(" ");
        let applicable_wisdom = comps
            .wisdom
            .applicable_to(&context_text)
            .into_iter()
            .take(3)
            .map(|w| w.content)
            .collect();

        HandlerSnapshot {
            stream_index: self.index,
            local_step: ctx.local_step,
            cycle_number: ctx.cycle_number,
            load: ctx.load,
            focus,
            focus_neighborhood,
            recent_thoughts: state.recent_thoughts.iter().cloned().collect(),
            top_goals,
            open_goal_count: comps.goals.open_count(),
            top_interests,
            interest_node_counts,
            flagged_gaps: state.flagged_gaps.clone(),
            applicable_wisdom,
            goal_bias: ctx.goal_bias.clone(),
            perceptions: ctx.perceptions.clone(),
            reflection_tier: comps.skills.tier("Reflection"),
            pattern_tier: comps.skills.tier("PatternRecognition"),
        }
    }

    /// Apply a step's writes as one batch. Contains no await point, so a
    /// task abort can never split it.
    fn apply_output(&self, ctx: &StepContext, output: StepOutput) -> StepOutcome {
        let StepOutput {
            new_nodes,
            new_edges,
            episodics,
            goals,
            interest_notes,
            practice,
            spread,
            focus,
            headline,
            salience,
        } = output;

        let comps = &self.comps;
        let mut writes = 0usize;
        let mut failure: Option<String> = None;

        let new_ids: BTreeSet<NodeId> = new_nodes.iter().map(|n| n.id).collect();

        for node in new_nodes {
            match comps.memory.add_node(node) {
                Ok(_) => writes += 1,
                Err(e) => {
                    failure = Some(format!("node insert: {e}"));
                    break;
                }
            }
        }

        if failure.is_none() {
            for edge in &new_edges {
                let src_ok = new_ids.contains(&edge.src) || comps.memory.contains(edge.src);
                let dst_ok = new_ids.contains(&edge.dst) || comps.memory.contains(edge.dst);
                if !src_ok || !dst_ok {
                    debug!(stream = self.index, "skipping edge with vanished endpoint");
                    continue;
                }
                match comps.memory.add_edge(BinaryEdge::new(
                    edge.src,
                    edge.dst,
                    edge.edge_type,
                    edge.weight,
                )) {
                    Ok(()) => writes += 1,
                    Err(e) => debug!(stream = self.index, error = %e, "edge insert skipped"),
                }
            }

            if let Some(spread) = &spread {
                comps
                    .memory
                    .spread_activation(&spread.seeds, spread.iterations, spread.decay);
                writes += 1;
            }

            let mut state = self.lock();
            if let Some(directive) = &focus {
                state.focus = match directive {
                    FocusDirective::Set(ids) => ids.iter().copied().take(FOCUS_LIMIT).collect(),
                    FocusDirective::Recompute { k } => {
                        comps.memory.top_activated((*k).min(FOCUS_LIMIT))
                    }
                };
            }
            for episodic in &episodics {
                if episodic.kind == crate::episodic::EpisodeKind::Thought {
                    state.recent_thoughts.push_back(preview(&episodic.content));
                    while state.recent_thoughts.len() > RECENT_THOUGHTS_KEPT {
                        state.recent_thoughts.pop_front();
                    }
                }
            }
            for note in &interest_notes {
                if let Some(gap_topic) = note.context.strip_prefix("knowledge_gap:") {
                    state.flagged_gaps.insert(gap_topic.to_string());
                }
            }
            drop(state);

            for episodic in episodics {
                comps.episodic.append(episodic);
                writes += 1;
            }
            for goal in goals {
                comps.goals.push(goal);
                writes += 1;
            }
            for note in interest_notes {
                comps.interests.note(&note.topic, note.weight, &note.context);
                writes += 1;
            }
            for skill in practice {
                match comps.skills.practice(&skill) {
                    Ok(_) => writes += 1,
                    Err(e) => {
                        debug!(stream = self.index, skill = %skill, error = %e, "practice skipped");
                    }
                }
            }
        }

        let focus_now = self.focus();
        match failure {
            Some(reason) => {
                warn!(
                    stream = self.index,
                    step = ctx.local_step,
                    reason = %reason,
                    "step failed during apply"
                );
                StepOutcome {
                    stream: self.index,
                    global_step: ctx.global_step,
                    local_step: ctx.local_step,
                    status: StepStatus::Failed,
                    reason: Some(reason),
                    perception: None,
                    writes: 0,
                }
            }
            None => StepOutcome {
                stream: self.index,
                global_step: ctx.global_step,
                local_step: ctx.local_step,
                status: StepStatus::Completed,
                reason: None,
                perception: Some(StreamPerception::new(
                    self.index,
                    ctx.local_step,
                    &headline,
                    &focus_now,
                    salience,
                )),
                writes,
            },
        }
    }

    /// Whether a gap topic has already been flagged by this stream.
    #[must_use]
    pub fn gap_already_flagged(&self, topic: &str) -> bool {
        self.lock().flagged_gaps.contains(topic)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn preview(content: &str) -> String {
    let mut s = content.to_string();
    if s.len() > 120 {
        s.truncate(120);
    }
    s
}
