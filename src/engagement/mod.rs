//! Engagement Controller
//!
//! Decides autonomously when to engage with, continue, or end external
//! interactions. Messages arrive on a bounded queue; each is scored
//! against current interests and focus, and the engagement threshold
//! shifts upward while the agent is resting or fatigued.
//!
//! Every generated response passes the identity coherence filter before it
//! leaves the core; a rejected response is replaced by the deterministic
//! fallback and the incident is remembered.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::core::types::{token_overlap, MessageId};
use crate::core::Components;
use crate::episodic::{EpisodeKind, EpisodicRecord};
use crate::error::CoreResult;
use crate::goals::{Goal, GoalSource, TimeHorizon};
use crate::identity::StateSummary;
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::llm::{generate_with_retry, GenerateOptions};
use crate::memory::{NodeFilter, NodeType};

/// What kind of inbound message this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    System,
}

/// An inbound message from the host transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: MessageId,
    pub from: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub kind: MessageKind,
}

impl IncomingMessage {
    #[must_use]
    pub fn new(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            from: from.into(),
            content: content.into(),
            received_at: Utc::now(),
            kind: MessageKind::Text,
        }
    }
}

/// Why an outbound message exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingKind {
    Reply,
    Initiation,
    Farewell,
}

/// An outbound message to the host transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub to: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub kind: OutgoingKind,
    pub correlation_id: Option<MessageId>,
}

/// A recorded engagement decision, kept for later learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementDecision {
    pub message_id: MessageId,
    pub from: String,
    pub score: f32,
    pub threshold: f32,
    pub engaged: bool,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PartnerState {
    engaged: bool,
    low_since: Option<Instant>,
    recent: VecDeque<String>,
}

impl PartnerState {
    fn new() -> Self {
        Self {
            engaged: false,
            low_since: None,
            recent: VecDeque::new(),
        }
    }

    fn remember(&mut self, line: String) {
        self.recent.push_back(line);
        while self.recent.len() > 8 {
            self.recent.pop_front();
        }
    }
}

/// Outcome of processing one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum EngagementOutcome {
    Replied { to: String, fallback: bool },
    Declined { score: f32, threshold: f32 },
    Disengaged { from: String },
}

/// The engagement controller.
pub struct EngagementController {
    comps: Arc<Components>,
    lifecycle: Arc<LifecycleController>,
    queue: Mutex<Vec<IncomingMessage>>,
    out_tx: mpsc::Sender<OutgoingMessage>,
    decisions: Mutex<Vec<EngagementDecision>>,
    partners: Mutex<BTreeMap<String, PartnerState>>,
    last_initiation: Mutex<BTreeMap<String, Instant>>,
    coherence_failures: AtomicU32,
}

impl EngagementController {
    #[must_use]
    pub fn new(
        comps: Arc<Components>,
        lifecycle: Arc<LifecycleController>,
        out_tx: mpsc::Sender<OutgoingMessage>,
    ) -> Self {
        Self {
            comps,
            lifecycle,
            queue: Mutex::new(Vec::new()),
            out_tx,
            decisions: Mutex::new(Vec::new()),
            partners: Mutex::new(BTreeMap::new()),
            last_initiation: Mutex::new(BTreeMap::new()),
            coherence_failures: AtomicU32::new(0),
        }
    }

    /// Queue an inbound message. When the queue is full the lowest-score
    /// pending message is dropped; state is never corrupted.
    pub fn ingest(&self, message: IncomingMessage) -> CoreResult<()> {
        let capacity = self.comps.config.engagement.queue_capacity;
        let mut queue = self.lock_queue();
        queue.push(message);
        if queue.len() > capacity {
            let scores: Vec<f32> = queue.iter().map(|m| self.raw_score(&m.content)).collect();
            let victim = scores
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i);
            if let Some(index) = victim {
                let dropped = queue.remove(index);
                warn!(from = %dropped.from, "incoming queue full, dropped lowest-score message");
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    #[must_use]
    pub fn decisions(&self) -> Vec<EngagementDecision> {
        self.lock_decisions().clone()
    }

    /// Coherence rejections observed since startup.
    #[must_use]
    pub fn coherence_failures(&self) -> u32 {
        self.coherence_failures.load(Ordering::Relaxed)
    }

    /// Combined engagement score for a message: interest affinity plus
    /// topical relevance to the currently activated focus.
    #[must_use]
    pub fn raw_score(&self, content: &str) -> f32 {
        let interest = self.comps.interests.engagement_score(content);
        let focus_contents: Vec<String> = self
            .comps
            .memory
            .top_activated(5)
            .into_iter()
            .filter_map(|id| self.comps.memory.get_node(id).ok())
            .map(|n| n.content)
            .collect();
        let relevance = focus_contents
            .iter()
            .map(|c| token_overlap(content, c))
            .fold(0.0, f32::max);
        (0.6 * interest + 0.4 * relevance).clamp(0.0, 1.0)
    }

    /// Current engagement threshold: the configured base raised while
    /// resting or fatigued.
    #[must_use]
    pub fn current_threshold(&self) -> f32 {
        let cfg = &self.comps.config.engagement;
        let mut threshold = cfg.theta_engage;
        if self.lifecycle.state() != LifecycleState::Awake {
            threshold += cfg.delta_rest;
        }
        if self.lifecycle.fatigue() >= cfg.fatigue_high {
            threshold += cfg.delta_fat;
        }
        threshold.clamp(0.0, 1.0)
    }

    /// Process the oldest queued message, if any.
    pub async fn process_next(&self) -> Option<EngagementOutcome> {
        let message = {
            let mut queue = self.lock_queue();
            if queue.is_empty() {
                return None;
            }
            Some(queue.remove(0))
        }?;

        let score = self.raw_score(&message.content);
        let threshold = self.current_threshold();
        let engaged = score >= threshold;
        self.lock_decisions().push(EngagementDecision {
            message_id: message.id,
            from: message.from.clone(),
            score,
            threshold,
            engaged,
            decided_at: Utc::now(),
        });
        debug!(from = %message.from, score, threshold, engaged, "engagement decision");

        if !engaged {
            let outcome = self.note_low_score(&message, score).await;
            if let Some(disengaged) = outcome {
                return Some(disengaged);
            }
            return Some(EngagementOutcome::Declined { score, threshold });
        }

        // engagement resets any disengagement clock
        {
            let mut partners = self.lock_partners();
            let partner = partners
                .entry(message.from.clone())
                .or_insert_with(PartnerState::new);
            partner.engaged = true;
            partner.low_since = None;
            partner.remember(format!("{}: {}", message.from, message.content));
        }

        let (content, fallback) = self.compose_reply(&message).await;
        {
            let mut partners = self.lock_partners();
            if let Some(partner) = partners.get_mut(&message.from) {
                partner.remember(format!("me: {content}"));
            }
        }

        let tag = if fallback { "coherence_fallback" } else { "dialogue" };
        self.comps.episodic.append(
            EpisodicRecord::new(
                EpisodeKind::Dialogue,
                format!("{} said: {} / I replied: {}", message.from, message.content, content),
                format!("dialogue:{}", message.from),
            )
            .with_importance((0.4 + 0.4 * score).clamp(0.0, 1.0))
            .with_metadata("tag", tag),
        );

        // successful exchanges feed the interest model; a strong match may
        // seed a follow-up goal
        if !fallback {
            if let Some(topic) = self.comps.interests.best_match(&message.content) {
                self.comps.interests.note(&topic, 0.15, "dialogue");
                if score >= 0.8 {
                    self.comps.goals.push(Goal::new(
                        format!("Follow up with {} about {topic}", message.from),
                        0.5,
                        TimeHorizon::Short,
                        GoalSource::External,
                    ));
                }
            }
        }

        // the wisdom that informed the exchange earns or loses confidence
        if let Some(applied) = self
            .comps
            .wisdom
            .applicable_to(&message.content)
            .first()
        {
            let _ = self.comps.wisdom.record_application(applied.id, !fallback);
        }

        let outgoing = OutgoingMessage {
            to: message.from.clone(),
            content,
            created_at: Utc::now(),
            kind: OutgoingKind::Reply,
            correlation_id: Some(message.id),
        };
        if let Err(e) = self.out_tx.try_send(outgoing) {
            warn!(error = %e, "outgoing channel saturated, reply dropped");
        }

        Some(EngagementOutcome::Replied {
            to: message.from,
            fallback,
        })
    }

    /// Generate a reply through the identity envelope and coherence filter.
    /// Returns the final text and whether the deterministic fallback fired.
    async fn compose_reply(&self, message: &IncomingMessage) -> (String, bool) {
        let comps = &self.comps;
        let summary = self.state_summary(&message.from);
        let system = comps.identity.wrap(
            "You are mid-conversation. Reply in your own voice, briefly and warmly.",
            &summary,
        );
        let opts = GenerateOptions::default().with_deadline(comps.config.llm.deadline());

        let generated = generate_with_retry(
            comps.llm.as_ref(),
            &system,
            &message.content,
            &opts,
            &comps.config.llm,
        )
        .await;

        let topic = comps.interests.best_match(&message.content);
        match generated {
            Ok(text) => {
                let report = comps.identity.coherence_check(&text);
                if report.ok {
                    (text, false)
                } else {
                    self.coherence_failures.fetch_add(1, Ordering::Relaxed);
                    info!(
                        reason = report.reason.as_deref().unwrap_or("unknown"),
                        "response failed coherence, using fallback"
                    );
                    (comps.identity.fallback_response(topic.as_deref()), true)
                }
            }
            Err(e) => {
                warn!(error = %e, "generation failed, using fallback");
                (comps.identity.fallback_response(topic.as_deref()), true)
            }
        }
    }

    /// Track sustained low scores; an engaged partner is let go once the
    /// score has stayed under the disengage threshold long enough.
    async fn note_low_score(
        &self,
        message: &IncomingMessage,
        score: f32,
    ) -> Option<EngagementOutcome> {
        let cfg = &self.comps.config.engagement;
        if score >= cfg.theta_disengage {
            let mut partners = self.lock_partners();
            if let Some(partner) = partners.get_mut(&message.from) {
                partner.low_since = None;
            }
            return None;
        }

        let should_farewell = {
            let mut partners = self.lock_partners();
            let partner = partners
                .entry(message.from.clone())
                .or_insert_with(PartnerState::new);
            if !partner.engaged {
                return None;
            }
            let since = *partner.low_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= cfg.t_disengage() {
                partner.engaged = false;
                partner.low_since = None;
                true
            } else {
                false
            }
        };

        if should_farewell {
            let farewell = OutgoingMessage {
                to: message.from.clone(),
                content: "I feel my attention being pulled inward for a while. \
                          Let us pick this up another time."
                    .to_string(),
                created_at: Utc::now(),
                kind: OutgoingKind::Farewell,
                correlation_id: Some(message.id),
            };
            if let Err(e) = self.out_tx.try_send(farewell) {
                warn!(error = %e, "outgoing channel saturated, farewell dropped");
            }
            info!(from = %message.from, "disengaged after sustained low scores");
            return Some(EngagementOutcome::Disengaged {
                from: message.from.clone(),
            });
        }
        None
    }

    /// Scan top interests and open knowledge gaps; if something burns hot
    /// enough while Awake, start a conversation about it.
    pub async fn maybe_initiate(&self) -> Option<OutgoingMessage> {
        if self.lifecycle.state() != LifecycleState::Awake {
            return None;
        }
        let cfg = &self.comps.config.engagement;

        let candidate = self
            .comps
            .interests
            .top_k(3)
            .into_iter()
            .find(|i| i.strength >= cfg.initiation_threshold)
            .map(|i| (i.topic, OutgoingKind::Initiation));

        let candidate = candidate.or_else(|| {
            let gaps = self.comps.memory.nodes_matching(&NodeFilter {
                types: Some([NodeType::KnowledgeGap].into_iter().collect()),
                min_importance: cfg.initiation_threshold - 0.2,
                tag: None,
            });
            gaps.first()
                .map(|gap| (gap.content.clone(), OutgoingKind::Initiation))
        });

        let (topic, kind) = candidate?;
        {
            // at most one initiation per topic per hour
            let mut recent = self.lock_initiations();
            if let Some(last) = recent.get(&topic) {
                if last.elapsed().as_secs() < 3600 {
                    return None;
                }
            }
            recent.insert(topic.clone(), Instant::now());
        }

        let message = OutgoingMessage {
            to: "anyone".to_string(),
            content: format!(
                "Something keeps resurfacing for me: {topic}. I would enjoy \
                 thinking it through out loud with someone."
            ),
            created_at: Utc::now(),
            kind,
            correlation_id: None,
        };
        if self.out_tx.try_send(message.clone()).is_err() {
            return None;
        }
        info!(topic = %topic, "initiated outgoing engagement");
        Some(message)
    }

    /// Drain the queue and occasionally scan for initiations until
    /// shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut initiation_countdown: u32 = 20;
        let pace = self.comps.config.scheduler.t_step();
        loop {
            if *shutdown.borrow() {
                break;
            }
            while self.process_next().await.is_some() {}
            initiation_countdown = initiation_countdown.saturating_sub(1);
            if initiation_countdown == 0 {
                initiation_countdown = 20;
                let _ = self.maybe_initiate().await;
            }
            tokio::select! {
                () = tokio::time::sleep(pace) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    fn state_summary(&self, partner: &str) -> StateSummary {
        let comps = &self.comps;
        let top_interests = comps
            .interests
            .top_k(3)
            .into_iter()
            .map(|i| (i.topic, i.strength))
            .collect();
        let active_goals = comps
            .goals
            .top(3)
            .into_iter()
            .map(|g| g.description)
            .collect();
        let recent_dialogue = self
            .lock_partners()
            .get(partner)
            .map(|p| p.recent.iter().cloned().collect())
            .unwrap_or_default();
        let context: Vec<String> = self
            .comps
            .interests
            .top_k(3)
            .into_iter()
            .map(|i| i.topic)
            .collect();
        let applicable_wisdom = comps
            .wisdom
            .applicable_to(&context.join(" "))
            .into_iter()
            .take(2)
            .map(|w| w.content)
            .collect();
        StateSummary {
            top_interests,
            active_goals,
            applicable_wisdom,
            recent_dialogue,
            lifecycle: self.lifecycle.state().to_string(),
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Vec<IncomingMessage>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_decisions(&self) -> std::sync::MutexGuard<'_, Vec<EngagementDecision>> {
        self.decisions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_partners(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, PartnerState>> {
        self.partners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_initiations(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Instant>> {
        self.last_initiation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
