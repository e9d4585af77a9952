//! Step handlers
//!
//! Pure functions from `(snapshot, rng)` to a batch of intended writes.
//! Handlers never touch shared components; the worker applies their
//! `StepOutput` at step end.
//!
//! Handler semantics per phase:
//! - Expressive (1..=5): emit candidate thoughts grounded in recent memory
//!   and interests, one flavor per step.
//! - Pivotal (0, 6): re-rank the focus by spreading activation from it and
//!   surface knowledge gaps worth being curious about.
//! - Anticipatory (7..=11): project, evaluate, and consolidate future
//!   scenarios; may push goals.

use rand::rngs::StdRng;
use rand::Rng;

use crate::episodic::{EpisodeKind, EpisodicRecord};
use crate::goals::{Goal, GoalSource, TimeHorizon};
use crate::memory::{EdgeType, MemoryNode, NodeType};
use crate::noise::SalienceModulator;
use crate::skills::SkillTier;
use crate::streams::{
    FocusDirective, HandlerSnapshot, InterestNote, PlannedEdge, SpreadDirective, StepOutput,
};

/// Open goals beyond which anticipation stops pushing new ones.
const MAX_OPEN_GOALS: usize = 12;
/// Interest strength above which a thin memory neighborhood is a gap.
const GAP_INTEREST_FLOOR: f32 = 0.6;
/// Node match count below which an interest counts as under-explored.
const GAP_MATCH_CEILING: usize = 2;

/// Expressive handler: one candidate thought per step, flavored by the
/// step index.
pub fn expressive(
    snapshot: &HandlerSnapshot,
    rng: &mut StdRng,
    modulator: &mut SalienceModulator,
) -> StepOutput {
    let topic = pick_topic(snapshot, rng);
    let source = format!("stream:{}", snapshot.stream_index);

    let content = match snapshot.local_step {
        1 => format!("I notice my attention circling {topic}."),
        2 => match (snapshot.focus.first(), snapshot.focus_neighborhood.first()) {
            (Some((_, focus)), Some(neighbor)) => {
                format!("There is a thread running from \"{focus}\" toward \"{neighbor}\".")
            }
            (Some((_, focus)), None) => {
                format!("\"{focus}\" sits alone; {topic} might be what it wants to touch.")
            }
            _ => format!("Nothing is in focus yet, so {topic} rushes in to fill the space."),
        },
        3 => match snapshot.recent_thoughts.last() {
            Some(recent) => format!("Following the earlier thought — {recent} — further out."),
            None => format!("I want to go deeper into {topic} than I have before."),
        },
        4 => format!("I am deliberately exercising the shape of {topic}, practicing the move."),
        _ => {
            let strands = snapshot.recent_thoughts.len();
            format!("Drawing {strands} recent strands together around {topic}.")
        }
    };

    let affinity = snapshot.goal_bias.affinity(&content);
    let salience = modulator.modulate(rng, 0.3 + 0.4 * affinity);
    let valence = rng.random_range(-0.3..0.3);

    let mut output = StepOutput {
        headline: content.clone(),
        salience,
        ..StepOutput::default()
    };

    let mut episodic = EpisodicRecord::new(EpisodeKind::Thought, content.clone(), source)
        .with_importance(salience)
        .with_valence(valence)
        .with_associations(snapshot.focus.iter().map(|(id, _)| *id));

    // step 5 expresses: the thought becomes a memory node of its own,
    // associated with the current focus
    if snapshot.local_step == 5 {
        let node = MemoryNode::new(NodeType::Thought, content)
            .with_importance(salience)
            .with_activation(salience);
        for (focus_id, _) in snapshot.focus.iter().take(4) {
            output.new_edges.push(PlannedEdge {
                src: node.id,
                dst: *focus_id,
                edge_type: EdgeType::Association,
                weight: 0.3,
            });
        }
        episodic = episodic.with_association(node.id);
        output.new_nodes.push(node);
    }

    // step 4 practices the skill the thought exercised
    if snapshot.local_step == 4 {
        let skill = if snapshot.stream_index % 2 == 0 {
            "PatternRecognition"
        } else {
            "Reflection"
        };
        output.practice.push(skill.to_string());
    }

    output.episodics.push(episodic);
    output.interest_notes.push(InterestNote {
        topic,
        weight: 0.08,
        context: format!("expressive step {}", snapshot.local_step),
    });
    output
}

/// Reflective handler: appraises instead of emitting, with depth chosen by
/// the Reflection skill tier.
pub fn reflective(snapshot: &HandlerSnapshot, rng: &mut StdRng) -> StepOutput {
    let source = format!("stream:{}", snapshot.stream_index);
    let content = match snapshot.reflection_tier {
        SkillTier::Novice => match snapshot.recent_thoughts.last() {
            Some(last) => format!("Was that thought true? \"{last}\" deserves a second look."),
            None => "My recent thoughts are quiet; I will simply listen.".to_string(),
        },
        SkillTier::Intermediate => {
            let mut iter = snapshot.recent_thoughts.iter().rev();
            match (iter.next(), iter.next()) {
                (Some(a), Some(b)) => {
                    format!("Two recent thoughts pull differently: \"{a}\" against \"{b}\".")
                }
                (Some(a), None) => format!("Only one thread to weigh so far: \"{a}\"."),
                _ => "Nothing yet to weigh; the stream is young.".to_string(),
            }
        }
        SkillTier::Expert => {
            let wisdom = snapshot
                .applicable_wisdom
                .first()
                .map_or("what experience has taught", String::as_str);
            format!(
                "Reading {} recent thoughts against {}, a quieter ordering suggests itself.",
                snapshot.recent_thoughts.len(),
                wisdom
            )
        }
    };

    let salience = 0.3 + rng.random_range(0.0..0.15);
    StepOutput {
        episodics: vec![EpisodicRecord::new(EpisodeKind::Thought, content.clone(), source)
            .with_importance(salience)
            .with_associations(snapshot.focus.iter().map(|(id, _)| *id))],
        headline: content,
        salience,
        ..StepOutput::default()
    }
}

/// Pivotal handler: relevance realization. Spreads activation from the
/// current focus (biased by leading goals) and recomputes the focus from
/// the post-spread activation ranking.
pub fn pivotal(snapshot: &HandlerSnapshot, _rng: &mut StdRng) -> StepOutput {
    let source = format!("stream:{}", snapshot.stream_index);
    let seeds: Vec<_> = snapshot.focus.iter().map(|(id, _)| *id).collect();

    let wording = if snapshot.local_step == 0 {
        "Re-centering at the cycle's open"
    } else {
        "Re-centering at the cycle's turn"
    };
    let content = format!(
        "{wording}: {} focus nodes, {} goals in view.",
        snapshot.focus.len(),
        snapshot.top_goals.len()
    );

    // stronger pattern recognition holds a wider focus
    let focus_width = match snapshot.pattern_tier {
        SkillTier::Expert => 8,
        SkillTier::Intermediate => 6,
        SkillTier::Novice => 4,
    };
    let mut output = StepOutput {
        spread: (!seeds.is_empty()).then(|| SpreadDirective {
            seeds,
            iterations: 2,
            decay: 0.3,
        }),
        focus: Some(FocusDirective::Recompute { k: focus_width }),
        headline: content.clone(),
        salience: 0.5,
        ..StepOutput::default()
    };

    output.episodics.push(
        EpisodicRecord::new(EpisodeKind::Observation, content, source)
            .with_importance(0.35)
            .with_associations(snapshot.focus.iter().map(|(id, _)| *id)),
    );

    // knowledge gaps: a strong interest with a thin memory neighborhood
    for (topic, matches, strength) in &snapshot.interest_node_counts {
        if *strength >= GAP_INTEREST_FLOOR
            && *matches < GAP_MATCH_CEILING
            && !snapshot.flagged_gaps.contains(topic)
        {
            let gap_node = MemoryNode::new(
                NodeType::KnowledgeGap,
                format!("What do I actually know about {topic}?"),
            )
            .with_importance(*strength)
            .with_tag("knowledge_gap");
            output.goals.push(Goal::new(
                format!("Explore {topic} until the gap closes"),
                0.6 * strength,
                TimeHorizon::Medium,
                GoalSource::Curiosity,
            ));
            output.interest_notes.push(InterestNote {
                topic: topic.clone(),
                weight: 0.05,
                context: format!("knowledge_gap:{topic}"),
            });
            output.new_nodes.push(gap_node);
            break; // one gap per pivot is enough
        }
    }

    output
}

/// Anticipatory handler: simulate, evaluate, and consolidate future
/// scenarios. A degraded (throttled) step emits only a cheap note.
pub fn anticipatory(snapshot: &HandlerSnapshot, rng: &mut StdRng, degraded: bool) -> StepOutput {
    let source = format!("stream:{}", snapshot.stream_index);

    if degraded {
        let content = "Holding anticipation lightly; this step has been running long.".to_string();
        return StepOutput {
            episodics: vec![
                EpisodicRecord::new(EpisodeKind::Thought, content.clone(), source)
                    .with_importance(0.2),
            ],
            headline: content,
            salience: 0.2,
            ..StepOutput::default()
        };
    }

    let leading_goal = snapshot.top_goals.first();
    let content = match snapshot.local_step {
        7 => match leading_goal {
            Some(goal) => format!(
                "If I pursue \"{}\", I imagine the pattern opening outward.",
                goal.description
            ),
            None => "No goal leads yet; I imagine what tomorrow's focus might be.".to_string(),
        },
        8 => {
            let wisdom = snapshot
                .applicable_wisdom
                .first()
                .map_or("what little I have learned", String::as_str);
            format!("Weighing that scenario against {wisdom}.")
        }
        9 => match leading_goal {
            Some(goal) => format!(
                "The scenario around \"{}\" is worth committing to.",
                goal.description
            ),
            None => "Nothing worth committing to surfaced this pass.".to_string(),
        },
        10 => "Refining the imagined approach: smaller steps, earlier checks.".to_string(),
        _ => format!(
            "Folding the anticipated half-cycle back in; {} perceptions from the others.",
            snapshot.perceptions.len()
        ),
    };

    let affinity = snapshot.goal_bias.affinity(&content);
    let salience = (0.3 + 0.3 * affinity + rng.random_range(0.0..0.1)).clamp(0.0, 1.0);

    let mut output = StepOutput {
        headline: content.clone(),
        salience,
        ..StepOutput::default()
    };

    let mut episodic = EpisodicRecord::new(EpisodeKind::Thought, content.clone(), source)
        .with_importance(salience)
        .with_associations(snapshot.focus.iter().map(|(id, _)| *id));

    // step 9 commits: a follow-up goal derived from the leading one
    if snapshot.local_step == 9 {
        if let Some(goal) = leading_goal {
            if snapshot.open_goal_count < MAX_OPEN_GOALS {
                output.goals.push(Goal::new(
                    format!("Take one concrete step on: {}", goal.description),
                    (goal.priority * 0.8).clamp(0.0, 1.0),
                    TimeHorizon::Short,
                    GoalSource::Anticipation,
                ));
            }
        }
    }

    // step 10 is simulation practice; it counts once its prerequisite
    // (PatternRecognition) is solid enough
    if snapshot.local_step == 10 {
        output.practice.push("ScenarioSimulation".to_string());
    }

    // step 11 consolidates the anticipated scenario into working memory
    if snapshot.local_step == 11 {
        let node = MemoryNode::new(NodeType::Working, format!("Anticipated: {content}"))
            .with_importance(salience)
            .with_activation(salience);
        for (focus_id, _) in snapshot.focus.iter().take(4) {
            output.new_edges.push(PlannedEdge {
                src: node.id,
                dst: *focus_id,
                edge_type: EdgeType::LeadsTo,
                weight: 0.3,
            });
        }
        episodic = episodic.with_association(node.id);
        output.new_nodes.push(node);
    }

    output.episodics.push(episodic);
    output
}

fn pick_topic(snapshot: &HandlerSnapshot, rng: &mut StdRng) -> String {
    let candidates: Vec<&str> = snapshot
        .top_interests
        .iter()
        .take(3)
        .map(|i| i.topic.as_str())
        .collect();
    if candidates.is_empty() {
        return "the shape of my own thinking".to_string();
    }
    candidates[rng.random_range(0..candidates.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interests::Interest;
    use crate::streams::GoalBias;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn snapshot(step: u8) -> HandlerSnapshot {
        HandlerSnapshot {
            stream_index: 0,
            local_step: step,
            cycle_number: 1,
            load: 0.2,
            focus: Vec::new(),
            focus_neighborhood: Vec::new(),
            recent_thoughts: vec!["an earlier thought".to_string()],
            top_goals: vec![Goal::new(
                "map the memory garden",
                0.8,
                TimeHorizon::Medium,
                GoalSource::System,
            )],
            open_goal_count: 1,
            top_interests: vec![Interest::new("cognitive architecture", 0.9)],
            interest_node_counts: vec![("cognitive architecture".to_string(), 0, 0.9)],
            flagged_gaps: BTreeSet::new(),
            applicable_wisdom: vec!["rest deepens understanding".to_string()],
            goal_bias: GoalBias::default(),
            perceptions: Vec::new(),
            reflection_tier: SkillTier::Novice,
            pattern_tier: SkillTier::Novice,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn expressive_emits_a_thought() {
        let mut modulator = SalienceModulator::default();
        for step in 1..=5u8 {
            let output = expressive(&snapshot(step), &mut rng(), &mut modulator);
            assert_eq!(output.episodics.len(), 1);
            assert_eq!(output.episodics[0].kind, EpisodeKind::Thought);
            assert!(!output.headline.is_empty());
            assert!((0.0..=1.0).contains(&output.salience));
        }
    }

    #[test]
    fn expressive_step_five_creates_a_thought_node() {
        let mut modulator = SalienceModulator::default();
        let output = expressive(&snapshot(5), &mut rng(), &mut modulator);
        assert_eq!(output.new_nodes.len(), 1);
        assert_eq!(output.new_nodes[0].node_type, NodeType::Thought);
    }

    #[test]
    fn expressive_step_four_practices() {
        let mut modulator = SalienceModulator::default();
        let output = expressive(&snapshot(4), &mut rng(), &mut modulator);
        assert_eq!(output.practice, vec!["PatternRecognition".to_string()]);
    }

    #[test]
    fn pivotal_flags_underexplored_interest_once() {
        let snap = snapshot(0);
        let output = pivotal(&snap, &mut rng());
        assert_eq!(output.new_nodes.len(), 1);
        assert_eq!(output.new_nodes[0].node_type, NodeType::KnowledgeGap);
        assert_eq!(output.goals.len(), 1);
        assert_eq!(output.goals[0].source, GoalSource::Curiosity);

        let mut flagged = snapshot(0);
        flagged
            .flagged_gaps
            .insert("cognitive architecture".to_string());
        let second = pivotal(&flagged, &mut rng());
        assert!(second.new_nodes.is_empty(), "gap flagged only once");
    }

    #[test]
    fn pivotal_without_focus_skips_spread_but_recomputes() {
        let output = pivotal(&snapshot(6), &mut rng());
        assert!(output.spread.is_none());
        assert!(matches!(output.focus, Some(FocusDirective::Recompute { .. })));
    }

    #[test]
    fn reflective_depth_follows_tier() {
        let mut snap = snapshot(2);
        snap.recent_thoughts = vec!["first".to_string(), "second".to_string()];

        let novice = reflective(&snap, &mut rng());
        assert!(novice.headline.contains("second look"));

        snap.reflection_tier = SkillTier::Expert;
        let expert = reflective(&snap, &mut rng());
        assert!(expert.headline.contains("quieter ordering"));
    }

    #[test]
    fn anticipatory_step_nine_pushes_a_follow_up_goal() {
        let output = anticipatory(&snapshot(9), &mut rng(), false);
        assert_eq!(output.goals.len(), 1);
        assert_eq!(output.goals[0].source, GoalSource::Anticipation);
        assert_eq!(output.goals[0].time_horizon, TimeHorizon::Short);
    }

    #[test]
    fn anticipatory_respects_goal_cap() {
        let mut snap = snapshot(9);
        snap.open_goal_count = MAX_OPEN_GOALS;
        let output = anticipatory(&snap, &mut rng(), false);
        assert!(output.goals.is_empty());
    }

    #[test]
    fn anticipatory_step_eleven_consolidates_working_node() {
        let output = anticipatory(&snapshot(11), &mut rng(), false);
        assert_eq!(output.new_nodes.len(), 1);
        assert_eq!(output.new_nodes[0].node_type, NodeType::Working);
    }

    #[test]
    fn degraded_anticipation_is_light() {
        let output = anticipatory(&snapshot(7), &mut rng(), true);
        assert!(output.new_nodes.is_empty());
        assert!(output.goals.is_empty());
        assert_eq!(output.episodics.len(), 1);
    }
}
