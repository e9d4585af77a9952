//! Phase scheduler tests

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::config::CoreConfig;
use crate::core::Components;
use crate::episodic::EpisodeKind;
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::llm::ScriptedModel;
use crate::scheduler::{offsets_for, CyclePhase, PhaseScheduler};
use crate::streams::StepStatus;

fn harness() -> (Arc<Components>, Arc<LifecycleController>, PhaseScheduler) {
    harness_with(CoreConfig::fast())
}

fn harness_with(
    config: CoreConfig,
) -> (Arc<Components>, Arc<LifecycleController>, PhaseScheduler) {
    let comps = Components::new(config, Arc::new(ScriptedModel::offline()));
    let lifecycle = Arc::new(LifecycleController::new(comps.config.lifecycle.clone()));
    let scheduler =
        PhaseScheduler::new(Arc::clone(&comps), Arc::clone(&lifecycle)).expect("scheduler");
    (comps, lifecycle, scheduler)
}

#[test]
fn offsets_match_boundary_table() {
    assert_eq!(offsets_for(3).unwrap(), vec![0, 4, 8]);
    assert_eq!(offsets_for(4).unwrap(), vec![0, 3, 6, 9]);
    assert_eq!(offsets_for(6).unwrap(), vec![0, 2, 4, 6, 8, 10]);
    assert_eq!(offsets_for(12).unwrap(), (0..12).collect::<Vec<u8>>());
}

#[test]
fn offsets_reject_bad_stream_counts() {
    assert!(offsets_for(2).is_err());
    assert!(offsets_for(0).is_err());
    assert!(offsets_for(13).is_err());
}

#[test]
fn offsets_are_pairwise_distinct_for_all_valid_counts() {
    for n in 3..=12 {
        let offsets = offsets_for(n).unwrap();
        let distinct: std::collections::BTreeSet<u8> =
            offsets.iter().map(|o| o % 12).collect();
        assert_eq!(distinct.len(), n, "offsets collide for n={n}");
    }
}

#[test]
fn cycle_phase_partitions_the_half_cycles() {
    for step in 0..6u8 {
        assert_eq!(CyclePhase::from_step(step), CyclePhase::Expressive);
    }
    for step in 6..12u8 {
        assert_eq!(CyclePhase::from_step(step), CyclePhase::Reflective);
    }
}

#[tokio::test(start_paused = true)]
async fn tick_runs_every_stream_and_advances() {
    let (_comps, _lifecycle, scheduler) = harness();
    assert_eq!(scheduler.global_step(), 0);

    let report = scheduler.tick().await;
    assert_eq!(report.global_step, 0);
    assert_eq!(report.outcomes.len(), 3);
    assert!(report.sync, "step 0 is a sync barrier");
    assert_eq!(scheduler.global_step(), 1);

    for outcome in &report.outcomes {
        assert_eq!(outcome.status, StepStatus::Completed);
    }
}

#[tokio::test(start_paused = true)]
async fn workers_derive_distinct_local_steps() {
    let (_comps, _lifecycle, scheduler) = harness();
    let locals: std::collections::BTreeSet<u8> = scheduler
        .workers()
        .iter()
        .map(|w| w.local_step(7))
        .collect();
    assert_eq!(locals.len(), 3, "offsets keep local steps distinct");
}

#[tokio::test(start_paused = true)]
async fn streams_write_thoughts_into_the_episodic_buffer() {
    let (comps, _lifecycle, scheduler) = harness();
    comps
        .interests
        .seed(crate::interests::Interest::new("echo gardens", 0.8));

    for _ in 0..12 {
        scheduler.tick().await;
    }

    let records = comps.episodic.export().records;
    assert!(!records.is_empty(), "a full cycle produces episodics");
    assert!(records
        .iter()
        .any(|r| r.kind == EpisodeKind::Thought && r.source.starts_with("stream:")));
}

#[tokio::test(start_paused = true)]
async fn overrunning_handler_is_cancelled_in_isolation() {
    // E5 shape: stream 0 overruns its step-3 budget; its writes are
    // discarded, the other streams are unaffected, and missed_sync stays
    // untouched because step 3 is not a barrier.
    let (comps, _lifecycle, scheduler) = harness();
    scheduler.restore_global_step(3);
    *scheduler.workers()[0]
        .forced_delay
        .lock()
        .unwrap() = Some((3, Duration::from_secs(60)));

    let report = scheduler.tick().await;
    assert!(!report.sync);

    let by_stream: std::collections::BTreeMap<usize, StepStatus> = report
        .outcomes
        .iter()
        .map(|o| (o.stream, o.status.clone()))
        .collect();
    assert_eq!(by_stream[&0], StepStatus::Cancelled);
    assert_eq!(by_stream[&1], StepStatus::Completed);
    assert_eq!(by_stream[&2], StepStatus::Completed);

    let counters = scheduler.metrics.snapshot();
    assert_eq!(counters.cancelled_steps, 1);
    assert_eq!(counters.missed_sync, 0, "non-barrier cancellation");

    // the cancelled stream contributed nothing
    let records = comps.episodic.export().records;
    assert!(records.iter().all(|r| r.source != "stream:0"));

    // degradation is tracked per handler
    let degradation = scheduler.workers()[0].degradation_counters();
    assert_eq!(degradation.get(&3), Some(&1));

    // next tick the stream proceeds to its next step unharmed
    *scheduler.workers()[0].forced_delay.lock().unwrap() = None;
    let next = scheduler.tick().await;
    let stream0 = next.outcomes.iter().find(|o| o.stream == 0).unwrap();
    assert_eq!(stream0.local_step, 4);
    assert_eq!(stream0.status, StepStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn late_stream_at_sync_barrier_counts_exactly_one_miss() {
    let (_comps, _lifecycle, scheduler) = harness();
    // global step 0 is a barrier; stream 0's local step is 0
    *scheduler.workers()[0]
        .forced_delay
        .lock()
        .unwrap() = Some((0, Duration::from_secs(60)));

    let report = scheduler.tick().await;
    assert!(report.sync);
    assert_eq!(scheduler.metrics.snapshot().missed_sync, 1);

    // the miss is counted once per overrun, not per subsequent tick
    *scheduler.workers()[0].forced_delay.lock().unwrap() = None;
    scheduler.tick().await;
    assert_eq!(scheduler.metrics.snapshot().missed_sync, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_stream_publishes_no_perception() {
    let (_comps, _lifecycle, scheduler) = harness();
    *scheduler.workers()[0]
        .forced_delay
        .lock()
        .unwrap() = Some((0, Duration::from_secs(60)));

    scheduler.tick().await;

    // streams 1 and 2 completed and published; stream 0 did not
    let seen_by_1 = scheduler.perceptions_for(1);
    assert!(seen_by_1.iter().all(|p| p.stream != 0));
    assert!(seen_by_1.iter().any(|p| p.stream == 2));
}

#[tokio::test(start_paused = true)]
async fn perceptions_flow_between_sync_barriers() {
    let (_comps, _lifecycle, scheduler) = harness();
    scheduler.tick().await; // sync at step 0 publishes

    let seen_by_0 = scheduler.perceptions_for(0);
    assert_eq!(seen_by_0.len(), 2, "everyone else's summary is visible");
    for perception in &seen_by_0 {
        assert!(!perception.headline.is_empty());
        assert!(perception.focus.len() <= 8);
    }
}

#[tokio::test(start_paused = true)]
async fn expressive_steps_suspend_outside_awake() {
    let (_comps, lifecycle, scheduler) = harness();
    lifecycle.request_rest();
    lifecycle.evaluate(0.0, 0.5, false, std::time::Instant::now());
    assert_eq!(lifecycle.state(), LifecycleState::Resting);

    // at global step 1 the three local steps are 1, 5, 9: two expressive
    // handlers (suspended while resting) and one anticipatory (runs)
    scheduler.restore_global_step(1);
    let report = scheduler.tick().await;

    let statuses: Vec<(u8, StepStatus)> = report
        .outcomes
        .iter()
        .map(|o| (o.local_step, o.status.clone()))
        .collect();
    for (local_step, status) in statuses {
        match local_step {
            1 | 5 => assert_eq!(status, StepStatus::Suspended),
            9 => assert_eq!(status, StepStatus::Completed),
            other => panic!("unexpected local step {other}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn pivotal_steps_run_even_while_resting() {
    let (_comps, lifecycle, scheduler) = harness();
    lifecycle.request_rest();
    lifecycle.evaluate(0.0, 0.5, false, std::time::Instant::now());

    // at global step 0 the local steps are 0, 4, 8: one pivotal (runs),
    // one expressive (suspended), one anticipatory (runs)
    let report = scheduler.tick().await;
    let pivotal = report
        .outcomes
        .iter()
        .find(|o| o.local_step == 0)
        .unwrap();
    assert_eq!(pivotal.status, StepStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn cycle_state_reflects_position() {
    let (_comps, _lifecycle, scheduler) = harness();
    for _ in 0..14 {
        scheduler.tick().await;
    }
    let state = scheduler.cycle_state();
    assert_eq!(state.cycle_number, 1);
    assert_eq!(state.step_index, 2);
    assert_eq!(state.phase, CyclePhase::Expressive);
    assert_eq!(state.active_streams, 3);
}

#[tokio::test(start_paused = true)]
async fn six_streams_use_even_offsets() {
    let mut config = CoreConfig::fast();
    config.scheduler.n_streams = 6;
    let (_comps, _lifecycle, scheduler) = harness_with(config);
    let offsets: Vec<u8> = scheduler.workers().iter().map(|w| w.offset()).collect();
    assert_eq!(offsets, vec![0, 2, 4, 6, 8, 10]);
}

#[tokio::test(start_paused = true)]
async fn sustained_ticking_never_panics_under_load() {
    let (_comps, _lifecycle, scheduler) = harness();
    for _ in 0..50 {
        let report = scheduler.tick().await;
        assert!(report.load >= 0.0 && report.load <= 1.0);
    }
    assert_eq!(scheduler.metrics.snapshot().ticks, 50);
}
