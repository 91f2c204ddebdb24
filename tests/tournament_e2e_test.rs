//! Generate ten hypotheses and let the tournament play every pair.

mod common;

use serde_json::json;
use std::time::Duration;

use common::Harness;
use cosci::application::CollaboratorRegistry;
use cosci::domain::models::{
    DebateDepth, Task, TaskPayload, TaskSource, TaskStatus, TaskType,
};

const HYPOTHESES: usize = 10;
const ALL_PAIRS: usize = HYPOTHESES * (HYPOTHESES - 1) / 2;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_of_ten_generated_hypotheses() {
    common::setup_test_logging();
    let mut config = common::fast_config();
    config.tournament.multi_turn_rank_cutoff = 0;
    config.tournament.max_pending_matches = 8;

    let registry = CollaboratorRegistry::new()
        .with(TaskType::Generate, common::numbered_generator())
        .with(TaskType::RankMatch, common::strength_judge());
    let harness = Harness::new(&config, registry);
    harness.start(true).await;

    for _ in 0..HYPOTHESES {
        let task = Task::new(TaskPayload::Generate { context: json!({}) })
            .with_source(TaskSource::External);
        harness.queue.enqueue(task).await.unwrap();
    }

    let finished = common::wait_for(
        || async {
            harness
                .tournament
                .progress()
                .await
                .is_ok_and(|p| p.resolved_matches == ALL_PAIRS)
        },
        20_000,
    )
    .await;
    assert!(finished, "tournament did not resolve every pair in time");

    // no pair beyond the 45 is ever scheduled
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.stop().await;

    let progress = harness.tournament.progress().await.unwrap();
    assert_eq!(progress.enrolled, HYPOTHESES);
    assert_eq!(progress.scheduled_pairs, ALL_PAIRS);
    assert_eq!(progress.open_matches, 0);
    assert!((progress.completion_rate() - 1.0).abs() < f64::EPSILON);

    let standings = harness.tournament.standings().await.unwrap();
    assert_eq!(standings.len(), HYPOTHESES);
    assert!(standings.iter().all(|s| s.match_count as usize == HYPOTHESES - 1));

    let total: f64 = standings.iter().map(|s| s.elo_rating).sum();
    let expected = HYPOTHESES as f64 * config.tournament.initial_rating;
    assert!((total - expected).abs() < 1e-6, "Elo is zero-sum, got {total}");

    let best = standings[0].elo_rating;
    assert!(standings[1..].iter().all(|s| s.elo_rating < best), "leader is unique");

    // the strongest hypothesis won every match it played
    let ledger = harness.tournament.ledger().await.unwrap();
    let strongest = standings
        .iter()
        .find(|s| s.hypothesis.content["strength"] == json!(HYPOTHESES - 1))
        .unwrap();
    let rating = ledger.rating(strongest.hypothesis.id).unwrap();
    assert_eq!(rating.wins as usize, HYPOTHESES - 1);
    assert_eq!(rating.losses, 0);

    let tasks = harness.queue.snapshot_tasks().await;
    let matches: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.task_type() == TaskType::RankMatch)
        .collect();
    assert_eq!(matches.len(), ALL_PAIRS);
    assert!(matches.iter().all(|t| t.status == TaskStatus::Succeeded));
    assert!(matches.iter().all(|t| matches!(
        &t.payload,
        TaskPayload::RankMatch { depth: DebateDepth::SingleTurn, .. }
    )));
    assert!(matches.iter().all(|t| t.source == TaskSource::Tournament));
}

#[tokio::test]
async fn test_halted_tournament_schedules_nothing() {
    let config = common::fast_config();
    let registry = CollaboratorRegistry::new()
        .with(TaskType::Generate, common::numbered_generator())
        .with(TaskType::RankMatch, common::strength_judge());
    let harness = Harness::new(&config, registry);
    harness.tournament.halt();
    harness.start(true).await;

    for _ in 0..3 {
        harness
            .queue
            .enqueue(Task::new(TaskPayload::Generate { context: json!({}) }))
            .await
            .unwrap();
    }
    assert!(harness.queue.wait_until_drained(Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.stop().await;

    let progress = harness.tournament.progress().await.unwrap();
    assert_eq!(progress.enrolled, 3);
    assert_eq!(progress.scheduled_pairs, 0);
    assert_eq!(harness.queue.metrics().await.total(), 3);
}
