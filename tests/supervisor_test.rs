//! Full runs through the orchestrator: budget exhaustion, stop requests
//! and convergence all end in Terminal with a final checkpoint.

mod common;

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::ScriptedCollaborator;
use cosci::adapters::checkpoint::FileCheckpointStore;
use cosci::adapters::memory::InMemoryContextStore;
use cosci::application::{CollaboratorRegistry, Orchestrator};
use cosci::domain::models::context::keys;
use cosci::domain::models::{
    Config, HypothesisDraft, Statistics, SupervisorState, Task, TaskOutcome, TaskPayload,
    TaskSource, TaskType,
};
use cosci::domain::ports::CheckpointStore;

/// Collaborators for every task type.
fn full_registry() -> CollaboratorRegistry {
    let reviewer = ScriptedCollaborator::new("reviewer", |task: &Task, _call: u32| {
        let TaskPayload::Review { hypothesis, .. } = &task.payload else {
            unreachable!("reviewer only receives review tasks");
        };
        Ok(TaskOutcome::Review {
            hypothesis_id: hypothesis.id,
            review: json!({"novelty": "medium"}),
            exclude_for_safety: false,
        })
    });
    let evolver = ScriptedCollaborator::new("evolver", |_task: &Task, call: u32| {
        Ok(TaskOutcome::Evolve {
            hypotheses: vec![HypothesisDraft::new(json!({"strength": 100 + call}), "evolution")],
            supersedes_parents: false,
        })
    });
    let clusterer = ScriptedCollaborator::new("clusterer", |task: &Task, _call: u32| {
        let TaskPayload::Cluster { hypotheses } = &task.payload else {
            unreachable!("clusterer only receives cluster tasks");
        };
        Ok(TaskOutcome::Cluster {
            clusters: vec![hypotheses.iter().map(|h| h.id).collect()],
        })
    });
    let meta = ScriptedCollaborator::new("meta-reviewer", |_task: &Task, _call: u32| {
        Ok(TaskOutcome::MetaReview {
            summary: json!("keep going"),
        })
    });

    CollaboratorRegistry::new()
        .with(TaskType::Generate, common::numbered_generator())
        .with(TaskType::RankMatch, common::strength_judge())
        .with(TaskType::Review, reviewer)
        .with(TaskType::Evolve, evolver)
        .with(TaskType::Cluster, clusterer)
        .with(TaskType::MetaReview, meta)
}

fn orchestrator(config: Config, dir: &tempfile::TempDir) -> (Orchestrator, Arc<FileCheckpointStore>) {
    let checkpoints = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));
    let orchestrator = Orchestrator::build(
        config,
        Arc::new(InMemoryContextStore::new()),
        checkpoints.clone(),
        full_registry(),
    );
    (orchestrator, checkpoints)
}

async fn run_with_timeout(orchestrator: &Orchestrator) -> Statistics {
    tokio::time::timeout(Duration::from_secs(30), orchestrator.run())
        .await
        .expect("run should finish")
        .expect("run should succeed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_budget_ends_the_run() {
    common::setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::fast_config();
    config.supervisor.budget.max_tasks = Some(8);
    let (orchestrator, checkpoints) = orchestrator(config, &dir);

    let stats = run_with_timeout(&orchestrator).await;

    assert_eq!(stats.state, SupervisorState::Terminal);
    assert_eq!(orchestrator.handle().state(), SupervisorState::Terminal);
    assert!(stats.tasks_enqueued >= 8);
    assert!(stats.hypothesis_count > 0);
    assert_eq!(stats.queue.active(), 0, "terminal drains in-flight work");
    assert!(orchestrator.tournament().is_halted());

    let published = orchestrator.statistics().latest().await.unwrap().unwrap();
    assert_eq!(published.state, SupervisorState::Terminal);

    let checkpoint = checkpoints.load().await.unwrap().expect("final checkpoint");
    assert!(checkpoint.entry(keys::SUPERVISOR_STATISTICS).is_some());
    assert_eq!(checkpoint.tasks.len(), stats.queue.total());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_request_reaches_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, checkpoints) = orchestrator(common::fast_config(), &dir);
    let handle = orchestrator.handle();
    let mut watcher = orchestrator.handle();

    let (stats, reached) = tokio::join!(run_with_timeout(&orchestrator), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop();
        watcher.wait_for(SupervisorState::Terminal).await
    });

    assert!(reached);
    assert!(handle.is_stop_requested());
    assert_eq!(stats.state, SupervisorState::Terminal);
    assert!(checkpoints.load().await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stable_leaderboard_converges_then_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::fast_config();
    config.tournament.multi_turn_rank_cutoff = 0;
    config.supervisor.convergence.window = 1;
    config.supervisor.convergence.terminal_after = 1;
    // only meta-reviews from the supervisor, so the field stays fixed
    config.supervisor.sampling_weights = BTreeMap::from([(TaskType::MetaReview, 1.0)]);
    let (orchestrator, _checkpoints) = orchestrator(config, &dir);

    for _ in 0..3 {
        let seed = Task::new(TaskPayload::Generate { context: json!({}) })
            .with_source(TaskSource::External);
        orchestrator.queue().enqueue(seed).await.unwrap();
    }

    let mut watcher = orchestrator.handle();
    let (stats, converged) = tokio::join!(
        run_with_timeout(&orchestrator),
        watcher.wait_for(SupervisorState::Converging)
    );

    assert!(converged, "Converging precedes Terminal");
    assert_eq!(stats.state, SupervisorState::Terminal);
    assert_eq!(stats.hypothesis_count, 3);
    assert_eq!(stats.tournament.resolved_matches, 3);
    assert_eq!(stats.leaders.len(), 3);
    assert!(stats.leaders.iter().all(|l| l.match_count == 2));
}
