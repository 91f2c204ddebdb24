//! Checkpoints capture Context Memory with versions plus the queue, and
//! restoring one into a fresh system resumes where it left off.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, SlowStore};
use cosci::adapters::checkpoint::FileCheckpointStore;
use cosci::application::{CollaboratorRegistry, OutcomeRecorder};
use cosci::domain::models::context::keys;
use cosci::domain::models::{
    HypothesisDraft, Task, TaskOutcome, TaskPayload, TaskSource, TaskStatus, TaskType,
};
use cosci::domain::ports::CheckpointStore;
use cosci::services::{Checkpointer, HypothesisRegistry};

fn generators() -> CollaboratorRegistry {
    CollaboratorRegistry::new().with(TaskType::Generate, common::numbered_generator())
}

#[tokio::test]
async fn test_restore_resumes_hypotheses_ratings_and_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path().join("state/checkpoint.json")));
    let config = common::fast_config();

    let before = Harness::new(&config, generators());
    before.start(false).await;
    for _ in 0..4 {
        before
            .queue
            .enqueue(Task::new(TaskPayload::Generate { context: json!({}) }))
            .await
            .unwrap();
    }
    assert!(before.queue.wait_until_drained(Duration::from_secs(5)).await);
    before.stop().await;

    // one task still held by a worker when the checkpoint is taken
    let held = before
        .queue
        .enqueue(Task::new(TaskPayload::MetaReview { context: json!({}) }))
        .await
        .unwrap();
    let leased = before
        .queue
        .lease("worker-gone", &[TaskType::MetaReview], Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.id, held);

    let checkpoint = Checkpointer::new(before.memory.clone(), before.queue.clone(), store.clone())
        .checkpoint("test")
        .await
        .unwrap();
    assert_eq!(checkpoint.tasks.len(), 5);
    assert_eq!(checkpoint.task_count(TaskStatus::Leased), 1);
    let index_version = checkpoint.entry(keys::HYPOTHESIS_INDEX).unwrap().version;

    let after = Harness::new(&config, generators());
    let restored = Checkpointer::new(after.memory.clone(), after.queue.clone(), store.clone())
        .restore_latest()
        .await
        .unwrap()
        .expect("checkpoint should exist");
    assert_eq!(restored.created_at, checkpoint.created_at);

    // versions survive, so compare-and-set continues from the same point
    let entry = after.memory.get(keys::HYPOTHESIS_INDEX).await.unwrap().unwrap();
    assert_eq!(entry.version, index_version);

    let registry = HypothesisRegistry::new(after.memory.clone());
    assert_eq!(registry.all().await.unwrap().len(), 4);
    assert_eq!(after.tournament.ledger().await.unwrap().ratings.len(), 4);

    let task = after.task(held).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.lease.is_none());
    assert_eq!(task.attempt_count, 0);
    assert_eq!(after.queue.metrics().await.succeeded, 4);
}

#[tokio::test]
async fn test_missing_checkpoint_restores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path().join("none.json")));
    assert!(store.load().await.unwrap().is_none());

    let harness = Harness::new(&common::fast_config(), generators());
    let restored = Checkpointer::new(harness.memory.clone(), harness.queue.clone(), store)
        .restore_latest()
        .await
        .unwrap();
    assert!(restored.is_none());
    assert_eq!(harness.queue.active_count().await, 0);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    tokio::fs::write(&path, b"{ not json").await.unwrap();

    let store = FileCheckpointStore::new(&path);
    assert!(store.load().await.is_err());
}

#[tokio::test]
async fn test_completion_during_checkpoint_is_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));
    let config = common::fast_config();

    let before = Harness::with_store(
        &config,
        generators(),
        SlowStore::slow_snapshots(Duration::from_millis(200)),
        Duration::from_secs(60),
    );
    let id = before
        .queue
        .enqueue(Task::new(TaskPayload::Generate { context: json!({}) }))
        .await
        .unwrap();
    let task = before.queue.lease("w1", &[], Duration::from_secs(60)).await.unwrap().unwrap();
    let token = task.lease.clone().unwrap().token;

    let checkpointer = Checkpointer::new(before.memory.clone(), before.queue.clone(), store.clone());
    let capture = tokio::spawn(async move { checkpointer.checkpoint("periodic").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the worker commits while the checkpoint is being captured
    let outcome = TaskOutcome::Generate {
        hypotheses: vec![HypothesisDraft::new(json!({"text": "mid-checkpoint"}), "w1")],
    };
    before.queue.begin_commit(id, token).await.unwrap();
    OutcomeRecorder::new(before.memory.clone(), before.tournament.clone())
        .record(&task, &outcome)
        .await
        .unwrap();
    before.queue.complete(id, token, outcome).await.unwrap();
    capture.await.unwrap().unwrap();

    let after = Harness::new(&config, generators());
    Checkpointer::new(after.memory.clone(), after.queue.clone(), store)
        .restore_latest()
        .await
        .unwrap()
        .expect("checkpoint should exist");
    let registry = HypothesisRegistry::new(after.memory.clone());
    let restored = after.task(id).await;
    if restored.status == TaskStatus::Succeeded {
        assert_eq!(registry.all().await.unwrap().len(), 1, "succeeded without its effects");
    }

    after.start(false).await;
    assert!(after.queue.wait_until_drained(Duration::from_secs(5)).await);
    after.stop().await;
    assert_eq!(after.task(id).await.status, TaskStatus::Succeeded);
    assert_eq!(registry.all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_match_reserved_without_task_is_released_after_restore() {
    let config = common::fast_config();
    let before = Harness::new(&config, generators());
    before.start(false).await;
    for _ in 0..2 {
        before
            .queue
            .enqueue(Task::new(TaskPayload::Generate { context: json!({}) }))
            .await
            .unwrap();
    }
    assert!(before.queue.wait_until_drained(Duration::from_secs(5)).await);
    before.stop().await;

    assert_eq!(before.tournament.schedule_matches().await.unwrap().len(), 1);
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));
    let mut checkpoint = Checkpointer::new(before.memory.clone(), before.queue.clone(), store.clone())
        .checkpoint("test")
        .await
        .unwrap();
    // reservation captured, its task not yet enqueued
    checkpoint.tasks.retain(|t| t.source != TaskSource::Tournament);

    let after = Harness::new(&config, generators());
    Checkpointer::new(after.memory.clone(), after.queue.clone(), store)
        .restore(&checkpoint)
        .await
        .unwrap();
    assert_eq!(after.tournament.progress().await.unwrap().open_matches, 1);

    assert_eq!(after.tournament.release_orphaned_matches().await.unwrap(), 1);
    let progress = after.tournament.progress().await.unwrap();
    assert_eq!(progress.open_matches, 0);
    assert_eq!(progress.scheduled_pairs, 0);
    assert_eq!(after.tournament.schedule_matches().await.unwrap().len(), 1);
    assert_eq!(after.tournament.release_orphaned_matches().await.unwrap(), 0);
}
