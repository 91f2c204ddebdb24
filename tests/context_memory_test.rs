//! Context Memory behaviour over both store backends.

mod common;

use serde_json::{json, Value};
use std::sync::Arc;

use cosci::adapters::memory::InMemoryContextStore;
use cosci::adapters::sqlite::{initialize_database, SqliteContextStore};
use cosci::domain::errors::DomainError;
use cosci::domain::models::{CasOutcome, RetryConfig};
use cosci::domain::ports::ContextStore;
use cosci::services::ContextMemory;

async fn concurrent_appends_are_never_lost(memory: ContextMemory, writers: usize, per_writer: usize) {
    let mut handles = Vec::new();
    for w in 0..writers {
        let memory = memory.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..per_writer {
                memory
                    .append_to_list("meta_reviews", &json!({ "writer": w, "item": i }))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let (list, version) = memory
        .get_json::<Vec<Value>>("meta_reviews")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(list.len(), writers * per_writer);
    // one successful CAS per append, each bumping the version by one
    assert_eq!(version, (writers * per_writer) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_memory_concurrent_appends() {
    let retry = RetryConfig {
        cas_max_retries: 10_000,
        ..common::fast_retry()
    };
    let memory = ContextMemory::new(Arc::new(InMemoryContextStore::new()), &retry);
    concurrent_appends_are_never_lost(memory, 8, 25).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_appends() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("context.db").display());
    let pool = initialize_database(&url, 4).await.unwrap();
    let retry = RetryConfig {
        cas_max_retries: 10_000,
        ..RetryConfig::default()
    };
    let memory = ContextMemory::new(Arc::new(SqliteContextStore::new(pool)), &retry);
    concurrent_appends_are_never_lost(memory, 4, 10).await;
}

#[tokio::test]
async fn test_cas_versions_start_at_one() {
    let memory = common::memory();

    assert!(memory.get("supervisor/statistics").await.unwrap().is_none());
    assert_eq!(
        memory.compare_and_set("k", 0, json!("a")).await.unwrap(),
        CasOutcome::Applied(1)
    );
    assert_eq!(
        memory.compare_and_set("k", 0, json!("b")).await.unwrap(),
        CasOutcome::Conflict(1)
    );
    assert_eq!(
        memory.compare_and_set("k", 1, json!("b")).await.unwrap(),
        CasOutcome::Applied(2)
    );

    let entry = memory.get("k").await.unwrap().unwrap();
    assert_eq!(entry.value, json!("b"));
    assert_eq!(entry.version, 2);
}

#[tokio::test]
async fn test_sqlite_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("context.db").display());

    {
        let pool = initialize_database(&url, 2).await.unwrap();
        let store = SqliteContextStore::new(pool.clone());
        store.compare_and_set("hypotheses/index", 0, json!(["a"])).await.unwrap();
        store.compare_and_set("hypotheses/index", 1, json!(["a", "b"])).await.unwrap();
        pool.close().await;
    }

    let pool = initialize_database(&url, 2).await.unwrap();
    let store = SqliteContextStore::new(pool);
    let entry = store.get("hypotheses/index").await.unwrap().unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(entry.value, json!(["a", "b"]));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = Arc::new(InMemoryContextStore::new());
    let memory = ContextMemory::new(store.clone(), &common::fast_retry());

    store.inject_failures(2);
    memory.append_to_list("reviews/x", &json!(1)).await.unwrap();
    assert_eq!(memory.storage_error_count(), 0);
}

#[tokio::test]
async fn test_persistent_failure_surfaces_storage_unavailable() {
    let store = Arc::new(InMemoryContextStore::new());
    let memory = ContextMemory::new(store.clone(), &common::fast_retry());

    store.inject_failures(u32::MAX);
    let err = memory.get("anything").await.unwrap_err();
    assert!(matches!(err, DomainError::StorageUnavailable(_)));
    assert_eq!(memory.storage_error_count(), 1);
}
