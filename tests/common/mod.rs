//! Common test utilities for integration tests
//!
//! Scripted collaborators, fast configs and a small harness that wires the
//! queue, tournament and worker pool together without a supervisor.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use cosci::adapters::memory::InMemoryContextStore;
use cosci::application::{CollaboratorRegistry, OutcomeRecorder, WorkerPool};
use cosci::domain::errors::{DomainError, DomainResult};
use cosci::domain::models::{
    CasOutcome, Config, ContextEntry, HypothesisDraft, RetryConfig, Task, TaskOutcome,
    TaskPayload, TaskType,
};
use cosci::domain::ports::{Collaborator, ContextStore};
use cosci::services::{ContextMemory, TaskQueue, Tournament};

/// Setup test logging
///
/// Initializes a tracing subscriber writing through the test harness.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll an async condition every 20ms until it holds or `timeout_ms`
/// passes.
pub async fn wait_for<F, Fut>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate().await
}

/// Storage retries measured in milliseconds.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        storage_initial_backoff_ms: 1,
        storage_max_backoff_ms: 5,
        storage_max_elapsed_ms: 200,
        ..RetryConfig::default()
    }
}

/// Defaults with every interval shrunk for tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry = fast_retry();
    config.workers.pool_size = 4;
    config.workers.poll_interval_ms = 10;
    config.queue.reclaim_interval_ms = 20;
    config.tournament.schedule_interval_ms = 20;
    config.supervisor.statistics_interval_secs = 1;
    config.supervisor.drain_timeout_secs = 5;
    config
}

pub fn memory() -> ContextMemory {
    ContextMemory::new(Arc::new(InMemoryContextStore::new()), &fast_retry())
}

/// Collaborator driven by a closure.
pub struct ScriptedCollaborator<F> {
    name: String,
    calls: AtomicU32,
    script: F,
}

impl<F> ScriptedCollaborator<F>
where
    F: Fn(&Task, u32) -> DomainResult<TaskOutcome> + Send + Sync,
{
    /// `script` receives the task and the 1-based call number.
    pub fn new(name: &str, script: F) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            script,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Collaborator for ScriptedCollaborator<F>
where
    F: Fn(&Task, u32) -> DomainResult<TaskOutcome> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &Task) -> DomainResult<TaskOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(task, call)
    }
}

/// Generator returning one hypothesis whose `strength` is the call number
/// minus one, so ten calls yield strengths 0..=9.
pub fn numbered_generator() -> Arc<dyn Collaborator> {
    ScriptedCollaborator::new("numbered-generator", |_task: &Task, call: u32| {
        Ok(TaskOutcome::Generate {
            hypotheses: vec![HypothesisDraft::new(
                json!({ "strength": call - 1 }),
                "numbered-generator",
            )],
        })
    })
}

/// Judge that always picks the hypothesis with the higher `strength`.
pub fn strength_judge() -> Arc<dyn Collaborator> {
    ScriptedCollaborator::new("strength-judge", |task: &Task, _call: u32| {
        let TaskPayload::RankMatch {
            match_id,
            hypothesis_a,
            hypothesis_b,
            ..
        } = &task.payload
        else {
            return Err(DomainError::collaborator_fatal(
                TaskType::RankMatch,
                "judge received a non-match task",
            ));
        };
        let strength = |h: &cosci::Hypothesis| h.content["strength"].as_i64().unwrap_or(0);
        let winner = if strength(hypothesis_a) >= strength(hypothesis_b) {
            hypothesis_a.id
        } else {
            hypothesis_b.id
        };
        Ok(TaskOutcome::RankMatch {
            match_id: *match_id,
            winner_id: Some(winner),
            transcript: json!("decided by strength"),
        })
    })
}

/// In-memory store with artificial latency on selected operations.
///
/// Writes to keys under `slow_prefix` sleep before being applied, and
/// `snapshot` sleeps after reading so writers can land in between.
pub struct SlowStore {
    inner: InMemoryContextStore,
    slow_prefix: Option<String>,
    write_delay: Duration,
    snapshot_delay: Duration,
}

impl SlowStore {
    pub fn slow_writes(prefix: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryContextStore::new(),
            slow_prefix: Some(prefix.to_string()),
            write_delay: delay,
            snapshot_delay: Duration::ZERO,
        })
    }

    pub fn slow_snapshots(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryContextStore::new(),
            slow_prefix: None,
            write_delay: Duration::ZERO,
            snapshot_delay: delay,
        })
    }
}

#[async_trait]
impl ContextStore for SlowStore {
    async fn get(&self, key: &str) -> DomainResult<Option<ContextEntry>> {
        self.inner.get(key).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> DomainResult<CasOutcome> {
        if self
            .slow_prefix
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix))
        {
            tokio::time::sleep(self.write_delay).await;
        }
        self.inner.compare_and_set(key, expected_version, value).await
    }

    async fn list_keys(&self, prefix: &str) -> DomainResult<Vec<String>> {
        self.inner.list_keys(prefix).await
    }

    async fn snapshot(&self) -> DomainResult<Vec<ContextEntry>> {
        let entries = self.inner.snapshot().await?;
        tokio::time::sleep(self.snapshot_delay).await;
        Ok(entries)
    }

    async fn restore(&self, entries: Vec<ContextEntry>) -> DomainResult<()> {
        self.inner.restore(entries).await
    }
}

/// Queue, tournament and worker pool running without a supervisor.
pub struct Harness {
    pub memory: ContextMemory,
    pub queue: Arc<TaskQueue>,
    pub tournament: Arc<Tournament>,
    pub pool: Arc<WorkerPool>,
    shutdown: broadcast::Sender<()>,
}

impl Harness {
    pub fn new(config: &Config, collaborators: CollaboratorRegistry) -> Self {
        let lease = Duration::from_secs(config.queue.lease_duration_secs);
        Self::with_store(config, collaborators, Arc::new(InMemoryContextStore::new()), lease)
    }

    /// Harness over `store`, with workers leasing for `lease_duration`.
    pub fn with_store(
        config: &Config,
        collaborators: CollaboratorRegistry,
        store: Arc<dyn ContextStore>,
        lease_duration: Duration,
    ) -> Self {
        let memory = ContextMemory::new(store, &config.retry);
        let queue = Arc::new(TaskQueue::new(config.queue.clone(), config.retry.clone()));
        let tournament = Arc::new(Tournament::with_seed(
            memory.clone(),
            queue.clone(),
            config.tournament.clone(),
            42,
        ));
        let recorder = Arc::new(OutcomeRecorder::new(memory.clone(), tournament.clone()));
        let pool = Arc::new(
            WorkerPool::new(
                queue.clone(),
                Arc::new(collaborators),
                recorder,
                &config.workers,
                &config.queue,
            )
            .with_lease_duration(lease_duration),
        );
        let (shutdown, _) = broadcast::channel(1);
        Self {
            memory,
            queue,
            tournament,
            pool,
            shutdown,
        }
    }

    /// Start workers, the reclaim sweep and, optionally, match scheduling.
    pub async fn start(&self, with_tournament: bool) {
        self.pool.start().await;
        tokio::spawn(self.pool.clone().run_reclaimer(self.shutdown.subscribe()));
        if with_tournament {
            tokio::spawn(self.tournament.clone().run(self.shutdown.subscribe()));
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        self.pool.shutdown(Duration::from_secs(5)).await;
    }

    pub async fn task(&self, id: uuid::Uuid) -> Task {
        self.queue.get(id).await.expect("task should exist")
    }
}
