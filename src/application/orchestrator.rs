//! Wiring for a complete run.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Orchestrator                 │
//! ├──────────────────────────────────────────────┤
//! │ ContextMemory ◀── OutcomeRecorder            │
//! │ TaskQueue     ◀── Supervisor, Tournament     │
//! │ WorkerPool    ──▶ CollaboratorRegistry       │
//! └──────────────────────────────────────────────┘
//!        │               │              │
//!        ▼               ▼              ▼
//!   Supervisor     Tournament     Lease reclaim
//!   (stats loop)   (match loop)   (sweep loop)
//! ```

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::adapters::checkpoint::FileCheckpointStore;
use crate::adapters::memory::InMemoryContextStore;
use crate::adapters::sqlite::{initialize_database, SqliteContextStore};
use crate::application::{
    CollaboratorRegistry, OutcomeRecorder, Supervisor, SupervisorHandle, WorkerPool,
};
use crate::domain::errors::DomainResult;
use crate::domain::models::{Checkpoint, Config, Statistics, StorageBackend};
use crate::domain::ports::{CheckpointStore, ContextStore};
use crate::services::{
    Checkpointer, ContextMemory, HypothesisRegistry, StatisticsCollector, TaskQueue, Tournament,
};

/// Owns every component of one run and drives it to completion.
///
/// # Examples
///
/// ```no_run
/// use cosci::application::{CollaboratorRegistry, Orchestrator};
/// use cosci::domain::models::Config;
///
/// # async fn example(collaborators: CollaboratorRegistry) -> anyhow::Result<()> {
/// let orchestrator = Orchestrator::from_config(Config::default(), collaborators).await?;
/// orchestrator.restore_from_checkpoint().await?;
///
/// let handle = orchestrator.handle();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     handle.stop();
/// });
///
/// let stats = orchestrator.run().await?;
/// println!("best elo: {:?}", stats.best_elo);
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    config: Config,
    memory: ContextMemory,
    queue: Arc<TaskQueue>,
    tournament: Arc<Tournament>,
    registry: HypothesisRegistry,
    statistics: StatisticsCollector,
    checkpointer: Checkpointer,
    pool: Arc<WorkerPool>,
    supervisor: Supervisor,
}

impl Orchestrator {
    /// Assemble the components over the given stores.
    pub fn build(
        config: Config,
        store: Arc<dyn ContextStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        collaborators: CollaboratorRegistry,
    ) -> Self {
        let memory = ContextMemory::new(store, &config.retry);
        let queue = Arc::new(TaskQueue::new(config.queue.clone(), config.retry.clone()));
        let tournament = Arc::new(Tournament::new(
            memory.clone(),
            queue.clone(),
            config.tournament.clone(),
        ));
        let registry = HypothesisRegistry::new(memory.clone());
        let statistics = StatisticsCollector::new(
            memory.clone(),
            queue.clone(),
            tournament.clone(),
            config.supervisor.convergence.top_n,
        );
        let checkpointer = Checkpointer::new(memory.clone(), queue.clone(), checkpoints);
        let recorder = Arc::new(OutcomeRecorder::new(memory.clone(), tournament.clone()));
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(collaborators),
            recorder,
            &config.workers,
            &config.queue,
        ));
        let supervisor = Supervisor::new(
            config.supervisor.clone(),
            queue.clone(),
            tournament.clone(),
            registry.clone(),
            statistics.clone(),
            checkpointer.clone(),
            pool.clone(),
        );

        Self {
            config,
            memory,
            queue,
            tournament,
            registry,
            statistics,
            checkpointer,
            pool,
            supervisor,
        }
    }

    /// Open the configured storage backend and checkpoint file.
    pub async fn from_config(config: Config, collaborators: CollaboratorRegistry) -> Result<Self> {
        let store: Arc<dyn ContextStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryContextStore::new()),
            StorageBackend::Sqlite => {
                let url = format!("sqlite:{}", config.storage.database_path);
                let pool = initialize_database(&url, config.storage.max_connections)
                    .await
                    .with_context(|| {
                        format!("Failed to open context database at {}", config.storage.database_path)
                    })?;
                Arc::new(SqliteContextStore::new(pool))
            }
        };
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(
            Path::new(&config.storage.checkpoint_path),
        ));

        info!(
            backend = ?config.storage.backend,
            checkpoint = %config.storage.checkpoint_path,
            "Storage opened"
        );
        Ok(Self::build(config, store, checkpoints, collaborators))
    }

    /// Load the latest checkpoint, if one exists, into memory and the queue.
    ///
    /// Match reservations that came back without a task are released.
    pub async fn restore_from_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let restored = self
            .checkpointer
            .restore_latest()
            .await
            .context("Failed to restore checkpoint")?;
        if restored.is_some() {
            self.tournament
                .release_orphaned_matches()
                .await
                .context("Failed to reconcile open matches")?;
        }
        Ok(restored)
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.supervisor.handle()
    }

    /// Run until the supervisor reaches Terminal and the queue drains.
    ///
    /// Starts the workers plus the tournament and reclaim loops, runs the
    /// supervisor in the foreground, then stops everything.
    pub async fn run(&self) -> Result<Statistics> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        self.pool.start().await;
        let tournament_loop = tokio::spawn(self.tournament.clone().run(shutdown_tx.subscribe()));
        let reclaim_loop = tokio::spawn(self.pool.clone().run_reclaimer(shutdown_tx.subscribe()));

        let outcome = self.supervisor.run().await;

        let _ = shutdown_tx.send(());
        let grace = Duration::from_secs(self.config.supervisor.drain_timeout_secs.max(1));
        self.pool.shutdown(grace).await;
        let joined = futures::future::join_all([tournament_loop, reclaim_loop]).await;
        for (name, result) in ["tournament", "reclaim"].into_iter().zip(joined) {
            if let Err(e) = result {
                warn!(loop_name = name, error = ?e, "Background loop panicked");
            }
        }

        outcome.context("Supervisor failed")
    }

    /// One-off checkpoint outside the supervisor's schedule.
    pub async fn checkpoint(&self, reason: &str) -> DomainResult<Checkpoint> {
        self.checkpointer.checkpoint(reason).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn memory(&self) -> &ContextMemory {
        &self.memory
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn tournament(&self) -> &Arc<Tournament> {
        &self.tournament
    }

    pub fn registry(&self) -> &HypothesisRegistry {
        &self.registry
    }

    pub fn statistics(&self) -> &StatisticsCollector {
        &self.statistics
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}
