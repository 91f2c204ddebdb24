//! Checkpoint capture and restore.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Checkpoint, TaskStatus};
use crate::domain::ports::CheckpointStore;
use crate::services::{ContextMemory, TaskQueue};

/// Writes and reads whole-system checkpoints: every Context Memory entry
/// with its version, plus every task in the queue.
#[derive(Clone)]
pub struct Checkpointer {
    memory: ContextMemory,
    queue: Arc<TaskQueue>,
    store: Arc<dyn CheckpointStore>,
}

impl Checkpointer {
    pub fn new(memory: ContextMemory, queue: Arc<TaskQueue>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            memory,
            queue,
            store,
        }
    }

    /// Capture and durably save the current state.
    ///
    /// The queue is read before Context Memory. A task that finishes in
    /// between is saved as held with its effects already in memory; restore
    /// requeues it and recording is idempotent per task. The reverse order
    /// could save it as succeeded with its effects missing.
    #[instrument(skip(self), err)]
    pub async fn checkpoint(&self, reason: &str) -> DomainResult<Checkpoint> {
        let tasks = self.queue.snapshot_tasks().await;
        let entries = self.memory.snapshot().await?;
        let checkpoint = Checkpoint::new(entries, tasks);
        self.store.save(&checkpoint).await?;

        info!(
            reason,
            entries = checkpoint.entries.len(),
            tasks = checkpoint.tasks.len(),
            "Checkpoint written"
        );
        Ok(checkpoint)
    }

    /// Replace live state with `checkpoint`.
    ///
    /// Tasks that were leased or running when it was taken come back as
    /// pending.
    pub async fn restore(&self, checkpoint: &Checkpoint) -> DomainResult<()> {
        self.memory.restore(checkpoint.entries.clone()).await?;
        self.queue.restore(checkpoint.tasks.clone()).await;

        let in_flight = checkpoint.task_count(TaskStatus::Leased)
            + checkpoint.task_count(TaskStatus::Running);
        info!(
            created_at = %checkpoint.created_at,
            entries = checkpoint.entries.len(),
            tasks = checkpoint.tasks.len(),
            in_flight,
            "State restored from checkpoint"
        );
        Ok(())
    }

    /// Restore the most recent checkpoint, if one exists.
    pub async fn restore_latest(&self) -> DomainResult<Option<Checkpoint>> {
        let Some(checkpoint) = self.store.load().await? else {
            return Ok(None);
        };
        self.restore(&checkpoint).await?;
        Ok(Some(checkpoint))
    }
}
