use crate::domain::errors::DomainResult;
use crate::domain::models::Checkpoint;
use async_trait::async_trait;

/// Port for durable checkpoint storage.
///
/// `save` must publish atomically: a reader sees either the previous
/// checkpoint or the new one, never a partial write.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> DomainResult<()>;

    /// Most recent checkpoint, if any has been written.
    async fn load(&self) -> DomainResult<Option<Checkpoint>>;
}
