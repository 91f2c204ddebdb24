//! JSON checkpoint file with atomic replacement.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::context::CHECKPOINT_FORMAT_VERSION;
use crate::domain::models::Checkpoint;
use crate::domain::ports::CheckpointStore;

/// Writes checkpoints to a single JSON file.
///
/// Each save goes to a sibling `.tmp` file which is then renamed over the
/// target, so a crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> DomainResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    DomainError::CheckpointError(format!(
                        "Failed to create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let content = serde_json::to_vec_pretty(checkpoint)?;
        let temp_path = self.temp_path();

        fs::write(&temp_path, &content)
            .await
            .map_err(|e| DomainError::CheckpointError(format!("Failed to write temp file: {e}")))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| DomainError::CheckpointError(format!("Failed to rename temp file: {e}")))?;

        tracing::debug!(
            path = %self.path.display(),
            entries = checkpoint.entries.len(),
            tasks = checkpoint.tasks.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    async fn load(&self) -> DomainResult<Option<Checkpoint>> {
        let content = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DomainError::CheckpointError(format!(
                    "Failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&content).map_err(|e| {
            DomainError::CheckpointError(format!("Corrupt checkpoint {}: {e}", self.path.display()))
        })?;

        if checkpoint.format_version > CHECKPOINT_FORMAT_VERSION {
            return Err(DomainError::CheckpointError(format!(
                "Unsupported checkpoint format {} (newest known is {})",
                checkpoint.format_version, CHECKPOINT_FORMAT_VERSION
            )));
        }

        Ok(Some(checkpoint))
    }
}
