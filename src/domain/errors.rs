//! Domain errors for the cosci orchestration core.

use thiserror::Error;
use uuid::Uuid;

use super::models::task::TaskType;

/// Domain-level errors that can occur anywhere in the core.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Context Memory I/O failed after exhausting local retries.
    /// The caller must not assume its mutation applied.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Compare-and-swap kept losing the race beyond the retry budget.
    #[error("Concurrent modification of {key} after {attempts} attempts")]
    ConcurrentModification { key: String, attempts: u32 },

    #[error("Task queue is full ({max_size} tasks)")]
    QueueFull { max_size: usize },

    #[error("Task {task_id} failed terminally after {attempts} attempts: {reason}")]
    TaskFailedTerminal {
        task_id: Uuid,
        attempts: u32,
        reason: String,
    },

    /// A result arrived from a worker that no longer holds the task's lease.
    #[error("Lease on task {task_id} is no longer held by worker {worker_id}")]
    LeaseExpired { task_id: Uuid, worker_id: String },

    #[error("Collaborator for {task_type} failed: {message}")]
    CollaboratorError {
        task_type: TaskType,
        message: String,
        retryable: bool,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Hypothesis not found: {0}")]
    HypothesisNotFound(Uuid),

    #[error("Match not found: {0}")]
    MatchNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Shutting down")]
    ShuttingDown,
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Storage-level errors worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Whether a task failing with this error may be attempted again.
    ///
    /// Only contention and I/O problems can clear up on their own. Missing
    /// records, bad transitions and malformed data fail the same way on
    /// every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CollaboratorError { retryable, .. } => *retryable,
            Self::StorageUnavailable(_)
            | Self::ConcurrentModification { .. }
            | Self::QueueFull { .. }
            | Self::CheckpointError(_) => true,
            Self::TaskFailedTerminal { .. }
            | Self::LeaseExpired { .. }
            | Self::TaskNotFound(_)
            | Self::HypothesisNotFound(_)
            | Self::MatchNotFound(_)
            | Self::InvalidStateTransition { .. }
            | Self::ValidationFailed(_)
            | Self::SerializationError(_)
            | Self::ShuttingDown => false,
        }
    }

    /// Shorthand for a retryable collaborator failure.
    pub fn collaborator(task_type: TaskType, message: impl Into<String>) -> Self {
        Self::CollaboratorError {
            task_type,
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a collaborator failure that must not be retried,
    /// e.g. a safety rejection.
    pub fn collaborator_fatal(task_type: TaskType, message: impl Into<String>) -> Self {
        Self::CollaboratorError {
            task_type,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
