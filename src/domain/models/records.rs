//! Records the core appends to Context Memory lists.
//!
//! Every record names the task that produced it; writers skip a record
//! whose task is already present, so a redelivered result is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::task::TaskType;

/// One review of a hypothesis, stored under `reviews/{hypothesis_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub task_id: Uuid,
    pub review: Value,
    #[serde(default)]
    pub exclude_for_safety: bool,
    pub recorded_at: DateTime<Utc>,
}

/// One meta-review summary, stored in the `meta_reviews` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaReviewRecord {
    pub task_id: Uuid,
    pub summary: Value,
    pub recorded_at: DateTime<Utc>,
}

/// A task that exhausted its attempts, stored in `tasks/terminal_failures`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalFailure {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub attempts: u32,
    pub error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

/// Records that carry their producing task id.
pub trait TaskRecord {
    fn task_id(&self) -> Uuid;
}

impl TaskRecord for ReviewRecord {
    fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl TaskRecord for MetaReviewRecord {
    fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl TaskRecord for TerminalFailure {
    fn task_id(&self) -> Uuid {
        self.task_id
    }
}
