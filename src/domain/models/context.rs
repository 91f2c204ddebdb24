//! Context Memory entries and checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::{Task, TaskStatus};

/// Version reported for a key that has never been written.
pub const ABSENT_VERSION: u64 = 0;

/// One versioned key/value record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: Value,
    /// Starts at 1 and grows by exactly one per successful write
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ContextEntry {
    pub fn new(key: impl Into<String>, value: Value, version: u64) -> Self {
        Self {
            key: key.into(),
            value,
            version,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of a compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Write applied; carries the new version
    Applied(u64),
    /// Expected version was stale; carries the version actually stored
    Conflict(u64),
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Well-known Context Memory keys.
pub mod keys {
    use uuid::Uuid;

    pub const HYPOTHESIS_PREFIX: &str = "hypotheses/";
    pub const HYPOTHESIS_INDEX: &str = "hypotheses/index";
    pub const PROXIMITY_CLUSTERS: &str = "proximity/clusters";
    pub const REVIEW_PREFIX: &str = "reviews/";
    pub const META_REVIEWS: &str = "meta_reviews";
    pub const TERMINAL_FAILURES: &str = "tasks/terminal_failures";
    pub const TOURNAMENT_LEDGER: &str = "tournament/ledger";
    pub const TOURNAMENT_PAIRINGS: &str = "tournament/pairings";
    pub const SUPERVISOR_STATISTICS: &str = "supervisor/statistics";

    pub fn hypothesis(id: Uuid) -> String {
        format!("hypotheses/{id}")
    }

    /// Ids of the hypotheses created by one task's result.
    pub fn hypotheses_by_task(task_id: Uuid) -> String {
        format!("hypotheses/by-task/{task_id}")
    }

    pub fn review(hypothesis_id: Uuid) -> String {
        format!("reviews/{hypothesis_id}")
    }

    pub fn tournament_match(match_id: Uuid) -> String {
        format!("tournament/matches/{match_id}")
    }
}

/// Current on-disk checkpoint format.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Point-in-time copy of Context Memory and the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ContextEntry>,
    pub tasks: Vec<Task>,
}

impl Checkpoint {
    pub fn new(entries: Vec<ContextEntry>, tasks: Vec<Task>) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            created_at: Utc::now(),
            entries,
            tasks,
        }
    }

    /// Entry lookup by key.
    pub fn entry(&self, key: &str) -> Option<&ContextEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Number of tasks in each status.
    pub fn task_count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}
