//! Health and progress figures published by the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::task::TaskType;

/// Counters for one task type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMetrics {
    /// Pending or retrying right now
    pub waiting: usize,
    /// Leased or running right now
    pub held: usize,
    pub succeeded: u64,
    /// Every failed attempt, including reclaimed leases
    pub failed_attempts: u64,
    /// Tasks that reached terminal `failed`
    pub terminal_failures: u64,
    pub reclaimed: u64,
    /// Results rejected because the lease was no longer held
    pub late_rejected: u64,
}

impl TypeMetrics {
    /// Share of finished tasks that failed terminally.
    pub fn terminal_failure_rate(&self) -> Option<f64> {
        let finished = self.succeeded + self.terminal_failures;
        (finished > 0).then(|| self.terminal_failures as f64 / finished as f64)
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending: usize,
    pub leased: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub max_size: usize,
    pub by_type: BTreeMap<TaskType, TypeMetrics>,
}

impl QueueMetrics {
    /// Tasks waiting for a worker.
    pub fn waiting(&self) -> usize {
        self.pending + self.retrying
    }

    /// Tasks held by a worker.
    pub fn in_flight(&self) -> usize {
        self.leased + self.running
    }

    /// Non-terminal tasks, the quantity bounded by `max_size`.
    pub fn active(&self) -> usize {
        self.waiting() + self.in_flight()
    }

    /// Every task the queue has accepted and still holds.
    pub fn total(&self) -> usize {
        self.active() + self.succeeded + self.failed
    }

    pub fn type_metrics(&self, task_type: TaskType) -> TypeMetrics {
        self.by_type.get(&task_type).cloned().unwrap_or_default()
    }
}

/// Tournament progress summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TournamentProgress {
    pub enrolled: usize,
    pub scheduled_pairs: usize,
    pub open_matches: usize,
    pub resolved_matches: usize,
    /// Distinct pairs among currently eligible hypotheses
    pub possible_pairs: usize,
}

impl TournamentProgress {
    /// Share of possible pairs already resolved, 0..=1.
    pub fn completion_rate(&self) -> f64 {
        if self.possible_pairs == 0 {
            return 0.0;
        }
        (self.resolved_matches as f64 / self.possible_pairs as f64).min(1.0)
    }
}

/// Worker pool figures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    /// Target size set at startup or by the last resize
    pub configured: usize,
    /// Workers currently running their loop
    pub live: usize,
    /// Workers executing a task right now
    pub busy: usize,
    pub processed: u64,
    pub failed: u64,
}

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Active,
    Converging,
    Terminal,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::Active
    }
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Converging => "converging",
            Self::Terminal => "terminal",
        }
    }

    /// Active -> Converging -> Terminal; Active may jump to Terminal.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Converging | Self::Terminal) | (Self::Converging, Self::Terminal)
        )
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the current leaders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leader {
    pub hypothesis_id: Uuid,
    pub elo_rating: f64,
    pub match_count: u32,
}

/// Aggregate view computed every statistics interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub computed_at: DateTime<Utc>,
    pub state: SupervisorState,
    pub elapsed_secs: u64,
    pub hypothesis_count: usize,
    pub active_hypotheses: usize,
    pub superseded_hypotheses: usize,
    pub excluded_hypotheses: usize,
    /// Active hypotheses without any review yet
    pub unreviewed_hypotheses: usize,
    pub average_elo: Option<f64>,
    pub best_elo: Option<f64>,
    pub leaders: Vec<Leader>,
    pub tournament: TournamentProgress,
    pub queue: QueueMetrics,
    pub workers: WorkerPoolStats,
    /// Tasks ever enqueued, counted against the task budget
    pub tasks_enqueued: usize,
    pub storage_errors: u64,
}

impl Statistics {
    pub fn terminal_failures(&self) -> u64 {
        self.queue.by_type.values().map(|m| m.terminal_failures).sum()
    }

    pub fn succeeded(&self) -> u64 {
        self.queue.by_type.values().map(|m| m.succeeded).sum()
    }
}
