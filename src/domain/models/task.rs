//! Task domain model.
//!
//! Tasks are discrete units of schedulable work. Each carries a typed payload
//! for the collaborator registered for its type and, once it succeeds, the
//! collaborator's typed outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::hypothesis::{Hypothesis, HypothesisDraft};
use super::tournament::DebateDepth;

/// Kind of work a task represents. Selects the collaborator that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Generate,
    Review,
    RankMatch,
    Evolve,
    Cluster,
    MetaReview,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        Self::Generate,
        Self::Review,
        Self::RankMatch,
        Self::Evolve,
        Self::Cluster,
        Self::MetaReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Review => "review",
            Self::RankMatch => "rank-match",
            Self::Evolve => "evolve",
            Self::Cluster => "cluster",
            Self::MetaReview => "meta-review",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "generate" => Some(Self::Generate),
            "review" => Some(Self::Review),
            "rank-match" => Some(Self::RankMatch),
            "evolve" => Some(Self::Evolve),
            "cluster" => Some(Self::Cluster),
            "meta-review" => Some(Self::MetaReview),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Enqueued and waiting for its first lease
    Pending,
    /// Claimed by a worker, not yet started
    Leased,
    /// Collaborator call in flight
    Running,
    /// Completed with a result
    Succeeded,
    /// Retries exhausted or failure was non-retryable
    Failed,
    /// Waiting for another attempt after a failed one
    Retrying,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "leased" => Some(Self::Leased),
            "running" => Some(Self::Running),
            "succeeded" | "complete" | "completed" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Waiting in the queue and eligible for a lease.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    /// Held by a worker.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Leased | Self::Running)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> Vec<TaskStatus> {
        match self {
            Self::Pending | Self::Retrying => vec![Self::Leased],
            Self::Leased => vec![
                Self::Running,
                Self::Succeeded,
                Self::Retrying,
                Self::Failed,
                Self::Pending,
            ],
            Self::Running => vec![Self::Succeeded, Self::Retrying, Self::Failed, Self::Pending],
            Self::Succeeded | Self::Failed => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who put the task on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Supervisor,
    Tournament,
    /// Submitted from outside the core (tests, seeding)
    External,
}

impl Default for TaskSource {
    fn default() -> Self {
        Self::External
    }
}

/// Input handed to the collaborator. The variant determines the task type.
///
/// Free-form `context` fields are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaskPayload {
    Generate {
        #[serde(default)]
        context: Value,
    },
    Review {
        hypothesis: Hypothesis,
        #[serde(default)]
        context: Value,
    },
    RankMatch {
        match_id: Uuid,
        hypothesis_a: Hypothesis,
        hypothesis_b: Hypothesis,
        depth: DebateDepth,
    },
    Evolve {
        parents: Vec<Hypothesis>,
        #[serde(default)]
        context: Value,
    },
    Cluster {
        hypotheses: Vec<Hypothesis>,
    },
    MetaReview {
        #[serde(default)]
        context: Value,
    },
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Generate { .. } => TaskType::Generate,
            Self::Review { .. } => TaskType::Review,
            Self::RankMatch { .. } => TaskType::RankMatch,
            Self::Evolve { .. } => TaskType::Evolve,
            Self::Cluster { .. } => TaskType::Cluster,
            Self::MetaReview { .. } => TaskType::MetaReview,
        }
    }
}

/// Structured output returned by a collaborator.
///
/// The core only reads the typed fields it needs for scheduling
/// (`winner_id`, new hypothesis drafts, clusters); everything else is
/// stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaskOutcome {
    Generate {
        hypotheses: Vec<HypothesisDraft>,
    },
    Review {
        hypothesis_id: Uuid,
        #[serde(default)]
        review: Value,
        #[serde(default)]
        exclude_for_safety: bool,
    },
    RankMatch {
        match_id: Uuid,
        /// `None` records a draw
        winner_id: Option<Uuid>,
        #[serde(default)]
        transcript: Value,
    },
    Evolve {
        hypotheses: Vec<HypothesisDraft>,
        #[serde(default)]
        supersedes_parents: bool,
    },
    Cluster {
        clusters: Vec<Vec<Uuid>>,
    },
    MetaReview {
        #[serde(default)]
        summary: Value,
    },
}

impl TaskOutcome {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Generate { .. } => TaskType::Generate,
            Self::Review { .. } => TaskType::Review,
            Self::RankMatch { .. } => TaskType::RankMatch,
            Self::Evolve { .. } => TaskType::Evolve,
            Self::Cluster { .. } => TaskType::Cluster,
            Self::MetaReview { .. } => TaskType::MetaReview,
        }
    }
}

/// A time-bounded claim by one worker on one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    /// Fresh per lease; results must present it to be committed
    pub token: Uuid,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once the holder starts writing results; a committing lease no
    /// longer expires and is released only by `complete` or `fail`
    #[serde(default)]
    pub committing: bool,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.committing && self.expires_at < now
    }
}

/// A discrete unit of work executed by a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// Typed collaborator input
    pub payload: TaskPayload,
    /// Base priority (0-10, higher is scheduled first)
    pub priority: u8,
    /// Current status
    pub status: TaskStatus,
    /// Failed attempts so far
    pub attempt_count: u32,
    /// Attempts allowed before the task fails terminally
    pub max_attempts: u32,
    /// Active lease, if held
    pub lease: Option<Lease>,
    /// Who enqueued it
    pub source: TaskSource,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last updated
    pub updated_at: DateTime<Utc>,
    /// When it entered a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Collaborator outcome, present once succeeded
    pub result: Option<TaskOutcome>,
    /// Most recent failure message
    pub last_error: Option<String>,
}

impl Task {
    /// Create a new pending task from a payload.
    pub fn new(payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            priority: 5,
            status: TaskStatus::default(),
            attempt_count: 0,
            max_attempts: 3,
            lease: None,
            source: TaskSource::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            last_error: None,
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set task source.
    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to new status.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }

        self.status = new_status;
        self.updated_at = Utc::now();

        if new_status.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        if !new_status.is_held() {
            self.lease = None;
        }

        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when the given token matches a lease that has not expired.
    pub fn holds_lease(&self, token: Uuid, now: DateTime<Utc>) -> bool {
        self.status.is_held()
            && self
                .lease
                .as_ref()
                .is_some_and(|l| l.token == token && !l.is_expired_at(now))
    }

    /// Held, but the lease ran out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_held() && self.lease.as_ref().is_none_or(|l| l.is_expired_at(now))
    }

    /// Whether another failed attempt still leaves room for a retry.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Validate task.
    pub fn validate(&self) -> Result<(), String> {
        if self.priority > 10 {
            return Err(format!("Invalid priority {} (must be 0-10)", self.priority));
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if let TaskPayload::RankMatch {
            hypothesis_a,
            hypothesis_b,
            ..
        } = &self.payload
        {
            if hypothesis_a.id == hypothesis_b.id {
                return Err("A match needs two distinct hypotheses".to_string());
            }
        }
        Ok(())
    }
}
