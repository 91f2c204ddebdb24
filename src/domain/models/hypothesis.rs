//! Hypothesis domain model.
//!
//! Hypothesis content is opaque to the core and immutable once created.
//! Evolution produces a new record pointing at its parent. Ratings are not
//! stored here; they live in the tournament ledger, which is the only
//! writer of Elo values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a hypothesis. Records are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HypothesisStatus {
    Active,
    Superseded,
    ExcludedForSafety,
}

impl Default for HypothesisStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl HypothesisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::ExcludedForSafety => "excluded-for-safety",
        }
    }

    /// Only active hypotheses take part in new matches.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for HypothesisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate research hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: Uuid,
    /// Opaque payload owned by the generation/evolution collaborators
    pub content: Value,
    /// Generation method that produced it
    pub source: String,
    pub status: HypothesisStatus,
    /// Parent for evolved hypotheses
    pub parent_id: Option<Uuid>,
    /// Task whose result created this record
    pub origin_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Hypothesis {
    pub fn new(content: Value, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            source: source.into(),
            status: HypothesisStatus::Active,
            parent_id: None,
            origin_task_id: None,
            created_at: Utc::now(),
        }
    }

    /// Materialize a collaborator draft produced by `task_id`.
    pub fn from_draft(draft: HypothesisDraft, task_id: Uuid) -> Self {
        Self {
            parent_id: draft.parent_id,
            origin_task_id: Some(task_id),
            ..Self::new(draft.content, draft.source)
        }
    }
}

/// A hypothesis as returned by a generate/evolve collaborator, before the
/// core assigns it an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisDraft {
    pub content: Value,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

fn default_source() -> String {
    "unknown".to_string()
}

impl HypothesisDraft {
    pub fn new(content: Value, source: impl Into<String>) -> Self {
        Self {
            content,
            source: source.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}
