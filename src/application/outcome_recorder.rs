//! Commits task outcomes to Context Memory.
//!
//! Every effect is idempotent per producing task (or per match for
//! rank-match results), so a result delivered twice changes nothing the
//! second time.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::context::keys;
use crate::domain::models::{
    HypothesisDraft, HypothesisStatus, MetaReviewRecord, ReviewRecord, Task, TaskOutcome,
    TaskPayload, TerminalFailure,
};
use crate::services::{ContextMemory, HypothesisRegistry, Tournament};

pub struct OutcomeRecorder {
    memory: ContextMemory,
    registry: HypothesisRegistry,
    tournament: Arc<Tournament>,
}

impl OutcomeRecorder {
    pub fn new(memory: ContextMemory, tournament: Arc<Tournament>) -> Self {
        Self {
            registry: HypothesisRegistry::new(memory.clone()),
            memory,
            tournament,
        }
    }

    /// Apply the effects of `outcome`, produced by `task`.
    #[instrument(skip(self, task, outcome), fields(task_id = %task.id, task_type = %task.task_type()), err)]
    pub async fn record(&self, task: &Task, outcome: &TaskOutcome) -> DomainResult<()> {
        match (&task.payload, outcome) {
            (TaskPayload::Generate { .. }, TaskOutcome::Generate { hypotheses }) => {
                self.register(task.id, hypotheses.clone()).await?;
            }
            (
                TaskPayload::Evolve { parents, .. },
                TaskOutcome::Evolve {
                    hypotheses,
                    supersedes_parents,
                },
            ) => {
                let parent_ids = parents.iter().map(|p| p.id).collect();
                self.record_evolution(task.id, parent_ids, hypotheses, *supersedes_parents)
                    .await?;
            }
            (
                TaskPayload::Review { hypothesis, .. },
                TaskOutcome::Review {
                    hypothesis_id,
                    review,
                    exclude_for_safety,
                },
            ) => {
                if *hypothesis_id != hypothesis.id {
                    return Err(DomainError::ValidationFailed(format!(
                        "Review for {hypothesis_id} returned by a task reviewing {}",
                        hypothesis.id
                    )));
                }
                self.record_review(task.id, *hypothesis_id, review.clone(), *exclude_for_safety)
                    .await?;
            }
            (
                TaskPayload::RankMatch {
                    match_id,
                    hypothesis_a,
                    hypothesis_b,
                    ..
                },
                TaskOutcome::RankMatch {
                    match_id: result_match,
                    winner_id,
                    ..
                },
            ) => {
                if result_match != match_id {
                    return Err(DomainError::ValidationFailed(format!(
                        "Result for match {result_match} delivered to match {match_id}"
                    )));
                }
                self.tournament
                    .apply_match_result(*match_id, hypothesis_a.id, hypothesis_b.id, *winner_id)
                    .await?;
            }
            (TaskPayload::Cluster { .. }, TaskOutcome::Cluster { clusters }) => {
                let clusters = clusters.clone();
                self.memory
                    .update::<Vec<Vec<Uuid>>, _, _>(keys::PROXIMITY_CLUSTERS, |current| {
                        current.clone_from(&clusters);
                        Ok(())
                    })
                    .await?;
                info!(clusters = clusters.len(), "Proximity clusters replaced");
            }
            (TaskPayload::MetaReview { .. }, TaskOutcome::MetaReview { summary }) => {
                let record = MetaReviewRecord {
                    task_id: task.id,
                    summary: summary.clone(),
                    recorded_at: Utc::now(),
                };
                self.memory.append_record(keys::META_REVIEWS, &record).await?;
            }
            (_, other) => {
                return Err(DomainError::ValidationFailed(format!(
                    "{} task {} returned a {} outcome",
                    task.task_type(),
                    task.id,
                    other.task_type()
                )));
            }
        }
        Ok(())
    }

    /// Register and enroll drafts returned by `task_id`.
    async fn register(&self, task_id: Uuid, drafts: Vec<HypothesisDraft>) -> DomainResult<Vec<Uuid>> {
        let created = self.registry.register_from_task(task_id, drafts).await?;
        let ids: Vec<Uuid> = created.iter().map(|h| h.id).collect();
        self.tournament.enroll(&ids).await?;
        Ok(ids)
    }

    async fn record_evolution(
        &self,
        task_id: Uuid,
        parent_ids: Vec<Uuid>,
        drafts: &[HypothesisDraft],
        supersedes_parents: bool,
    ) -> DomainResult<()> {
        let only_parent = match parent_ids.as_slice() {
            [single] => Some(*single),
            _ => None,
        };
        let drafts: Vec<HypothesisDraft> = drafts
            .iter()
            .cloned()
            .map(|mut d| {
                if d.parent_id.is_none() {
                    d.parent_id = only_parent;
                }
                d
            })
            .collect();

        let mut parents: BTreeSet<Uuid> = parent_ids.into_iter().collect();
        parents.extend(drafts.iter().filter_map(|d| d.parent_id));

        let children = self.register(task_id, drafts).await?;

        if supersedes_parents && !children.is_empty() {
            for parent in parents {
                match self.registry.set_status(parent, HypothesisStatus::Superseded).await {
                    Ok(_) => {}
                    Err(DomainError::HypothesisNotFound(id)) => {
                        warn!(hypothesis_id = %id, "Superseded parent is not registered");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn record_review(
        &self,
        task_id: Uuid,
        hypothesis_id: Uuid,
        review: serde_json::Value,
        exclude_for_safety: bool,
    ) -> DomainResult<()> {
        if self.registry.get(hypothesis_id).await?.is_none() {
            return Err(DomainError::ValidationFailed(format!(
                "Review for unknown hypothesis {hypothesis_id}"
            )));
        }

        let record = ReviewRecord {
            task_id,
            review,
            exclude_for_safety,
            recorded_at: Utc::now(),
        };
        self.memory
            .append_record(&keys::review(hypothesis_id), &record)
            .await?;

        if exclude_for_safety
            && self
                .registry
                .set_status(hypothesis_id, HypothesisStatus::ExcludedForSafety)
                .await?
        {
            warn!(%hypothesis_id, "Hypothesis excluded for safety");
        }
        Ok(())
    }

    /// Record a task that reached terminal `failed`. A failed rank-match
    /// also gives up its tournament slot.
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type()), err)]
    pub async fn record_terminal_failure(&self, task: &Task) -> DomainResult<()> {
        let failure = TerminalFailure {
            task_id: task.id,
            task_type: task.task_type(),
            attempts: task.attempt_count,
            error: task.last_error.clone(),
            failed_at: task.completed_at.unwrap_or_else(Utc::now),
        };
        if self
            .memory
            .append_record(keys::TERMINAL_FAILURES, &failure)
            .await?
        {
            warn!(attempts = failure.attempts, error = ?failure.error, "Task failed terminally");
        }

        if let TaskPayload::RankMatch { match_id, .. } = &task.payload {
            self.tournament.abandon_match(*match_id).await?;
        }
        Ok(())
    }
}
