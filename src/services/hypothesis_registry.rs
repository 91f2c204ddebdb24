//! Hypothesis records in Context Memory.
//!
//! Layout:
//! - `hypotheses/{id}` holds one `Hypothesis`
//! - `hypotheses/index` lists every id in registration order
//! - `hypotheses/by-task/{task_id}` lists the ids a task's result created

use std::collections::HashSet;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::context::keys;
use crate::domain::models::{CasOutcome, Hypothesis, HypothesisDraft, HypothesisStatus};
use crate::services::ContextMemory;

#[derive(Clone)]
pub struct HypothesisRegistry {
    memory: ContextMemory,
}

impl HypothesisRegistry {
    pub fn new(memory: ContextMemory) -> Self {
        Self { memory }
    }

    /// Materialize the drafts returned by `task_id`.
    ///
    /// Idempotent per task: the first caller claims the by-task marker and
    /// writes the records; any later caller (a retried or late execution of
    /// the same task) gets the already registered hypotheses back.
    #[instrument(skip(self, drafts), fields(count = drafts.len()), err)]
    pub async fn register_from_task(
        &self,
        task_id: Uuid,
        drafts: Vec<HypothesisDraft>,
    ) -> DomainResult<Vec<Hypothesis>> {
        let hypotheses: Vec<Hypothesis> = drafts
            .into_iter()
            .map(|d| Hypothesis::from_draft(d, task_id))
            .collect();
        let ids: Vec<Uuid> = hypotheses.iter().map(|h| h.id).collect();

        let marker = keys::hypotheses_by_task(task_id);
        if let CasOutcome::Conflict(_) = self.memory.cas_json(&marker, 0, &ids).await? {
            debug!(%task_id, "Task result already registered");
            let (existing, _) = self.memory.get_or_default::<Vec<Uuid>>(&marker).await?;
            return self.get_many(&existing).await;
        }

        for hypothesis in &hypotheses {
            self.memory
                .cas_json(&keys::hypothesis(hypothesis.id), 0, hypothesis)
                .await?;
        }

        self.memory
            .update::<Vec<Uuid>, _, _>(keys::HYPOTHESIS_INDEX, |index| {
                index.extend(ids.iter().copied());
                Ok(())
            })
            .await?;

        info!(%task_id, count = hypotheses.len(), "Registered hypotheses");
        Ok(hypotheses)
    }

    pub async fn get(&self, id: Uuid) -> DomainResult<Option<Hypothesis>> {
        Ok(self
            .memory
            .get_json::<Hypothesis>(&keys::hypothesis(id))
            .await?
            .map(|(h, _)| h))
    }

    /// Fetch a hypothesis that must exist.
    pub async fn require(&self, id: Uuid) -> DomainResult<Hypothesis> {
        self.get(id)
            .await?
            .ok_or(DomainError::HypothesisNotFound(id))
    }

    async fn get_many(&self, ids: &[Uuid]) -> DomainResult<Vec<Hypothesis>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(h) = self.get(id).await? {
                out.push(h);
            }
        }
        Ok(out)
    }

    /// Every registered id, oldest first, without duplicates.
    pub async fn ids(&self) -> DomainResult<Vec<Uuid>> {
        let (index, _) = self
            .memory
            .get_or_default::<Vec<Uuid>>(keys::HYPOTHESIS_INDEX)
            .await?;
        let mut seen = HashSet::with_capacity(index.len());
        Ok(index.into_iter().filter(|id| seen.insert(*id)).collect())
    }

    pub async fn all(&self) -> DomainResult<Vec<Hypothesis>> {
        let ids = self.ids().await?;
        self.get_many(&ids).await
    }

    /// Active hypotheses only.
    pub async fn eligible(&self) -> DomainResult<Vec<Hypothesis>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|h| h.status.is_eligible())
            .collect())
    }

    /// Change a hypothesis' status. Content is never touched.
    ///
    /// `excluded-for-safety` wins over everything; `superseded` only
    /// applies to active hypotheses. Returns whether the record changed.
    pub async fn set_status(&self, id: Uuid, status: HypothesisStatus) -> DomainResult<bool> {
        let changed = self
            .memory
            .try_update::<Option<Hypothesis>, (), _>(&keys::hypothesis(id), |record| {
                let hypothesis = record.as_mut().ok_or(DomainError::HypothesisNotFound(id))?;
                let allowed = match status {
                    HypothesisStatus::ExcludedForSafety => {
                        hypothesis.status != HypothesisStatus::ExcludedForSafety
                    }
                    HypothesisStatus::Superseded => hypothesis.status == HypothesisStatus::Active,
                    HypothesisStatus::Active => false,
                };
                if !allowed {
                    return Ok(None);
                }
                hypothesis.status = status;
                Ok(Some(()))
            })
            .await?
            .is_some();

        if changed {
            info!(hypothesis_id = %id, %status, "Hypothesis status changed");
        }
        Ok(changed)
    }
}
