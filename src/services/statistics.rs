//! Aggregate statistics over Context Memory, the queue and the tournament.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::context::keys;
use crate::domain::models::{
    HypothesisStatus, Leader, Statistics, SupervisorState, WorkerPoolStats,
};
use crate::services::{ContextMemory, TaskQueue, Tournament};

/// Computes the periodic `Statistics` view and publishes it to
/// `supervisor/statistics`.
#[derive(Clone)]
pub struct StatisticsCollector {
    memory: ContextMemory,
    queue: Arc<TaskQueue>,
    tournament: Arc<Tournament>,
    top_n: usize,
}

impl StatisticsCollector {
    pub fn new(
        memory: ContextMemory,
        queue: Arc<TaskQueue>,
        tournament: Arc<Tournament>,
        top_n: usize,
    ) -> Self {
        Self {
            memory,
            queue,
            tournament,
            top_n: top_n.max(1),
        }
    }

    /// Read everything and compute a fresh view.
    #[instrument(skip(self, workers), level = "debug", err)]
    pub async fn collect(
        &self,
        state: SupervisorState,
        workers: WorkerPoolStats,
        elapsed: Duration,
    ) -> DomainResult<Statistics> {
        let standings = self.tournament.standings().await?;
        let reviewed = self.reviewed_ids().await?;
        let progress = self.tournament.progress().await?;
        let queue = self.queue.metrics().await;

        let count_status = |status: HypothesisStatus| {
            standings
                .iter()
                .filter(|s| s.hypothesis.status == status)
                .count()
        };
        let active: Vec<_> = standings
            .iter()
            .filter(|s| s.hypothesis.status.is_eligible())
            .collect();

        let unreviewed = active
            .iter()
            .filter(|s| !reviewed.contains(&s.hypothesis.id))
            .count();
        let average_elo = (!active.is_empty())
            .then(|| active.iter().map(|s| s.elo_rating).sum::<f64>() / active.len() as f64);
        let leaders: Vec<Leader> = active
            .iter()
            .take(self.top_n)
            .map(|s| Leader {
                hypothesis_id: s.hypothesis.id,
                elo_rating: s.elo_rating,
                match_count: s.match_count,
            })
            .collect();

        Ok(Statistics {
            computed_at: Utc::now(),
            state,
            elapsed_secs: elapsed.as_secs(),
            hypothesis_count: standings.len(),
            active_hypotheses: active.len(),
            superseded_hypotheses: count_status(HypothesisStatus::Superseded),
            excluded_hypotheses: count_status(HypothesisStatus::ExcludedForSafety),
            unreviewed_hypotheses: unreviewed,
            average_elo,
            best_elo: leaders.first().map(|l| l.elo_rating),
            leaders,
            tournament: progress,
            tasks_enqueued: queue.total(),
            queue,
            workers,
            storage_errors: self.memory.storage_error_count(),
        })
    }

    /// Write `statistics` to `supervisor/statistics`, replacing the previous
    /// view.
    pub async fn publish(&self, statistics: &Statistics) -> DomainResult<()> {
        self.memory
            .update::<Option<Statistics>, _, _>(keys::SUPERVISOR_STATISTICS, |current| {
                *current = Some(statistics.clone());
                Ok(())
            })
            .await?;
        debug!(state = %statistics.state, "Statistics published");
        Ok(())
    }

    /// Last published view.
    pub async fn latest(&self) -> DomainResult<Option<Statistics>> {
        Ok(self
            .memory
            .get_json::<Option<Statistics>>(keys::SUPERVISOR_STATISTICS)
            .await?
            .and_then(|(s, _)| s))
    }

    /// Hypotheses with at least one recorded review.
    pub async fn reviewed_ids(&self) -> DomainResult<HashSet<Uuid>> {
        Ok(self
            .memory
            .list_keys(keys::REVIEW_PREFIX)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(keys::REVIEW_PREFIX))
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryContextStore;
    use crate::services::HypothesisRegistry;
    use crate::domain::models::{
        HypothesisDraft, QueueConfig, RetryConfig, Task, TaskPayload, TournamentConfig,
    };
    use serde_json::json;

    struct Fixture {
        collector: StatisticsCollector,
        registry: HypothesisRegistry,
        memory: ContextMemory,
        queue: Arc<TaskQueue>,
        tournament: Arc<Tournament>,
    }

    fn fixture() -> Fixture {
        let memory = ContextMemory::new(
            Arc::new(InMemoryContextStore::new()),
            &RetryConfig::default(),
        );
        let queue = Arc::new(TaskQueue::new(QueueConfig::default(), RetryConfig::default()));
        let tournament = Arc::new(Tournament::with_seed(
            memory.clone(),
            queue.clone(),
            TournamentConfig::default(),
            7,
        ));
        Fixture {
            collector: StatisticsCollector::new(memory.clone(), queue.clone(), tournament.clone(), 3),
            registry: HypothesisRegistry::new(memory.clone()),
            memory,
            queue,
            tournament,
        }
    }

    fn drafts(n: usize) -> Vec<HypothesisDraft> {
        (0..n)
            .map(|i| HypothesisDraft::new(json!(i), "test"))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_system() {
        let f = fixture();
        let stats = f
            .collector
            .collect(SupervisorState::Active, WorkerPoolStats::default(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(stats.hypothesis_count, 0);
        assert_eq!(stats.average_elo, None);
        assert_eq!(stats.best_elo, None);
        assert!(stats.leaders.is_empty());
        assert_eq!(stats.tasks_enqueued, 0);
    }

    #[tokio::test]
    async fn test_counts_and_leaders() {
        let f = fixture();
        let hs = f.registry.register_from_task(Uuid::new_v4(), drafts(4)).await.unwrap();
        let ids: Vec<Uuid> = hs.iter().map(|h| h.id).collect();
        f.tournament.enroll(&ids).await.unwrap();
        f.tournament
            .apply_match_result(Uuid::new_v4(), ids[0], ids[1], Some(ids[0]))
            .await
            .unwrap();
        f.registry
            .set_status(ids[3], HypothesisStatus::ExcludedForSafety)
            .await
            .unwrap();
        f.memory
            .append_to_list(&keys::review(ids[1]), &json!({"score": 3}))
            .await
            .unwrap();
        f.queue
            .enqueue(Task::new(TaskPayload::Generate { context: json!({}) }))
            .await
            .unwrap();

        let stats = f
            .collector
            .collect(SupervisorState::Active, WorkerPoolStats::default(), Duration::from_secs(9))
            .await
            .unwrap();

        assert_eq!(stats.hypothesis_count, 4);
        assert_eq!(stats.active_hypotheses, 3);
        assert_eq!(stats.excluded_hypotheses, 1);
        assert_eq!(stats.unreviewed_hypotheses, 2);
        assert_eq!(stats.leaders.len(), 3);
        assert_eq!(stats.leaders[0].hypothesis_id, ids[0]);
        assert_eq!(stats.best_elo, Some(1216.0));
        assert!((stats.average_elo.unwrap() - 1200.0).abs() < 1e-9);
        assert_eq!(stats.tasks_enqueued, 1);
        assert_eq!(stats.elapsed_secs, 9);
        assert_eq!(stats.tournament.resolved_matches, 1);
    }

    #[tokio::test]
    async fn test_publish_replaces_previous_view() {
        let f = fixture();
        let first = f
            .collector
            .collect(SupervisorState::Active, WorkerPoolStats::default(), Duration::ZERO)
            .await
            .unwrap();
        f.collector.publish(&first).await.unwrap();

        let second = f
            .collector
            .collect(SupervisorState::Converging, WorkerPoolStats::default(), Duration::ZERO)
            .await
            .unwrap();
        f.collector.publish(&second).await.unwrap();

        let latest = f.collector.latest().await.unwrap().unwrap();
        assert_eq!(latest.state, SupervisorState::Converging);
    }
}
