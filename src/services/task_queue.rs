//! Lease-based priority task queue.
//!
//! Tasks wait as `pending` (first attempt) or `retrying` (after a failed
//! attempt); both are leasable. A lease hands one worker a fresh token and a
//! deadline. `complete` and `fail` must present that token while the lease
//! is still live, otherwise they are rejected with `LeaseExpired` and the
//! queue state is left untouched.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Lease, QueueConfig, QueueMetrics, RetryConfig, Task, TaskOutcome, TaskStatus, TaskType,
    TypeMetrics,
};
use crate::services::PriorityCalculator;

#[derive(Debug, Default)]
struct QueueState {
    tasks: HashMap<Uuid, Task>,
    counters: BTreeMap<TaskType, TypeMetrics>,
}

impl QueueState {
    fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_terminal()).count()
    }

    fn counters_mut(&mut self, task_type: TaskType) -> &mut TypeMetrics {
        self.counters.entry(task_type).or_default()
    }

    fn held_task_mut(
        &mut self,
        task_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> DomainResult<&mut Task> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(DomainError::TaskNotFound(task_id))?;

        if !task.holds_lease(token, now) {
            let worker_id = task
                .lease
                .as_ref()
                .map_or_else(|| "<none>".to_string(), |l| l.worker_id.clone());
            let task_type = task.task_type();
            self.counters_mut(task_type).late_rejected += 1;
            return Err(DomainError::LeaseExpired { task_id, worker_id });
        }

        self.tasks
            .get_mut(&task_id)
            .ok_or(DomainError::TaskNotFound(task_id))
    }
}

/// In-process task queue shared by the supervisor, the tournament and the
/// worker pool.
///
/// All state sits behind one mutex held only for bookkeeping, never across
/// a collaborator call. Durability comes from checkpoints
/// (`snapshot_tasks` / `restore`).
pub struct TaskQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    retry: RetryConfig,
    priority: PriorityCalculator,
    available: Notify,
    settled: Notify,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, retry: RetryConfig) -> Self {
        Self {
            priority: PriorityCalculator::from_config(&config),
            state: Mutex::new(QueueState::default()),
            config,
            retry,
            available: Notify::new(),
            settled: Notify::new(),
        }
    }

    /// Lease duration granted when the caller has no preference.
    pub fn default_lease_duration(&self) -> Duration {
        Duration::from_secs(self.config.lease_duration_secs)
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// Add a task in `pending` status.
    ///
    /// The attempt budget is taken from the retry policy for the task's
    /// type. Fails with `QueueFull` once `max_size` non-terminal tasks are
    /// held; nothing is dropped silently.
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type()), err)]
    pub async fn enqueue(&self, mut task: Task) -> DomainResult<Uuid> {
        task.validate().map_err(DomainError::ValidationFailed)?;

        let task_type = task.task_type();
        task.status = TaskStatus::Pending;
        task.lease = None;
        task.max_attempts = self.retry.max_attempts_for(task_type);
        task.updated_at = Utc::now();

        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(DomainError::ValidationFailed(format!(
                "Task {} is already queued",
                task.id
            )));
        }
        if state.active_count() >= self.config.max_size {
            return Err(DomainError::QueueFull {
                max_size: self.config.max_size,
            });
        }

        let id = task.id;
        state.counters_mut(task_type).waiting += 1;
        state.tasks.insert(id, task);
        drop(state);

        self.available.notify_one();
        debug!(%id, "Task enqueued");
        Ok(id)
    }

    /// Lease the best waiting task whose type is in `task_types` (all types
    /// when empty).
    ///
    /// Best means highest effective priority (base plus aging), then oldest
    /// `created_at`. Returns `None` when nothing is eligible.
    #[instrument(skip(self, task_types), level = "debug")]
    pub async fn lease(
        &self,
        worker_id: &str,
        task_types: &[TaskType],
        lease_duration: Duration,
    ) -> DomainResult<Option<Task>> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| DomainError::ValidationFailed(format!("Invalid lease duration: {e}")))?;

        let mut state = self.state.lock().await;

        let chosen = state
            .tasks
            .values()
            .filter(|t| t.status.is_waiting())
            .filter(|t| task_types.is_empty() || task_types.contains(&t.task_type()))
            .max_by(|a, b| self.compare_for_lease(a, b, now))
            .map(|t| t.id);

        let Some(task_id) = chosen else {
            return Ok(None);
        };

        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(DomainError::TaskNotFound(task_id))?;
        task.transition_to(TaskStatus::Leased)
            .map_err(|reason| DomainError::InvalidStateTransition {
                from: task.status.to_string(),
                to: TaskStatus::Leased.to_string(),
                reason,
            })?;
        task.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            token: Uuid::new_v4(),
            leased_at: now,
            expires_at,
            committing: false,
        });
        let leased = task.clone();

        let counters = state.counters_mut(leased.task_type());
        counters.waiting = counters.waiting.saturating_sub(1);
        counters.held += 1;

        debug!(task_id = %leased.id, task_type = %leased.task_type(), "Task leased");
        Ok(Some(leased))
    }

    /// `Ordering::Greater` means `a` should be leased before `b`.
    fn compare_for_lease(&self, a: &Task, b: &Task, now: DateTime<Utc>) -> Ordering {
        let pa = self.priority.calculate(a, now);
        let pb = self.priority.calculate(b, now);
        pa.total_cmp(&pb)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.id.cmp(&a.id))
    }

    /// Move a leased task to `running`.
    pub async fn mark_running(&self, task_id: Uuid, token: Uuid) -> DomainResult<()> {
        let mut state = self.state.lock().await;
        let task = state.held_task_mut(task_id, token, Utc::now())?;
        if task.status == TaskStatus::Leased {
            task.transition_to(TaskStatus::Running)
                .map_err(|reason| DomainError::InvalidStateTransition {
                    from: TaskStatus::Leased.to_string(),
                    to: TaskStatus::Running.to_string(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// Fence the task for its lease holder before any result is written.
    ///
    /// Succeeds only while `token` holds a live lease. From then on the
    /// lease cannot expire or be reclaimed, so the holder's side effects and
    /// its `complete`/`fail` call belong to the same attempt. Calling it
    /// again with the same token is a no-op.
    pub async fn begin_commit(&self, task_id: Uuid, token: Uuid) -> DomainResult<()> {
        let mut state = self.state.lock().await;
        let task = state.held_task_mut(task_id, token, Utc::now())?;
        if let Some(lease) = task.lease.as_mut() {
            lease.committing = true;
        }
        Ok(())
    }

    /// Mark the task `succeeded` and store its outcome.
    #[instrument(skip(self, outcome), err(level = "warn"))]
    pub async fn complete(&self, task_id: Uuid, token: Uuid, outcome: TaskOutcome) -> DomainResult<Task> {
        let mut state = self.state.lock().await;
        let task = state.held_task_mut(task_id, token, Utc::now())?;

        if outcome.task_type() != task.task_type() {
            return Err(DomainError::ValidationFailed(format!(
                "{} task {} returned a {} outcome",
                task.task_type(),
                task_id,
                outcome.task_type()
            )));
        }

        task.transition_to(TaskStatus::Succeeded)
            .map_err(|reason| DomainError::InvalidStateTransition {
                from: task.status.to_string(),
                to: TaskStatus::Succeeded.to_string(),
                reason,
            })?;
        task.result = Some(outcome);
        let done = task.clone();

        let counters = state.counters_mut(done.task_type());
        counters.held = counters.held.saturating_sub(1);
        counters.succeeded += 1;
        drop(state);

        self.settled.notify_waiters();
        debug!(%task_id, "Task succeeded");
        Ok(done)
    }

    /// Record a failed attempt.
    ///
    /// The attempt counter is incremented; the task is requeued as
    /// `retrying` while attempts remain and the error is retryable,
    /// otherwise it becomes terminal `failed`. Returns the updated task.
    #[instrument(skip(self, error), fields(reason = %error))]
    pub async fn fail(&self, task_id: Uuid, token: Uuid, error: &DomainError) -> DomainResult<Task> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.held_task_mut(task_id, token, now)?;
        let task = self.record_failure(&mut state, task_id, &error.to_string(), error.is_retryable())?;
        drop(state);

        self.after_failure(&task);
        Ok(task)
    }

    /// Requeue every held task whose lease has expired, through the same
    /// path as `fail`. Returns the reclaimed tasks in their new state.
    pub async fn reclaim_expired_leases(&self) -> DomainResult<Vec<Task>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let expired: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| t.lease_expired(now))
            .map(|t| t.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for task_id in expired {
            let worker_id = state
                .tasks
                .get(&task_id)
                .and_then(|t| t.lease.as_ref())
                .map_or_else(String::new, |l| l.worker_id.clone());
            let reason = format!("lease held by {worker_id} expired");
            let task = self.record_failure(&mut state, task_id, &reason, true)?;
            state.counters_mut(task.task_type()).reclaimed += 1;
            warn!(%task_id, %worker_id, status = %task.status, "Reclaimed expired lease");
            reclaimed.push(task);
        }
        drop(state);

        for task in &reclaimed {
            self.after_failure(task);
        }
        Ok(reclaimed)
    }

    fn record_failure(
        &self,
        state: &mut QueueState,
        task_id: Uuid,
        reason: &str,
        retryable: bool,
    ) -> DomainResult<Task> {
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(DomainError::TaskNotFound(task_id))?;

        task.attempt_count += 1;
        task.last_error = Some(reason.to_string());
        let next = if retryable && task.has_attempts_left() {
            TaskStatus::Retrying
        } else {
            TaskStatus::Failed
        };
        let from = task.status;
        task.transition_to(next)
            .map_err(|reason| DomainError::InvalidStateTransition {
                from: from.to_string(),
                to: next.to_string(),
                reason,
            })?;
        let task = task.clone();

        let counters = state.counters_mut(task.task_type());
        counters.held = counters.held.saturating_sub(1);
        counters.failed_attempts += 1;
        if next == TaskStatus::Failed {
            counters.terminal_failures += 1;
        } else {
            counters.waiting += 1;
        }
        Ok(task)
    }

    fn after_failure(&self, task: &Task) {
        if task.status == TaskStatus::Failed {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type(),
                attempts = task.attempt_count,
                error = task.last_error.as_deref().unwrap_or(""),
                "Task failed terminally"
            );
            self.settled.notify_waiters();
        } else {
            debug!(task_id = %task.id, attempt = task.attempt_count, "Task will be retried");
            self.available.notify_one();
        }
    }

    pub async fn get(&self, task_id: Uuid) -> Option<Task> {
        self.state.lock().await.tasks.get(&task_id).cloned()
    }

    /// Non-terminal task count.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active_count()
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock().await;
        let mut metrics = QueueMetrics {
            max_size: self.config.max_size,
            by_type: state.counters.clone(),
            ..QueueMetrics::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => metrics.pending += 1,
                TaskStatus::Leased => metrics.leased += 1,
                TaskStatus::Running => metrics.running += 1,
                TaskStatus::Retrying => metrics.retrying += 1,
                TaskStatus::Succeeded => metrics.succeeded += 1,
                TaskStatus::Failed => metrics.failed += 1,
            }
        }
        metrics
    }

    /// Copy of every task, for checkpoints.
    pub async fn snapshot_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Replace the queue contents with checkpointed tasks.
    ///
    /// Leased and running tasks had holders that no longer exist; they go
    /// back to `pending` with their lease cleared and no attempt consumed.
    pub async fn restore(&self, tasks: Vec<Task>) {
        let mut state = self.state.lock().await;
        let mut restored = QueueState::default();
        let mut requeued = 0usize;

        for mut task in tasks {
            if task.status.is_held() {
                task.status = TaskStatus::Pending;
                task.lease = None;
                task.updated_at = Utc::now();
                requeued += 1;
            }

            let counters = restored.counters_mut(task.task_type());
            counters.failed_attempts += u64::from(task.attempt_count);
            match task.status {
                TaskStatus::Succeeded => counters.succeeded += 1,
                TaskStatus::Failed => counters.terminal_failures += 1,
                _ => counters.waiting += 1,
            }
            restored.tasks.insert(task.id, task);
        }

        let total = restored.tasks.len();
        *state = restored;
        drop(state);

        info!(tasks = total, requeued, "Task queue restored");
        self.available.notify_waiters();
        self.settled.notify_waiters();
    }

    /// Wait up to `timeout` for a task to become leasable. Returns `false`
    /// on timeout. Callers still have to race for the lease.
    pub async fn wait_for_task(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.available.notified())
            .await
            .is_ok()
    }

    /// Wait until no non-terminal task remains, up to `timeout`.
    /// Returns whether the queue drained.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active_count().await == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active_count().await == 0;
            }
        }
    }
}
