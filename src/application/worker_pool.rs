//! Worker pool with lease-bounded execution.
//!
//! Manages concurrent workers using tokio primitives:
//! - one spawned task per worker, each leasing from the shared queue
//! - a broadcast channel for global shutdown
//! - per-worker retire flags so the pool can shrink without interrupting
//!   a task in flight

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::{CollaboratorRegistry, OutcomeRecorder};
use crate::domain::errors::DomainError;
use crate::domain::models::{
    QueueConfig, Task, TaskOutcome, TaskStatus, WorkerConfig, WorkerPoolStats,
};
use crate::services::TaskQueue;

/// State shared by every worker.
struct Shared {
    queue: Arc<TaskQueue>,
    collaborators: Arc<CollaboratorRegistry>,
    recorder: Arc<OutcomeRecorder>,
    lease_duration: Duration,
    poll_interval: Duration,
    live: AtomicUsize,
    busy: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
}

struct WorkerSlot {
    id: String,
    retire: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Bounded pool of workers executing leased tasks against collaborators.
///
/// # Examples
///
/// ```no_run
/// use cosci::application::{CollaboratorRegistry, OutcomeRecorder, WorkerPool};
/// use cosci::domain::models::{QueueConfig, WorkerConfig};
/// use cosci::services::TaskQueue;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example(queue: Arc<TaskQueue>, recorder: Arc<OutcomeRecorder>) {
/// let pool = WorkerPool::new(
///     queue,
///     Arc::new(CollaboratorRegistry::new()),
///     recorder,
///     &WorkerConfig::default(),
///     &QueueConfig::default(),
/// );
/// pool.start().await;
/// pool.resize(8).await;
/// println!("busy workers: {}", pool.stats().await.busy);
/// pool.shutdown(Duration::from_secs(5)).await;
/// # }
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    min_size: usize,
    max_size: usize,
    configured: AtomicUsize,
    next_index: AtomicUsize,
    workers: Mutex<Vec<WorkerSlot>>,
    stopping: AtomicBool,
    reclaim_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        collaborators: Arc<CollaboratorRegistry>,
        recorder: Arc<OutcomeRecorder>,
        workers: &WorkerConfig,
        queue_config: &QueueConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let min_size = workers.min_pool_size.max(1);
        let max_size = workers.max_pool_size.max(min_size);
        Self {
            shared: Arc::new(Shared {
                queue,
                collaborators,
                recorder,
                lease_duration: Duration::from_secs(queue_config.lease_duration_secs),
                poll_interval: Duration::from_millis(workers.poll_interval_ms.max(1)),
                live: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            min_size,
            max_size,
            configured: AtomicUsize::new(workers.pool_size.clamp(min_size, max_size)),
            next_index: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            reclaim_interval: Duration::from_millis(queue_config.reclaim_interval_ms.max(1)),
            shutdown_tx,
        }
    }

    /// Override the lease duration granted to workers.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.lease_duration = lease_duration;
        }
        self
    }

    /// Spawn the configured number of workers.
    pub async fn start(&self) {
        let target = self.configured.load(Ordering::SeqCst);
        self.resize(target).await;
    }

    /// Grow or shrink to `size`, clamped to the configured bounds.
    ///
    /// Retired workers finish the task they hold before exiting. Returns
    /// the size actually applied.
    pub async fn resize(&self, size: usize) -> usize {
        let size = size.clamp(self.min_size, self.max_size);
        if self.stopping.load(Ordering::SeqCst) {
            return self.configured.load(Ordering::SeqCst);
        }

        let mut workers = self.workers.lock().await;
        workers.retain(|w| !w.handle.is_finished());
        let current = workers.len();

        if size > current {
            for _ in current..size {
                workers.push(self.spawn_worker());
            }
        } else {
            for slot in workers.drain(size..) {
                slot.retire.store(true, Ordering::SeqCst);
                debug!(worker_id = %slot.id, "Worker retiring");
            }
        }

        let previous = self.configured.swap(size, Ordering::SeqCst);
        if previous != size || current != size {
            info!(from = current, to = size, "Worker pool resized");
        }
        size
    }

    fn spawn_worker(&self) -> WorkerSlot {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let id = format!("worker-{index}");
        let retire = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_worker(
            self.shared.clone(),
            id.clone(),
            retire.clone(),
            self.shutdown_tx.subscribe(),
        ));
        WorkerSlot { id, retire, handle }
    }

    pub async fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            configured: self.configured.load(Ordering::SeqCst),
            live: self.shared.live.load(Ordering::SeqCst),
            busy: self.shared.busy.load(Ordering::SeqCst),
            processed: self.shared.processed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min_size, self.max_size)
    }

    /// Periodically requeue tasks whose lease expired.
    ///
    /// Singleton loop; tasks failed terminally by a reclaim are recorded
    /// like any other terminal failure.
    pub async fn run_reclaimer(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.reclaim_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Lease reclaim loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.reclaim_once().await,
                _ = shutdown.recv() => {
                    info!("Lease reclaim loop received shutdown signal");
                    break;
                }
            }
        }
    }

    /// One reclaim sweep.
    pub async fn reclaim_once(&self) {
        let reclaimed = match self.shared.queue.reclaim_expired_leases().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Lease reclaim sweep failed");
                return;
            }
        };
        for task in reclaimed.iter().filter(|t| t.status == TaskStatus::Failed) {
            if let Err(e) = self.shared.recorder.record_terminal_failure(task).await {
                warn!(task_id = %task.id, error = %e, "Failed to record terminal failure");
            }
        }
    }

    /// Stop every worker, cancelling in-flight collaborator calls.
    ///
    /// Cancelled tasks keep their lease and are requeued by the reclaim
    /// sweep or by restoring a checkpoint.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping worker pool");
        let _ = self.shutdown_tx.send(());

        let slots: Vec<WorkerSlot> = self.workers.lock().await.drain(..).collect();
        let count = slots.len();
        let joined = tokio::time::timeout(timeout, async {
            for slot in slots {
                if let Err(e) = slot.handle.await {
                    warn!(worker_id = %slot.id, error = ?e, "Worker panicked");
                }
            }
        })
        .await;

        match joined {
            Ok(()) => info!(workers = count, "Worker pool stopped"),
            Err(_) => warn!(
                remaining = self.shared.live.load(Ordering::SeqCst),
                "Worker pool shutdown timeout"
            ),
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    worker_id: String,
    retire: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) {
    shared.live.fetch_add(1, Ordering::SeqCst);
    let task_types = shared.collaborators.task_types();
    debug!(%worker_id, "Worker started");

    loop {
        if retire.load(Ordering::SeqCst) {
            break;
        }
        match shutdown.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            _ => break,
        }

        match shared
            .queue
            .lease(&worker_id, &task_types, shared.lease_duration)
            .await
        {
            Ok(Some(task)) => {
                shared.busy.fetch_add(1, Ordering::SeqCst);
                let cancelled = tokio::select! {
                    () = shared.execute(&worker_id, task) => false,
                    _ = shutdown.recv() => true,
                };
                shared.busy.fetch_sub(1, Ordering::SeqCst);
                if cancelled {
                    info!(%worker_id, "In-flight task cancelled by shutdown");
                    break;
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = shared.queue.wait_for_task(shared.poll_interval) => {}
                    _ = shutdown.recv() => break,
                }
            }
            Err(e) => {
                warn!(%worker_id, error = %e, "Lease attempt failed");
                tokio::select! {
                    () = tokio::time::sleep(shared.poll_interval) => {}
                    _ = shutdown.recv() => break,
                }
            }
        }
    }

    shared.live.fetch_sub(1, Ordering::SeqCst);
    debug!(%worker_id, "Worker stopped");
}

impl Shared {
    /// Run one leased task to completion, failure or lease deadline.
    async fn execute(&self, worker_id: &str, task: Task) {
        let Some(lease) = task.lease.clone() else {
            warn!(task_id = %task.id, "Leased task carries no lease");
            return;
        };
        let token = lease.token;

        if let Err(e) = self.queue.mark_running(task.id, token).await {
            warn!(task_id = %task.id, error = %e, "Lost lease before starting");
            return;
        }

        let remaining = (lease.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let result = tokio::time::timeout(remaining, self.collaborators.execute(&task)).await;

        match result {
            Err(_) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    %worker_id,
                    task_id = %task.id,
                    task_type = %task.task_type(),
                    "Lease deadline passed, abandoning task"
                );
            }
            Ok(Ok(outcome)) => self.commit(worker_id, &task, token, outcome).await,
            Ok(Err(e)) => self.fail(worker_id, &task, token, &e).await,
        }
    }

    async fn commit(
        &self,
        worker_id: &str,
        task: &Task,
        token: Uuid,
        outcome: TaskOutcome,
    ) {
        if let Err(e) = self.queue.begin_commit(task.id, token).await {
            warn!(%worker_id, task_id = %task.id, error = %e, "Late result rejected");
            return;
        }

        if let Err(e) = self.recorder.record(task, &outcome).await {
            self.fail(worker_id, task, token, &e).await;
            return;
        }

        match self.queue.complete(task.id, token, outcome).await {
            Ok(_) => {
                self.processed.fetch_add(1, Ordering::SeqCst);
                debug!(%worker_id, task_id = %task.id, "Task completed");
            }
            Err(e @ DomainError::LeaseExpired { .. }) => {
                warn!(%worker_id, task_id = %task.id, error = %e, "Late result rejected");
            }
            Err(e) => {
                error!(%worker_id, task_id = %task.id, error = %e, "Failed to complete task");
            }
        }
    }

    async fn fail(&self, worker_id: &str, task: &Task, token: Uuid, error: &DomainError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        debug!(%worker_id, task_id = %task.id, error = %error, "Task attempt failed");

        match self.queue.fail(task.id, token, error).await {
            Ok(updated) if updated.status == TaskStatus::Failed => {
                if let Err(e) = self.recorder.record_terminal_failure(&updated).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record terminal failure");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%worker_id, task_id = %task.id, error = %e, "Failure report rejected");
            }
        }
    }
}
