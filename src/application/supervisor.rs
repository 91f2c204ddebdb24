//! Supervisor: statistics, allocation and termination.
//!
//! A single periodic loop drives the state machine
//!
//! ```text
//! Active ──(top-N Elo stable for `window` intervals)──▶ Converging
//!   │                                                      │
//!   └──(budget spent | stop())──▶ Terminal ◀──(stable `terminal_after` more)
//! ```
//!
//! While Active it enqueues a batch of work every statistics interval,
//! sampled from per-type weights derived from the latest statistics.
//! Converging enqueues a reduced batch. Terminal enqueues nothing, halts
//! match scheduling, waits for the queue to drain and writes a final
//! checkpoint.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::application::WorkerPool;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Hypothesis, Leader, Statistics, SupervisorConfig, SupervisorState, Task, TaskPayload,
    TaskSource, TaskType,
};
use crate::services::{
    Checkpointer, HypothesisRegistry, StatisticsCollector, TaskQueue, Tournament,
};

/// Outcomes a type needs before its failure rate can zero its weight.
const MIN_OUTCOMES_FOR_FAILURE_RATE: u64 = 10;
const MAX_FAILURE_RATE: f64 = 0.5;
/// Tournament completion above which evolution is favored.
const EVOLVE_COMPLETION_THRESHOLD: f64 = 0.8;

/// Control handle for a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    stop_flag: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    state: watch::Receiver<SupervisorState>,
}

impl SupervisorHandle {
    /// Request the Terminal state. In-flight work still drains.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.stop_signal.notify_one();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Wait until the supervisor reaches `target`.
    pub async fn wait_for(&mut self, target: SupervisorState) -> bool {
        self.state.wait_for(|s| *s == target).await.is_ok()
    }
}

/// Tracks how long the top of the leaderboard has been stable.
#[derive(Debug, Default)]
struct ConvergenceTracker {
    previous: Option<HashMap<Uuid, f64>>,
    stable_intervals: usize,
}

impl ConvergenceTracker {
    /// Feed one interval's leaders; returns the current stable streak.
    ///
    /// An interval is stable when the same hypotheses lead, every leader
    /// has played, and no leader's Elo moved more than `threshold`.
    fn observe(&mut self, leaders: &[Leader], threshold: f64) -> usize {
        let current: HashMap<Uuid, f64> = leaders
            .iter()
            .map(|l| (l.hypothesis_id, l.elo_rating))
            .collect();
        let played = !leaders.is_empty() && leaders.iter().all(|l| l.match_count > 0);

        let stable = played
            && self.previous.as_ref().is_some_and(|prev| {
                prev.len() == current.len()
                    && current.iter().all(|(id, elo)| {
                        prev.get(id)
                            .is_some_and(|before| (elo - before).abs() <= threshold)
                    })
            });

        self.stable_intervals = if stable { self.stable_intervals + 1 } else { 0 };
        self.previous = Some(current);
        self.stable_intervals
    }
}

/// Periodic supervising loop. One per system.
pub struct Supervisor {
    config: SupervisorConfig,
    queue: Arc<TaskQueue>,
    tournament: Arc<Tournament>,
    registry: HypothesisRegistry,
    statistics: StatisticsCollector,
    checkpointer: Checkpointer,
    pool: Arc<WorkerPool>,
    state_tx: watch::Sender<SupervisorState>,
    stop_flag: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    convergence: Mutex<ConvergenceTracker>,
    rng: Mutex<StdRng>,
    rounds: AtomicU64,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SupervisorConfig,
        queue: Arc<TaskQueue>,
        tournament: Arc<Tournament>,
        registry: HypothesisRegistry,
        statistics: StatisticsCollector,
        checkpointer: Checkpointer,
        pool: Arc<WorkerPool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Active);
        Self {
            config,
            queue,
            tournament,
            registry,
            statistics,
            checkpointer,
            pool,
            state_tx,
            stop_flag: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            convergence: Mutex::new(ConvergenceTracker::default()),
            rng: Mutex::new(StdRng::from_os_rng()),
            rounds: AtomicU64::new(0),
        }
    }

    /// Deterministic task sampling for tests.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            stop_flag: self.stop_flag.clone(),
            stop_signal: self.stop_signal.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: SupervisorState, reason: &str) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            return false;
        }
        self.state_tx.send_replace(next);
        info!(from = %current, to = %next, reason, "Supervisor state changed");
        true
    }

    /// Run until Terminal, drain, and return the final statistics.
    pub async fn run(&self) -> DomainResult<Statistics> {
        let started = Instant::now();
        let stats_period = Duration::from_secs(self.config.statistics_interval_secs.max(1));
        let checkpoint_period = Duration::from_secs(self.config.checkpoint_interval_secs.max(1));

        let mut stats_ticker = interval_at(started, stats_period);
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut checkpoint_ticker = interval_at(started + checkpoint_period, checkpoint_period);
        checkpoint_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(state = %self.state(), "Supervisor started");

        while self.state() != SupervisorState::Terminal {
            tokio::select! {
                _ = stats_ticker.tick() => {
                    if let Err(e) = self.round(started.elapsed()).await {
                        warn!(error = %e, "Supervisor round failed");
                    }
                }
                _ = checkpoint_ticker.tick() => {
                    if let Err(e) = self.checkpointer.checkpoint("periodic").await {
                        warn!(error = %e, "Periodic checkpoint failed");
                    }
                }
                () = self.stop_signal.notified() => {
                    self.enter_terminal("stop requested").await;
                }
            }
        }

        self.drain(started.elapsed()).await
    }

    /// One statistics interval: publish, check termination, allocate.
    #[instrument(skip(self), fields(round = tracing::field::Empty), err)]
    pub async fn round(&self, elapsed: Duration) -> DomainResult<Statistics> {
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("round", round);

        let stats = self
            .statistics
            .collect(self.state(), self.pool.stats().await, elapsed)
            .await?;
        self.statistics.publish(&stats).await?;
        self.log_health(&stats);

        if self.stop_flag.load(Ordering::Acquire) {
            self.enter_terminal("stop requested").await;
            return Ok(stats);
        }
        if let Some(reason) = self.budget_exhausted(&stats, elapsed) {
            self.enter_terminal(&reason).await;
            return Ok(stats);
        }

        let streak = self
            .convergence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(&stats.leaders, self.config.convergence.threshold);
        let window = self.config.convergence.window;
        match self.state() {
            SupervisorState::Active if streak >= window => {
                self.transition(SupervisorState::Converging, "leaderboard stable");
            }
            SupervisorState::Converging
                if streak >= window + self.config.convergence.terminal_after =>
            {
                self.enter_terminal("sustained convergence").await;
                return Ok(stats);
            }
            _ => {}
        }

        let weights = self.sampling_weights(&stats);
        let enqueued = self.enqueue_batch(&stats, &weights, round).await?;
        self.rebalance_pool(&stats).await;
        debug!(enqueued, state = %self.state(), "Allocation round complete");
        Ok(stats)
    }

    fn log_health(&self, stats: &Statistics) {
        let terminal = stats.terminal_failures();
        if stats.storage_errors > 0 || terminal > 0 {
            warn!(
                storage_errors = stats.storage_errors,
                terminal_failures = terminal,
                "Degraded health"
            );
        }
        info!(
            state = %stats.state,
            hypotheses = stats.hypothesis_count,
            best_elo = ?stats.best_elo,
            completion = stats.tournament.completion_rate(),
            waiting = stats.queue.waiting(),
            in_flight = stats.queue.in_flight(),
            "Statistics"
        );
    }

    fn budget_exhausted(&self, stats: &Statistics, elapsed: Duration) -> Option<String> {
        let budget = &self.config.budget;
        if let Some(max) = budget.max_tasks {
            if stats.tasks_enqueued as u64 >= max {
                return Some(format!("task budget of {max} consumed"));
            }
        }
        if let Some(max) = budget.max_runtime_secs {
            if elapsed.as_secs() >= max {
                return Some(format!("runtime budget of {max}s consumed"));
            }
        }
        None
    }

    /// Per-type sampling weights for this round.
    pub fn sampling_weights(&self, stats: &Statistics) -> BTreeMap<TaskType, f64> {
        allocation_weights(&self.config, stats)
    }

    fn batch_size(&self, stats: &Statistics) -> usize {
        let base = self.config.batch_size;
        let size = match self.state() {
            SupervisorState::Active => base,
            SupervisorState::Converging => {
                (base as f64 * self.config.converging_batch_fraction.clamp(0.0, 1.0)).ceil()
                    as usize
            }
            SupervisorState::Terminal => 0,
        };
        match self.config.budget.max_tasks {
            Some(max) => size.min(max.saturating_sub(stats.tasks_enqueued as u64) as usize),
            None => size,
        }
    }

    /// Enqueue one round of supervisor work. Stops quietly when the queue
    /// pushes back.
    async fn enqueue_batch(
        &self,
        stats: &Statistics,
        weights: &BTreeMap<TaskType, f64>,
        round: u64,
    ) -> DomainResult<usize> {
        let size = self.batch_size(stats);
        if size == 0 {
            return Ok(0);
        }

        let types = self.sample_types(weights, size);
        if types.is_empty() {
            return Ok(0);
        }

        let eligible = self.registry.eligible().await?;
        let reviewed = self.statistics.reviewed_ids().await?;
        let mut unreviewed: Vec<&Hypothesis> =
            eligible.iter().filter(|h| !reviewed.contains(&h.id)).collect();

        let mut enqueued = 0;
        for task_type in types {
            let Some(payload) = self
                .payload_for(task_type, stats, &eligible, &mut unreviewed, round)
                .await?
            else {
                continue;
            };
            let task = Task::new(payload)
                .with_priority(default_priority(task_type))
                .with_source(TaskSource::Supervisor);

            match self.queue.enqueue(task).await {
                Ok(_) => enqueued += 1,
                Err(DomainError::QueueFull { max_size }) => {
                    debug!(max_size, enqueued, "Queue full, throttling this round");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(enqueued)
    }

    fn sample_types(&self, weights: &BTreeMap<TaskType, f64>, count: usize) -> Vec<TaskType> {
        let total: f64 = weights.values().sum();
        if total <= 0.0 {
            return Vec::new();
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut picked = Vec::with_capacity(count);
        for _ in 0..count {
            let mut target = rng.random::<f64>() * total;
            let mut choice = None;
            for (task_type, weight) in weights {
                if *weight <= 0.0 {
                    continue;
                }
                choice = Some(*task_type);
                if target < *weight {
                    break;
                }
                target -= weight;
            }
            picked.extend(choice);
        }
        picked
    }

    async fn payload_for(
        &self,
        task_type: TaskType,
        stats: &Statistics,
        eligible: &[Hypothesis],
        unreviewed: &mut Vec<&Hypothesis>,
        round: u64,
    ) -> DomainResult<Option<TaskPayload>> {
        let payload = match task_type {
            TaskType::Generate => Some(TaskPayload::Generate {
                context: json!({
                    "round": round,
                    "existing_hypotheses": stats.hypothesis_count,
                }),
            }),
            TaskType::Review => {
                let target = if unreviewed.is_empty() {
                    None
                } else {
                    Some(unreviewed.remove(0).clone())
                };
                target.map(|hypothesis| TaskPayload::Review {
                    hypothesis,
                    context: json!({ "round": round }),
                })
            }
            TaskType::Evolve => {
                let mut parents = Vec::new();
                for leader in stats.leaders.iter().take(2) {
                    if let Some(h) = self.registry.get(leader.hypothesis_id).await? {
                        parents.push(h);
                    }
                }
                (!parents.is_empty()).then(|| TaskPayload::Evolve {
                    parents,
                    context: json!({ "round": round }),
                })
            }
            TaskType::Cluster => (eligible.len() >= 2).then(|| TaskPayload::Cluster {
                hypotheses: eligible.to_vec(),
            }),
            TaskType::MetaReview => Some(TaskPayload::MetaReview {
                context: json!({
                    "round": round,
                    "leaders": stats.leaders,
                    "resolved_matches": stats.tournament.resolved_matches,
                }),
            }),
            TaskType::RankMatch => None,
        };
        Ok(payload)
    }

    /// Size the pool to the backlog.
    async fn rebalance_pool(&self, stats: &Statistics) {
        let (min, max) = self.pool.bounds();
        let target = pool_target(stats, min, max);
        if target != stats.workers.configured {
            self.pool.resize(target).await;
        }
    }

    async fn enter_terminal(&self, reason: &str) {
        if self.state() == SupervisorState::Terminal {
            return;
        }
        if let Err(e) = self.checkpointer.checkpoint("entering terminal").await {
            warn!(error = %e, "Checkpoint before terminal failed");
        }
        self.tournament.halt();
        self.transition(SupervisorState::Terminal, reason);
    }

    /// Wait for in-flight work, then publish final statistics and write the
    /// final checkpoint.
    async fn drain(&self, elapsed: Duration) -> DomainResult<Statistics> {
        let timeout = Duration::from_secs(self.config.drain_timeout_secs);
        if self.queue.wait_until_drained(timeout).await {
            info!("Queue drained");
        } else {
            warn!(
                remaining = self.queue.active_count().await,
                "Drain timeout reached with work outstanding"
            );
        }

        let stats = self
            .statistics
            .collect(SupervisorState::Terminal, self.pool.stats().await, elapsed)
            .await?;
        self.statistics.publish(&stats).await?;
        self.checkpointer.checkpoint("final").await?;
        info!(
            hypotheses = stats.hypothesis_count,
            best_elo = ?stats.best_elo,
            resolved_matches = stats.tournament.resolved_matches,
            "Supervisor finished"
        );
        Ok(stats)
    }
}

/// Sampling weights derived from the configured base weights.
///
/// Rank-match work belongs to the tournament and never gets a weight.
/// Generation is boosted below `min_hypotheses`, review while hypotheses
/// await one, evolution once most possible matches are resolved. Types with
/// too many terminal failures drop to zero.
pub fn allocation_weights(
    config: &SupervisorConfig,
    stats: &Statistics,
) -> BTreeMap<TaskType, f64> {
    let mut weights: BTreeMap<TaskType, f64> = config
        .sampling_weights
        .iter()
        .filter(|(t, _)| **t != TaskType::RankMatch)
        .map(|(t, w)| (*t, if w.is_finite() { w.max(0.0) } else { 0.0 }))
        .collect();
    let mut scale = |t: TaskType, factor: f64| {
        if let Some(w) = weights.get_mut(&t) {
            *w *= factor;
        }
    };

    let active = stats.active_hypotheses;
    if active < config.min_hypotheses {
        scale(TaskType::Generate, 3.0);
    }
    if stats.unreviewed_hypotheses > 0 {
        scale(TaskType::Review, 2.0);
    }
    if active >= 2 && stats.tournament.completion_rate() >= EVOLVE_COMPLETION_THRESHOLD {
        scale(TaskType::Evolve, 2.0);
    }
    if active == 0 {
        scale(TaskType::Review, 0.0);
        scale(TaskType::Evolve, 0.0);
        scale(TaskType::MetaReview, 0.0);
    }
    if active < 2 {
        scale(TaskType::Cluster, 0.0);
    }

    for (task_type, metrics) in &stats.queue.by_type {
        let outcomes = metrics.succeeded + metrics.terminal_failures;
        if outcomes >= MIN_OUTCOMES_FOR_FAILURE_RATE
            && metrics
                .terminal_failure_rate()
                .is_some_and(|rate| rate > MAX_FAILURE_RATE)
        {
            debug!(%task_type, "Task type disabled by failure rate");
            scale(*task_type, 0.0);
        }
    }
    weights
}

/// Workers wanted for the current backlog (waiting plus in flight),
/// clamped to the pool bounds.
pub fn pool_target(stats: &Statistics, min: usize, max: usize) -> usize {
    (stats.queue.waiting() + stats.queue.in_flight()).clamp(min, max)
}

fn default_priority(task_type: TaskType) -> u8 {
    match task_type {
        TaskType::Review => 6,
        TaskType::RankMatch | TaskType::Generate => 5,
        TaskType::Evolve => 4,
        TaskType::Cluster => 3,
        TaskType::MetaReview => 2,
    }
}
