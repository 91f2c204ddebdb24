use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::task::TaskType;

/// Main configuration structure for cosci
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Task queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry policy configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Tournament configuration
    #[serde(default)]
    pub tournament: TournamentConfig,

    /// Supervisor configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Initial number of concurrent workers
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Lower bound when the supervisor scales down
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,

    /// Upper bound when the supervisor scales up
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// How long an idle worker waits before polling the queue again
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const fn default_pool_size() -> usize {
    4
}

const fn default_min_pool_size() -> usize {
    1
}

const fn default_max_pool_size() -> usize {
    32
}

const fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            min_pool_size: default_min_pool_size(),
            max_pool_size: default_max_pool_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Maximum number of non-terminal tasks held at once
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// Lease duration granted to a worker
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,

    /// Interval of the expired-lease sweep
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,

    /// Priority units gained per minute spent waiting
    #[serde(default = "default_aging_per_minute")]
    pub aging_per_minute: f64,

    /// Cap on the aging boost
    #[serde(default = "default_max_aging_boost")]
    pub max_aging_boost: f64,
}

const fn default_queue_max_size() -> usize {
    1000
}

const fn default_lease_duration_secs() -> u64 {
    300
}

const fn default_reclaim_interval_ms() -> u64 {
    1000
}

const fn default_aging_per_minute() -> f64 {
    0.1
}

const fn default_max_aging_boost() -> f64 {
    5.0
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            lease_duration_secs: default_lease_duration_secs(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            aging_per_minute: default_aging_per_minute(),
            max_aging_boost: default_max_aging_boost(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Attempts per task when no per-type override exists
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Per task type attempt overrides
    #[serde(default)]
    pub max_attempts: BTreeMap<TaskType, u32>,

    /// Initial backoff for storage retries in milliseconds
    #[serde(default = "default_storage_initial_backoff_ms")]
    pub storage_initial_backoff_ms: u64,

    /// Maximum backoff for storage retries in milliseconds
    #[serde(default = "default_storage_max_backoff_ms")]
    pub storage_max_backoff_ms: u64,

    /// Give up on a storage operation after this long
    #[serde(default = "default_storage_max_elapsed_ms")]
    pub storage_max_elapsed_ms: u64,

    /// Compare-and-set attempts before `ConcurrentModification`
    #[serde(default = "default_cas_max_retries")]
    pub cas_max_retries: u32,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_storage_initial_backoff_ms() -> u64 {
    10
}

const fn default_storage_max_backoff_ms() -> u64 {
    1000
}

const fn default_storage_max_elapsed_ms() -> u64 {
    5000
}

const fn default_cas_max_retries() -> u32 {
    16
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            max_attempts: BTreeMap::new(),
            storage_initial_backoff_ms: default_storage_initial_backoff_ms(),
            storage_max_backoff_ms: default_storage_max_backoff_ms(),
            storage_max_elapsed_ms: default_storage_max_elapsed_ms(),
            cas_max_retries: default_cas_max_retries(),
        }
    }
}

impl RetryConfig {
    /// Attempt budget for a task type.
    pub fn max_attempts_for(&self, task_type: TaskType) -> u32 {
        self.max_attempts
            .get(&task_type)
            .copied()
            .unwrap_or(self.default_max_attempts)
    }
}

/// Tournament configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TournamentConfig {
    /// Elo K-factor
    #[serde(default = "default_k_factor")]
    pub k_factor: f64,

    /// Rating assigned on enrollment
    #[serde(default = "default_initial_rating")]
    pub initial_rating: f64,

    /// Matches between two hypotheses ranked at or above this cutoff are
    /// multi-turn debates
    #[serde(default = "default_multi_turn_rank_cutoff")]
    pub multi_turn_rank_cutoff: usize,

    /// Unresolved matches allowed in flight
    #[serde(default = "default_max_pending_matches")]
    pub max_pending_matches: usize,

    /// Interval of the match scheduling loop
    #[serde(default = "default_schedule_interval_ms")]
    pub schedule_interval_ms: u64,

    /// Queue priority of rank-match tasks
    #[serde(default = "default_match_priority")]
    pub match_priority: u8,
}

const fn default_k_factor() -> f64 {
    32.0
}

const fn default_initial_rating() -> f64 {
    1200.0
}

const fn default_multi_turn_rank_cutoff() -> usize {
    5
}

const fn default_max_pending_matches() -> usize {
    8
}

const fn default_schedule_interval_ms() -> u64 {
    1000
}

const fn default_match_priority() -> u8 {
    5
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            k_factor: default_k_factor(),
            initial_rating: default_initial_rating(),
            multi_turn_rank_cutoff: default_multi_turn_rank_cutoff(),
            max_pending_matches: default_max_pending_matches(),
            schedule_interval_ms: default_schedule_interval_ms(),
            match_priority: default_match_priority(),
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Interval between statistics/allocation rounds
    #[serde(default = "default_statistics_interval_secs")]
    pub statistics_interval_secs: u64,

    /// Interval between periodic checkpoints
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// How long Terminal waits for in-flight work
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Tasks enqueued per round while Active
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Fraction of `batch_size` enqueued while Converging
    #[serde(default = "default_converging_batch_fraction")]
    pub converging_batch_fraction: f64,

    /// Generation is favored until this many hypotheses exist
    #[serde(default = "default_min_hypotheses")]
    pub min_hypotheses: usize,

    /// Base sampling weight per task type (rank-match is owned by the
    /// tournament and ignored here)
    #[serde(default = "default_sampling_weights")]
    pub sampling_weights: BTreeMap<TaskType, f64>,

    /// Convergence detection
    #[serde(default)]
    pub convergence: ConvergenceConfig,

    /// Resource budget
    #[serde(default)]
    pub budget: BudgetConfig,
}

const fn default_statistics_interval_secs() -> u64 {
    30
}

const fn default_checkpoint_interval_secs() -> u64 {
    300
}

const fn default_drain_timeout_secs() -> u64 {
    60
}

const fn default_batch_size() -> usize {
    4
}

const fn default_converging_batch_fraction() -> f64 {
    0.25
}

const fn default_min_hypotheses() -> usize {
    10
}

fn default_sampling_weights() -> BTreeMap<TaskType, f64> {
    BTreeMap::from([
        (TaskType::Generate, 4.0),
        (TaskType::Review, 3.0),
        (TaskType::Evolve, 2.0),
        (TaskType::Cluster, 0.5),
        (TaskType::MetaReview, 0.5),
    ])
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            statistics_interval_secs: default_statistics_interval_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            batch_size: default_batch_size(),
            converging_batch_fraction: default_converging_batch_fraction(),
            min_hypotheses: default_min_hypotheses(),
            sampling_weights: default_sampling_weights(),
            convergence: ConvergenceConfig::default(),
            budget: BudgetConfig::default(),
        }
    }
}

/// Convergence detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConvergenceConfig {
    /// How many leaders are tracked
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Largest Elo movement still counted as stable
    #[serde(default = "default_convergence_threshold")]
    pub threshold: f64,

    /// Consecutive stable intervals before Converging
    #[serde(default = "default_convergence_window")]
    pub window: usize,

    /// Further stable intervals before Terminal
    #[serde(default = "default_terminal_after")]
    pub terminal_after: usize,
}

const fn default_top_n() -> usize {
    5
}

const fn default_convergence_threshold() -> f64 {
    5.0
}

const fn default_convergence_window() -> usize {
    3
}

const fn default_terminal_after() -> usize {
    3
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            threshold: default_convergence_threshold(),
            window: default_convergence_window(),
            terminal_after: default_terminal_after(),
        }
    }
}

/// Resource budget; unset limits are unbounded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BudgetConfig {
    /// Total tasks the supervisor and tournament may enqueue
    #[serde(default)]
    pub max_tasks: Option<u64>,

    /// Wall-clock limit for a run
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
}

/// Context Memory backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Where Context Memory lives
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Checkpoint file
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,
}

const fn default_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_database_path() -> String {
    ".cosci/context.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

fn default_checkpoint_path() -> String {
    ".cosci/checkpoint.json".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            checkpoint_path: default_checkpoint_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
