pub mod config;
pub mod context;
pub mod hypothesis;
pub mod records;
pub mod statistics;
pub mod task;
pub mod tournament;

pub use config::{
    BudgetConfig, Config, ConvergenceConfig, LoggingConfig, QueueConfig, RetryConfig,
    StorageBackend, StorageConfig, SupervisorConfig, TournamentConfig, WorkerConfig,
};
pub use context::{CasOutcome, Checkpoint, ContextEntry, ABSENT_VERSION};
pub use hypothesis::{Hypothesis, HypothesisDraft, HypothesisStatus};
pub use records::{MetaReviewRecord, ReviewRecord, TaskRecord, TerminalFailure};
pub use statistics::{
    Leader, QueueMetrics, Statistics, SupervisorState, TournamentProgress, TypeMetrics,
    WorkerPoolStats,
};
pub use task::{Lease, Task, TaskOutcome, TaskPayload, TaskSource, TaskStatus, TaskType};
pub use tournament::{
    DebateDepth, Match, MatchResult, PairKey, PairingBook, Rating, RatingLedger, Standing,
};
