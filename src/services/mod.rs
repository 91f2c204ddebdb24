//! Core services: Context Memory, the task queue and the tournament.
//!
//! Services own the system's invariants and are shared between the
//! application-level loops (workers, supervisor, tournament scheduler).

pub mod checkpointer;
pub mod context_memory;
pub mod elo;
pub mod hypothesis_registry;
pub mod priority_calculator;
pub mod statistics;
pub mod task_queue;
pub mod tournament;

pub use checkpointer::Checkpointer;
pub use context_memory::ContextMemory;
pub use elo::EloCalculator;
pub use hypothesis_registry::HypothesisRegistry;
pub use priority_calculator::PriorityCalculator;
pub use statistics::StatisticsCollector;
pub use task_queue::TaskQueue;
pub use tournament::{build_standings, MatchApplication, Tournament};
