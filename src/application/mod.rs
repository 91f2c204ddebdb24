pub mod collaborator_registry;
pub mod orchestrator;
pub mod outcome_recorder;
pub mod supervisor;
pub mod worker_pool;

pub use collaborator_registry::CollaboratorRegistry;
pub use orchestrator::Orchestrator;
pub use outcome_recorder::OutcomeRecorder;
pub use supervisor::{Supervisor, SupervisorHandle};
pub use worker_pool::WorkerPool;
