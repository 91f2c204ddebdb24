//! Cosci - orchestration core for a multi-agent research hypothesis system
//!
//! Cosci schedules work for external collaborators (generation, review,
//! ranking debates, evolution, clustering, meta-review), keeps their shared
//! state in a versioned Context Memory, and ranks hypotheses through an Elo
//! tournament until the leaderboard converges.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): models, the error taxonomy and port traits
//! - **Adapter Layer** (`adapters`): in-memory and SQLite Context Memory
//!   stores, the checkpoint file store
//! - **Service Layer** (`services`): Context Memory, task queue, tournament,
//!   statistics and checkpoints
//! - **Application Layer** (`application`): worker pool, supervisor and the
//!   orchestrator wiring them together
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): read-only inspection commands
//!
//! # Example
//!
//! ```no_run
//! use cosci::application::{CollaboratorRegistry, Orchestrator};
//! use cosci::infrastructure::config::ConfigLoader;
//! use cosci::infrastructure::logging::{LogConfig, LoggerImpl};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let _logger = LoggerImpl::init(&LogConfig::from(&config.logging))?;
//!     let collaborators = CollaboratorRegistry::new(); // register agents here
//!     let orchestrator = Orchestrator::from_config(config, collaborators).await?;
//!     orchestrator.restore_from_checkpoint().await?;
//!     let stats = orchestrator.run().await?;
//!     println!("{} hypotheses ranked", stats.hypothesis_count);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{CollaboratorRegistry, Orchestrator, SupervisorHandle};
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    Config, Hypothesis, HypothesisDraft, Statistics, SupervisorState, Task, TaskOutcome,
    TaskPayload, TaskStatus, TaskType,
};
pub use domain::ports::{CheckpointStore, Collaborator, ContextStore};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{ContextMemory, TaskQueue, Tournament};
