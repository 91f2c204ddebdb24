//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines async trait interfaces that adapters must implement:
//! - ContextStore: versioned key/value storage behind Context Memory
//! - Collaborator: external agents that execute task payloads
//! - CheckpointStore: durable snapshot publication
//!
//! These traits let the core stay independent of storage engines and of
//! whatever model provider the agents use.

pub mod checkpoint_store;
pub mod collaborator;
pub mod context_store;

pub use checkpoint_store::CheckpointStore;
pub use collaborator::Collaborator;
pub use context_store::ContextStore;
