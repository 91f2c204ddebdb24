//! In-process Context Memory backend.

pub mod context_store;

pub use context_store::InMemoryContextStore;
