use crate::domain::errors::DomainResult;
use crate::domain::models::{CasOutcome, ContextEntry};
use async_trait::async_trait;
use serde_json::Value;

/// Port for the versioned key/value store behind Context Memory.
///
/// There is deliberately no unconditional `set`: every mutation is a
/// compare-and-set against the version the writer last read. Version 0
/// stands for "absent", so creating a key is a CAS with `expected_version = 0`.
///
/// Implementations report I/O problems as `DomainError::StorageUnavailable`;
/// retrying them is the caller's business (see `ContextMemory`).
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Current entry for `key`, or `None` if it was never written.
    async fn get(&self, key: &str) -> DomainResult<Option<ContextEntry>>;

    /// Atomically replace the value of `key` if its stored version equals
    /// `expected_version`.
    ///
    /// # Returns
    ///
    /// * `Ok(CasOutcome::Applied(v))` - written, `v = expected_version + 1`
    /// * `Ok(CasOutcome::Conflict(v))` - stale expectation, `v` is the stored version
    /// * `Err` - storage failure; the write may not have happened
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> DomainResult<CasOutcome>;

    /// Keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> DomainResult<Vec<String>>;

    /// Consistent point-in-time copy of every entry.
    async fn snapshot(&self) -> DomainResult<Vec<ContextEntry>>;

    /// Replace all state with `entries`, keeping their versions.
    async fn restore(&self, entries: Vec<ContextEntry>) -> DomainResult<()>;
}
