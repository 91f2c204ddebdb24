//! In-memory implementation of the ContextStore.
//!
//! Used for tests and for single-process runs where durability comes from
//! periodic checkpoints rather than the store itself.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CasOutcome, ContextEntry, ABSENT_VERSION};
use crate::domain::ports::ContextStore;

/// Context store backed by a `BTreeMap` behind a tokio `RwLock`.
///
/// Reads share the lock; a compare-and-set holds the write lock only for the
/// version check and the swap, so readers never wait on anything slower.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    entries: RwLock<BTreeMap<String, ContextEntry>>,
    injected_failures: AtomicU32,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with `StorageUnavailable`.
    pub fn inject_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> DomainResult<()> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(DomainError::StorageUnavailable(
                "injected storage failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get(&self, key: &str) -> DomainResult<Option<ContextEntry>> {
        self.check_injected_failure()?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> DomainResult<CasOutcome> {
        self.check_injected_failure()?;
        let mut entries = self.entries.write().await;

        let current = entries.get(key).map_or(ABSENT_VERSION, |e| e.version);
        if current != expected_version {
            return Ok(CasOutcome::Conflict(current));
        }

        let version = current + 1;
        entries.insert(
            key.to_string(),
            ContextEntry {
                key: key.to_string(),
                value,
                version,
                updated_at: Utc::now(),
            },
        );
        Ok(CasOutcome::Applied(version))
    }

    async fn list_keys(&self, prefix: &str) -> DomainResult<Vec<String>> {
        self.check_injected_failure()?;
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn snapshot(&self) -> DomainResult<Vec<ContextEntry>> {
        self.check_injected_failure()?;
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn restore(&self, entries: Vec<ContextEntry>) -> DomainResult<()> {
        self.check_injected_failure()?;
        let restored: BTreeMap<_, _> = entries.into_iter().map(|e| (e.key.clone(), e)).collect();
        *self.entries.write().await = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = InMemoryContextStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let store = InMemoryContextStore::new();

        let created = store.compare_and_set("k", 0, json!(1)).await.unwrap();
        assert_eq!(created, CasOutcome::Applied(1));

        let updated = store.compare_and_set("k", 1, json!(2)).await.unwrap();
        assert_eq!(updated, CasOutcome::Applied(2));

        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.value, json!(2));
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = InMemoryContextStore::new();
        store.compare_and_set("k", 0, json!("a")).await.unwrap();

        let outcome = store.compare_and_set("k", 0, json!("b")).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict(1));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!("a"));
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let store = InMemoryContextStore::new();
        for key in ["hypotheses/b", "hypotheses/a", "reviews/a", "hypotheses"] {
            store.compare_and_set(key, 0, json!(null)).await.unwrap();
        }

        let keys = store.list_keys("hypotheses/").await.unwrap();
        assert_eq!(keys, vec!["hypotheses/a", "hypotheses/b"]);
    }

    #[tokio::test]
    async fn test_restore_replaces_state() {
        let store = InMemoryContextStore::new();
        store.compare_and_set("old", 0, json!(1)).await.unwrap();

        store
            .restore(vec![ContextEntry::new("new", json!(2), 7)])
            .await
            .unwrap();

        assert!(store.get("old").await.unwrap().is_none());
        assert_eq!(store.get("new").await.unwrap().unwrap().version, 7);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryContextStore::new();
        store.inject_failures(2);

        assert!(matches!(
            store.get("k").await,
            Err(DomainError::StorageUnavailable(_))
        ));
        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.is_ok());
    }
}
