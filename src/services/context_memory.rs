//! Context Memory: the retrying, typed façade over a `ContextStore`.

use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CasOutcome, ContextEntry, RetryConfig, TaskRecord, ABSENT_VERSION};
use crate::domain::ports::ContextStore;

/// Shared, versioned state for every component of the core.
///
/// Storage failures are retried with exponential backoff before surfacing as
/// `StorageUnavailable`. Compare-and-set conflicts are never retried here;
/// `update` and `append_to_list` re-read and recompute instead, up to
/// `cas_max_retries` times.
///
/// # Examples
///
/// ```no_run
/// use cosci::adapters::memory::InMemoryContextStore;
/// use cosci::domain::models::RetryConfig;
/// use cosci::services::ContextMemory;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> cosci::domain::DomainResult<()> {
/// let memory = ContextMemory::new(Arc::new(InMemoryContextStore::new()), &RetryConfig::default());
/// memory.append_to_list("meta_reviews", &json!({"summary": "..."})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ContextMemory {
    store: Arc<dyn ContextStore>,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_elapsed: Duration,
    cas_max_retries: u32,
    storage_errors: Arc<AtomicU64>,
}

impl ContextMemory {
    pub fn new(store: Arc<dyn ContextStore>, retry: &RetryConfig) -> Self {
        Self {
            store,
            initial_backoff: Duration::from_millis(retry.storage_initial_backoff_ms),
            max_backoff: Duration::from_millis(retry.storage_max_backoff_ms),
            max_elapsed: Duration::from_millis(retry.storage_max_elapsed_ms),
            cas_max_retries: retry.cas_max_retries.max(1),
            storage_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of operations that failed with `StorageUnavailable` after
    /// exhausting backoff.
    pub fn storage_error_count(&self) -> u64 {
        self.storage_errors.load(Ordering::Relaxed)
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }

    /// Run a store operation, retrying transient failures with backoff.
    async fn with_backoff<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> DomainResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        let result = retry(self.backoff_policy(), || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        debug!(op = op_name, error = %e, "Transient storage error, backing off");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await;

        if let Err(DomainError::StorageUnavailable(reason)) = &result {
            self.storage_errors.fetch_add(1, Ordering::Relaxed);
            warn!(op = op_name, reason = %reason, "Storage unavailable after retries");
        }
        result
    }

    /// Current entry for `key`, or `None` if it was never written.
    pub async fn get(&self, key: &str) -> DomainResult<Option<ContextEntry>> {
        self.with_backoff("get", || self.store.get(key)).await
    }

    /// Typed read: the decoded value and its version.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> DomainResult<Option<(T, u64)>> {
        match self.get(key).await? {
            Some(entry) => Ok(Some((serde_json::from_value(entry.value)?, entry.version))),
            None => Ok(None),
        }
    }

    /// Typed read returning `T::default()` at version 0 for absent keys.
    pub async fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> DomainResult<(T, u64)> {
        Ok(self
            .get_json(key)
            .await?
            .unwrap_or_else(|| (T::default(), ABSENT_VERSION)))
    }

    /// The only mutation primitive. See `ContextStore::compare_and_set`.
    #[instrument(skip(self, value), level = "trace")]
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> DomainResult<CasOutcome> {
        self.with_backoff("compare_and_set", || {
            self.store.compare_and_set(key, expected_version, value.clone())
        })
        .await
    }

    pub async fn cas_json<T: Serialize>(
        &self,
        key: &str,
        expected_version: u64,
        value: &T,
    ) -> DomainResult<CasOutcome> {
        self.compare_and_set(key, expected_version, serde_json::to_value(value)?)
            .await
    }

    /// Read-modify-CAS loop.
    ///
    /// `mutate` is called on a freshly read value for every attempt and may
    /// return `Ok(None)` to leave the key untouched. Conflicts are retried
    /// up to `cas_max_retries` times before `ConcurrentModification`.
    pub async fn try_update<T, R, F>(&self, key: &str, mut mutate: F) -> DomainResult<Option<R>>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnMut(&mut T) -> DomainResult<Option<R>>,
    {
        for attempt in 1..=self.cas_max_retries {
            let (mut value, version) = self.get_or_default::<T>(key).await?;

            let Some(out) = mutate(&mut value)? else {
                return Ok(None);
            };

            match self.cas_json(key, version, &value).await? {
                CasOutcome::Applied(new_version) => {
                    debug!(key, version = new_version, attempt, "CAS applied");
                    return Ok(Some(out));
                }
                CasOutcome::Conflict(current) => {
                    debug!(key, expected = version, current, attempt, "CAS conflict, re-reading");
                    tokio::task::yield_now().await;
                }
            }
        }

        warn!(key, attempts = self.cas_max_retries, "CAS retry budget exhausted");
        Err(DomainError::ConcurrentModification {
            key: key.to_string(),
            attempts: self.cas_max_retries,
        })
    }

    /// Read-modify-CAS loop that always writes.
    pub async fn update<T, R, F>(&self, key: &str, mut mutate: F) -> DomainResult<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnMut(&mut T) -> DomainResult<R>,
    {
        self.try_update::<T, R, _>(key, |value| mutate(value).map(Some))
            .await?
            .ok_or_else(|| DomainError::ConcurrentModification {
                key: key.to_string(),
                attempts: self.cas_max_retries,
            })
    }

    /// Append one item to the JSON array stored at `key`, creating it when
    /// absent. Returns the new list length.
    #[instrument(skip(self, item), level = "debug")]
    pub async fn append_to_list<T: Serialize>(&self, key: &str, item: &T) -> DomainResult<usize> {
        let item = serde_json::to_value(item)?;
        self.update::<Vec<Value>, _, _>(key, |list| {
            list.push(item.clone());
            Ok(list.len())
        })
        .await
    }

    /// Append `record` unless the list already holds one from the same
    /// task. Returns whether it was appended.
    pub async fn append_record<T>(&self, key: &str, record: &T) -> DomainResult<bool>
    where
        T: TaskRecord + Serialize + DeserializeOwned + Clone,
    {
        let task_id = record.task_id();
        let appended = self
            .try_update::<Vec<T>, (), _>(key, |list| {
                if list.iter().any(|r| r.task_id() == task_id) {
                    return Ok(None);
                }
                list.push(record.clone());
                Ok(Some(()))
            })
            .await?;
        Ok(appended.is_some())
    }

    /// Keys starting with `prefix`, sorted.
    pub async fn list_keys(&self, prefix: &str) -> DomainResult<Vec<String>> {
        self.with_backoff("list_keys", || self.store.list_keys(prefix))
            .await
    }

    /// Consistent copy of every entry.
    pub async fn snapshot(&self) -> DomainResult<Vec<ContextEntry>> {
        self.with_backoff("snapshot", || self.store.snapshot()).await
    }

    /// Replace all state. Startup recovery only.
    pub async fn restore(&self, entries: Vec<ContextEntry>) -> DomainResult<()> {
        self.with_backoff("restore", || self.store.restore(entries.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryContextStore;
    use serde_json::json;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            storage_initial_backoff_ms: 1,
            storage_max_backoff_ms: 5,
            storage_max_elapsed_ms: 200,
            ..RetryConfig::default()
        }
    }

    fn memory_with(store: Arc<InMemoryContextStore>) -> ContextMemory {
        ContextMemory::new(store, &fast_retry())
    }

    #[tokio::test]
    async fn test_get_json_absent() {
        let memory = memory_with(Arc::new(InMemoryContextStore::new()));
        let value: Option<(Vec<u32>, u64)> = memory.get_json("missing").await.unwrap();
        assert!(value.is_none());

        let (list, version): (Vec<u32>, u64) = memory.get_or_default("missing").await.unwrap();
        assert!(list.is_empty());
        assert_eq!(version, ABSENT_VERSION);
    }

    #[tokio::test]
    async fn test_append_creates_and_extends() {
        let memory = memory_with(Arc::new(InMemoryContextStore::new()));

        assert_eq!(memory.append_to_list("log", &json!("a")).await.unwrap(), 1);
        assert_eq!(memory.append_to_list("log", &json!("b")).await.unwrap(), 2);

        let (list, version): (Vec<String>, u64) = memory.get_json("log").await.unwrap().unwrap();
        assert_eq!(list, vec!["a", "b"]);
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_append_record_once_per_task() {
        use crate::domain::models::MetaReviewRecord;
        use chrono::Utc;
        use uuid::Uuid;

        let memory = memory_with(Arc::new(InMemoryContextStore::new()));
        let record = MetaReviewRecord {
            task_id: Uuid::new_v4(),
            summary: json!("first"),
            recorded_at: Utc::now(),
        };
        let redelivered = MetaReviewRecord {
            summary: json!("second"),
            ..record.clone()
        };

        assert!(memory.append_record("meta", &record).await.unwrap());
        assert!(!memory.append_record("meta", &redelivered).await.unwrap());

        let (list, _): (Vec<MetaReviewRecord>, u64) = memory.get_json("meta").await.unwrap().unwrap();
        assert_eq!(list, vec![record]);
    }

    #[tokio::test]
    async fn test_try_update_can_skip_write() {
        let memory = memory_with(Arc::new(InMemoryContextStore::new()));
        memory.cas_json("n", 0, &5u32).await.unwrap();

        let skipped = memory
            .try_update::<u32, (), _>("n", |_| Ok(None))
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(memory.get("n").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_update_error_aborts_without_write() {
        let memory = memory_with(Arc::new(InMemoryContextStore::new()));
        let result = memory
            .update::<u32, (), _>("n", |_| Err(DomainError::ValidationFailed("no".into())))
            .await;
        assert!(matches!(result, Err(DomainError::ValidationFailed(_))));
        assert!(memory.get("n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Arc::new(InMemoryContextStore::new());
        let memory = memory_with(store.clone());
        store.inject_failures(3);

        memory.append_to_list("k", &json!(1)).await.unwrap();
        assert_eq!(memory.storage_error_count(), 0);
    }

    #[tokio::test]
    async fn test_persistent_errors_surface_as_storage_unavailable() {
        let store = Arc::new(InMemoryContextStore::new());
        let memory = memory_with(store.clone());
        store.inject_failures(u32::MAX);

        let err = memory.get("k").await.unwrap_err();
        assert!(matches!(err, DomainError::StorageUnavailable(_)));
        assert_eq!(memory.storage_error_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_lose_nothing() {
        let store = Arc::new(InMemoryContextStore::new());
        let memory = ContextMemory::new(
            store,
            &RetryConfig {
                cas_max_retries: 1000,
                ..fast_retry()
            },
        );

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let memory = memory.clone();
                tokio::spawn(async move { memory.append_to_list("shared", &i).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let (mut list, version): (Vec<u32>, u64) = memory.get_json("shared").await.unwrap().unwrap();
        list.sort_unstable();
        assert_eq!(list, (0..32).collect::<Vec<_>>());
        assert_eq!(version, 32);
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let memory = memory_with(Arc::new(InMemoryContextStore::new()));
        memory.append_to_list("a", &1).await.unwrap();
        memory.cas_json("b", 0, &"x").await.unwrap();
        let snapshot = memory.snapshot().await.unwrap();

        let other = memory_with(Arc::new(InMemoryContextStore::new()));
        other.restore(snapshot.clone()).await.unwrap();
        assert_eq!(other.snapshot().await.unwrap(), snapshot);
    }
}
