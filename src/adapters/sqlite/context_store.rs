//! SQLite implementation of the ContextStore.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CasOutcome, ContextEntry, ABSENT_VERSION};
use crate::domain::ports::ContextStore;

/// Durable Context Memory.
///
/// Compare-and-set is a single guarded statement, so the version check and
/// the write cannot interleave with another connection's write.
#[derive(Clone)]
pub struct SqliteContextStore {
    pool: SqlitePool,
}

impl SqliteContextStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn current_version(&self, key: &str) -> DomainResult<u64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM context_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map_or(ABSENT_VERSION, |(v,)| v as u64))
    }
}

#[async_trait]
impl ContextStore for SqliteContextStore {
    async fn get(&self, key: &str) -> DomainResult<Option<ContextEntry>> {
        let row: Option<ContextRow> = sqlx::query_as(
            "SELECT key, value, version, updated_at FROM context_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> DomainResult<CasOutcome> {
        let value_json = serde_json::to_string(&value)?;
        let now = Utc::now().to_rfc3339();

        let result = if expected_version == ABSENT_VERSION {
            sqlx::query(
                r#"INSERT INTO context_entries (key, value, version, updated_at)
                   VALUES (?, ?, 1, ?)
                   ON CONFLICT(key) DO NOTHING"#,
            )
            .bind(key)
            .bind(&value_json)
            .bind(&now)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"UPDATE context_entries
                   SET value = ?, version = version + 1, updated_at = ?
                   WHERE key = ? AND version = ?"#,
            )
            .bind(&value_json)
            .bind(&now)
            .bind(key)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied(expected_version + 1))
        } else {
            Ok(CasOutcome::Conflict(self.current_version(key).await?))
        }
    }

    async fn list_keys(&self, prefix: &str) -> DomainResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM context_entries WHERE instr(key, ?) = 1 ORDER BY key")
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn snapshot(&self) -> DomainResult<Vec<ContextEntry>> {
        let rows: Vec<ContextRow> = sqlx::query_as(
            "SELECT key, value, version, updated_at FROM context_entries ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn restore(&self, entries: Vec<ContextEntry>) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM context_entries")
            .execute(&mut *tx)
            .await?;

        for entry in &entries {
            sqlx::query(
                "INSERT INTO context_entries (key, value, version, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&entry.key)
            .bind(serde_json::to_string(&entry.value)?)
            .bind(entry.version as i64)
            .bind(entry.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ContextRow {
    key: String,
    value: String,
    version: i64,
    updated_at: String,
}

impl TryFrom<ContextRow> for ContextEntry {
    type Error = DomainError;

    fn try_from(row: ContextRow) -> Result<Self, Self::Error> {
        Ok(ContextEntry {
            value: serde_json::from_str(&row.value)?,
            version: row.version as u64,
            updated_at: super::parse_datetime(&row.updated_at)?,
            key: row.key,
        })
    }
}
