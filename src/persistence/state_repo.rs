//! Namespaced key-value state for `SQLite` persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::db::Database;
use super::retry::with_retry;
use crate::Result;

/// Repository over the `state` table.
///
/// Writes are last-write-wins upserts; there are no multi-key transactions.
#[derive(Clone)]
pub struct StateRepo {
    db: Arc<Database>,
    attempts: u32,
}

impl StateRepo {
    /// Create a repository that retries lock conflicts `attempts` times.
    #[must_use]
    pub fn new(db: Arc<Database>, attempts: u32) -> Self {
        Self {
            db,
            attempts: attempts.max(1),
        }
    }

    /// Upsert `key` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the write fails.
    pub async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let db = self.db.as_ref();
        with_retry(self.attempts, "state set", move || async move {
            sqlx::query(
                "INSERT INTO state (namespace, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            )
            .bind(namespace)
            .bind(key)
            .bind(value)
            .execute(db)
            .await
        })
        .await?;
        Ok(())
    }

    /// Read `key` in `namespace`; `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let db = self.db.as_ref();
        let row: Option<(Option<String>,)> =
            with_retry(self.attempts, "state get", move || async move {
                sqlx::query_as("SELECT value FROM state WHERE namespace = ?1 AND key = ?2")
                    .bind(namespace)
                    .bind(key)
                    .fetch_optional(db)
                    .await
            })
            .await?;
        Ok(row.and_then(|(value,)| value))
    }

    /// Snapshot every key in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn get_all(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        let db = self.db.as_ref();
        let rows: Vec<(String, Option<String>)> =
            with_retry(self.attempts, "state get_all", move || async move {
                sqlx::query_as("SELECT key, value FROM state WHERE namespace = ?1")
                    .bind(namespace)
                    .fetch_all(db)
                    .await
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(key, value)| (key, value.unwrap_or_default()))
            .collect())
    }

    /// Delete one key. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the delete fails.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let db = self.db.as_ref();
        let result = with_retry(self.attempts, "state delete", move || async move {
            sqlx::query("DELETE FROM state WHERE namespace = ?1 AND key = ?2")
                .bind(namespace)
                .bind(key)
                .execute(db)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every key in `namespace`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the delete fails.
    pub async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        let db = self.db.as_ref();
        let result = with_retry(self.attempts, "state delete_namespace", move || async move {
            sqlx::query("DELETE FROM state WHERE namespace = ?1")
                .bind(namespace)
                .execute(db)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }
}
