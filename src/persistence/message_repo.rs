//! Append-only message log for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::{Message, Workspace};
use crate::{AppError, Result};

use super::db::Database;
use super::retry::with_retry;

/// Repository over the `message` table.
#[derive(Clone)]
pub struct MessageRepo {
    db: Arc<Database>,
    attempts: u32,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    repo: String,
    pr_number: String,
    from_agent: String,
    to_agent: String,
    content: String,
    timestamp: String,
}

impl MessageRow {
    /// Convert a database row into the domain model.
    fn into_message(self) -> Result<Message> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| AppError::Store(format!("invalid message timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(Message {
            id: self.id,
            repo: self.repo,
            pr_number: self.pr_number,
            from_agent: self.from_agent,
            to_agent: self.to_agent,
            content: self.content,
            timestamp,
        })
    }
}

impl MessageRepo {
    /// Create a repository that retries lock conflicts `attempts` times.
    #[must_use]
    pub fn new(db: Arc<Database>, attempts: u32) -> Self {
        Self {
            db,
            attempts: attempts.max(1),
        }
    }

    /// Append one message to the log of `scope` and return its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the insert fails.
    pub async fn append(
        &self,
        scope: &Workspace,
        from: &str,
        to: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64> {
        let db = self.db.as_ref();
        let stamp = timestamp.to_rfc3339();
        let stamp = stamp.as_str();
        let result = with_retry(self.attempts, "message append", move || async move {
            sqlx::query(
                "INSERT INTO message (repo, pr_number, from_agent, to_agent, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&scope.repo)
            .bind(&scope.pr)
            .bind(from)
            .bind(to)
            .bind(content)
            .bind(stamp)
            .execute(db)
            .await
        })
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// List messages of `scope`, oldest first.
    ///
    /// `agent` keeps only messages sent by or to that agent; `limit` keeps
    /// only the most recent `limit` of those, still oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the query fails or a row is corrupt.
    pub async fn list(
        &self,
        scope: &Workspace,
        agent: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        let db = self.db.as_ref();
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, i64::from);
        let rows: Vec<MessageRow> = with_retry(self.attempts, "message list", move || async move {
            sqlx::query_as(
                "SELECT * FROM message
                 WHERE repo = ?1 AND pr_number = ?2
                   AND (?3 IS NULL OR from_agent = ?3 OR to_agent = ?3)
                 ORDER BY id DESC
                 LIMIT ?4",
            )
            .bind(&scope.repo)
            .bind(&scope.pr)
            .bind(agent)
            .bind(limit)
            .fetch_all(db)
            .await
        })
        .await?;

        let mut messages = rows
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}
