//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS`, so every process may run the
//! bootstrap on connect.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the table and index definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Store` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS state (
    namespace       TEXT NOT NULL,
    key             TEXT NOT NULL,
    value           TEXT,
    PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS message (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    repo            TEXT NOT NULL,
    pr_number       TEXT NOT NULL,
    from_agent      TEXT NOT NULL,
    to_agent        TEXT NOT NULL,
    content         TEXT NOT NULL,
    timestamp       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_message_scope ON message (repo, pr_number, id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
