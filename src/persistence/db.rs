//! `SQLite` connection pool and schema bootstrap.

use std::fs;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::debug;

use crate::{AppError, Result};

use super::schema;

/// Alias for the shared `SQLite` pool.
pub type Database = SqlitePool;

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections per process. Writers serialise on the file lock anyway.
const MAX_CONNECTIONS: u32 = 4;

/// Open (creating if needed) the store file at `path` and apply the schema.
///
/// Every CLI invocation and daemon opens its own pool; the file is the only
/// shared state, so the journal runs in WAL mode to let readers proceed while
/// another process writes.
///
/// # Errors
///
/// Returns `AppError::Store` if the directory, connection or schema cannot
/// be set up.
pub async fn connect(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::Store(format!("failed to create store dir: {err}")))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    debug!(path = %path.display(), "coordination store ready");
    Ok(pool)
}

/// Open a private in-memory store, for tests.
///
/// The pool is pinned to one connection that never expires, since every
/// `SQLite` in-memory connection is its own database.
///
/// # Errors
///
/// Returns `AppError::Store` if the connection or schema fails.
pub async fn connect_memory() -> Result<Database> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
