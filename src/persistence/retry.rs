//! Bounded retry for store operations that hit another process's lock.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::{AppError, Result};

/// Base delay; attempt `n` waits `n * BACKOFF_STEP`.
const BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Primary `SQLite` result codes for a busy or locked database.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Run `op` up to `attempts` times while it fails with a busy/locked error.
///
/// # Errors
///
/// Returns `AppError::Store` with the last error once attempts are exhausted,
/// or immediately for any other failure.
pub(crate) async fn with_retry<T, F, Fut>(attempts: u32, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt = 1_u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_contended(&err) => {
                warn!(what, attempt, %err, "store busy, retrying");
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(AppError::Store(format!("{what}: {err}"))),
        }
    }
}

/// Whether `err` is a transient lock conflict.
pub(crate) fn is_contended(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    // Extended codes (e.g. 517 BUSY_SNAPSHOT) keep the primary code in the
    // low byte.
    let primary = db
        .code()
        .and_then(|code| code.parse::<i64>().ok())
        .map(|code| code & 0xff);
    matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED))
        || db.message().contains("database is locked")
}
