//! Coordination store: namespaced state plus a per-workspace message log,
//! shared by every daemon and CLI process through one `SQLite` file.

use std::path::Path;
use std::sync::Arc;

pub mod db;
pub mod message_repo;
mod retry;
pub mod schema;
pub mod state_repo;
pub mod swarm;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

pub use message_repo::MessageRepo;
pub use state_repo::StateRepo;
pub use swarm::SwarmState;

use crate::Result;

/// Both repositories over one pool.
#[derive(Clone)]
pub struct Store {
    /// Key-value state.
    pub state: StateRepo,
    /// Message log.
    pub messages: MessageRepo,
}

impl Store {
    /// Open the store file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the file cannot be opened.
    pub async fn open(path: &Path, retry_attempts: u32) -> Result<Self> {
        let pool = db::connect(path).await?;
        Ok(Self::from_pool(Arc::new(pool), retry_attempts))
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the connection fails.
    pub async fn open_memory(retry_attempts: u32) -> Result<Self> {
        let pool = db::connect_memory().await?;
        Ok(Self::from_pool(Arc::new(pool), retry_attempts))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: Arc<SqlitePool>, retry_attempts: u32) -> Self {
        Self {
            state: StateRepo::new(Arc::clone(&pool), retry_attempts),
            messages: MessageRepo::new(pool, retry_attempts),
        }
    }
}
