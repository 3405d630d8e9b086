//! Shared application state

use sqlx::SqlitePool;

/// State shared across all route handlers
#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
}

impl AppState {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Database pool accessor
    pub fn db(&self) -> &SqlitePool {
        &self.pool
    }
}
