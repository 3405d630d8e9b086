//! Atrium Server Library
//!
//! Exposes the server's modules for integration tests and tooling. The
//! server binary lives in main.rs.
//!
//! # Modules
//!
//! - `entities`: versioned entity store with append-only history
//! - `merge`: conflict detection, pure merge strategies, conflict log
//! - `sync`: offline change queue and batch replay coordinator
//! - `routes`: HTTP surface

pub mod config;
pub mod entities;
pub mod error;
pub mod merge;
pub mod routes;
pub mod state;
pub mod sync;

use axum::Router;
use sqlx::SqlitePool;

use crate::state::AppState;

/// Create all tables the server needs.
pub async fn init_schema(pool: &SqlitePool) -> error::Result<()> {
    entities::EntityRepository::new(pool).init().await?;
    merge::ConflictLogRepository::new(pool).init().await?;
    sync::ChangeQueueRepository::new(pool).init().await?;
    Ok(())
}

/// Assemble the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/health", routes::health::router())
        .nest("/api/entities", routes::entities::router())
        .nest("/api/sync", routes::sync::router())
        .nest("/api/conflicts", routes::conflicts::router())
        .with_state(state)
}
