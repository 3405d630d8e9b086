//! Offline change queue persistence
//!
//! SQLite storage for mutations captured while disconnected. Entries are
//! replayed in ascending `(priority, captured_at)` order: lower priority
//! values first, ties broken by earliest capture time. Entries are kept
//! for audit after processing; only their status changes.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::entities::{ChangeKind, EntityKind, FieldMap};
use crate::error::{AppError, Result};

use super::types::{QueuedChange, SyncStatus};

/// Repository for the offline change queue
pub struct ChangeQueueRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChangeQueueRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the queue table
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS offline_changes (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                change_kind TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                entity_id TEXT,
                payload TEXT NOT NULL,
                base_version INTEGER,
                captured_at TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                synced_at TEXT,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_offline_user_status
                ON offline_changes(user_id, sync_status, priority);
            "#,
        )
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Record a queued change.
    ///
    /// A resubmitted change id reuses its row: the entry returns to
    /// `pending` with the fresh payload, keeping the attempt count.
    pub async fn enqueue(&self, change: &QueuedChange) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO offline_changes (
                id, user_id, change_kind, entity_kind, entity_id, payload,
                base_version, captured_at, priority, sync_status, attempts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                base_version = excluded.base_version,
                captured_at = excluded.captured_at,
                priority = excluded.priority,
                sync_status = excluded.sync_status,
                last_error = NULL
            "#,
        )
        .bind(&change.id)
        .bind(&change.user_id)
        .bind(change.change_kind.as_str())
        .bind(change.entity_kind.as_str())
        .bind(&change.entity_id)
        .bind(serde_json::to_string(&change.payload)?)
        .bind(change.base_version)
        .bind(change.captured_at.to_rfc3339())
        .bind(change.priority)
        .bind(change.sync_status.as_str())
        .bind(change.attempts)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Get a queued change by id
    pub async fn get(&self, id: &str) -> Result<Option<QueuedChange>> {
        let row = sqlx::query_as::<_, QueuedChangeRow>(
            r#"
            SELECT id, user_id, change_kind, entity_kind, entity_id, payload,
                   base_version, captured_at, priority, sync_status, attempts,
                   synced_at, last_error
            FROM offline_changes
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_change()).transpose()
    }

    /// Pending changes for a user, in replay order
    pub async fn pending_for_user(&self, user_id: &str) -> Result<Vec<QueuedChange>> {
        let rows = sqlx::query_as::<_, QueuedChangeRow>(
            r#"
            SELECT id, user_id, change_kind, entity_kind, entity_id, payload,
                   base_version, captured_at, priority, sync_status, attempts,
                   synced_at, last_error
            FROM offline_changes
            WHERE user_id = ? AND sync_status = 'pending'
            ORDER BY priority ASC, captured_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_change()).collect()
    }

    /// Mark a change as synced
    pub async fn mark_synced(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE offline_changes
            SET sync_status = 'synced', synced_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Mark a change as conflicted
    pub async fn mark_conflict(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE offline_changes SET sync_status = 'conflict' WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(())
    }

    /// Mark a change as failed, recording the error and counting the attempt
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE offline_changes
            SET sync_status = 'failed', attempts = attempts + 1, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct QueuedChangeRow {
    id: String,
    user_id: String,
    change_kind: String,
    entity_kind: String,
    entity_id: Option<String>,
    payload: String,
    base_version: Option<i64>,
    captured_at: String,
    priority: i64,
    sync_status: String,
    attempts: i64,
    synced_at: Option<String>,
    last_error: Option<String>,
}

impl QueuedChangeRow {
    fn into_change(self) -> Result<QueuedChange> {
        let change_kind = ChangeKind::parse(&self.change_kind)?;
        let entity_kind = EntityKind::parse(&self.entity_kind)?;
        let payload: FieldMap = serde_json::from_str(&self.payload)?;
        let sync_status = SyncStatus::parse(&self.sync_status)
            .ok_or_else(|| AppError::Internal(format!("unknown sync status `{}`", self.sync_status)))?;

        let captured_at = parse_timestamp(&self.captured_at)?;
        let synced_at = self.synced_at.as_deref().map(parse_timestamp).transpose()?;

        Ok(QueuedChange {
            id: self.id,
            user_id: self.user_id,
            change_kind,
            entity_kind,
            entity_id: self.entity_id,
            payload,
            base_version: self.base_version,
            captured_at,
            priority: self.priority,
            sync_status,
            attempts: self.attempts,
            synced_at,
            last_error: self.last_error,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("invalid timestamp `{}`: {}", s, e)))
}
