//! Conflict audit log
//!
//! Append-only record of every resolution attempt: the inputs, the result,
//! the strategy, and the participants. Records are written once and never
//! updated or deleted; this is a raw audit trail, not a business-rule gate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::entities::{EntityKind, FieldMap};
use crate::error::{AppError, Result};

use super::engine::MergeStrategy;

/// One recorded resolution attempt
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub id: String,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    #[serde(rename = "entityKind")]
    pub entity_kind: EntityKind,
    #[serde(rename = "userA")]
    pub user_a: Option<String>,
    #[serde(rename = "userB")]
    pub user_b: Option<String>,
    #[serde(rename = "changesA")]
    pub changes_a: FieldMap,
    #[serde(rename = "changesB")]
    pub changes_b: FieldMap,
    #[serde(rename = "versionAtConflict")]
    pub version_at_conflict: i64,
    #[serde(rename = "resolvedFields")]
    pub resolved_fields: FieldMap,
    #[serde(rename = "conflictingFields")]
    pub conflicting_fields: Vec<String>,
    pub strategy: MergeStrategy,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Repository for the conflict audit log
pub struct ConflictLogRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConflictLogRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the conflict log table
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflict_log (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                user_a TEXT,
                user_b TEXT,
                changes_a TEXT NOT NULL,
                changes_b TEXT NOT NULL,
                version_at_conflict INTEGER NOT NULL,
                resolved_fields TEXT NOT NULL,
                conflicting_fields TEXT NOT NULL,
                strategy TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conflict_entity ON conflict_log(entity_id);
            "#,
        )
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Append a record of one resolution attempt.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        entity_id: &str,
        entity_kind: EntityKind,
        user_a: Option<&str>,
        user_b: Option<&str>,
        changes_a: &FieldMap,
        changes_b: &FieldMap,
        version_at_conflict: i64,
        resolved_fields: &FieldMap,
        conflicting_fields: &[String],
        strategy: MergeStrategy,
    ) -> Result<ConflictRecord> {
        let record = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            entity_kind,
            user_a: user_a.map(str::to_string),
            user_b: user_b.map(str::to_string),
            changes_a: changes_a.clone(),
            changes_b: changes_b.clone(),
            version_at_conflict,
            resolved_fields: resolved_fields.clone(),
            conflicting_fields: conflicting_fields.to_vec(),
            strategy,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                id, entity_id, entity_kind, user_a, user_b, changes_a, changes_b,
                version_at_conflict, resolved_fields, conflicting_fields, strategy, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.entity_id)
        .bind(record.entity_kind.as_str())
        .bind(&record.user_a)
        .bind(&record.user_b)
        .bind(serde_json::to_string(&record.changes_a)?)
        .bind(serde_json::to_string(&record.changes_b)?)
        .bind(record.version_at_conflict)
        .bind(serde_json::to_string(&record.resolved_fields)?)
        .bind(serde_json::to_string(&record.conflicting_fields)?)
        .bind(record.strategy.as_str())
        .bind(record.created_at.to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(record)
    }

    /// List records, newest first
    pub async fn list(&self, limit: i64) -> Result<Vec<ConflictRecord>> {
        let rows = sqlx::query_as::<_, ConflictRow>(
            r#"
            SELECT id, entity_id, entity_kind, user_a, user_b, changes_a, changes_b,
                   version_at_conflict, resolved_fields, conflicting_fields, strategy, created_at
            FROM conflict_log
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_record()).collect()
    }

    /// List records for one entity, newest first
    pub async fn list_for_entity(&self, entity_id: &str) -> Result<Vec<ConflictRecord>> {
        let rows = sqlx::query_as::<_, ConflictRow>(
            r#"
            SELECT id, entity_id, entity_kind, user_a, user_b, changes_a, changes_b,
                   version_at_conflict, resolved_fields, conflicting_fields, strategy, created_at
            FROM conflict_log
            WHERE entity_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(entity_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_record()).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: String,
    entity_id: String,
    entity_kind: String,
    user_a: Option<String>,
    user_b: Option<String>,
    changes_a: String,
    changes_b: String,
    version_at_conflict: i64,
    resolved_fields: String,
    conflicting_fields: String,
    strategy: String,
    created_at: String,
}

impl ConflictRow {
    fn into_record(self) -> Result<ConflictRecord> {
        let entity_kind = EntityKind::parse(&self.entity_kind)?;
        let strategy = MergeStrategy::parse(&self.strategy)
            .ok_or_else(|| AppError::Internal(format!("unknown merge strategy `{}`", self.strategy)))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Internal(format!("invalid timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(ConflictRecord {
            id: self.id,
            entity_id: self.entity_id,
            entity_kind,
            user_a: self.user_a,
            user_b: self.user_b,
            changes_a: serde_json::from_str(&self.changes_a)?,
            changes_b: serde_json::from_str(&self.changes_b)?,
            version_at_conflict: self.version_at_conflict,
            resolved_fields: serde_json::from_str(&self.resolved_fields)?,
            conflicting_fields: serde_json::from_str(&self.conflicting_fields)?,
            strategy,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let repo = ConflictLogRepository::new(&pool);
        repo.init().await.unwrap();
        pool
    }

    fn fields(value: serde_json::Value) -> FieldMap {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let pool = setup_test_db().await;
        let repo = ConflictLogRepository::new(&pool);

        let changes_a = fields(json!({"name": "X"}));
        let changes_b = fields(json!({"name": "Y"}));
        let resolved = fields(json!({"name": "Y"}));

        let record = repo
            .record(
                "fp-1",
                EntityKind::FloorPlan,
                Some("alice"),
                Some("bob"),
                &changes_a,
                &changes_b,
                3,
                &resolved,
                &["name".to_string()],
                MergeStrategy::ThreeWayMerge,
            )
            .await
            .unwrap();

        assert_eq!(record.version_at_conflict, 3);

        let listed = repo.list_for_entity("fp-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].conflicting_fields, vec!["name".to_string()]);
        assert_eq!(listed[0].strategy, MergeStrategy::ThreeWayMerge);
        assert_eq!(listed[0].user_b.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_records_accumulate() {
        let pool = setup_test_db().await;
        let repo = ConflictLogRepository::new(&pool);

        let empty = FieldMap::new();
        for _ in 0..3 {
            repo.record(
                "fp-1",
                EntityKind::FloorPlan,
                None,
                Some("bob"),
                &empty,
                &empty,
                1,
                &empty,
                &[],
                MergeStrategy::ThreeWayMerge,
            )
            .await
            .unwrap();
        }

        let listed = repo.list(10).await.unwrap();
        assert_eq!(listed.len(), 3);
    }
}
