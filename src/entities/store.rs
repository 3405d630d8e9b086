//! Versioned entity persistence
//!
//! SQLite storage for entities and their append-only version history. The
//! version commit is a guarded compare-and-increment: the UPDATE only
//! matches when the row still carries the version that was read, so no two
//! commits can observe and increment the same version.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{AppError, Result};

use super::types::{ChangeKind, EntityKind, FieldMap, HistoricalSnapshot, VersionedEntity};

/// Repository for entity persistence
pub struct EntityRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EntityRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize entity tables
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                entity_kind TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                fields TEXT NOT NULL,
                created_by TEXT,
                updated_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(entity_kind);
            CREATE INDEX IF NOT EXISTS idx_entities_version ON entities(version);

            CREATE TABLE IF NOT EXISTS entity_history (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                fields TEXT NOT NULL,
                editor TEXT,
                change_kind TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_entity ON entity_history(entity_id, version);
            "#,
        )
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Create a new entity at version 1 and record its first snapshot.
    pub async fn create(
        &self,
        kind: EntityKind,
        fields: &FieldMap,
        creator: &str,
    ) -> Result<VersionedEntity> {
        let now = Utc::now();
        let entity = VersionedEntity {
            id: Uuid::new_v4().to_string(),
            kind,
            version: 1,
            fields: fields.clone(),
            created_by: Some(creator.to_string()),
            updated_by: Some(creator.to_string()),
            created_at: now,
            updated_at: now,
            deleted: false,
        };

        let mut tx = self.pool.begin().await?;
        insert_in_tx(&mut tx, &entity).await?;
        append_history_in_tx(
            &mut tx,
            &entity.id,
            1,
            &entity.fields,
            Some(creator),
            ChangeKind::Create,
        )
        .await?;
        tx.commit().await?;

        Ok(entity)
    }

    /// Get an entity by ID (tombstoned entities included)
    pub async fn get(&self, id: &str) -> Result<Option<VersionedEntity>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT id, entity_kind, version, fields, created_by, updated_by,
                   created_at, updated_at, deleted
            FROM entities
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_entity()).transpose()
    }

    /// List active entities, optionally filtered by kind
    pub async fn list(&self, kind: Option<EntityKind>) -> Result<Vec<VersionedEntity>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query_as::<_, EntityRow>(
                    r#"
                    SELECT id, entity_kind, version, fields, created_by, updated_by,
                           created_at, updated_at, deleted
                    FROM entities
                    WHERE deleted = 0 AND entity_kind = ?
                    ORDER BY updated_at DESC
                    "#,
                )
                .bind(kind.as_str())
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, EntityRow>(
                    r#"
                    SELECT id, entity_kind, version, fields, created_by, updated_by,
                           created_at, updated_at, deleted
                    FROM entities
                    WHERE deleted = 0
                    ORDER BY updated_at DESC
                    "#,
                )
                .fetch_all(self.pool)
                .await?
            }
        };

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    /// Get the version history of an entity, newest first
    pub async fn history(&self, entity_id: &str) -> Result<Vec<HistoricalSnapshot>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT entity_id, version, fields, editor, change_kind, recorded_at
            FROM entity_history
            WHERE entity_id = ?
            ORDER BY version DESC
            "#,
        )
        .bind(entity_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_snapshot()).collect()
    }

    /// Get the snapshot recorded at a specific version
    pub async fn snapshot_at(
        &self,
        entity_id: &str,
        version: i64,
    ) -> Result<Option<HistoricalSnapshot>> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT entity_id, version, fields, editor, change_kind, recorded_at
            FROM entity_history
            WHERE entity_id = ? AND version = ?
            "#,
        )
        .bind(entity_id)
        .bind(version)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_snapshot()).transpose()
    }
}

/// Insert a new entity row inside a transaction.
pub async fn insert_in_tx(conn: &mut SqliteConnection, entity: &VersionedEntity) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entities (
            id, entity_kind, version, fields, created_by, updated_by,
            created_at, updated_at, deleted
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(&entity.id)
    .bind(entity.kind.as_str())
    .bind(entity.version)
    .bind(serde_json::to_string(&entity.fields)?)
    .bind(&entity.created_by)
    .bind(&entity.updated_by)
    .bind(entity.created_at.to_rfc3339())
    .bind(entity.updated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Load an entity inside a transaction, for a read-check-apply cycle.
pub async fn load_in_tx(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<VersionedEntity>> {
    let row = sqlx::query_as::<_, EntityRow>(
        r#"
        SELECT id, entity_kind, version, fields, created_by, updated_by,
               created_at, updated_at, deleted
        FROM entities
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|r| r.into_entity()).transpose()
}

/// Load the snapshot at a specific version inside a transaction.
pub async fn snapshot_in_tx(
    conn: &mut SqliteConnection,
    entity_id: &str,
    version: i64,
) -> Result<Option<HistoricalSnapshot>> {
    let row = sqlx::query_as::<_, HistoryRow>(
        r#"
        SELECT entity_id, version, fields, editor, change_kind, recorded_at
        FROM entity_history
        WHERE entity_id = ? AND version = ?
        "#,
    )
    .bind(entity_id)
    .bind(version)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|r| r.into_snapshot()).transpose()
}

/// Commit a field update with a compare-and-increment version guard.
///
/// The UPDATE only matches while the row still carries `expected_version`;
/// a zero row count means another commit won the race and the transaction
/// must not proceed. Returns the new version.
pub async fn commit_update_in_tx(
    conn: &mut SqliteConnection,
    id: &str,
    expected_version: i64,
    fields: &FieldMap,
    editor: &str,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();

    let result = sqlx::query(
        r#"
        UPDATE entities
        SET fields = ?, version = version + 1, updated_by = ?, updated_at = ?
        WHERE id = ? AND version = ? AND deleted = 0
        "#,
    )
    .bind(serde_json::to_string(fields)?)
    .bind(editor)
    .bind(&now)
    .bind(id)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::Transaction(format!(
            "version of entity {} moved during apply",
            id
        )));
    }

    Ok(expected_version + 1)
}

/// Tombstone an entity with the same version guard as an update.
pub async fn tombstone_in_tx(
    conn: &mut SqliteConnection,
    id: &str,
    expected_version: i64,
    editor: &str,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();

    let result = sqlx::query(
        r#"
        UPDATE entities
        SET deleted = 1, version = version + 1, updated_by = ?, updated_at = ?
        WHERE id = ? AND version = ? AND deleted = 0
        "#,
    )
    .bind(editor)
    .bind(&now)
    .bind(id)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::Transaction(format!(
            "version of entity {} moved during delete",
            id
        )));
    }

    Ok(expected_version + 1)
}

/// Append a history snapshot inside a transaction.
pub async fn append_history_in_tx(
    conn: &mut SqliteConnection,
    entity_id: &str,
    version: i64,
    fields: &FieldMap,
    editor: Option<&str>,
    change_kind: ChangeKind,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entity_history (id, entity_id, version, fields, editor, change_kind, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(entity_id)
    .bind(version)
    .bind(serde_json::to_string(fields)?)
    .bind(editor)
    .bind(change_kind.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    entity_kind: String,
    version: i64,
    fields: String,
    created_by: Option<String>,
    updated_by: Option<String>,
    created_at: String,
    updated_at: String,
    deleted: i64,
}

impl EntityRow {
    fn into_entity(self) -> Result<VersionedEntity> {
        let kind = EntityKind::parse(&self.entity_kind)?;
        let fields: FieldMap = serde_json::from_str(&self.fields)?;
        let created_at = parse_timestamp(&self.created_at)?;
        let updated_at = parse_timestamp(&self.updated_at)?;

        Ok(VersionedEntity {
            id: self.id,
            kind,
            version: self.version,
            fields,
            created_by: self.created_by,
            updated_by: self.updated_by,
            created_at,
            updated_at,
            deleted: self.deleted != 0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    entity_id: String,
    version: i64,
    fields: String,
    editor: Option<String>,
    change_kind: String,
    recorded_at: String,
}

impl HistoryRow {
    fn into_snapshot(self) -> Result<HistoricalSnapshot> {
        let fields: FieldMap = serde_json::from_str(&self.fields)?;
        let change_kind = ChangeKind::parse(&self.change_kind)?;
        let recorded_at = parse_timestamp(&self.recorded_at)?;

        Ok(HistoricalSnapshot {
            entity_id: self.entity_id,
            version: self.version,
            fields,
            editor: self.editor,
            change_kind,
            recorded_at,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("invalid timestamp `{}`: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let repo = EntityRepository::new(&pool);
        repo.init().await.unwrap();
        pool
    }

    fn floor_plan_fields() -> FieldMap {
        json!({"name": "HQ Level 1", "floor_number": 1})
            .as_object()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_create_starts_at_version_one() {
        let pool = setup_test_db().await;
        let repo = EntityRepository::new(&pool);

        let entity = repo
            .create(EntityKind::FloorPlan, &floor_plan_fields(), "alice")
            .await
            .unwrap();

        assert_eq!(entity.version, 1);
        assert_eq!(entity.created_by.as_deref(), Some("alice"));

        let history = repo.history(&entity.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].change_kind, ChangeKind::Create);
    }

    #[tokio::test]
    async fn test_guarded_update_bumps_version() {
        let pool = setup_test_db().await;
        let repo = EntityRepository::new(&pool);

        let entity = repo
            .create(EntityKind::FloorPlan, &floor_plan_fields(), "alice")
            .await
            .unwrap();

        let mut fields = entity.fields.clone();
        fields.insert("name".to_string(), json!("HQ Level 1 (renovated)"));

        let mut tx = pool.begin().await.unwrap();
        let new_version = commit_update_in_tx(&mut tx, &entity.id, 1, &fields, "bob")
            .await
            .unwrap();
        append_history_in_tx(&mut tx, &entity.id, new_version, &fields, Some("bob"), ChangeKind::Update)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(new_version, 2);

        let loaded = repo.get(&entity.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.fields["name"], json!("HQ Level 1 (renovated)"));
        assert_eq!(loaded.updated_by.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_guarded_update_rejects_stale_version() {
        let pool = setup_test_db().await;
        let repo = EntityRepository::new(&pool);

        let entity = repo
            .create(EntityKind::FloorPlan, &floor_plan_fields(), "alice")
            .await
            .unwrap();

        let mut tx = pool.begin().await.unwrap();
        let result = commit_update_in_tx(&mut tx, &entity.id, 7, &entity.fields, "bob").await;
        assert!(matches!(result, Err(AppError::Transaction(_))));
    }

    #[tokio::test]
    async fn test_snapshot_at_returns_past_state() {
        let pool = setup_test_db().await;
        let repo = EntityRepository::new(&pool);

        let entity = repo
            .create(EntityKind::FloorPlan, &floor_plan_fields(), "alice")
            .await
            .unwrap();

        let mut fields = entity.fields.clone();
        fields.insert("name".to_string(), json!("HQ Level 1 (renovated)"));

        let mut tx = pool.begin().await.unwrap();
        let v2 = commit_update_in_tx(&mut tx, &entity.id, 1, &fields, "bob")
            .await
            .unwrap();
        append_history_in_tx(&mut tx, &entity.id, v2, &fields, Some("bob"), ChangeKind::Update)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let snapshot = repo.snapshot_at(&entity.id, 1).await.unwrap().unwrap();
        assert_eq!(snapshot.fields["name"], json!("HQ Level 1"));

        let snapshot = repo.snapshot_at(&entity.id, 2).await.unwrap().unwrap();
        assert_eq!(snapshot.fields["name"], json!("HQ Level 1 (renovated)"));
    }

    #[tokio::test]
    async fn test_tombstone_excludes_from_listing() {
        let pool = setup_test_db().await;
        let repo = EntityRepository::new(&pool);

        let entity = repo
            .create(EntityKind::Room, &json!({
                "floor_plan_id": "fp-1",
                "name": "Huddle A",
                "room_number": "101",
                "capacity": 4
            }).as_object().unwrap().clone(), "alice")
            .await
            .unwrap();

        let mut tx = pool.begin().await.unwrap();
        tombstone_in_tx(&mut tx, &entity.id, 1, "alice").await.unwrap();
        tx.commit().await.unwrap();

        let listed = repo.list(Some(EntityKind::Room)).await.unwrap();
        assert!(listed.is_empty());

        // Still readable for audit
        let loaded = repo.get(&entity.id).await.unwrap().unwrap();
        assert!(loaded.deleted);
        assert_eq!(loaded.version, 2);
    }
}
