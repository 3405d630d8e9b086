//! Batch replay of offline changes
//!
//! Walks a user's queued changes in `(priority, captured_at)` order. Each
//! change runs as its own transaction: the target entity row is locked for
//! the read-check-merge-apply-commit cycle, and any error is caught at the
//! per-change boundary so one bad change never aborts its siblings. The
//! merge engine stays pure; this module owns all store and log access.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::entities::{
    self, ChangeKind, EntityKind, EntityRepository, FieldMap,
};
use crate::error::{AppError, Result};
use crate::merge::{has_conflict, three_way_merge, ConflictLogRepository, MergeStrategy};

use super::queue::ChangeQueueRepository;
use super::types::{
    ChangeInput, ConflictedChange, FailedChange, QueuedChange, SyncReport, SyncStatus,
    SyncedChange,
};

/// Outcome of applying a single versioned update
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The update committed, directly or via auto-merge
    Applied {
        new_version: i64,
        strategy: Option<MergeStrategy>,
    },
    /// A true field conflict; nothing was applied
    Conflict {
        expected_version: i64,
        conflicting_fields: Vec<String>,
        merged_fields: FieldMap,
    },
}

/// Internal per-change outcome before queue status bookkeeping
enum ChangeOutcome {
    Synced(SyncedChange),
    Conflict(ConflictedChange),
}

/// Orchestrates replay of a user's offline change queue
pub struct BatchSyncCoordinator<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BatchSyncCoordinator<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Replay a batch of offline changes for one user.
    ///
    /// Every submitted change lands in exactly one of the report's three
    /// buckets. A `conflict` or `failed` outcome is terminal within the
    /// batch; the client decides whether to resubmit.
    pub async fn sync_batch(&self, user_id: &str, inputs: Vec<ChangeInput>) -> SyncReport {
        let queue = ChangeQueueRepository::new(self.pool);
        let mut report = SyncReport::default();
        let mut accepted = Vec::new();

        // Ingestion boundary: parse kinds, validate payloads against the
        // per-kind schema, and persist the queue entry. A change that fails
        // here goes straight to the failed bucket.
        for input in inputs {
            let change_id = input
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            match admit(user_id, &change_id, &input) {
                Ok(change) => {
                    if let Err(e) = queue.enqueue(&change).await {
                        tracing::warn!("Failed to enqueue change {}: {}", change.id, e);
                        report.failed.push(failed_from_input(&change_id, &input, &e));
                        continue;
                    }
                    accepted.push(change);
                }
                Err(e) => {
                    report.failed.push(failed_from_input(&change_id, &input, &e));
                }
            }
        }

        // Replay order: lower priority value first, FIFO within a tier.
        accepted.sort_by(|a, b| {
            (a.priority, a.captured_at).cmp(&(b.priority, b.captured_at))
        });

        for change in accepted {
            match self.sync_single(&change).await {
                Ok(ChangeOutcome::Synced(synced)) => {
                    if let Err(e) = queue.mark_synced(&change.id).await {
                        tracing::warn!("Failed to mark change {} synced: {}", change.id, e);
                    }
                    report.synced.push(synced);
                }
                Ok(ChangeOutcome::Conflict(conflict)) => {
                    if let Err(e) = queue.mark_conflict(&change.id).await {
                        tracing::warn!("Failed to mark change {} conflicted: {}", change.id, e);
                    }
                    report.conflicts.push(conflict);
                }
                Err(e) => {
                    tracing::warn!("Change {} failed to sync: {}", change.id, e);
                    if let Err(mark_err) = queue.mark_failed(&change.id, &e.to_string()).await {
                        tracing::warn!("Failed to mark change {} failed: {}", change.id, mark_err);
                    }
                    report.failed.push(FailedChange {
                        change_id: change.id.clone(),
                        change_kind: change.change_kind.as_str().to_string(),
                        entity_kind: change.entity_kind.as_str().to_string(),
                        entity_id: change.entity_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Apply one queued change, dispatching on its change kind.
    async fn sync_single(&self, change: &QueuedChange) -> Result<ChangeOutcome> {
        match change.change_kind {
            ChangeKind::Create => self.apply_create(change).await,
            ChangeKind::Update => self.apply_update_change(change).await,
            ChangeKind::Delete => self.apply_delete(change).await,
        }
    }

    async fn apply_create(&self, change: &QueuedChange) -> Result<ChangeOutcome> {
        let repo = EntityRepository::new(self.pool);
        let entity = repo
            .create(change.entity_kind, &change.payload, &change.user_id)
            .await?;

        Ok(ChangeOutcome::Synced(SyncedChange {
            change_id: change.id.clone(),
            change_kind: ChangeKind::Create,
            entity_kind: change.entity_kind,
            entity_id: entity.id,
            new_version: Some(entity.version),
            strategy: None,
        }))
    }

    async fn apply_update_change(&self, change: &QueuedChange) -> Result<ChangeOutcome> {
        // Presence enforced at admission
        let entity_id = change.entity_id.as_deref().unwrap_or_default();
        let base_version = change.base_version.unwrap_or_default();

        let outcome = apply_update(
            self.pool,
            entity_id,
            &change.payload,
            base_version,
            &change.user_id,
        )
        .await?;

        Ok(match outcome {
            UpdateOutcome::Applied {
                new_version,
                strategy,
            } => ChangeOutcome::Synced(SyncedChange {
                change_id: change.id.clone(),
                change_kind: ChangeKind::Update,
                entity_kind: change.entity_kind,
                entity_id: entity_id.to_string(),
                new_version: Some(new_version),
                strategy,
            }),
            UpdateOutcome::Conflict {
                expected_version,
                conflicting_fields,
                merged_fields,
            } => ChangeOutcome::Conflict(ConflictedChange {
                change_id: change.id.clone(),
                change_kind: ChangeKind::Update,
                entity_kind: change.entity_kind,
                entity_id: entity_id.to_string(),
                expected_version,
                conflicting_fields,
                merged_fields,
            }),
        })
    }

    async fn apply_delete(&self, change: &QueuedChange) -> Result<ChangeOutcome> {
        let entity_id = change.entity_id.as_deref().unwrap_or_default();
        let base_version = change.base_version.unwrap_or_default();

        let mut tx = self.pool.begin().await?;

        let entity = entities::load_in_tx(&mut tx, entity_id)
            .await?
            .filter(|e| !e.deleted)
            .ok_or_else(|| AppError::NotFound(format!("Entity not found: {}", entity_id)))?;

        // A stale delete is surfaced instead of destroying newer edits.
        if has_conflict(entity.version, base_version) {
            drop(tx);
            return Ok(ChangeOutcome::Conflict(ConflictedChange {
                change_id: change.id.clone(),
                change_kind: ChangeKind::Delete,
                entity_kind: change.entity_kind,
                entity_id: entity_id.to_string(),
                expected_version: entity.version,
                conflicting_fields: Vec::new(),
                merged_fields: entity.fields,
            }));
        }

        let new_version =
            entities::tombstone_in_tx(&mut tx, entity_id, entity.version, &change.user_id).await?;
        entities::append_history_in_tx(
            &mut tx,
            entity_id,
            new_version,
            &entity.fields,
            Some(&change.user_id),
            ChangeKind::Delete,
        )
        .await?;
        tx.commit().await?;

        Ok(ChangeOutcome::Synced(SyncedChange {
            change_id: change.id.clone(),
            change_kind: ChangeKind::Delete,
            entity_kind: change.entity_kind,
            entity_id: entity_id.to_string(),
            new_version: Some(new_version),
            strategy: None,
        }))
    }
}

/// Apply a versioned update with conflict detection and three-way merge.
///
/// On a version match the payload is applied directly. On a mismatch the
/// merge runs with `base` taken from the history snapshot at the client's
/// version (what the client actually saw), `ours` as the server's current
/// fields, and `theirs` as the base overlaid with the payload, so omitted
/// fields read as unchanged. A non-empty conflict list leaves the entity
/// untouched. Every merge attempt is recorded in the conflict log.
pub async fn apply_update(
    pool: &SqlitePool,
    entity_id: &str,
    payload: &FieldMap,
    client_version: i64,
    editor: &str,
) -> Result<UpdateOutcome> {
    let mut tx = pool.begin().await?;

    let entity = entities::load_in_tx(&mut tx, entity_id)
        .await?
        .filter(|e| !e.deleted)
        .ok_or_else(|| AppError::NotFound(format!("Entity not found: {}", entity_id)))?;

    if !has_conflict(entity.version, client_version) {
        // Versions agree: apply the payload onto the current fields.
        let mut fields = entity.fields.clone();
        for (key, value) in payload {
            fields.insert(key.clone(), value.clone());
        }

        let new_version =
            entities::commit_update_in_tx(&mut tx, entity_id, entity.version, &fields, editor)
                .await?;
        entities::append_history_in_tx(
            &mut tx,
            entity_id,
            new_version,
            &fields,
            Some(editor),
            ChangeKind::Update,
        )
        .await?;
        tx.commit().await?;

        return Ok(UpdateOutcome::Applied {
            new_version,
            strategy: None,
        });
    }

    // Version mismatch: reconcile against the state the client last saw.
    let base = entities::snapshot_in_tx(&mut tx, entity_id, client_version)
        .await?
        .map(|s| s.fields)
        .unwrap_or_else(|| entity.fields.clone());

    let ours = entity.fields.clone();
    let mut theirs = base.clone();
    for (key, value) in payload {
        theirs.insert(key.clone(), value.clone());
    }

    let (merged, conflicting) = three_way_merge(&base, &ours, &theirs);

    if !conflicting.is_empty() {
        // True conflict: release the row untouched, then record the attempt.
        drop(tx);

        ConflictLogRepository::new(pool)
            .record(
                entity_id,
                entity.kind,
                entity.updated_by.as_deref(),
                Some(editor),
                &ours,
                payload,
                entity.version,
                &merged,
                &conflicting,
                MergeStrategy::ThreeWayMerge,
            )
            .await?;

        return Ok(UpdateOutcome::Conflict {
            expected_version: entity.version,
            conflicting_fields: conflicting,
            merged_fields: merged,
        });
    }

    // The edits did not overlap: commit the merged fields.
    let new_version =
        entities::commit_update_in_tx(&mut tx, entity_id, entity.version, &merged, editor).await?;
    entities::append_history_in_tx(
        &mut tx,
        entity_id,
        new_version,
        &merged,
        Some(editor),
        ChangeKind::Update,
    )
    .await?;
    tx.commit().await?;

    ConflictLogRepository::new(pool)
        .record(
            entity_id,
            entity.kind,
            entity.updated_by.as_deref(),
            Some(editor),
            &ours,
            payload,
            entity.version,
            &merged,
            &[],
            MergeStrategy::ThreeWayMerge,
        )
        .await?;

    Ok(UpdateOutcome::Applied {
        new_version,
        strategy: Some(MergeStrategy::ThreeWayMerge),
    })
}

/// Validate a wire change and turn it into a queue entry.
fn admit(user_id: &str, change_id: &str, input: &ChangeInput) -> Result<QueuedChange> {
    let change_kind = ChangeKind::parse(&input.change_kind)?;
    let entity_kind = EntityKind::parse(&input.entity_kind)?;

    match change_kind {
        ChangeKind::Create => {
            entity_kind.validate_payload(&input.payload, true)?;
        }
        ChangeKind::Update => {
            if input.entity_id.is_none() {
                return Err(AppError::Validation(
                    "entityId is required for UPDATE changes".to_string(),
                ));
            }
            if input.base_version.is_none() {
                return Err(AppError::Validation(
                    "baseVersion is required for UPDATE changes".to_string(),
                ));
            }
            if input.payload.is_empty() {
                return Err(AppError::Validation(
                    "payload must not be empty for UPDATE changes".to_string(),
                ));
            }
            entity_kind.validate_payload(&input.payload, false)?;
        }
        ChangeKind::Delete => {
            if input.entity_id.is_none() {
                return Err(AppError::Validation(
                    "entityId is required for DELETE changes".to_string(),
                ));
            }
            if input.base_version.is_none() {
                return Err(AppError::Validation(
                    "baseVersion is required for DELETE changes".to_string(),
                ));
            }
        }
    }

    Ok(QueuedChange {
        id: change_id.to_string(),
        user_id: user_id.to_string(),
        change_kind,
        entity_kind,
        entity_id: input.entity_id.clone(),
        payload: input.payload.clone(),
        base_version: input.base_version,
        captured_at: input.captured_at.unwrap_or_else(Utc::now),
        priority: input.priority,
        sync_status: SyncStatus::Pending,
        attempts: 0,
        synced_at: None,
        last_error: None,
    })
}

fn failed_from_input(change_id: &str, input: &ChangeInput, error: &AppError) -> FailedChange {
    FailedChange {
        change_id: change_id.to_string(),
        change_kind: input.change_kind.clone(),
        entity_kind: input.entity_kind.clone(),
        entity_id: input.entity_id.clone(),
        error: error.to_string(),
    }
}
