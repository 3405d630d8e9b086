//! Entity API endpoints
//!
//! CRUD plus the optimistic-concurrency surface: conflict pre-check,
//! versioned update with merge-on-mismatch, and version history.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{ChangeKind, EntityKind, EntityRepository, FieldMap, VersionedEntity};
use crate::error::{AppError, Result};
use crate::merge::has_conflict;
use crate::state::AppState;
use crate::sync::{apply_update, UpdateOutcome};

/// Create the entities router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_entity).get(list_entities))
        .route("/:id", get(get_entity).put(update_entity))
        .route("/:id/conflict-check", post(conflict_check))
        .route("/:id/history", get(get_history))
}

#[derive(Debug, Deserialize)]
pub struct CreateEntityRequest {
    pub kind: String,
    pub fields: FieldMap,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntityRequest {
    pub fields: FieldMap,
    pub version: i64,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConflictCheckRequest {
    pub version: i64,
}

#[derive(Debug, Serialize)]
pub struct ConflictCheckResponse {
    pub conflict: bool,
    #[serde(rename = "serverVersion")]
    pub server_version: i64,
    #[serde(rename = "clientVersion")]
    pub client_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 409 payload for an update that hit a true field conflict
#[derive(Debug, Serialize)]
pub struct ConflictDetectedResponse {
    pub error: &'static str,
    #[serde(rename = "expectedVersion")]
    pub expected_version: i64,
    #[serde(rename = "conflictingFields")]
    pub conflicting_fields: Vec<String>,
    #[serde(rename = "mergedFields")]
    pub merged_fields: FieldMap,
}

/// One entry of an entity's version history
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub version: i64,
    pub editor: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "changeKind")]
    pub change_kind: ChangeKind,
}

/// Create a new entity
async fn create_entity(
    State(state): State<AppState>,
    Json(req): Json<CreateEntityRequest>,
) -> Result<Response> {
    let kind = EntityKind::parse(&req.kind)?;
    kind.validate_payload(&req.fields, true)?;

    let user = req.user.as_deref().unwrap_or("anonymous");
    let entity = EntityRepository::new(state.db())
        .create(kind, &req.fields, user)
        .await?;

    Ok((StatusCode::CREATED, Json(entity)).into_response())
}

/// List active entities, optionally by kind
async fn list_entities(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<VersionedEntity>>> {
    let kind = params.kind.as_deref().map(EntityKind::parse).transpose()?;
    let entities = EntityRepository::new(state.db()).list(kind).await?;
    Ok(Json(entities))
}

/// Get an entity by ID
async fn get_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VersionedEntity>> {
    let entity = EntityRepository::new(state.db())
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Entity not found: {}", id)))?;
    Ok(Json(entity))
}

/// Check for a version conflict before saving
async fn conflict_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConflictCheckRequest>,
) -> Result<Response> {
    let entity = EntityRepository::new(state.db())
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Entity not found: {}", id)))?;

    if has_conflict(entity.version, req.version) {
        return Ok((
            StatusCode::CONFLICT,
            Json(ConflictCheckResponse {
                conflict: true,
                server_version: entity.version,
                client_version: req.version,
                message: Some("Entity has been updated by another user".to_string()),
            }),
        )
            .into_response());
    }

    Ok(Json(ConflictCheckResponse {
        conflict: false,
        server_version: entity.version,
        client_version: req.version,
        message: None,
    })
    .into_response())
}

/// Update an entity with optimistic concurrency control.
///
/// A version mismatch triggers a three-way merge; non-overlapping edits
/// apply automatically, a true field conflict returns 409 with the merge
/// proposal so the client can resolve it.
async fn update_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateEntityRequest>,
) -> Result<Response> {
    let repo = EntityRepository::new(state.db());
    let entity = repo
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Entity not found: {}", id)))?;

    entity.kind.validate_payload(&req.fields, false)?;

    let user = req.user.as_deref().unwrap_or("anonymous");
    match apply_update(state.db(), &id, &req.fields, req.version, user).await? {
        UpdateOutcome::Applied { .. } => {
            let updated = repo
                .get(&id)
                .await?
                .ok_or_else(|| AppError::Internal("Failed to reload updated entity".to_string()))?;
            Ok(Json(updated).into_response())
        }
        UpdateOutcome::Conflict {
            expected_version,
            conflicting_fields,
            merged_fields,
        } => Ok((
            StatusCode::CONFLICT,
            Json(ConflictDetectedResponse {
                error: "CONFLICT_DETECTED",
                expected_version,
                conflicting_fields,
                merged_fields,
            }),
        )
            .into_response()),
    }
}

/// Get the version history of an entity, newest first
async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HistoryEntry>>> {
    let snapshots = EntityRepository::new(state.db()).history(&id).await?;

    if snapshots.is_empty() {
        return Err(AppError::NotFound(format!("Entity not found: {}", id)));
    }

    let entries = snapshots
        .into_iter()
        .map(|s| HistoryEntry {
            version: s.version,
            editor: s.editor,
            timestamp: s.recorded_at,
            change_kind: s.change_kind,
        })
        .collect();

    Ok(Json(entries))
}
