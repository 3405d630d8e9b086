//! Sync API endpoints
//!
//! Batch replay of offline changes and queue inspection.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{
    BatchSyncCoordinator, ChangeQueueRepository, QueuedChange, SyncBatchRequest,
    SyncBatchResponse,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/batch", post(batch_sync))
        .route("/pending/:user_id", get(pending_changes))
}

/// Replay a batch of offline changes.
///
/// The response always partitions the input into synced, conflicts, and
/// failed; a partial outcome is reported as 207 so callers can tell it
/// apart from a fully clean sync.
async fn batch_sync(
    State(state): State<AppState>,
    Json(req): Json<SyncBatchRequest>,
) -> Result<Response> {
    if req.changes.is_empty() {
        return Err(AppError::BadRequest("No changes provided".to_string()));
    }

    let coordinator = BatchSyncCoordinator::new(state.db());
    let results = coordinator.sync_batch(&req.user_id, req.changes).await;

    let message = if !results.conflicts.is_empty() {
        format!(
            "Synced {} changes, {} conflicts detected",
            results.synced.len(),
            results.conflicts.len()
        )
    } else if !results.failed.is_empty() {
        format!(
            "Synced {} changes, {} failed",
            results.synced.len(),
            results.failed.len()
        )
    } else {
        format!("Successfully synced {} changes", results.synced.len())
    };

    let status = if results.is_clean() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };

    Ok((status, Json(SyncBatchResponse { message, results })).into_response())
}

/// Pending queued changes for a user, in replay order
async fn pending_changes(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<QueuedChange>>> {
    let pending = ChangeQueueRepository::new(state.db())
        .pending_for_user(&user_id)
        .await?;
    Ok(Json(pending))
}
