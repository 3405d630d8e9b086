//! Conflict audit endpoints
//!
//! Read-only view over the append-only conflict log.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::error::Result;
use crate::merge::{ConflictLogRepository, ConflictRecord};
use crate::state::AppState;

/// Create the conflicts router
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_conflicts))
}

#[derive(Debug, Deserialize)]
pub struct ConflictListParams {
    #[serde(rename = "entityId")]
    pub entity_id: Option<String>,
    pub limit: Option<i64>,
}

/// List recorded resolution attempts, newest first
async fn list_conflicts(
    State(state): State<AppState>,
    Query(params): Query<ConflictListParams>,
) -> Result<Json<Vec<ConflictRecord>>> {
    let repo = ConflictLogRepository::new(state.db());

    let records = match params.entity_id {
        Some(entity_id) => repo.list_for_entity(&entity_id).await?,
        None => repo.list(params.limit.unwrap_or(100).min(500)).await?,
    };

    Ok(Json(records))
}
