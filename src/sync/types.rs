//! Offline sync data types
//!
//! Defines the queued-change record, the batch sync request/response wire
//! format, and the partitioned outcome report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{ChangeKind, EntityKind, FieldMap};
use crate::merge::MergeStrategy;

/// Sync status of a queued change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            "conflict" => Some(SyncStatus::Conflict),
            _ => None,
        }
    }
}

/// A mutation captured while offline, as stored in the queue.
///
/// Queue entries are never deleted; the coordinator only updates their
/// status, keyed by the unique change id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedChange {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "changeKind")]
    pub change_kind: ChangeKind,
    #[serde(rename = "entityKind")]
    pub entity_kind: EntityKind,
    #[serde(rename = "entityId", skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub payload: FieldMap,
    #[serde(rename = "baseVersion", skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
    #[serde(rename = "capturedAt")]
    pub captured_at: DateTime<Utc>,
    pub priority: i64,
    #[serde(rename = "syncStatus")]
    pub sync_status: SyncStatus,
    pub attempts: i64,
    #[serde(rename = "syncedAt", skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Wire form of one change in a batch sync request.
///
/// Kinds arrive as plain strings so that a single unrecognized kind fails
/// that change alone instead of rejecting the whole request body at
/// deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeInput {
    /// Client-assigned change id; the server assigns one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "changeKind")]
    pub change_kind: String,
    #[serde(rename = "entityKind")]
    pub entity_kind: String,
    #[serde(rename = "entityId", default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: FieldMap,
    #[serde(rename = "baseVersion", default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
    #[serde(rename = "capturedAt", default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    5
}

/// Request body for a batch sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatchRequest {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub changes: Vec<ChangeInput>,
}

/// A change that was applied successfully
#[derive(Debug, Clone, Serialize)]
pub struct SyncedChange {
    #[serde(rename = "changeId")]
    pub change_id: String,
    #[serde(rename = "changeKind")]
    pub change_kind: ChangeKind,
    #[serde(rename = "entityKind")]
    pub entity_kind: EntityKind,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    #[serde(rename = "newVersion", skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    /// Present when a stale change was reconciled automatically
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<MergeStrategy>,
}

/// A change that hit a true field conflict and was not applied
#[derive(Debug, Clone, Serialize)]
pub struct ConflictedChange {
    #[serde(rename = "changeId")]
    pub change_id: String,
    #[serde(rename = "changeKind")]
    pub change_kind: ChangeKind,
    #[serde(rename = "entityKind")]
    pub entity_kind: EntityKind,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    #[serde(rename = "expectedVersion")]
    pub expected_version: i64,
    #[serde(rename = "conflictingFields")]
    pub conflicting_fields: Vec<String>,
    #[serde(rename = "mergedFields")]
    pub merged_fields: FieldMap,
}

/// A change that could not be applied
#[derive(Debug, Clone, Serialize)]
pub struct FailedChange {
    #[serde(rename = "changeId")]
    pub change_id: String,
    #[serde(rename = "changeKind")]
    pub change_kind: String,
    #[serde(rename = "entityKind")]
    pub entity_kind: String,
    #[serde(rename = "entityId", skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub error: String,
}

/// Partitioned outcome of a batch sync.
///
/// The three lists always cover the input changes exactly: every submitted
/// change lands in exactly one of them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub synced: Vec<SyncedChange>,
    pub conflicts: Vec<ConflictedChange>,
    pub failed: Vec<FailedChange>,
}

impl SyncReport {
    /// True when every change synced cleanly
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.synced.len() + self.conflicts.len() + self.failed.len()
    }
}

/// Response body for a batch sync
#[derive(Debug, Clone, Serialize)]
pub struct SyncBatchResponse {
    pub message: String,
    pub results: SyncReport,
}
