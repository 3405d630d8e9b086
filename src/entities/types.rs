//! Versioned entity model
//!
//! Defines the closed set of editable entity kinds, the versioned record
//! stored in SQLite, and per-kind payload validation. Payloads are checked
//! against a fixed field schema at the ingestion boundary, before any merge
//! or apply logic runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

/// Named field values for an entity, keyed by field name.
pub type FieldMap = Map<String, Value>;

/// The closed set of entity kinds that can be edited and synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    FloorPlan,
    Room,
    Booking,
}

/// Expected JSON type for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Text,
    Integer,
    Number,
    Boolean,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::Text => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::Text => "a string",
            FieldType::Integer => "an integer",
            FieldType::Number => "a number",
            FieldType::Boolean => "a boolean",
        }
    }
}

const FLOOR_PLAN_SCHEMA: &[(&str, FieldType)] = &[
    ("name", FieldType::Text),
    ("floor_number", FieldType::Integer),
    ("is_active", FieldType::Boolean),
];

const ROOM_SCHEMA: &[(&str, FieldType)] = &[
    ("floor_plan_id", FieldType::Text),
    ("name", FieldType::Text),
    ("room_number", FieldType::Text),
    ("room_type", FieldType::Text),
    ("capacity", FieldType::Integer),
    ("location_x", FieldType::Number),
    ("location_y", FieldType::Number),
    ("has_projector", FieldType::Boolean),
    ("has_whiteboard", FieldType::Boolean),
    ("has_video_conference", FieldType::Boolean),
    ("is_active", FieldType::Boolean),
];

const BOOKING_SCHEMA: &[(&str, FieldType)] = &[
    ("room_id", FieldType::Text),
    ("start_time", FieldType::Text),
    ("end_time", FieldType::Text),
    ("participants_count", FieldType::Integer),
    ("purpose", FieldType::Text),
    ("status", FieldType::Text),
];

impl EntityKind {
    /// Parse the wire/storage form of a kind.
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "floor_plan" => Ok(EntityKind::FloorPlan),
            "room" => Ok(EntityKind::Room),
            "booking" => Ok(EntityKind::Booking),
            other => Err(AppError::UnsupportedEntityKind(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::FloorPlan => "floor_plan",
            EntityKind::Room => "room",
            EntityKind::Booking => "booking",
        }
    }

    fn schema(&self) -> &'static [(&'static str, FieldType)] {
        match self {
            EntityKind::FloorPlan => FLOOR_PLAN_SCHEMA,
            EntityKind::Room => ROOM_SCHEMA,
            EntityKind::Booking => BOOKING_SCHEMA,
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::FloorPlan => &["name", "floor_number"],
            EntityKind::Room => &["floor_plan_id", "name", "room_number", "capacity"],
            EntityKind::Booking => &["room_id", "start_time", "end_time", "participants_count"],
        }
    }

    /// Validate a payload against this kind's field schema.
    ///
    /// `require_all` is set for CREATE payloads; UPDATE payloads may carry
    /// any subset of the known fields.
    pub fn validate_payload(&self, payload: &FieldMap, require_all: bool) -> Result<(), AppError> {
        for (name, value) in payload {
            let Some((_, field_type)) = self.schema().iter().find(|(n, _)| n == name) else {
                return Err(AppError::Validation(format!(
                    "unknown field `{}` for {}",
                    name,
                    self.as_str()
                )));
            };
            if !field_type.matches(value) {
                return Err(AppError::Validation(format!(
                    "field `{}` of {} expects {}",
                    name,
                    self.as_str(),
                    field_type.name()
                )));
            }
        }

        if require_all {
            for required in self.required_fields() {
                if !payload.contains_key(*required) {
                    return Err(AppError::Validation(format!(
                        "missing required field `{}` for {}",
                        required,
                        self.as_str()
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Kind of committed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    /// Parse the wire/storage form of a change kind (case-insensitive, the
    /// offline clients send uppercase).
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            _ => Err(AppError::UnsupportedChangeKind(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A mutable entity carrying an optimistic-concurrency version counter.
///
/// The version changes only as the result of a successfully committed
/// apply; it is strictly increasing and never reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedEntity {
    pub id: String,
    pub kind: EntityKind,
    pub version: i64,
    pub fields: FieldMap,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

/// Immutable record of an entity's field-state at a past version.
///
/// Appended on every committed mutation; never mutated or deleted. Used as
/// the common-ancestor input to three-way merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalSnapshot {
    pub entity_id: String,
    pub version: i64,
    pub fields: FieldMap,
    pub editor: Option<String>,
    pub change_kind: ChangeKind,
    pub recorded_at: DateTime<Utc>,
}
