//! Conflict detection and resolution
//!
//! Pure merge strategies for concurrent edits, the version-conflict
//! predicate, and the append-only conflict audit log.

mod detect;
mod engine;
mod log;

pub use detect::has_conflict;
pub use engine::{field_level_merge, last_write_wins, three_way_merge, MergeStrategy};
pub use log::{ConflictLogRepository, ConflictRecord};
