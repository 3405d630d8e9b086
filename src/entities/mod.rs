//! Versioned entity storage
//!
//! Entities carry a monotonically increasing version counter and an
//! append-only history of prior field-states.

mod store;
mod types;

pub use store::{
    append_history_in_tx, commit_update_in_tx, insert_in_tx, load_in_tx, snapshot_in_tx,
    tombstone_in_tx, EntityRepository,
};
pub use types::{ChangeKind, EntityKind, FieldMap, HistoricalSnapshot, VersionedEntity};
