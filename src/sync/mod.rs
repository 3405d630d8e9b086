//! Offline change synchronization
//!
//! Batch replay of mutations captured while disconnected, with optimistic
//! concurrency control and three-way merge on version mismatch.

mod coordinator;
mod queue;
mod types;

pub use coordinator::{apply_update, BatchSyncCoordinator, UpdateOutcome};
pub use queue::ChangeQueueRepository;
pub use types::{
    ChangeInput, ConflictedChange, FailedChange, QueuedChange, SyncBatchRequest,
    SyncBatchResponse, SyncReport, SyncStatus, SyncedChange,
};
