//! Checkpoint snapshots and the diff engine.

pub mod diff;
pub mod snapshot;

pub use diff::{DeletedEntry, DiffEntry, DiffMode, DiffRequest, DiffResponse};
pub use snapshot::{CheckpointEntry, CheckpointSnapshot, CheckpointStore};
