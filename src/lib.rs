//! # Session Memory Store
//!
//! An embedded store for keyed session items with change tracking, polling
//! watchers, and checkpoint diffs.
//!
//! ## Core Concepts
//!
//! - **Items**: Keyed records scoped to a session; `(session, key)` unique
//! - **Change Records**: An append-only, globally sequenced log of every
//!   meaningful item mutation, written in the same atomic unit
//! - **Watchers**: Filtered, cursor-tracking poll subscriptions with TTLs
//! - **Checkpoints**: Frozen item membership, diffable against live state
//!   to recover additions, modifications, and deletions
//!
//! ## Example
//!
//! ```ignore
//! use memstore::{ItemInput, SessionId, Store, StoreConfig, WatcherFilter};
//!
//! let store = Store::open_or_create(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?;
//!
//! let session = SessionId::new("agent-1");
//!
//! // Watch for task changes
//! let watch = store.create_watcher(
//!     Some(&session),
//!     WatcherFilter::keys(vec!["task_*".into()]),
//!     None,
//! )?;
//!
//! // Mutate an item; a change record is appended atomically
//! store.save_item(&session, ItemInput::new("task_1", "write the report"))?;
//!
//! // Pull the change
//! let response = store.poll(watch.watcher_id, None)?;
//! assert_eq!(response.changes.len(), 1);
//! ```

pub mod changes;
pub mod checkpoints;
pub mod error;
pub mod items;
pub mod store;
pub mod types;
pub mod watchers;

// Re-exports
pub use changes::ChangeLog;
pub use checkpoints::{
    CheckpointEntry, CheckpointSnapshot, CheckpointStore, DeletedEntry, DiffEntry, DiffMode,
    DiffRequest, DiffResponse,
};
pub use error::{Result, StoreError};
pub use items::ItemStore;
pub use store::{Store, StoreConfig};
pub use types::*;
pub use watchers::{
    ChangeEntry, PollResponse, StopResponse, WatchCreated, WatchList, Watcher, WatcherFilter,
    WatcherRegistry, WatcherState, WatcherStatus, WatcherSummary, DEFAULT_POLL_LIMIT,
    DEFAULT_TTL_SECS,
};
