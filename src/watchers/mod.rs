//! Polling watchers over the change log.
//!
//! There is deliberately no push or streaming channel here: a watcher is a
//! cursor plus a filter, and callers re-poll to observe new changes.

pub mod registry;
pub mod types;

pub use registry::WatcherRegistry;
pub use types::{
    glob_match, ChangeEntry, PollResponse, StopResponse, WatchCreated, WatchList, Watcher,
    WatcherFilter, WatcherState, WatcherStatus, WatcherSummary, DEFAULT_POLL_LIMIT,
    DEFAULT_TTL_SECS,
};
