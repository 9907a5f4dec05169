//! Watcher registry: subscription storage and lifecycle.
//!
//! Polling itself lives in the store facade (it needs the change log and
//! the live item table); the registry owns watcher state transitions and
//! the monotonic cursor.

use crate::error::{Result, StoreError};
use crate::types::{SequenceId, SessionId, Timestamp, WatcherId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::types::{Watcher, WatcherFilter, WatcherState};

/// Magic bytes for the watcher snapshot file.
const WATCHER_INDEX_MAGIC: &[u8; 4] = b"WTC\0";

/// Current watcher snapshot format version.
const WATCHER_INDEX_VERSION: u8 = 1;

/// Watcher table stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WatcherIndex {
    watchers: HashMap<WatcherId, Watcher>,
    next_id: u64,
}

/// Stores and manages watcher subscriptions.
pub struct WatcherRegistry {
    path: PathBuf,
    index: RwLock<WatcherIndex>,
}

impl WatcherRegistry {
    /// Open the registry, loading the snapshot if one exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let registry = Self {
            path: path.clone(),
            index: RwLock::new(WatcherIndex {
                next_id: 1,
                ..Default::default()
            }),
        };

        if path.exists() {
            registry.load_from_file()?;
        }

        Ok(registry)
    }

    /// Register a new watcher. The filter must already be validated; the
    /// cursor is the caller-computed max sequence visible to the scope, so
    /// the watcher never sees backlog.
    pub fn create(
        &self,
        session_id: Option<SessionId>,
        filter: WatcherFilter,
        ttl_seconds: u64,
        cursor: SequenceId,
    ) -> Result<Watcher> {
        let now = Timestamp::now();

        let watcher = {
            let mut index = self.index.write();
            let id = WatcherId(index.next_id);
            index.next_id += 1;

            let watcher = Watcher {
                id,
                session_id,
                filter,
                last_sequence: cursor,
                ttl_seconds,
                created_at: now,
                last_poll_at: None,
                expires_at: now.plus_secs(ttl_seconds),
                state: WatcherState::Active,
            };

            index.watchers.insert(id, watcher.clone());
            watcher
        };

        self.save()?;
        Ok(watcher)
    }

    /// Get a watcher by id.
    pub fn get(&self, id: WatcherId) -> Option<Watcher> {
        self.index.read().watchers.get(&id).cloned()
    }

    /// Stop a watcher. Idempotent: returns true the first time, false on
    /// repeat calls. Unknown ids are an error so callers can tell a
    /// garbage-collected watcher from a stopped one.
    pub fn stop(&self, id: WatcherId) -> Result<bool> {
        let stopped = {
            let mut index = self.index.write();
            let watcher = index
                .watchers
                .get_mut(&id)
                .ok_or(StoreError::WatcherNotFound(id))?;

            if watcher.state == WatcherState::Active {
                watcher.state = WatcherState::Stopped;
                true
            } else {
                false
            }
        };

        if stopped {
            self.save()?;
        }
        Ok(stopped)
    }

    /// List watchers, scoped to one session when given. Stopped and
    /// TTL-lapsed watchers are hidden unless `include_expired` is set.
    pub fn list(&self, session: Option<&SessionId>, include_expired: bool) -> Vec<Watcher> {
        let now = Timestamp::now();
        let index = self.index.read();

        let mut watchers: Vec<Watcher> = index
            .watchers
            .values()
            .filter(|w| match session {
                Some(s) => w.session_id.as_ref() == Some(s),
                None => true,
            })
            .filter(|w| include_expired || (w.is_active() && !w.is_expired(now)))
            .cloned()
            .collect();

        watchers.sort_by_key(|w| w.id.0);
        watchers
    }

    /// Mark a watcher Expired (lazy detection during poll).
    pub fn expire(&self, id: WatcherId) -> Result<()> {
        {
            let mut index = self.index.write();
            if let Some(watcher) = index.watchers.get_mut(&id) {
                if watcher.state == WatcherState::Active {
                    tracing::debug!(watcher = %id, "watcher expired");
                    watcher.state = WatcherState::Expired;
                }
            }
        }
        self.save()
    }

    /// Record a successful active poll: advance the cursor monotonically
    /// (never backward, even under concurrent polls) and renew the TTL.
    /// Returns the persisted cursor.
    pub fn complete_poll(
        &self,
        id: WatcherId,
        cursor: SequenceId,
        now: Timestamp,
    ) -> Result<SequenceId> {
        let persisted = {
            let mut index = self.index.write();
            let watcher = index
                .watchers
                .get_mut(&id)
                .ok_or(StoreError::WatcherNotFound(id))?;

            watcher.last_sequence = watcher.last_sequence.max(cursor);
            watcher.last_poll_at = Some(now);
            watcher.expires_at = now.plus_secs(watcher.ttl_seconds);
            watcher.last_sequence
        };

        self.save()?;
        Ok(persisted)
    }

    /// Remove watchers that have been dead for longer than `grace_seconds`.
    /// Storage reclamation only; correctness never depends on this running.
    pub fn sweep_expired(&self, grace_seconds: u64) -> Result<usize> {
        let now = Timestamp::now();

        let removed = {
            let mut index = self.index.write();
            let before = index.watchers.len();
            index.watchers.retain(|_, w| {
                (w.state == WatcherState::Active && !w.is_expired(now))
                    || now <= w.expires_at.plus_secs(grace_seconds)
            });
            before - index.watchers.len()
        };

        if removed > 0 {
            tracing::debug!(removed, "swept expired watchers");
            self.save()?;
        }
        Ok(removed)
    }

    /// Number of registered watchers (any state).
    pub fn count(&self) -> u64 {
        self.index.read().watchers.len() as u64
    }

    /// Save the watcher table to file.
    pub fn save(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(WATCHER_INDEX_MAGIC)?;
        file.write_all(&[WATCHER_INDEX_VERSION])?;

        let index = self.index.read();
        let encoded =
            rmp_serde::to_vec(&*index).map_err(|e| StoreError::Serialization(e.to_string()))?;

        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;

        file.sync_all()?;
        Ok(())
    }

    fn load_from_file(&self) -> Result<()> {
        let mut file = File::open(&self.path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != WATCHER_INDEX_MAGIC {
            return Err(StoreError::InvalidFormat(
                "Invalid watcher snapshot magic".into(),
            ));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != WATCHER_INDEX_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported watcher snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let index: WatcherIndex = rmp_serde::from_slice(&encoded)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        *self.index.write() = index;

        Ok(())
    }
}
