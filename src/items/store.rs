//! Live item table.
//!
//! Holds the current `(session, key) -> item` state. The change log is
//! authoritative: the on-disk snapshot records the last applied sequence,
//! and the store replays newer log records on open to catch up.

use crate::error::{Result, StoreError};
use crate::types::{ChangeOp, ChangeRecord, Item, ItemId, SequenceId, SessionId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the item snapshot file.
const ITEM_INDEX_MAGIC: &[u8; 4] = b"ITM\0";

/// Current item snapshot format version.
const ITEM_INDEX_VERSION: u8 = 1;

/// Item table stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ItemIndex {
    /// All live items by id.
    items: HashMap<ItemId, Item>,

    /// `(session, key)` to id mapping.
    by_key: HashMap<(SessionId, String), ItemId>,

    /// Next item id to assign.
    next_id: u64,

    /// Sequence of the last change record reflected in this table.
    last_applied: u64,
}

/// In-memory item table with snapshot persistence.
pub struct ItemStore {
    path: PathBuf,
    index: RwLock<ItemIndex>,
}

impl ItemStore {
    /// Open the item table, loading the snapshot if one exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let store = Self {
            path: path.clone(),
            index: RwLock::new(ItemIndex {
                next_id: 1,
                ..Default::default()
            }),
        };

        if path.exists() {
            store.load_from_file()?;
        }

        Ok(store)
    }

    /// Sequence of the last change record applied to this table.
    pub fn last_applied(&self) -> SequenceId {
        SequenceId(self.index.read().last_applied)
    }

    /// Reserve a fresh item id. Ids burned by aborted mutations are never
    /// reused.
    pub fn allocate_id(&self) -> ItemId {
        let mut index = self.index.write();
        let id = ItemId(index.next_id);
        index.next_id += 1;
        id
    }

    /// Get an item by session and key.
    pub fn get(&self, session: &SessionId, key: &str) -> Option<Item> {
        let index = self.index.read();
        let id = index.by_key.get(&(session.clone(), key.to_string()))?;
        index.items.get(id).cloned()
    }

    /// Get an item by id.
    pub fn get_by_id(&self, id: ItemId) -> Option<Item> {
        self.index.read().items.get(&id).cloned()
    }

    /// All items of one session, ordered by key.
    pub fn list(&self, session: &SessionId) -> Vec<Item> {
        let index = self.index.read();
        let mut items: Vec<Item> = index
            .items
            .values()
            .filter(|i| i.session_id == *session)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    /// Insert or replace an item, marking `sequence` as applied.
    pub fn put(&self, item: Item, sequence: SequenceId) {
        let mut index = self.index.write();
        index
            .by_key
            .insert((item.session_id.clone(), item.key.clone()), item.id);
        index.items.insert(item.id, item);
        index.last_applied = index.last_applied.max(sequence.0);
    }

    /// Remove an item, marking `sequence` as applied.
    pub fn remove(&self, session: &SessionId, key: &str, sequence: SequenceId) -> Option<Item> {
        let mut index = self.index.write();
        let id = index.by_key.remove(&(session.clone(), key.to_string()))?;
        let removed = index.items.remove(&id);
        index.last_applied = index.last_applied.max(sequence.0);
        removed
    }

    /// Refresh an item's `updated_at` without any other change. No change
    /// record exists for this, so it is not replayable and is best-effort
    /// across restarts.
    pub fn touch(&self, session: &SessionId, key: &str, now: Timestamp) {
        let mut index = self.index.write();
        if let Some(id) = index.by_key.get(&(session.clone(), key.to_string())).copied() {
            if let Some(item) = index.items.get_mut(&id) {
                item.updated_at = now;
            }
        }
    }

    /// Apply one change record, used when replaying the log on open.
    pub fn apply(&self, record: &ChangeRecord) {
        let mut index = self.index.write();

        match record.op {
            ChangeOp::Create | ChangeOp::Update => {
                let Some(meta) = &record.new_metadata else {
                    return;
                };
                let Some(value) = &record.new_value else {
                    return;
                };

                let created_at = index
                    .items
                    .get(&record.item_id)
                    .map(|existing| existing.created_at)
                    .unwrap_or(record.created_at);

                let item = Item {
                    id: record.item_id,
                    session_id: record.session_id.clone(),
                    key: record.key.clone(),
                    value: value.clone(),
                    category: meta.category,
                    priority: meta.priority,
                    channel: meta.channel.clone(),
                    is_private: meta.is_private,
                    size: meta.size,
                    created_at,
                    updated_at: record.created_at,
                };

                index
                    .by_key
                    .insert((item.session_id.clone(), item.key.clone()), item.id);
                index.items.insert(item.id, item);
            }
            ChangeOp::Delete => {
                index
                    .by_key
                    .remove(&(record.session_id.clone(), record.key.clone()));
                index.items.remove(&record.item_id);
            }
        }

        index.next_id = index.next_id.max(record.item_id.0 + 1);
        index.last_applied = index.last_applied.max(record.sequence.0);
    }

    /// Number of live items.
    pub fn count(&self) -> u64 {
        self.index.read().items.len() as u64
    }

    /// Total bytes across all live item values.
    pub fn total_value_bytes(&self) -> u64 {
        self.index.read().items.values().map(|i| i.size).sum()
    }

    /// Save the item table to file.
    pub fn save(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(ITEM_INDEX_MAGIC)?;
        file.write_all(&[ITEM_INDEX_VERSION])?;

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
        if &magic != ITEM_INDEX_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid item snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ITEM_INDEX_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported item snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let index: ItemIndex = rmp_serde::from_slice(&encoded)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        *self.index.write() = index;

        Ok(())
    }
}
