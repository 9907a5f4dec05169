//! Checkpoint snapshots: frozen item membership for a session.

use crate::error::{Result, StoreError};
use crate::types::{CheckpointId, Item, ItemId, SessionId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the checkpoint snapshot file.
const CHECKPOINT_INDEX_MAGIC: &[u8; 4] = b"CKP\0";

/// Current checkpoint snapshot format version.
const CHECKPOINT_INDEX_VERSION: u8 = 1;

/// One frozen item in a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub item_id: ItemId,
    pub key: String,
    pub value: String,
}

/// An immutable record of item membership/state for a session at one
/// instant. Membership is frozen at creation: a key re-created under a new
/// id later is not retroactively part of this snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub id: CheckpointId,
    pub session_id: SessionId,
    pub name: String,
    pub created_at: Timestamp,
    pub entries: Vec<CheckpointEntry>,
}

impl CheckpointSnapshot {
    /// The frozen `key -> value` map used by snapshot diffs.
    pub fn value_map(&self) -> HashMap<&str, &str> {
        self.entries
            .iter()
            .map(|e| (e.key.as_str(), e.value.as_str()))
            .collect()
    }
}

/// Checkpoint table stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    checkpoints: HashMap<CheckpointId, CheckpointSnapshot>,
    next_id: u64,
}

/// Stores checkpoint snapshots. Snapshots are write-once.
pub struct CheckpointStore {
    path: PathBuf,
    index: RwLock<CheckpointIndex>,
}

impl CheckpointStore {
    /// Open the checkpoint store, loading the snapshot file if present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let store = Self {
            path: path.clone(),
            index: RwLock::new(CheckpointIndex {
                next_id: 1,
                ..Default::default()
            }),
        };

        if path.exists() {
            store.load_from_file()?;
        }

        Ok(store)
    }

    /// Freeze the given items into a new checkpoint.
    pub fn create(
        &self,
        session_id: SessionId,
        name: impl Into<String>,
        items: &[Item],
    ) -> Result<CheckpointSnapshot> {
        let snapshot = {
            let mut index = self.index.write();
            let id = CheckpointId(index.next_id);
            index.next_id += 1;

            let snapshot = CheckpointSnapshot {
                id,
                session_id,
                name: name.into(),
                created_at: Timestamp::now(),
                entries: items
                    .iter()
                    .map(|i| CheckpointEntry {
                        item_id: i.id,
                        key: i.key.clone(),
                        value: i.value.clone(),
                    })
                    .collect(),
            };

            index.checkpoints.insert(id, snapshot.clone());
            snapshot
        };

        self.save()?;
        Ok(snapshot)
    }

    /// Get a checkpoint by id.
    pub fn get(&self, id: CheckpointId) -> Option<CheckpointSnapshot> {
        self.index.read().checkpoints.get(&id).cloned()
    }

    /// All checkpoints of one session, oldest first.
    pub fn list(&self, session: &SessionId) -> Vec<CheckpointSnapshot> {
        let index = self.index.read();
        let mut snapshots: Vec<CheckpointSnapshot> = index
            .checkpoints
            .values()
            .filter(|c| c.session_id == *session)
            .cloned()
            .collect();
        snapshots.sort_by_key(|c| c.id.0);
        snapshots
    }

    /// Number of stored checkpoints.
    pub fn count(&self) -> u64 {
        self.index.read().checkpoints.len() as u64
    }

    /// Save the checkpoint table to file.
    pub fn save(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(CHECKPOINT_INDEX_MAGIC)?;
        file.write_all(&[CHECKPOINT_INDEX_VERSION])?;

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
        if &magic != CHECKPOINT_INDEX_MAGIC {
            return Err(StoreError::InvalidFormat(
                "Invalid checkpoint snapshot magic".into(),
            ));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_INDEX_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported checkpoint snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let index: CheckpointIndex = rmp_serde::from_slice(&encoded)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        *self.index.write() = index;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemInput;
    use tempfile::TempDir;

    fn make_item(id: u64, key: &str, value: &str) -> Item {
        Item::new(
            ItemId(id),
            SessionId::new("s1"),
            ItemInput::new(key, value),
            Timestamp::now(),
        )
    }

    #[test]
    fn test_membership_is_frozen() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoints.bin")).unwrap();

        let items = vec![make_item(1, "a", "1"), make_item(2, "b", "2")];
        let snapshot = store
            .create(SessionId::new("s1"), "before-change", &items)
            .unwrap();

        // The stored snapshot is independent of later item state.
        let fetched = store.get(snapshot.id).unwrap();
        assert_eq!(fetched.entries.len(), 2);
        let map = fetched.value_map();
        assert_eq!(map.get("a"), Some(&"1"));
        assert_eq!(map.get("b"), Some(&"2"));
    }

    #[test]
    fn test_list_and_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.bin");
        let session = SessionId::new("s1");

        {
            let store = CheckpointStore::open(&path).unwrap();
            store.create(session.clone(), "first", &[]).unwrap();
            store
                .create(SessionId::new("other"), "second", &[])
                .unwrap();
        }

        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.count(), 2);
        let listed = store.list(&session);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "first");
    }
}
