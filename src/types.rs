//! Core types for the memory store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for an item.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global position in the change log. Strictly increasing, store-wide.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceId(pub u64);

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceId {
    pub fn next(self) -> Self {
        SequenceId(self.0 + 1)
    }
}

/// Unique identifier for a watcher.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatcherId(pub u64);

impl fmt::Debug for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatcherId({})", self.0)
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a checkpoint snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

impl fmt::Debug for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CheckpointId({})", self.0)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session scope for items, watchers, and checkpoints.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    /// This timestamp plus a number of whole seconds.
    pub fn plus_secs(self, secs: u64) -> Self {
        Timestamp(self.0 + (secs as i64) * 1_000_000)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Item category. Closed set: unknown values fail filter validation at the
/// deserialization boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Task,
    Note,
    Decision,
    Reference,
    Conversation,
}

impl Default for Category {
    fn default() -> Self {
        Category::Note
    }
}

/// Item priority. Closed set, like [`Category`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// A keyed item in the store. `(session_id, key)` is unique.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier (assigned by store).
    pub id: ItemId,

    /// Owning session.
    pub session_id: SessionId,

    /// Key, unique within the session.
    pub key: String,

    /// Payload value.
    pub value: String,

    pub category: Category,
    pub priority: Priority,

    /// Free-form channel tag (open set).
    pub channel: String,

    /// Private items are hidden from cross-session watchers.
    pub is_private: bool,

    /// Value size in bytes, maintained by the store.
    pub size: u64,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Item {
    /// Build a fresh item from input (assigns size and timestamps).
    pub fn new(id: ItemId, session_id: SessionId, input: ItemInput, now: Timestamp) -> Self {
        let size = input.value.len() as u64;
        Self {
            id,
            session_id,
            key: input.key,
            value: input.value,
            category: input.category,
            priority: input.priority,
            channel: input.channel,
            is_private: input.is_private,
            size,
            created_at: now,
            updated_at: now,
        }
    }

    /// Snapshot of the metadata fields tracked in change records.
    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            category: self.category,
            priority: self.priority,
            channel: self.channel.clone(),
            is_private: self.is_private,
            size: self.size,
        }
    }
}

/// Input for saving an item (before id/size/timestamps are assigned).
#[derive(Clone, Debug)]
pub struct ItemInput {
    pub key: String,
    pub value: String,
    pub category: Category,
    pub priority: Priority,
    pub channel: String,
    pub is_private: bool,
}

impl ItemInput {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            category: Category::default(),
            priority: Priority::default(),
            channel: "default".to_string(),
            is_private: false,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn private(mut self) -> Self {
        self.is_private = true;
        self
    }
}

/// Metadata portion of an item, embedded in change records so the live
/// table can be rebuilt from the log alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub category: Category,
    pub priority: Priority,
    pub channel: String,
    pub is_private: bool,
    pub size: u64,
}

/// Kind of mutation a change record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Create => write!(f, "create"),
            ChangeOp::Update => write!(f, "update"),
            ChangeOp::Delete => write!(f, "delete"),
        }
    }
}

/// Immutable log entry describing one meaningful item mutation.
///
/// Append-only: never mutated or deleted after write. Exactly one record is
/// written per meaningful mutation; pure timestamp refreshes produce none.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Global, strictly increasing sequence number.
    pub sequence: SequenceId,

    pub session_id: SessionId,
    pub item_id: ItemId,
    pub key: String,

    pub op: ChangeOp,

    /// Value before the mutation (None for CREATE).
    pub old_value: Option<String>,

    /// Value after the mutation (None for DELETE).
    pub new_value: Option<String>,

    pub old_metadata: Option<ItemMetadata>,
    pub new_metadata: Option<ItemMetadata>,

    /// Post-mutation category/priority/channel (pre-mutation for DELETE),
    /// denormalized for filter matching.
    pub category: Category,
    pub priority: Priority,
    pub channel: String,

    /// Signed size difference in bytes.
    pub size_delta: i64,

    pub created_at: Timestamp,

    /// Logical origin tag (e.g. "item-save"). Audit only, never filtered on.
    pub created_by: String,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub item_count: u64,
    pub change_count: u64,
    pub watcher_count: u64,
    pub checkpoint_count: u64,
    pub total_value_bytes: u64,
    pub log_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_next() {
        assert_eq!(SequenceId(0).next(), SequenceId(1));
        assert_eq!(SequenceId(41).next(), SequenceId(42));
    }

    #[test]
    fn test_timestamp_plus_secs() {
        let t = Timestamp(1_000_000);
        assert_eq!(t.plus_secs(2), Timestamp(3_000_000));
    }

    #[test]
    fn test_item_new_assigns_size() {
        let item = Item::new(
            ItemId(1),
            SessionId::new("s1"),
            ItemInput::new("k", "hello"),
            Timestamp::now(),
        );
        assert_eq!(item.size, 5);
        assert_eq!(item.created_at, item.updated_at);
    }

    #[test]
    fn test_category_serde_names() {
        let json = serde_json::to_string(&Category::Task).unwrap();
        assert_eq!(json, "\"task\"");
        let back: Category = serde_json::from_str("\"decision\"").unwrap();
        assert_eq!(back, Category::Decision);
        assert!(serde_json::from_str::<Category>("\"bogus\"").is_err());
    }

    #[test]
    fn test_item_input_builders() {
        let input = ItemInput::new("task_1", "v")
            .with_category(Category::Task)
            .with_priority(Priority::High)
            .with_channel("work")
            .private();
        assert_eq!(input.category, Category::Task);
        assert_eq!(input.priority, Priority::High);
        assert_eq!(input.channel, "work");
        assert!(input.is_private);
    }
}
