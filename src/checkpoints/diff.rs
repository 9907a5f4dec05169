//! Diff engine: reconciles live items against a time cursor or a frozen
//! checkpoint snapshot.
//!
//! Cursor diffs compare timestamps only and cannot report deletions (a
//! removed row leaves no trace in the live table). Snapshot diffs compare
//! key identity against the frozen membership and do report deletions.

use crate::types::{Category, CheckpointId, Item, SessionId, Timestamp};
use serde::{Deserialize, Serialize};

use super::snapshot::{CheckpointEntry, CheckpointSnapshot};

/// How to compute the diff.
#[derive(Clone, Debug)]
pub enum DiffMode {
    /// Compare item timestamps against an instant.
    Since(Timestamp),
    /// Compare current keys against a frozen checkpoint.
    Checkpoint(CheckpointId),
}

/// A diff request. Filters and pagination apply to the reported lists;
/// summary counts always reflect the full (filtered) cardinalities.
#[derive(Clone, Debug)]
pub struct DiffRequest {
    pub session_id: SessionId,
    pub mode: DiffMode,
    pub categories: Option<Vec<Category>>,
    pub channels: Option<Vec<String>>,
    pub include_values: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl DiffRequest {
    pub fn since(session_id: SessionId, since: Timestamp) -> Self {
        Self {
            session_id,
            mode: DiffMode::Since(since),
            categories: None,
            channels: None,
            include_values: true,
            offset: 0,
            limit: None,
        }
    }

    pub fn checkpoint(session_id: SessionId, checkpoint: CheckpointId) -> Self {
        Self {
            session_id,
            mode: DiffMode::Checkpoint(checkpoint),
            categories: None,
            channels: None,
            include_values: true,
            offset: 0,
            limit: None,
        }
    }

    pub fn with_categories(mut self, categories: Vec<Category>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Strip values for a lightweight summary.
    pub fn without_values(mut self) -> Self {
        self.include_values = false;
        self
    }

    pub fn paged(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn item_passes(&self, item: &Item) -> bool {
        if let Some(categories) = &self.categories {
            if !categories.is_empty() && !categories.contains(&item.category) {
                return false;
            }
        }
        if let Some(channels) = &self.channels {
            if !channels.is_empty() && !channels.contains(&item.channel) {
                return false;
            }
        }
        true
    }
}

/// A live item as reported in a diff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffEntry {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub category: Category,
    pub channel: String,
    pub updated_at: Timestamp,
}

impl DiffEntry {
    fn from_item(item: &Item, include_values: bool) -> Self {
        Self {
            key: item.key.clone(),
            value: include_values.then(|| item.value.clone()),
            category: item.category,
            channel: item.channel.clone(),
            updated_at: item.updated_at,
        }
    }
}

/// A deleted key as reported by a snapshot diff. Only the frozen key and
/// value survive; the live row (and its metadata) is gone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeletedEntry {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Result of a diff. `deleted` is `None` in cursor mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffResponse {
    pub added: Vec<DiffEntry>,
    pub modified: Vec<DiffEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Vec<DeletedEntry>>,
    pub total_added: usize,
    pub total_modified: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_deleted: Option<usize>,
}

impl DiffResponse {
    /// An empty response; used by fail-closed read paths.
    pub fn empty(with_deleted: bool) -> Self {
        Self {
            added: Vec::new(),
            modified: Vec::new(),
            deleted: with_deleted.then(Vec::new),
            total_added: 0,
            total_modified: 0,
            total_deleted: with_deleted.then_some(0),
        }
    }

    /// Exact-cardinality summary, e.g. `"5 added, 3 modified, 2 deleted"`.
    /// Pagination never changes these counts.
    pub fn summary(&self) -> String {
        match self.total_deleted {
            Some(deleted) => format!(
                "{} added, {} modified, {} deleted",
                self.total_added, self.total_modified, deleted
            ),
            None => format!("{} added, {} modified", self.total_added, self.total_modified),
        }
    }
}

/// Classify items against a time instant. Returns `(added, modified)`;
/// deletions are undetectable in this mode.
pub fn cursor_diff(items: &[Item], since: Timestamp) -> (Vec<Item>, Vec<Item>) {
    let mut added = Vec::new();
    let mut modified = Vec::new();

    for item in items {
        if item.created_at > since {
            added.push(item.clone());
        } else if item.updated_at > since {
            // Existed at the instant, changed after it.
            modified.push(item.clone());
        }
    }

    (added, modified)
}

/// Reconcile live items against a frozen snapshot by key identity.
/// Returns `(added, modified, deleted)`.
///
/// A key deleted and later re-created under a new item id is classified as
/// modified, not deleted-plus-added: the diff compares keys, not ids.
pub fn snapshot_diff(
    items: &[Item],
    snapshot: &CheckpointSnapshot,
) -> (Vec<Item>, Vec<Item>, Vec<CheckpointEntry>) {
    let frozen = snapshot.value_map();

    let mut added = Vec::new();
    let mut modified = Vec::new();

    for item in items {
        match frozen.get(item.key.as_str()) {
            None => added.push(item.clone()),
            Some(old_value) => {
                if *old_value != item.value {
                    modified.push(item.clone());
                }
            }
        }
    }

    let live_keys: std::collections::HashSet<&str> =
        items.iter().map(|i| i.key.as_str()).collect();
    let deleted: Vec<CheckpointEntry> = snapshot
        .entries
        .iter()
        .filter(|e| !live_keys.contains(e.key.as_str()))
        .cloned()
        .collect();

    (added, modified, deleted)
}

/// Apply request filters, totals, pagination, and value stripping.
pub fn build_response(
    added: Vec<Item>,
    modified: Vec<Item>,
    deleted: Option<Vec<CheckpointEntry>>,
    request: &DiffRequest,
) -> DiffResponse {
    let added: Vec<&Item> = added.iter().filter(|i| request.item_passes(i)).collect();
    let modified: Vec<&Item> = modified.iter().filter(|i| request.item_passes(i)).collect();

    let total_added = added.len();
    let total_modified = modified.len();
    let total_deleted = deleted.as_ref().map(|d| d.len());

    let page = |entries: Vec<DiffEntry>| -> Vec<DiffEntry> {
        entries
            .into_iter()
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .collect()
    };

    let added = page(
        added
            .iter()
            .map(|i| DiffEntry::from_item(i, request.include_values))
            .collect(),
    );
    let modified = page(
        modified
            .iter()
            .map(|i| DiffEntry::from_item(i, request.include_values))
            .collect(),
    );

    let deleted = deleted.map(|entries| {
        entries
            .into_iter()
            .map(|e| DeletedEntry {
                key: e.key,
                value: request.include_values.then_some(e.value),
            })
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .collect()
    });

    DiffResponse {
        added,
        modified,
        deleted,
        total_added,
        total_modified,
        total_deleted,
    }
}
