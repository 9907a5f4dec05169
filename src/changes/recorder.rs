//! Change recorder: turns item mutations into change records.
//!
//! Invoked exactly once per item write, inside the same atomic unit as the
//! write. UPDATEs only produce a record when a significant field changed;
//! a pure timestamp refresh produces none.

use crate::types::{ChangeOp, ChangeRecord, Item, SequenceId, Timestamp};

/// Origin tag for records produced by `save_item`.
pub const SAVE_ORIGIN: &str = "item-save";

/// Origin tag for records produced by `delete_item`.
pub const DELETE_ORIGIN: &str = "item-delete";

/// Whether an update touched a field that warrants a change record.
/// Timestamps alone are not significant.
pub fn is_significant(before: &Item, after: &Item) -> bool {
    before.value != after.value
        || before.category != after.category
        || before.priority != after.priority
        || before.channel != after.channel
        || before.is_private != after.is_private
}

/// Build the change record for one mutation, or `None` when the mutation is
/// not meaningful (an UPDATE with no significant field change).
///
/// CREATE requires `after`, DELETE requires `before`, UPDATE requires both.
pub fn build_record(
    sequence: SequenceId,
    op: ChangeOp,
    before: Option<&Item>,
    after: Option<&Item>,
    created_by: &str,
) -> Option<ChangeRecord> {
    let subject = after.or(before)?;

    let (old_value, new_value, old_metadata, new_metadata, size_delta) = match op {
        ChangeOp::Create => {
            let after = after?;
            (
                None,
                Some(after.value.clone()),
                None,
                Some(after.metadata()),
                after.size as i64,
            )
        }
        ChangeOp::Update => {
            let before = before?;
            let after = after?;
            if !is_significant(before, after) {
                return None;
            }
            (
                Some(before.value.clone()),
                Some(after.value.clone()),
                Some(before.metadata()),
                Some(after.metadata()),
                after.size as i64 - before.size as i64,
            )
        }
        ChangeOp::Delete => {
            let before = before?;
            (
                Some(before.value.clone()),
                None,
                Some(before.metadata()),
                None,
                -(before.size as i64),
            )
        }
    };

    Some(ChangeRecord {
        sequence,
        session_id: subject.session_id.clone(),
        item_id: subject.id,
        key: subject.key.clone(),
        op,
        old_value,
        new_value,
        old_metadata,
        new_metadata,
        category: subject.category,
        priority: subject.priority,
        channel: subject.channel.clone(),
        size_delta,
        created_at: Timestamp::now(),
        created_by: created_by.to_string(),
    })
}
