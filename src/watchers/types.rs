//! Watcher types: filters, state machine, and response shapes.

use crate::error::{Result, StoreError};
use crate::types::{
    Category, ChangeOp, ChangeRecord, Priority, SequenceId, SessionId, Timestamp, WatcherId,
};
use serde::{Deserialize, Serialize};

/// Default watcher TTL in seconds.
pub const DEFAULT_TTL_SECS: u64 = 1800;

/// Default poll batch limit.
pub const DEFAULT_POLL_LIMIT: usize = 100;

/// Filter criteria for a watcher.
///
/// All present dimensions must match (AND); within a dimension any listed
/// value matches (OR). An absent or empty dimension matches everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WatcherFilter {
    /// Key glob patterns: `*` matches any run of characters, `?` exactly one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<Category>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priorities: Option<Vec<Priority>>,
}

impl WatcherFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter by key glob patterns.
    pub fn keys(patterns: Vec<String>) -> Self {
        Self {
            keys: Some(patterns),
            ..Default::default()
        }
    }

    /// Filter by categories.
    pub fn categories(categories: Vec<Category>) -> Self {
        Self {
            categories: Some(categories),
            ..Default::default()
        }
    }

    /// Filter by channels.
    pub fn channels(channels: Vec<String>) -> Self {
        Self {
            channels: Some(channels),
            ..Default::default()
        }
    }

    /// Filter by priorities.
    pub fn priorities(priorities: Vec<Priority>) -> Self {
        Self {
            priorities: Some(priorities),
            ..Default::default()
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

    /// Parse a filter from protocol-layer JSON. Unknown category or
    /// priority values are rejected as validation errors, never silently
    /// dropped.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let filter: WatcherFilter = serde_json::from_value(value)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        filter.validate()?;
        Ok(filter)
    }

    /// Check filter shape. Rejected before any state change.
    pub fn validate(&self) -> Result<()> {
        if let Some(keys) = &self.keys {
            for pattern in keys {
                if pattern.is_empty() {
                    return Err(StoreError::Validation("empty key pattern".into()));
                }
            }
        }
        if let Some(channels) = &self.channels {
            for channel in channels {
                if channel.is_empty() {
                    return Err(StoreError::Validation("empty channel".into()));
                }
            }
        }
        Ok(())
    }

    /// Whether a change record passes this filter.
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        if let Some(patterns) = &self.keys {
            if !patterns.is_empty() && !patterns.iter().any(|p| glob_match(p, &record.key)) {
                return false;
            }
        }

        if let Some(categories) = &self.categories {
            if !categories.is_empty() && !categories.contains(&record.category) {
                return false;
            }
        }

        if let Some(channels) = &self.channels {
            if !channels.is_empty() && !channels.contains(&record.channel) {
                return false;
            }
        }

        if let Some(priorities) = &self.priorities {
            if !priorities.is_empty() && !priorities.contains(&record.priority) {
                return false;
            }
        }

        true
    }
}

/// Glob match with `*` (any run, including empty) and `?` (exactly one
/// character). Iterative with single-star backtracking.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        // The star branch must win over the literal branch: keys are
        // free-form and may themselves contain '*', which would otherwise
        // consume a pattern '*' as a literal with no backtrack point.
        if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            // Let the last star absorb one more character.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }

    p == pat.len()
}

/// Lifecycle state of a watcher. Stopped and Expired are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Active,
    Stopped,
    Expired,
}

/// A filtered, cursor-tracking subscription over the change log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Watcher {
    pub id: WatcherId,

    /// Owning session; `None` is a cross-session watcher.
    pub session_id: Option<SessionId>,

    pub filter: WatcherFilter,

    /// Last delivered sequence; the exclusive lower bound of the next poll.
    pub last_sequence: SequenceId,

    /// TTL in seconds; each successful poll renews `expires_at` by this.
    pub ttl_seconds: u64,

    pub created_at: Timestamp,
    pub last_poll_at: Option<Timestamp>,
    pub expires_at: Timestamp,

    pub state: WatcherState,
}

impl Watcher {
    pub fn is_active(&self) -> bool {
        self.state == WatcherState::Active
    }

    /// Whether the TTL has elapsed (meaningful only while Active; expiry is
    /// detected lazily at the next poll or list).
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

/// Status reported by a poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherStatus {
    Active,
    Expired,
    Stopped,
}

/// One change as surfaced to a poller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEntry {
    #[serde(rename = "type")]
    pub op: ChangeOp,
    pub key: String,
    /// Post-change value; absent for deletions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub category: Category,
    pub channel: String,
    pub sequence: SequenceId,
    pub timestamp: Timestamp,
}

impl ChangeEntry {
    pub fn from_record(record: &ChangeRecord) -> Self {
        Self {
            op: record.op,
            key: record.key.clone(),
            value: record.new_value.clone(),
            category: record.category,
            channel: record.channel.clone(),
            sequence: record.sequence,
            timestamp: record.created_at,
        }
    }
}

/// Response shape for `create_watcher`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchCreated {
    pub watcher_id: WatcherId,
    pub filter: WatcherFilter,
    /// Cursor at creation: the watcher never sees records at or below this.
    pub current_sequence: SequenceId,
    /// Seconds until expiry if never polled.
    pub expires_in: u64,
}

/// Response shape for `poll`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub watcher_id: WatcherId,
    pub status: WatcherStatus,
    pub changes: Vec<ChangeEntry>,
    pub has_more: bool,
    pub last_sequence: SequenceId,
    pub polled_at: Timestamp,
}

/// Response shape for `stop_watcher`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub watcher_id: WatcherId,
    /// True the first time; false when the watcher was already stopped.
    pub stopped: bool,
}

/// One entry in a `list_watchers` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatcherSummary {
    pub watcher_id: WatcherId,
    pub active: bool,
    pub filter: WatcherFilter,
    pub last_sequence: SequenceId,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl WatcherSummary {
    pub fn from_watcher(watcher: &Watcher) -> Self {
        Self {
            watcher_id: watcher.id,
            active: watcher.is_active(),
            filter: watcher.filter.clone(),
            last_sequence: watcher.last_sequence,
            created_at: watcher.created_at,
            expires_at: watcher.expires_at,
        }
    }
}

/// Response shape for `list_watchers`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchList {
    pub watchers: Vec<WatcherSummary>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemId, Timestamp};
    use proptest::prelude::*;
    use serde_json::json;

    fn make_record(key: &str, category: Category, channel: &str, priority: Priority) -> ChangeRecord {
        ChangeRecord {
            sequence: SequenceId(1),
            session_id: SessionId::new("s1"),
            item_id: ItemId(1),
            key: key.to_string(),
            op: ChangeOp::Create,
            old_value: None,
            new_value: Some("v".to_string()),
            old_metadata: None,
            new_metadata: None,
            category,
            priority,
            channel: channel.to_string(),
            size_delta: 1,
            created_at: Timestamp::now(),
            created_by: "test".to_string(),
        }
    }

    #[test]
    fn test_glob_basics() {
        assert!(glob_match("task_*", "task_new_high"));
        assert!(!glob_match("task_*", "note_new_low"));
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*_end", "the_end"));
        assert!(glob_match("a*b*c", "a_x_b_y_c"));
        assert!(!glob_match("abc", "abcd"));
    }

    #[test]
    fn test_glob_metacharacters_in_text() {
        // Keys are free-form: a '*' or '?' in the text is an ordinary
        // character, never a wildcard.
        assert!(glob_match("*", "*x"));
        assert!(glob_match("*", "*"));
        assert!(glob_match("task_*", "task_*x"));
        assert!(glob_match("task_*", "task_?"));
        assert!(glob_match("*x", "**x"));
        assert!(!glob_match("task_?", "task_no"));
    }

    #[test]
    fn test_filter_and_across_or_within() {
        let filter = WatcherFilter {
            keys: Some(vec!["task_*".to_string(), "note_*".to_string()]),
            categories: Some(vec![Category::Task]),
            channels: None,
            priorities: None,
        };

        // Key matches (OR within keys), category matches.
        assert!(filter.matches(&make_record("task_1", Category::Task, "default", Priority::Low)));
        assert!(filter.matches(&make_record("note_1", Category::Task, "default", Priority::Low)));

        // Key matches, category does not: AND across dimensions fails.
        assert!(!filter.matches(&make_record("task_1", Category::Note, "default", Priority::Low)));

        // Key does not match.
        assert!(!filter.matches(&make_record("other", Category::Task, "default", Priority::Low)));
    }

    #[test]
    fn test_empty_dimension_matches_everything() {
        let filter = WatcherFilter {
            keys: Some(vec![]),
            categories: Some(vec![]),
            channels: None,
            priorities: None,
        };
        assert!(filter.matches(&make_record("anything", Category::Note, "x", Priority::Low)));
        assert!(WatcherFilter::all().matches(&make_record("k", Category::Task, "y", Priority::High)));
    }

    #[test]
    fn test_from_json_rejects_unknown_category() {
        let result = WatcherFilter::from_json(json!({"categories": ["task", "bogus"]}));
        assert!(matches!(result, Err(StoreError::Validation(_))));

        let result = WatcherFilter::from_json(json!({"priorities": ["urgent"]}));
        assert!(matches!(result, Err(StoreError::Validation(_))));

        let ok = WatcherFilter::from_json(json!({"keys": ["task_*"], "priorities": ["high"]}))
            .unwrap();
        assert_eq!(ok.priorities, Some(vec![Priority::High]));
    }

    #[test]
    fn test_validate_rejects_empty_pattern() {
        let filter = WatcherFilter::keys(vec!["".to_string()]);
        assert!(matches!(filter.validate(), Err(StoreError::Validation(_))));
    }

    proptest! {
        #[test]
        fn prop_star_matches_everything(text in "\\PC*") {
            prop_assert!(glob_match("*", &text));
        }

        #[test]
        fn prop_literal_matches_only_itself(text in "[a-z_]{0,12}", other in "[a-z_]{0,12}") {
            prop_assert!(glob_match(&text, &text));
            prop_assert_eq!(glob_match(&text, &other), text == other);
        }

        #[test]
        fn prop_prefix_star(prefix in "[a-z_]{1,8}", suffix in "[a-z_]{0,8}") {
            let pattern = format!("{}*", prefix);
            let text = format!("{}{}", prefix, suffix);
            prop_assert!(glob_match(&pattern, &text));
        }

        #[test]
        fn prop_question_is_length_sensitive(text in "[a-z]{1,12}") {
            let pattern: String = text.chars().map(|_| '?').collect();
            prop_assert!(glob_match(&pattern, &text));
            prop_assert!(!glob_match(&pattern, &text[..text.len() - 1]));
        }
    }
}
