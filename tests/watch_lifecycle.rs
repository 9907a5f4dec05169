//! Watcher lifecycle tests: backlog exclusion, filter routing, TTL
//! renewal, stop/expiry semantics, and privacy visibility.

use std::thread::sleep;
use std::time::Duration;

use memstore::{
    Category, ChangeOp, ItemInput, Priority, SequenceId, SessionId, Store, StoreConfig,
    WatcherFilter, WatcherStatus,
};
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> Store {
    Store::create(StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn test_watcher_never_sees_backlog() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    store.save_item(&session, ItemInput::new("before_1", "v")).unwrap();
    store.save_item(&session, ItemInput::new("before_2", "v")).unwrap();

    let watch = store
        .create_watcher(Some(&session), WatcherFilter::all(), None)
        .unwrap();
    assert_eq!(watch.current_sequence, store.max_sequence());

    // Nothing yet: only mutations after creation are visible.
    let response = store.poll(watch.watcher_id, None).unwrap();
    assert!(response.changes.is_empty());

    store.save_item(&session, ItemInput::new("after", "v")).unwrap();
    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.changes[0].key, "after");
}

#[test]
fn test_filter_routes_by_key_glob() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let watch = store
        .create_watcher(
            Some(&session),
            WatcherFilter::keys(vec!["task_*".to_string()]),
            None,
        )
        .unwrap();

    store
        .save_item(&session, ItemInput::new("task_new_high", "v"))
        .unwrap();
    store
        .save_item(&session, ItemInput::new("note_new_low", "v"))
        .unwrap();

    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.changes[0].key, "task_new_high");

    // The cursor advances to the last delivered record only; the
    // filtered-out record past it is skipped, not redelivered.
    assert_eq!(response.last_sequence, SequenceId(1));
    let again = store.poll(watch.watcher_id, None).unwrap();
    assert!(again.changes.is_empty());
    assert_eq!(again.last_sequence, SequenceId(1));
}

#[test]
fn test_filter_dimensions_combine_as_and() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let watch = store
        .create_watcher(
            Some(&session),
            WatcherFilter::categories(vec![Category::Task]).with_channels(vec!["work".to_string()]),
            None,
        )
        .unwrap();

    store
        .save_item(
            &session,
            ItemInput::new("a", "v").with_category(Category::Task).with_channel("work"),
        )
        .unwrap();
    store
        .save_item(
            &session,
            ItemInput::new("b", "v").with_category(Category::Task).with_channel("home"),
        )
        .unwrap();
    store
        .save_item(
            &session,
            ItemInput::new("c", "v").with_category(Category::Note).with_channel("work"),
        )
        .unwrap();

    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.changes[0].key, "a");
}

#[test]
fn test_poll_pagination_has_more() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let watch = store
        .create_watcher(Some(&session), WatcherFilter::all(), None)
        .unwrap();

    for i in 0..5 {
        store
            .save_item(&session, ItemInput::new(format!("k{}", i), "v"))
            .unwrap();
    }

    let first = store.poll(watch.watcher_id, Some(3)).unwrap();
    assert_eq!(first.changes.len(), 3);
    assert!(first.has_more);

    let second = store.poll(watch.watcher_id, Some(3)).unwrap();
    assert_eq!(second.changes.len(), 2);
    assert!(!second.has_more);

    // No gap, no overlap.
    let delivered: Vec<&str> = first
        .changes
        .iter()
        .chain(second.changes.iter())
        .map(|c| c.key.as_str())
        .collect();
    assert_eq!(delivered, vec!["k0", "k1", "k2", "k3", "k4"]);
}

#[test]
fn test_empty_poll_keeps_cursor_and_renews_ttl() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let watch = store
        .create_watcher(Some(&session), WatcherFilter::all(), None)
        .unwrap();

    let first = store.poll(watch.watcher_id, None).unwrap();
    let expires_1 = store
        .list_watchers(Some(&session), false)
        .watchers[0]
        .expires_at;

    sleep(Duration::from_millis(3));

    let second = store.poll(watch.watcher_id, None).unwrap();
    let expires_2 = store
        .list_watchers(Some(&session), false)
        .watchers[0]
        .expires_at;

    // Cursor unchanged with nothing to deliver; TTL renewed regardless.
    assert!(first.changes.is_empty());
    assert!(second.changes.is_empty());
    assert_eq!(first.last_sequence, watch.current_sequence);
    assert_eq!(second.last_sequence, watch.current_sequence);
    assert!(expires_2 > expires_1);
}

#[test]
fn test_stop_is_idempotent_and_terminal() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let watch = store
        .create_watcher(Some(&session), WatcherFilter::all(), None)
        .unwrap();

    let first = store.stop_watcher(watch.watcher_id).unwrap();
    assert!(first.stopped);

    let again = store.stop_watcher(watch.watcher_id).unwrap();
    assert!(!again.stopped);

    // Polling a stopped watcher is a status, not an error.
    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.status, WatcherStatus::Stopped);
    assert!(response.changes.is_empty());
}

#[test]
fn test_expiry_is_lazy_and_terminal() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let watch = store
        .create_watcher(Some(&session), WatcherFilter::all(), Some(0))
        .unwrap();

    sleep(Duration::from_millis(3));

    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.status, WatcherStatus::Expired);

    // Expired stays expired; it does not degrade to stopped or not-found.
    let again = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(again.status, WatcherStatus::Expired);
    assert_ne!(again.status, WatcherStatus::Stopped);
}

#[test]
fn test_expired_watchers_hidden_from_default_listing() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    store
        .create_watcher(Some(&session), WatcherFilter::all(), Some(0))
        .unwrap();
    store
        .create_watcher(Some(&session), WatcherFilter::all(), None)
        .unwrap();

    sleep(Duration::from_millis(3));

    let visible = store.list_watchers(Some(&session), false);
    assert_eq!(visible.total, 1);
    assert!(visible.watchers[0].active);

    let all = store.list_watchers(Some(&session), true);
    assert_eq!(all.total, 2);
}

#[test]
fn test_sweep_reclaims_dead_watchers() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let doomed = store
        .create_watcher(Some(&session), WatcherFilter::all(), Some(0))
        .unwrap();
    store
        .create_watcher(Some(&session), WatcherFilter::all(), None)
        .unwrap();

    sleep(Duration::from_millis(3));

    let swept = store.sweep_expired_watchers(0).unwrap();
    assert_eq!(swept, 1);

    // After the sweep the id is genuinely gone.
    assert!(store.poll(doomed.watcher_id, None).is_err());
}

#[test]
fn test_session_scoped_watcher_ignores_other_sessions() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mine = SessionId::new("mine");
    let other = SessionId::new("other");

    let watch = store
        .create_watcher(Some(&mine), WatcherFilter::all(), None)
        .unwrap();

    store.save_item(&other, ItemInput::new("theirs", "v")).unwrap();
    store.save_item(&mine, ItemInput::new("ours", "v")).unwrap();

    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.changes[0].key, "ours");
}

#[test]
fn test_cross_session_watcher_sees_all_sessions() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let watch = store.create_watcher(None, WatcherFilter::all(), None).unwrap();

    store
        .save_item(&SessionId::new("a"), ItemInput::new("k1", "v"))
        .unwrap();
    store
        .save_item(&SessionId::new("b"), ItemInput::new("k2", "v"))
        .unwrap();

    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.changes.len(), 2);
}

#[test]
fn test_cross_session_watcher_respects_live_privacy() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let watch = store.create_watcher(None, WatcherFilter::all(), None).unwrap();

    store
        .save_item(&session, ItemInput::new("secret", "hidden").private())
        .unwrap();

    // Private as of now: the record is withheld, but the cursor stays put
    // so the record is not lost.
    let response = store.poll(watch.watcher_id, None).unwrap();
    assert!(response.changes.is_empty());

    // Flipping the item public reveals the backlog: both the original
    // CREATE and the privacy-flip UPDATE are delivered.
    store
        .save_item(&session, ItemInput::new("secret", "hidden"))
        .unwrap();
    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.changes.len(), 2);
    assert_eq!(response.changes[0].op, ChangeOp::Create);
    assert_eq!(response.changes[1].op, ChangeOp::Update);
}

#[test]
fn test_privacy_does_not_hide_deletions_from_cross_session() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    store
        .save_item(&session, ItemInput::new("doomed", "v"))
        .unwrap();

    let watch = store.create_watcher(None, WatcherFilter::all(), None).unwrap();
    store.delete_item(&session, "doomed").unwrap();

    // No live row to consult; the delete record stays visible.
    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.changes[0].op, ChangeOp::Delete);
}

#[test]
fn test_session_scoped_watcher_sees_own_private_items() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let session = SessionId::new("s1");

    let watch = store
        .create_watcher(Some(&session), WatcherFilter::all(), None)
        .unwrap();

    store
        .save_item(
            &session,
            ItemInput::new("secret", "v").private().with_priority(Priority::High),
        )
        .unwrap();

    let response = store.poll(watch.watcher_id, None).unwrap();
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.changes[0].key, "secret");
}
