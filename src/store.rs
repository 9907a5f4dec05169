//! Main Store struct tying all components together.

use crate::changes::{build_record, ChangeLog, DELETE_ORIGIN, SAVE_ORIGIN};
use crate::checkpoints::{
    diff, CheckpointSnapshot, CheckpointStore, DiffMode, DiffRequest, DiffResponse,
};
use crate::error::{Result, StoreError};
use crate::items::ItemStore;
use crate::types::{
    ChangeOp, ChangeRecord, CheckpointId, Item, ItemInput, SequenceId, SessionId, StoreStats,
    Timestamp, WatcherId,
};
use crate::watchers::{
    ChangeEntry, PollResponse, StopResponse, WatchCreated, WatchList, WatcherFilter,
    WatcherRegistry, WatcherState, WatcherStatus, WatcherSummary, DEFAULT_POLL_LIMIT,
    DEFAULT_TTL_SECS,
};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Fsync the change log every N appends.
    pub sync_interval: u64,

    /// Watcher TTL in seconds when the caller doesn't specify one.
    pub default_ttl_secs: u64,

    /// Poll batch limit when the caller doesn't specify one.
    pub default_poll_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./memstore"),
            create_if_missing: true,
            sync_interval: ChangeLog::DEFAULT_SYNC_INTERVAL,
            default_ttl_secs: DEFAULT_TTL_SECS,
            default_poll_limit: DEFAULT_POLL_LIMIT,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"MEM\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// The session memory store.
///
/// Provides a unified interface for:
/// - Saving and deleting keyed items (each meaningful mutation appends a
///   change record in the same atomic unit)
/// - Creating and polling filtered watchers over the change log
/// - Freezing checkpoint snapshots and diffing live state against them
pub struct Store {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Append-only change log (authoritative).
    log: ChangeLog,

    /// Live item table.
    items: ItemStore,

    watchers: WatcherRegistry,
    checkpoints: CheckpointStore,

    /// Serializes mutations so the record append and the item write form
    /// one atomic unit.
    write_lock: Mutex<()>,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;

        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log =
            ChangeLog::open_with_sync_interval(config.path.join("changes.log"), config.sync_interval)?;
        let items = ItemStore::open(config.path.join("items.bin"))?;
        let watchers = WatcherRegistry::open(config.path.join("watchers.bin"))?;
        let checkpoints = CheckpointStore::open(config.path.join("checkpoints.bin"))?;

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            items,
            watchers,
            checkpoints,
            write_lock: Mutex::new(()),
        })
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log =
            ChangeLog::open_with_sync_interval(config.path.join("changes.log"), config.sync_interval)?;
        let items = ItemStore::open(config.path.join("items.bin"))?;
        let watchers = WatcherRegistry::open(config.path.join("watchers.bin"))?;
        let checkpoints = CheckpointStore::open(config.path.join("checkpoints.bin"))?;

        // The log is authoritative: catch the item table up to any records
        // the snapshot hadn't absorbed when the store last closed.
        let behind = log.records_after(items.last_applied());
        if !behind.is_empty() {
            tracing::debug!(records = behind.len(), "replaying change log tail");
            for record in &behind {
                items.apply(record);
            }
            items.save()?;
        }

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            items,
            watchers,
            checkpoints,
            write_lock: Mutex::new(()),
        })
    }

    // --- Item Operations ---

    /// Create or update an item. This is the single mutation choke point:
    /// the change record is appended first (the commit point), and the item
    /// write is applied only once the append succeeded — a failed append
    /// aborts the whole mutation with no state change.
    ///
    /// An update that changes no significant field refreshes `updated_at`
    /// and appends nothing.
    pub fn save_item(&self, session: &SessionId, input: ItemInput) -> Result<Item> {
        let _lock = self.write_lock.lock();
        let now = Timestamp::now();

        match self.items.get(session, &input.key) {
            None => {
                let id = self.items.allocate_id();
                let item = Item::new(id, session.clone(), input, now);

                let sequence = self.log.next_sequence();
                let record =
                    build_record(sequence, ChangeOp::Create, None, Some(&item), SAVE_ORIGIN)
                        .expect("CREATE always yields a record");

                self.log.append(record)?;
                self.items.put(item.clone(), sequence);
                self.items.save()?;
                Ok(item)
            }
            Some(before) => {
                let mut after = before.clone();
                after.value = input.value;
                after.category = input.category;
                after.priority = input.priority;
                after.channel = input.channel;
                after.is_private = input.is_private;
                after.size = after.value.len() as u64;
                after.updated_at = now;

                let sequence = self.log.next_sequence();
                match build_record(
                    sequence,
                    ChangeOp::Update,
                    Some(&before),
                    Some(&after),
                    SAVE_ORIGIN,
                ) {
                    Some(record) => {
                        self.log.append(record)?;
                        self.items.put(after.clone(), sequence);
                    }
                    None => {
                        // Pure timestamp refresh: not a meaningful change.
                        self.items.touch(session, &after.key, now);
                    }
                }
                self.items.save()?;
                Ok(after)
            }
        }
    }

    /// Delete an item. Returns false (and records nothing) when the key
    /// doesn't exist.
    pub fn delete_item(&self, session: &SessionId, key: &str) -> Result<bool> {
        let _lock = self.write_lock.lock();

        let Some(before) = self.items.get(session, key) else {
            return Ok(false);
        };

        let sequence = self.log.next_sequence();
        let record = build_record(sequence, ChangeOp::Delete, Some(&before), None, DELETE_ORIGIN)
            .expect("DELETE always yields a record");

        self.log.append(record)?;
        self.items.remove(session, key, sequence);
        self.items.save()?;
        Ok(true)
    }

    /// Get an item by session and key.
    pub fn get_item(&self, session: &SessionId, key: &str) -> Option<Item> {
        self.items.get(session, key)
    }

    /// All items of one session, ordered by key.
    pub fn list_items(&self, session: &SessionId) -> Vec<Item> {
        self.items.list(session)
    }

    // --- Change Log Reads ---

    /// Highest assigned sequence number.
    pub fn max_sequence(&self) -> SequenceId {
        self.log.max_sequence()
    }

    /// Records with `sequence > after`, optionally scoped to one session.
    pub fn changes_since(
        &self,
        after: SequenceId,
        session: Option<&SessionId>,
    ) -> Vec<ChangeRecord> {
        match session {
            Some(s) => self
                .log
                .select(after, usize::MAX, |r| r.session_id == *s),
            None => self.log.records_after(after),
        }
    }

    // --- Watch Operations ---

    /// Create a watcher. The cursor starts at the max sequence visible to
    /// the scope, so the watcher never sees backlog.
    pub fn create_watcher(
        &self,
        session: Option<&SessionId>,
        filter: WatcherFilter,
        ttl_seconds: Option<u64>,
    ) -> Result<WatchCreated> {
        filter.validate()?;

        let cursor = match session {
            Some(s) => self.log.max_sequence_for_session(s),
            None => self.log.max_sequence(),
        };

        let ttl = ttl_seconds.unwrap_or(self.config.default_ttl_secs);
        let watcher = self
            .watchers
            .create(session.cloned(), filter, ttl, cursor)?;

        Ok(WatchCreated {
            watcher_id: watcher.id,
            filter: watcher.filter,
            current_sequence: watcher.last_sequence,
            expires_in: ttl,
        })
    }

    /// Poll a watcher for changes past its cursor.
    ///
    /// Stopped and Expired are statuses, not errors; only an id that never
    /// existed (or was swept) is `WatcherNotFound`. Every successful active
    /// poll renews the TTL, even when it returns no changes — polling is
    /// the liveness signal.
    pub fn poll(&self, id: WatcherId, limit: Option<usize>) -> Result<PollResponse> {
        let now = Timestamp::now();
        let watcher = self
            .watchers
            .get(id)
            .ok_or(StoreError::WatcherNotFound(id))?;

        match watcher.state {
            WatcherState::Stopped => {
                return Ok(Self::empty_poll(&watcher, WatcherStatus::Stopped, now));
            }
            WatcherState::Expired => {
                return Ok(Self::empty_poll(&watcher, WatcherStatus::Expired, now));
            }
            WatcherState::Active => {}
        }

        if watcher.is_expired(now) {
            self.watchers.expire(id)?;
            return Ok(Self::empty_poll(&watcher, WatcherStatus::Expired, now));
        }

        let limit = limit.unwrap_or(self.config.default_poll_limit);
        let scope = watcher.session_id.clone();
        let filter = watcher.filter.clone();

        // Fetch one extra record to detect has_more without a count query.
        let mut batch = self.log.select(watcher.last_sequence, limit + 1, |record| {
            if let Some(session) = &scope {
                if record.session_id != *session {
                    return false;
                }
            }
            if !filter.matches(record) {
                return false;
            }
            // Cross-session watchers respect privacy as of *now*, not as of
            // when the record was written: a later privacy flip hides or
            // reveals old records. Deleted items have no live row and stay
            // visible. Session-scoped watchers own their session outright.
            if scope.is_none() {
                if let Some(item) = self.items.get_by_id(record.item_id) {
                    if item.is_private {
                        return false;
                    }
                }
            }
            true
        });

        let has_more = batch.len() > limit;
        batch.truncate(limit);

        let batch_max = batch
            .last()
            .map(|r| r.sequence)
            .unwrap_or(watcher.last_sequence);
        let last_sequence = self.watchers.complete_poll(id, batch_max, now)?;

        Ok(PollResponse {
            watcher_id: id,
            status: WatcherStatus::Active,
            changes: batch.iter().map(ChangeEntry::from_record).collect(),
            has_more,
            last_sequence,
            polled_at: now,
        })
    }

    fn empty_poll(
        watcher: &crate::watchers::Watcher,
        status: WatcherStatus,
        now: Timestamp,
    ) -> PollResponse {
        PollResponse {
            watcher_id: watcher.id,
            status,
            changes: Vec::new(),
            has_more: false,
            last_sequence: watcher.last_sequence,
            polled_at: now,
        }
    }

    /// Stop a watcher. Idempotent; see [`WatcherRegistry::stop`].
    pub fn stop_watcher(&self, id: WatcherId) -> Result<StopResponse> {
        let stopped = self.watchers.stop(id)?;
        Ok(StopResponse {
            watcher_id: id,
            stopped,
        })
    }

    /// List watchers, scoped to one session when given.
    pub fn list_watchers(&self, session: Option<&SessionId>, include_expired: bool) -> WatchList {
        let watchers: Vec<WatcherSummary> = self
            .watchers
            .list(session, include_expired)
            .iter()
            .map(WatcherSummary::from_watcher)
            .collect();
        let total = watchers.len();
        WatchList { watchers, total }
    }

    /// Reclaim storage for watchers dead longer than `grace_seconds`.
    pub fn sweep_expired_watchers(&self, grace_seconds: u64) -> Result<usize> {
        self.watchers.sweep_expired(grace_seconds)
    }

    // --- Checkpoint & Diff Operations ---

    /// Freeze the session's current item membership into a checkpoint.
    pub fn create_checkpoint(
        &self,
        session: &SessionId,
        name: impl Into<String>,
    ) -> Result<CheckpointSnapshot> {
        let items = self.items.list(session);
        self.checkpoints.create(session.clone(), name, &items)
    }

    /// Get a checkpoint by id.
    pub fn get_checkpoint(&self, id: CheckpointId) -> Result<CheckpointSnapshot> {
        self.checkpoints
            .get(id)
            .ok_or(StoreError::CheckpointNotFound(id))
    }

    /// All checkpoints of one session, oldest first.
    pub fn list_checkpoints(&self, session: &SessionId) -> Vec<CheckpointSnapshot> {
        self.checkpoints.list(session)
    }

    /// Compute a diff. Read path: bad inputs (a timestamp before the epoch,
    /// an unknown checkpoint, a checkpoint from another session) fail
    /// closed to an empty result instead of erroring.
    pub fn diff(&self, request: DiffRequest) -> DiffResponse {
        let items = self.items.list(&request.session_id);

        match &request.mode {
            DiffMode::Since(since) => {
                if since.0 < 0 {
                    return DiffResponse::empty(false);
                }
                let (added, modified) = diff::cursor_diff(&items, *since);
                diff::build_response(added, modified, None, &request)
            }
            DiffMode::Checkpoint(id) => {
                let Some(snapshot) = self.checkpoints.get(*id) else {
                    return DiffResponse::empty(true);
                };
                if snapshot.session_id != request.session_id {
                    return DiffResponse::empty(true);
                }
                let (added, modified, deleted) = diff::snapshot_diff(&items, &snapshot);
                diff::build_response(added, modified, Some(deleted), &request)
            }
        }
    }

    // --- Maintenance ---

    /// Force all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.log.sync()?;
        self.items.save()?;
        self.watchers.save()?;
        self.checkpoints.save()?;
        Ok(())
    }

    /// Store statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            item_count: self.items.count(),
            change_count: self.log.len(),
            watcher_count: self.watchers.count(),
            checkpoint_count: self.checkpoints.count(),
            total_value_bytes: self.items.total_value_bytes(),
            log_size_bytes: self.log.file_size(),
        }
    }

    /// The configuration this store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Manifest & Locking ---

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("manifest"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let manifest_path = path.join("manifest");
        if !manifest_path.exists() {
            return Err(StoreError::NotInitialized);
        }

        let mut file = File::open(manifest_path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path.join("lock"))?;

        lock_file.try_lock_exclusive().map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}
