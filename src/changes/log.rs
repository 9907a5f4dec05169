//! Append-only change log.
//!
//! Every meaningful item mutation appends exactly one frame here. The log
//! is the commit point for mutations: an item write is only applied after
//! its change record is durably framed, so readers never observe one
//! without the other.

use crate::error::{Result, StoreError};
use crate::types::{ChangeRecord, SequenceId, SessionId};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the change log file.
const LOG_MAGIC: &[u8; 4] = b"CHG\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Sanity bound on a single frame.
const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Append-only change log: a header followed by frames of
/// `len (u32 LE) + MessagePack(ChangeRecord) + crc32 (u32 LE)`.
pub struct ChangeLog {
    path: PathBuf,

    /// Append handle, positioned at end of file.
    file: Mutex<File>,

    /// All records, in sequence order. Sequences are dense starting at 1,
    /// so `records[i].sequence == i + 1`.
    records: RwLock<Vec<ChangeRecord>>,

    file_size: Mutex<u64>,

    /// Number of writes since last fsync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N writes (0 is treated as every write).
    sync_interval: u64,
}

impl ChangeLog {
    /// Default sync interval, balancing durability and throughput.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a change log with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a change log with a custom sync interval.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let (records, good_size) = if exists && file.metadata()?.len() > 0 {
            Self::read_all(&file)?
        } else {
            let mut f = &file;
            f.write_all(LOG_MAGIC)?;
            f.write_all(&[LOG_VERSION])?;
            f.sync_all()?;
            (Vec::new(), 5)
        };

        // Drop any torn tail left by a crash mid-append.
        let actual = file.metadata()?.len();
        if actual > good_size {
            tracing::warn!(
                path = %path.display(),
                torn_bytes = actual - good_size,
                "truncating torn tail of change log"
            );
            file.set_len(good_size)?;
            file.sync_all()?;
        }

        let mut file = file;
        file.seek(SeekFrom::Start(good_size))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            records: RwLock::new(records),
            file_size: Mutex::new(good_size),
            writes_since_sync: Mutex::new(0),
            sync_interval: if sync_interval == 0 { 1 } else { sync_interval },
        })
    }

    /// Next sequence number an append will receive.
    pub fn next_sequence(&self) -> SequenceId {
        SequenceId(self.records.read().len() as u64 + 1)
    }

    /// Highest assigned sequence number (0 when the log is empty).
    pub fn max_sequence(&self) -> SequenceId {
        SequenceId(self.records.read().len() as u64)
    }

    /// Highest sequence number among records of one session (0 if none).
    pub fn max_sequence_for_session(&self, session: &SessionId) -> SequenceId {
        let records = self.records.read();
        records
            .iter()
            .rev()
            .find(|r| r.session_id == *session)
            .map(|r| r.sequence)
            .unwrap_or_default()
    }

    /// Number of records in the log.
    pub fn len(&self) -> u64 {
        self.records.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> u64 {
        *self.file_size.lock()
    }

    /// Append a record. The record's sequence must equal `next_sequence()`;
    /// the caller serializes appends (store write lock).
    ///
    /// The disk write is the commit point: on error nothing is applied in
    /// memory and the caller must abort the enclosing mutation.
    pub fn append(&self, record: ChangeRecord) -> Result<()> {
        if record.sequence != self.next_sequence() {
            return Err(StoreError::Corruption(format!(
                "out-of-order append: got {:?}, expected {:?}",
                record.sequence,
                self.next_sequence()
            )));
        }

        let encoded = rmp_serde::to_vec(&record)?;

        let mut file = self.file.lock();
        let start = *self.file_size.lock();
        file.seek(SeekFrom::Start(start))?;

        let write = (|| -> Result<u64> {
            file.write_all(&(encoded.len() as u32).to_le_bytes())?;
            file.write_all(&encoded)?;
            let checksum = crc32fast::hash(&encoded);
            file.write_all(&checksum.to_le_bytes())?;
            Ok(file.stream_position()?)
        })();

        let new_size = match write {
            Ok(pos) => pos,
            Err(e) => {
                // Roll the file back to the last good frame boundary so a
                // partial frame can never be mistaken for a record.
                let _ = file.set_len(start);
                return Err(e);
            }
        };

        *self.file_size.lock() = new_size;

        let mut writes = self.writes_since_sync.lock();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_all()?;
            *writes = 0;
        }

        self.records.write().push(record);
        Ok(())
    }

    /// Force all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Records with `sequence > after`, in sequence order.
    pub fn records_after(&self, after: SequenceId) -> Vec<ChangeRecord> {
        let records = self.records.read();
        let start = (after.0 as usize).min(records.len());
        records[start..].to_vec()
    }

    /// Up to `max` records with `sequence > after` matching `pred`,
    /// in sequence order.
    pub fn select<F>(&self, after: SequenceId, max: usize, pred: F) -> Vec<ChangeRecord>
    where
        F: Fn(&ChangeRecord) -> bool,
    {
        let records = self.records.read();
        let start = (after.0 as usize).min(records.len());
        records[start..]
            .iter()
            .filter(|r| pred(r))
            .take(max)
            .cloned()
            .collect()
    }

    /// Path to the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all frames, returning the records and the offset just past the
    /// last complete, checksum-valid frame.
    fn read_all(file: &File) -> Result<(Vec<ChangeRecord>, u64)> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid change log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported change log version: {}",
                version[0]
            )));
        }

        let mut records = Vec::new();
        let mut good_offset = 5u64;

        loop {
            match Self::read_frame(&mut reader) {
                Ok(record) => {
                    // A frame with the wrong sequence means the tail is
                    // garbage that happened to checksum; stop there.
                    if record.sequence.0 != records.len() as u64 + 1 {
                        break;
                    }
                    records.push(record);
                    good_offset = reader.stream_position()?;
                }
                Err(_) => break,
            }
        }

        Ok((records, good_offset))
    }

    fn read_frame(reader: &mut BufReader<File>) -> Result<ChangeRecord> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_BYTES {
            return Err(StoreError::Corruption("change log frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(StoreError::Corruption("change log checksum mismatch".into()));
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}
