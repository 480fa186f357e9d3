//! # Durable dictionary
//!
//! [`LogDict`] is a small durable key → bytes store used as the home of the
//! durable index backends. It follows a **WAL + snapshot** model:
//!
//! 1. Every `set` / `delete` is appended to `<name>.wal` and applied to the
//!    in-memory map. The append is not fsynced; the dictionary is marked
//!    dirty instead.
//! 2. [`LogDict::commit`] fsyncs the WAL and clears the dirty bit. When the
//!    WAL has grown past the checkpoint threshold, the whole map is written
//!    to `<name>.snapshot` (sealed, atomic rename) and the WAL is reset.
//! 3. On open the snapshot is loaded and the WAL replayed on top of it.
//!    Replay stops at the first torn or corrupt record and the tail is cut
//!    off so later appends stay reachable.
//!
//! Writes that were never committed may be lost if the process dies.
//!
//! Every dictionary declares the [`KeyKind`] it accepts; keys of the other
//! kind are rejected with [`DictError::KeyTypeMismatch`]. String keys longer
//! than [`STR_KEY_LIMIT`] bytes are truncated on a char boundary.

#[cfg(test)]
mod tests;

pub mod wal;

use std::{
    borrow::Cow,
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{Decode, Encode, EncodingError};
use crate::key::{Key, KeyKind};
use crate::persist::{self, PersistError};
use wal::{Wal, WalError};

/// Longest string key kept verbatim, in bytes.
pub const STR_KEY_LIMIT: usize = 512;

/// WAL records written between two snapshots before `commit` checkpoints.
pub const DEFAULT_CHECKPOINT_RECORDS: u64 = 64 * 1024;

const SNAPSHOT_MAGIC: [u8; 4] = *b"SKDS";
const WAL_SUFFIX: &str = "wal";
const SNAPSHOT_SUFFIX: &str = "snapshot";

#[derive(Debug, Error)]
pub enum DictError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("snapshot error: {0}")]
    Persist(#[from] PersistError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key type mismatch: dictionary holds {expected} keys, got {found}")]
    KeyTypeMismatch { expected: KeyKind, found: KeyKind },

    #[error("dictionary is closed")]
    Closed,

    #[error("corrupt dictionary: {0}")]
    Corrupt(String),
}

/// Mutation recorded in the dictionary WAL.
#[derive(Debug, Clone, PartialEq)]
pub enum DictEvent {
    Put { key: Key, value: Vec<u8> },
    Delete { key: Key },
}

impl Encode for DictEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            DictEvent::Put { key, value } => {
                0u8.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)
            }
            DictEvent::Delete { key } => {
                1u8.encode_to(buf)?;
                key.encode_to(buf)
            }
        }
    }
}

impl Decode for DictEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        let (key, n) = Key::decode_from(&buf[offset..])?;
        offset += n;
        match tag {
            0 => {
                let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((DictEvent::Put { key, value }, offset))
            }
            1 => Ok((DictEvent::Delete { key }, offset)),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "DictEvent",
            }),
        }
    }
}

/// Durable key → bytes dictionary. See the [module docs](self).
#[derive(Debug)]
pub struct LogDict {
    dir: PathBuf,
    name: String,
    kind: KeyKind,
    wal: Option<Wal<DictEvent>>,
    entries: HashMap<Key, Vec<u8>>,
    /// Live keys in first-insertion order.
    order: Vec<Key>,
    dirty: bool,
    wal_records: u64,
    checkpoint_records: u64,
}

impl LogDict {
    /// Opens (or creates) `<dir>/<name>.wal` and `<dir>/<name>.snapshot`.
    pub fn open(dir: impl AsRef<Path>, name: &str, kind: KeyKind) -> Result<Self, DictError> {
        Self::open_with(dir, name, kind, DEFAULT_CHECKPOINT_RECORDS)
    }

    pub fn open_with(
        dir: impl AsRef<Path>,
        name: &str,
        kind: KeyKind,
        checkpoint_records: u64,
    ) -> Result<Self, DictError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut dict = Self {
            wal: None,
            dir,
            name: name.to_owned(),
            kind,
            entries: HashMap::new(),
            order: Vec::new(),
            dirty: false,
            wal_records: 0,
            checkpoint_records: checkpoint_records.max(1),
        };

        let snapshot_path = dict.snapshot_path();
        if snapshot_path.exists() {
            dict.load_snapshot(&snapshot_path)?;
        }

        let mut wal = Wal::<DictEvent>::open(dict.wal_path(), None)?;
        let (events, good_end, failure) = {
            let mut iter = wal.replay();
            let mut events = Vec::new();
            let mut failure = None;
            for item in iter.by_ref() {
                match item {
                    Ok(event) => events.push(event),
                    Err(e) => failure = Some(e),
                }
            }
            (events, iter.offset(), failure)
        };
        if let Some(e) = failure {
            warn!(
                "dictionary {} WAL replay stopped: {}; cutting tail at {}",
                dict.name, e, good_end
            );
            wal.truncate_at(good_end)?;
        }
        dict.wal_records = events.len() as u64;
        for event in events {
            dict.apply(event)?;
        }
        dict.wal = Some(wal);

        info!(
            name = %dict.name,
            kind = %dict.kind,
            keys = dict.order.len(),
            replayed = dict.wal_records,
            "dictionary opened"
        );
        Ok(dict)
    }

    /// Whether `<dir>/<name>.*` files exist.
    pub fn exists(dir: impl AsRef<Path>, name: &str) -> bool {
        let dir = dir.as_ref();
        dir.join(format!("{name}.{WAL_SUFFIX}")).is_file()
            || dir.join(format!("{name}.{SNAPSHOT_SUFFIX}")).is_file()
    }

    fn wal_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{WAL_SUFFIX}", self.name))
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{SNAPSHOT_SUFFIX}", self.name))
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// `true` while some mutation has not been committed.
    pub fn requires_commit(&self) -> bool {
        self.dirty
    }

    fn check_key(&self, key: &Key) -> Result<Key, DictError> {
        if key.kind() != self.kind {
            return Err(DictError::KeyTypeMismatch {
                expected: self.kind,
                found: key.kind(),
            });
        }
        Ok(stored_key(key).into_owned())
    }

    fn wal_mut(&mut self) -> Result<&mut Wal<DictEvent>, DictError> {
        self.wal.as_mut().ok_or(DictError::Closed)
    }

    fn record(&mut self, event: DictEvent) -> Result<(), DictError> {
        self.wal_mut()?.append(&event)?;
        self.wal_records += 1;
        self.dirty = true;
        self.apply(event)
    }

    fn apply(&mut self, event: DictEvent) -> Result<(), DictError> {
        match event {
            DictEvent::Put { key, value } => {
                if self.entries.insert(key.clone(), value).is_none() {
                    self.order.push(key);
                }
            }
            DictEvent::Delete { key } => {
                if self.entries.remove(&key).is_some() {
                    self.order.retain(|k| k != &key);
                }
            }
        }
        Ok(())
    }

    /// Inserts or replaces `key`.
    pub fn set(&mut self, key: &Key, value: Vec<u8>) -> Result<(), DictError> {
        let key = self.check_key(key)?;
        self.record(DictEvent::Put { key, value })
    }

    /// Looks `key` up. Commits pending writes first.
    pub fn get(&mut self, key: &Key) -> Result<Option<&[u8]>, DictError> {
        let key = self.check_key(key)?;
        if self.dirty {
            self.commit()?;
        }
        Ok(self.entries.get(&key).map(Vec::as_slice))
    }

    /// Lookup without the commit-on-read.
    pub(crate) fn peek(&self, key: &Key) -> Option<&[u8]> {
        self.entries.get(stored_key(key).as_ref()).map(Vec::as_slice)
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&mut self, key: &Key) -> Result<bool, DictError> {
        let key = self.check_key(key)?;
        if !self.entries.contains_key(&key) {
            return Ok(false);
        }
        self.record(DictEvent::Delete { key })?;
        Ok(true)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(stored_key(key).as_ref())
    }

    /// Keys in ascending order for integer dictionaries, insertion order for
    /// string dictionaries.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys = self.order.clone();
        if self.kind == KeyKind::Int {
            keys.sort();
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Makes every mutation so far durable, checkpointing when the WAL is long.
    pub fn commit(&mut self) -> Result<(), DictError> {
        if self.wal_records >= self.checkpoint_records {
            return self.checkpoint();
        }
        if self.dirty {
            self.wal_mut()?.sync()?;
            self.dirty = false;
            debug!(name = %self.name, "dictionary committed");
        }
        Ok(())
    }

    /// Writes a full snapshot and resets the WAL.
    pub fn checkpoint(&mut self) -> Result<(), DictError> {
        // The WAL must be durable before the snapshot replaces it.
        self.wal_mut()?.sync()?;

        let mut payload = Vec::new();
        let tag: u8 = match self.kind {
            KeyKind::Int => 0,
            KeyKind::Str => 1,
        };
        tag.encode_to(&mut payload)?;
        u64::try_from(self.order.len())
            .map_err(|_| DictError::Corrupt("too many keys".into()))?
            .encode_to(&mut payload)?;
        for key in &self.order {
            let value = self
                .entries
                .get(key)
                .ok_or_else(|| DictError::Corrupt(format!("key {key} missing from map")))?;
            key.encode_to(&mut payload)?;
            value.encode_to(&mut payload)?;
        }
        persist::write_sealed(&self.snapshot_path(), SNAPSHOT_MAGIC, &payload)?;

        self.wal_mut()?.reset()?;
        self.wal_records = 0;
        self.dirty = false;
        info!(name = %self.name, keys = self.order.len(), "dictionary checkpointed");
        Ok(())
    }

    fn load_snapshot(&mut self, path: &Path) -> Result<(), DictError> {
        let payload = persist::read_sealed(path, SNAPSHOT_MAGIC)?;
        let (tag, mut offset) = u8::decode_from(&payload)?;
        let kind = match tag {
            0 => KeyKind::Int,
            1 => KeyKind::Str,
            other => return Err(DictError::Corrupt(format!("unknown key kind tag {other}"))),
        };
        if kind != self.kind {
            return Err(DictError::KeyTypeMismatch {
                expected: self.kind,
                found: kind,
            });
        }
        let (count, n) = u64::decode_from(&payload[offset..])?;
        offset += n;
        for _ in 0..count {
            let (key, n) = Key::decode_from(&payload[offset..])?;
            offset += n;
            let (value, n) = Vec::<u8>::decode_from(&payload[offset..])?;
            offset += n;
            self.apply(DictEvent::Put { key, value })?;
        }
        if offset != payload.len() {
            return Err(DictError::Corrupt("trailing bytes in snapshot".into()));
        }
        debug!(path = %path.display(), keys = count, "dictionary snapshot loaded");
        Ok(())
    }

    /// Commits and releases the WAL. Later calls fail with [`DictError::Closed`].
    pub fn close(&mut self) -> Result<(), DictError> {
        if self.wal.is_none() {
            return Ok(());
        }
        self.commit()?;
        self.wal = None;
        info!(name = %self.name, "dictionary closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.wal.is_some()
    }
}

/// The form a key is stored under: long string keys are cut to
/// [`STR_KEY_LIMIT`] bytes.
fn stored_key(key: &Key) -> Cow<'_, Key> {
    match key {
        Key::Str(s) if s.len() > STR_KEY_LIMIT => Cow::Owned(Key::Str(truncate_key(s).to_owned())),
        other => Cow::Borrowed(other),
    }
}

fn truncate_key(s: &str) -> &str {
    let mut end = STR_KEY_LIMIT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
