//! Index backends that keep their triplets in a [`LogDict`].
//!
//! Both survive a restart without a separate blob load. They differ in how
//! they batch durability:
//!
//! - [`DurableIntIndex`] commits by itself after `commit_interval`
//!   uncommitted inserts, and before any read.
//! - [`DurableStrIndex`] only marks itself dirty; the next read or an
//!   explicit commit makes the writes durable.

use std::path::Path;

use tracing::{debug, info, warn};

use super::{IndexError, IndexRecord};
use crate::dict::LogDict;
use crate::key::{Key, KeyKind};

fn decode_record(key: &Key, raw: &[u8]) -> Result<IndexRecord, IndexError> {
    IndexRecord::read_from(raw).ok_or_else(|| {
        warn!(%key, len = raw.len(), "malformed durable index entry");
        IndexError::Corrupt(format!("entry for {key} holds {} bytes", raw.len()))
    })
}

/// Integer-keyed durable index stored as `int_index.*`.
#[derive(Debug)]
pub struct DurableIntIndex {
    dict: LogDict,
    commit_interval: usize,
    uncommitted: usize,
}

impl DurableIntIndex {
    pub const NAME: &'static str = "int_index";

    pub fn open(dir: &Path, commit_interval: usize) -> Result<Self, IndexError> {
        let dict = LogDict::open(dir, Self::NAME, KeyKind::Int)?;
        info!(dir = %dir.display(), keys = dict.len(), "durable int index opened");
        Ok(Self {
            dict,
            commit_interval: commit_interval.max(1),
            uncommitted: 0,
        })
    }

    pub fn exists(dir: &Path) -> bool {
        LogDict::exists(dir, Self::NAME)
    }

    /// Commits pending inserts, then looks `key` up.
    pub fn get(&mut self, key: &Key) -> Result<Option<IndexRecord>, IndexError> {
        if self.dict.requires_commit() {
            self.commit()?;
        }
        self.peek(key)
    }

    /// Uncommitted view of `key`.
    pub fn peek(&self, key: &Key) -> Result<Option<IndexRecord>, IndexError> {
        self.dict
            .peek(key)
            .map(|raw| decode_record(key, raw))
            .transpose()
    }

    /// Inserts a new key. Fails with [`IndexError::Duplicate`] if present.
    pub fn append(&mut self, key: &Key, record: IndexRecord) -> Result<(), IndexError> {
        if self.dict.contains(key) {
            return Err(IndexError::Duplicate(key.clone()));
        }
        self.dict.set(key, record.to_bytes().to_vec())?;
        self.uncommitted += 1;
        if self.uncommitted >= self.commit_interval {
            debug!(inserts = self.uncommitted, "durable int index auto-commit");
            self.commit()?;
        }
        Ok(())
    }

    /// Replaces the record of an existing or new key.
    pub fn set(&mut self, key: &Key, record: IndexRecord) -> Result<(), IndexError> {
        self.dict.set(key, record.to_bytes().to_vec())?;
        Ok(())
    }

    /// Whether inserts are waiting for a commit.
    pub fn is_dirty(&self) -> bool {
        self.dict.requires_commit()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.dict.keys()
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn commit(&mut self) -> Result<(), IndexError> {
        self.dict.commit()?;
        self.uncommitted = 0;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), IndexError> {
        self.dict.close()?;
        self.uncommitted = 0;
        Ok(())
    }
}

/// String-keyed durable index stored as `str_index.*`.
#[derive(Debug)]
pub struct DurableStrIndex {
    dict: LogDict,
}

impl DurableStrIndex {
    pub const NAME: &'static str = "str_index";

    pub fn open(dir: &Path) -> Result<Self, IndexError> {
        let dict = LogDict::open(dir, Self::NAME, KeyKind::Str)?;
        info!(dir = %dir.display(), keys = dict.len(), "durable str index opened");
        Ok(Self { dict })
    }

    pub fn exists(dir: &Path) -> bool {
        LogDict::exists(dir, Self::NAME)
    }

    /// Commits if dirty, then looks `key` up.
    pub fn get(&mut self, key: &Key) -> Result<Option<IndexRecord>, IndexError> {
        match self.dict.get(key)? {
            Some(raw) => decode_record(key, raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn peek(&self, key: &Key) -> Result<Option<IndexRecord>, IndexError> {
        self.dict
            .peek(key)
            .map(|raw| decode_record(key, raw))
            .transpose()
    }

    /// Stores `record` under `key` and leaves the index dirty.
    pub fn set(&mut self, key: &Key, record: IndexRecord) -> Result<(), IndexError> {
        self.dict.set(key, record.to_bytes().to_vec())?;
        Ok(())
    }

    /// Whether writes are waiting for a commit.
    pub fn is_dirty(&self) -> bool {
        self.dict.requires_commit()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.dict.keys()
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn commit(&mut self) -> Result<(), IndexError> {
        self.dict.commit()?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), IndexError> {
        self.dict.close()?;
        Ok(())
    }
}
