//! Compact in-memory offset index.
//!
//! Records are packed back to back into one flat little-endian buffer:
//!
//! ```text
//! [shard_id: u32][position: u64][length: u32]   (16 bytes per slot)
//! ```
//!
//! Random reads decode a single 16-byte window, so a lookup never copies the
//! buffer or allocates. Growth relies on `Vec`'s geometric reallocation.
//!
//! # Views
//!
//! [`CompactOffsetIndex::view`] hands out a read-optimized [`RecordView`]
//! over the raw buffer. The index tracks whether a view has been issued and
//! every mutating path (append, set, resize, save) releases it first; the
//! borrow on the view keeps the buffer from being mutated while one is alive,
//! and the flag makes the next reader rebuild it lazily.

use std::path::Path;

use tracing::{debug, trace};

use super::{IndexError, IndexRecord, RECORD_SIZE};
use crate::persist;

const INDEX_MAGIC: [u8; 4] = *b"SKIX";

/// Growable dense array of [`IndexRecord`]s addressed by slot number.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompactOffsetIndex {
    buf: Vec<u8>,
    len: u32,
    view_live: bool,
}

impl CompactOffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index with `slots` zero-length (never written) entries.
    pub fn with_slots(slots: u32) -> Self {
        let mut index = Self::new();
        index.resize(slots);
        index
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a record and returns its slot.
    pub fn append(&mut self, record: IndexRecord) -> Result<u32, IndexError> {
        let slot = self.len;
        let next = slot.checked_add(1).ok_or(IndexError::Full)?;
        self.release_view();
        record.write_to(&mut self.buf);
        self.len = next;
        trace!(slot, ?record, "index append");
        Ok(slot)
    }

    /// Bounds-checked read. `None` when `slot >= len()`.
    pub fn get(&self, slot: u32) -> Option<IndexRecord> {
        if slot >= self.len {
            return None;
        }
        let start = slot as usize * RECORD_SIZE;
        IndexRecord::read_from(&self.buf[start..start + RECORD_SIZE])
    }

    /// Overwrites an existing slot in place.
    pub fn set(&mut self, slot: u32, record: IndexRecord) -> Result<(), IndexError> {
        if slot >= self.len {
            return Err(IndexError::OutOfRange {
                slot: u64::from(slot),
                len: self.len,
            });
        }
        self.release_view();
        let start = slot as usize * RECORD_SIZE;
        record.patch(&mut self.buf[start..start + RECORD_SIZE]);
        trace!(slot, ?record, "index overwrite");
        Ok(())
    }

    /// Grows to `slots` entries, filling new slots with zero-length records.
    /// Never shrinks.
    pub fn resize(&mut self, slots: u32) {
        if slots <= self.len {
            return;
        }
        self.release_view();
        self.buf.resize(slots as usize * RECORD_SIZE, 0);
        debug!(from = self.len, to = slots, "index resized");
        self.len = slots;
    }

    /// Returns the read-optimized view, creating it if none is live.
    pub fn view(&mut self) -> RecordView<'_> {
        if !self.view_live {
            trace!(len = self.len, "index view created");
            self.view_live = true;
        }
        RecordView {
            raw: &self.buf,
            len: self.len,
        }
    }

    /// Whether a view has been handed out since the last mutation.
    pub fn has_view(&self) -> bool {
        self.view_live
    }

    fn release_view(&mut self) {
        if self.view_live {
            trace!("index view released");
            self.view_live = false;
        }
    }

    /// Persists the whole index as one sealed blob.
    pub fn save(&mut self, path: &Path) -> Result<(), IndexError> {
        self.release_view();
        let mut payload = Vec::with_capacity(4 + self.buf.len());
        payload.extend_from_slice(&self.len.to_le_bytes());
        payload.extend_from_slice(&self.buf);
        persist::write_sealed(path, INDEX_MAGIC, &payload)?;
        debug!(path = %path.display(), slots = self.len, "offset index saved");
        Ok(())
    }

    /// Loads an index previously written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let payload = persist::read_sealed(path, INDEX_MAGIC)?;
        if payload.len() < 4 {
            return Err(IndexError::Corrupt("index blob missing slot count".into()));
        }
        let mut count = [0u8; 4];
        count.copy_from_slice(&payload[..4]);
        let len = u32::from_le_bytes(count);

        let buf = payload[4..].to_vec();
        if buf.len() != len as usize * RECORD_SIZE {
            return Err(IndexError::Corrupt(format!(
                "index blob holds {} bytes for {len} slots",
                buf.len()
            )));
        }
        debug!(path = %path.display(), slots = len, "offset index loaded");
        Ok(Self {
            buf,
            len,
            view_live: false,
        })
    }
}

/// Borrowed random-access view over a [`CompactOffsetIndex`].
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    raw: &'a [u8],
    len: u32,
}

impl RecordView<'_> {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, slot: u32) -> Option<IndexRecord> {
        if slot >= self.len {
            return None;
        }
        let start = slot as usize * RECORD_SIZE;
        IndexRecord::read_from(&self.raw[start..start + RECORD_SIZE])
    }

    pub fn iter(&self) -> impl Iterator<Item = IndexRecord> + '_ {
        self.raw
            .chunks_exact(RECORD_SIZE)
            .filter_map(IndexRecord::read_from)
    }
}
