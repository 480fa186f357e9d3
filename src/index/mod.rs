//! # Offset index
//!
//! Everything that maps an external [`Key`] to the `(shard, position, length)`
//! triplet of its value lives here.
//!
//! [`OffsetIndex`] is the closed set of backends a store can run on:
//!
//! | Variant                     | Keys            | Persistence                         |
//! |-----------------------------|-----------------|-------------------------------------|
//! | `InMemory` + resolver       | `Int` and `Str` | `store_index` blob + key map on save |
//! | `InMemory` direct           | `Int` ≥ 0       | `store_index` blob on save           |
//! | [`DurableIntIndex`]         | `Int`           | `int_index.*` dictionary             |
//! | [`DurableStrIndex`]         | `Str`           | `str_index.*` dictionary             |
//!
//! In direct-indexing mode the key *is* the slot. Writing past the end grows
//! the index to 1.2× the key so nearby writes do not resize again.

#[cfg(test)]
mod tests;

pub mod compact;
pub mod durable;
pub mod resolver;

use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, trace};

use crate::dict::DictError;
use crate::key::{Key, KeyKind};
use crate::persist::PersistError;

pub use compact::{CompactOffsetIndex, RecordView};
pub use durable::{DurableIntIndex, DurableStrIndex};
pub use resolver::KeyResolver;

/// Size of one encoded [`IndexRecord`].
pub const RECORD_SIZE: usize = 16;

/// File holding the in-memory index blob.
pub const INDEX_FILE: &str = "store_index";

/// Growth factor applied when a direct-mode write lands past the end.
const DIRECT_GROWTH_NUM: u64 = 6;
const DIRECT_GROWTH_DEN: u64 = 5;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("offset index is full")]
    Full,

    #[error("slot {slot} out of range (len {len})")]
    OutOfRange { slot: u64, len: u32 },

    #[error("key type mismatch: index accepts {expected} keys, got {found}")]
    KeyTypeMismatch { expected: KeyKind, found: KeyKind },

    #[error("negative key {0} in direct-indexing mode")]
    NegativeKey(i64),

    #[error("key {0} already present")]
    Duplicate(Key),

    #[error("corrupt index: {0}")]
    Corrupt(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("dictionary error: {0}")]
    Dict(#[from] DictError),
}

/// Location of one serialized value.
///
/// `length == 0` marks a slot that was allocated but never written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub shard_id: u32,
    pub position: u64,
    pub length: u32,
}

impl IndexRecord {
    pub fn new(shard_id: u32, position: u64, length: u32) -> Self {
        Self {
            shard_id,
            position,
            length,
        }
    }

    /// A slot that holds no value.
    pub fn is_vacant(&self) -> bool {
        self.length == 0
    }

    /// Offset just past the value inside its shard, `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.position.checked_add(u64::from(self.length))
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        self.patch(&mut out);
        out
    }

    /// Appends the 16-byte encoding to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_bytes());
    }

    /// Overwrites the first [`RECORD_SIZE`] bytes of `dst`.
    pub fn patch(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.shard_id.to_le_bytes());
        dst[4..12].copy_from_slice(&self.position.to_le_bytes());
        dst[12..16].copy_from_slice(&self.length.to_le_bytes());
    }

    /// Decodes a record from exactly [`RECORD_SIZE`] bytes.
    pub fn read_from(src: &[u8]) -> Option<Self> {
        if src.len() != RECORD_SIZE {
            return None;
        }
        let mut shard = [0u8; 4];
        let mut position = [0u8; 8];
        let mut length = [0u8; 4];
        shard.copy_from_slice(&src[0..4]);
        position.copy_from_slice(&src[4..12]);
        length.copy_from_slice(&src[12..16]);
        Some(Self {
            shard_id: u32::from_le_bytes(shard),
            position: u64::from_le_bytes(position),
            length: u32::from_le_bytes(length),
        })
    }
}

/// Which index a store runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    /// [`CompactOffsetIndex`], with a [`KeyResolver`] unless `direct`.
    InMemory { direct: bool },
    /// [`DurableIntIndex`].
    DurableInt,
    /// [`DurableStrIndex`].
    DurableStr,
}

impl Default for IndexBackend {
    fn default() -> Self {
        IndexBackend::InMemory { direct: false }
    }
}

impl IndexBackend {
    /// Tag stored in the parameter record.
    pub(crate) fn tag(self) -> u8 {
        match self {
            IndexBackend::InMemory { direct: false } => 0,
            IndexBackend::InMemory { direct: true } => 1,
            IndexBackend::DurableInt => 2,
            IndexBackend::DurableStr => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(IndexBackend::InMemory { direct: false }),
            1 => Some(IndexBackend::InMemory { direct: true }),
            2 => Some(IndexBackend::DurableInt),
            3 => Some(IndexBackend::DurableStr),
            _ => None,
        }
    }

    /// Key kind this backend is restricted to, if any.
    pub fn key_kind(self) -> Option<KeyKind> {
        match self {
            IndexBackend::InMemory { direct: false } => None,
            IndexBackend::InMemory { direct: true } | IndexBackend::DurableInt => {
                Some(KeyKind::Int)
            }
            IndexBackend::DurableStr => Some(KeyKind::Str),
        }
    }
}

impl fmt::Display for IndexBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexBackend::InMemory { direct: false } => f.write_str("in-memory"),
            IndexBackend::InMemory { direct: true } => f.write_str("in-memory (direct)"),
            IndexBackend::DurableInt => f.write_str("durable-int"),
            IndexBackend::DurableStr => f.write_str("durable-str"),
        }
    }
}

fn expect_kind(key: &Key, expected: KeyKind) -> Result<(), IndexError> {
    if key.kind() != expected {
        return Err(IndexError::KeyTypeMismatch {
            expected,
            found: key.kind(),
        });
    }
    Ok(())
}

/// Slot addressed by a direct-mode key. `Ok(None)` when the key cannot fit
/// in a `u32` slot and so can never have been written.
fn direct_slot(key: &Key) -> Result<Option<u32>, IndexError> {
    match key {
        Key::Int(n) if *n < 0 => Err(IndexError::NegativeKey(*n)),
        Key::Int(n) => Ok(u32::try_from(*n).ok()),
        Key::Str(_) => Err(IndexError::KeyTypeMismatch {
            expected: KeyKind::Int,
            found: KeyKind::Str,
        }),
    }
}

/// Slot a direct-mode write goes to. Keys past `u32::MAX` can never be
/// addressed and are reported as out of range.
fn writable_slot(key: &Key, len: u32) -> Result<u32, IndexError> {
    direct_slot(key)?.ok_or_else(|| IndexError::OutOfRange {
        slot: key.as_int().map_or(u64::MAX, |n| n as u64),
        len,
    })
}

/// Size a direct-mode index grows to when `slot` is written past the end.
fn direct_growth(slot: u32) -> u32 {
    let scaled = u64::from(slot) * DIRECT_GROWTH_NUM / DIRECT_GROWTH_DEN;
    let target = scaled.max(u64::from(slot) + 1);
    u32::try_from(target).unwrap_or(u32::MAX)
}

/// The offset index of one store. See the [module docs](self).
#[derive(Debug)]
pub enum OffsetIndex {
    InMemory {
        resolver: Option<KeyResolver>,
        records: CompactOffsetIndex,
    },
    DurableInt(DurableIntIndex),
    DurableStr(DurableStrIndex),
}

impl OffsetIndex {
    /// A fresh in-memory index. `direct` skips the resolver.
    pub fn in_memory(direct: bool, initial_slots: u32) -> Self {
        OffsetIndex::InMemory {
            resolver: (!direct).then(KeyResolver::new),
            records: CompactOffsetIndex::with_slots(initial_slots),
        }
    }

    pub fn backend(&self) -> IndexBackend {
        match self {
            OffsetIndex::InMemory { resolver, .. } => IndexBackend::InMemory {
                direct: resolver.is_none(),
            },
            OffsetIndex::DurableInt(_) => IndexBackend::DurableInt,
            OffsetIndex::DurableStr(_) => IndexBackend::DurableStr,
        }
    }

    /// Record stored for `key`, or `None` if the key was never indexed.
    ///
    /// Durable backends commit pending writes first.
    pub fn get(&mut self, key: &Key) -> Result<Option<IndexRecord>, IndexError> {
        match self {
            OffsetIndex::InMemory {
                resolver: Some(resolver),
                records,
            } => Ok(resolver.resolve(key).and_then(|slot| records.view().get(slot))),
            OffsetIndex::InMemory {
                resolver: None,
                records,
            } => Ok(direct_slot(key)?.and_then(|slot| records.view().get(slot))),
            OffsetIndex::DurableInt(index) => {
                expect_kind(key, KeyKind::Int)?;
                index.get(key)
            }
            OffsetIndex::DurableStr(index) => {
                expect_kind(key, KeyKind::Str)?;
                index.get(key)
            }
        }
    }

    /// Record stored for `key` without committing. Used on the write path.
    pub fn current(&self, key: &Key) -> Result<Option<IndexRecord>, IndexError> {
        match self {
            OffsetIndex::InMemory {
                resolver: Some(resolver),
                records,
            } => Ok(resolver.resolve(key).and_then(|slot| records.get(slot))),
            OffsetIndex::InMemory {
                resolver: None,
                records,
            } => Ok(direct_slot(key)?.and_then(|slot| records.get(slot))),
            OffsetIndex::DurableInt(index) => {
                expect_kind(key, KeyKind::Int)?;
                index.peek(key)
            }
            OffsetIndex::DurableStr(index) => {
                expect_kind(key, KeyKind::Str)?;
                index.peek(key)
            }
        }
    }

    /// Rejects keys this backend cannot hold, before any I/O happens.
    pub fn check_key(&self, key: &Key) -> Result<(), IndexError> {
        match self {
            OffsetIndex::InMemory {
                resolver: None,
                records,
            } => writable_slot(key, records.len()).map(|_| ()),
            other => match other.backend().key_kind() {
                Some(kind) => expect_kind(key, kind),
                None => Ok(()),
            },
        }
    }

    /// Points `key` at `record`, creating the slot if the key is new.
    pub fn set(&mut self, key: &Key, record: IndexRecord) -> Result<(), IndexError> {
        match self {
            OffsetIndex::InMemory {
                resolver: Some(resolver),
                records,
            } => {
                let (slot, created) = resolver.resolve_or_create(key)?;
                if created || slot == records.len() {
                    if let Err(e) = records.append(record) {
                        if created {
                            resolver.pop();
                        }
                        return Err(e);
                    }
                    Ok(())
                } else {
                    records.set(slot, record)
                }
            }
            OffsetIndex::InMemory {
                resolver: None,
                records,
            } => {
                let len = records.len();
                let slot = writable_slot(key, len)?;
                if slot == len {
                    records.append(record)?;
                } else {
                    if slot > len {
                        let target = direct_growth(slot);
                        debug!(slot, from = len, to = target, "direct index grows past end");
                        records.resize(target);
                    }
                    records.set(slot, record)?;
                }
                Ok(())
            }
            OffsetIndex::DurableInt(index) => {
                expect_kind(key, KeyKind::Int)?;
                if index.peek(key)?.is_some() {
                    index.set(key, record)
                } else {
                    index.append(key, record)
                }
            }
            OffsetIndex::DurableStr(index) => {
                expect_kind(key, KeyKind::Str)?;
                index.set(key, record)
            }
        }
    }

    /// Grows a direct-mode index to `slots` vacant entries.
    pub fn presize(&mut self, slots: u32) -> Result<(), IndexError> {
        match self {
            OffsetIndex::InMemory {
                resolver: None,
                records,
            } => {
                records.resize(slots);
                Ok(())
            }
            other => Err(IndexError::Unsupported(format!(
                "presize needs the direct in-memory index, not {}",
                other.backend()
            ))),
        }
    }

    /// Number of slots (resolver and direct mode) or stored keys (durable).
    pub fn len(&self) -> usize {
        match self {
            OffsetIndex::InMemory { records, .. } => records.len() as usize,
            OffsetIndex::DurableInt(index) => index.len(),
            OffsetIndex::DurableStr(index) => index.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in enumeration order: insertion order for the resolver,
    /// `0..len` in direct mode, backend order for durable indexes.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            OffsetIndex::InMemory {
                resolver: Some(resolver),
                ..
            } => resolver.keys().to_vec(),
            OffsetIndex::InMemory {
                resolver: None,
                records,
            } => (0..i64::from(records.len())).map(Key::Int).collect(),
            OffsetIndex::DurableInt(index) => index.keys(),
            OffsetIndex::DurableStr(index) => index.keys(),
        }
    }

    /// Resolver keys to persist next to the store parameters.
    pub fn key_map(&self) -> Option<Vec<Key>> {
        match self {
            OffsetIndex::InMemory {
                resolver: Some(resolver),
                ..
            } => Some(resolver.keys().to_vec()),
            _ => None,
        }
    }

    /// Makes pending writes durable. A no-op for the in-memory index.
    pub fn commit(&mut self) -> Result<(), IndexError> {
        match self {
            OffsetIndex::InMemory { .. } => Ok(()),
            OffsetIndex::DurableInt(index) => index.commit(),
            OffsetIndex::DurableStr(index) => index.commit(),
        }
    }

    /// Persists the index under `dir`.
    pub fn save(&mut self, dir: &Path) -> Result<(), IndexError> {
        match self {
            OffsetIndex::InMemory { records, .. } => records.save(&dir.join(INDEX_FILE)),
            other => other.commit(),
        }
    }

    pub fn close(&mut self) -> Result<(), IndexError> {
        trace!(backend = %self.backend(), "closing offset index");
        match self {
            OffsetIndex::InMemory { .. } => Ok(()),
            OffsetIndex::DurableInt(index) => index.close(),
            OffsetIndex::DurableStr(index) => index.close(),
        }
    }
}
