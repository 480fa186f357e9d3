//! # Storage engine
//!
//! The [`Engine`] composes an [`OffsetIndex`] with a [`ShardManager`] and is
//! the byte-level core behind [`Store`](crate::Store).
//!
//! ## Write path
//!
//! 1. The key is checked against the backend (wrong kind fails before I/O).
//! 2. If the key already points at a value of the same byte length, the bytes
//!    are patched in place inside the mapped shard. Nothing is appended.
//! 3. Otherwise the bytes are appended to the current write shard and the
//!    index is pointed at the new triplet.
//!
//! ## Read path
//!
//! The key is resolved to its triplet, the owning shard is mapped and the
//! caller's closure runs over the borrowed bytes. Values are never cached.
//! Triplets that point at an unknown shard or past the end of a shard are
//! logged as suspected corruption and reported as a missing key.
//!
//! ## Persistence
//!
//! [`Engine::save`] flushes the shards, persists the index (the `store_index`
//! blob or a durable commit) and writes `store_params`. [`Engine::load`]
//! restores all of it without opening any shard.

#[cfg(test)]
mod tests;

pub mod params;

use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{info, warn};

use crate::encoding::EncodingError;
use crate::index::{
    CompactOffsetIndex, DurableIntIndex, DurableStrIndex, INDEX_FILE, IndexBackend, IndexError,
    KeyResolver, OffsetIndex,
};
use crate::key::Key;
use crate::persist::PersistError;
use crate::shard::{
    DEFAULT_MAX_OPEN_SHARDS, DEFAULT_SHARD_SIZE, SHARD_PREFIX, ShardError, ShardManager,
    ShardState,
};
use params::StoreParams;

pub use params::{CLASS_TAG, FORMAT_TAG, PARAMS_FILE};

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("shard error: {0}")]
    Shard(#[from] ShardError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key not found: {0}")]
    KeyNotFound(Key),

    #[error("incompatible store format: {0}")]
    FormatMismatch(String),

    #[error("no store found in {0}")]
    NotAStore(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("engine is closed")]
    Closed,
}

/// Configuration for an [`Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub shard_size: u64,
    pub max_open_shards: usize,
    pub backend: IndexBackend,
    pub initial_slots: u32,
    pub commit_interval: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_size: DEFAULT_SHARD_SIZE,
            max_open_shards: DEFAULT_MAX_OPEN_SHARDS,
            backend: IndexBackend::default(),
            initial_slots: 0,
            commit_interval: 100_000,
        }
    }
}

/// Backend implied by the index files present in `dir`.
pub fn infer_backend(dir: &Path) -> Option<IndexBackend> {
    if DurableIntIndex::exists(dir) {
        Some(IndexBackend::DurableInt)
    } else if DurableStrIndex::exists(dir) {
        Some(IndexBackend::DurableStr)
    } else if dir.join(INDEX_FILE).is_file() {
        Some(IndexBackend::InMemory { direct: false })
    } else {
        None
    }
}

/// Rebuilds placement state from the shard files on disk. Used when a
/// durable-index store is reopened without a parameter record.
fn scan_shards(dir: &Path, shard_size: u64) -> Result<ShardState, EngineError> {
    let mut state = ShardState::new(shard_size);
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(id) = name
            .strip_prefix(SHARD_PREFIX)
            .and_then(|digits| digits.parse::<u32>().ok())
        else {
            continue;
        };
        if id >= state.shard_for_write {
            state.shard_for_write = id;
            state.written = entry.metadata()?.len();
        }
        state.file_index.insert(id, name);
    }
    if state.written >= shard_size && !state.file_index.is_empty() {
        state.shard_for_write += 1;
        state.written = 0;
    }
    Ok(state)
}

/// Byte-level storage engine. See the [module docs](self).
#[derive(Debug)]
pub struct Engine {
    dir: PathBuf,
    index: OffsetIndex,
    shards: ShardManager,
    closed: bool,
}

impl Engine {
    /// Creates a new engine in `dir`. The directory itself is created on
    /// first write or save.
    pub fn create(dir: impl AsRef<Path>, config: &EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        let index = match config.backend {
            IndexBackend::InMemory { direct } => {
                OffsetIndex::in_memory(direct, config.initial_slots)
            }
            IndexBackend::DurableInt => {
                OffsetIndex::DurableInt(DurableIntIndex::open(&dir, config.commit_interval)?)
            }
            IndexBackend::DurableStr => OffsetIndex::DurableStr(DurableStrIndex::open(&dir)?),
        };
        let shards = ShardManager::new(&dir, config.shard_size, config.max_open_shards);
        info!(dir = %dir.display(), backend = %config.backend, shard_size = config.shard_size, "engine created");
        Ok(Self {
            dir,
            index,
            shards,
            closed: false,
        })
    }

    /// Reopens the engine saved in `dir`.
    ///
    /// The backend and shard placement come from `store_params`. A durable
    /// index can outlive its last save, so for durable backends the saved
    /// placement is advanced to the shard files found on disk. Without a
    /// parameter record the placement is rebuilt from those files alone. `config` supplies the
    /// open-shard budget, the commit interval and that fallback shard size.
    pub fn load(dir: impl AsRef<Path>, config: &EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();

        let (backend, state, key_map) = if StoreParams::exists(&dir) {
            let params = StoreParams::load(&dir)?;
            let mut state = params.shards;
            if matches!(
                params.backend,
                IndexBackend::DurableInt | IndexBackend::DurableStr
            ) {
                // A durable index can be ahead of the last saved parameters.
                let on_disk = scan_shards(&dir, state.shard_size)?;
                if state.catch_up(on_disk) {
                    warn!(
                        dir = %dir.display(),
                        shards = state.file_index.len(),
                        shard_for_write = state.shard_for_write,
                        written = state.written,
                        "store parameters behind shard files; placement advanced"
                    );
                }
            }
            (params.backend, state, params.key_map)
        } else {
            match infer_backend(&dir) {
                Some(backend @ (IndexBackend::DurableInt | IndexBackend::DurableStr)) => {
                    warn!(dir = %dir.display(), %backend, "store parameters missing; rebuilding shard placement");
                    (backend, scan_shards(&dir, config.shard_size)?, None)
                }
                _ => return Err(EngineError::NotAStore(dir)),
            }
        };

        let index = match backend {
            IndexBackend::InMemory { direct } => {
                let records = CompactOffsetIndex::load(&dir.join(INDEX_FILE))?;
                let resolver = if direct {
                    None
                } else {
                    let keys = key_map.ok_or_else(|| {
                        IndexError::Corrupt("resolver-backed store saved without a key map".into())
                    })?;
                    let resolver = KeyResolver::from_ordered(keys)?;
                    if resolver.len() != records.len() as usize {
                        return Err(IndexError::Corrupt(format!(
                            "key map holds {} keys but the index {} slots",
                            resolver.len(),
                            records.len()
                        ))
                        .into());
                    }
                    Some(resolver)
                };
                OffsetIndex::InMemory { resolver, records }
            }
            IndexBackend::DurableInt => {
                OffsetIndex::DurableInt(DurableIntIndex::open(&dir, config.commit_interval)?)
            }
            IndexBackend::DurableStr => OffsetIndex::DurableStr(DurableStrIndex::open(&dir)?),
        };

        let shards = ShardManager::restore(&dir, state, config.max_open_shards);
        info!(
            dir = %dir.display(),
            %backend,
            keys = index.len(),
            shards = shards.shard_count(),
            "engine loaded"
        );
        Ok(Self {
            dir,
            index,
            shards,
            closed: false,
        })
    }

    /// Whether `dir` holds something [`load`](Self::load) can open.
    pub fn exists(dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        StoreParams::exists(dir) || infer_backend(dir).is_some()
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads and writes
    // --------------------------------------------------------------------------------------------

    /// Stores `bytes` under `key`.
    pub fn set_bytes(&mut self, key: &Key, bytes: &[u8]) -> Result<(), EngineError> {
        self.check_open()?;
        if bytes.is_empty() {
            return Err(EngineError::InvalidArgument(
                "serialized value must not be empty".into(),
            ));
        }
        self.index.check_key(key)?;

        let reusable = self
            .index
            .current(key)?
            .filter(|current| !current.is_vacant() && current.length as usize == bytes.len());
        if let Some(current) = reusable {
            match self.shards.overwrite(&current, bytes) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_dangling() => {
                    warn!(%key, error = %e, "dangling index entry; appending a fresh copy");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let record = self.shards.append(bytes)?;
        self.index.set(key, record)?;
        Ok(())
    }

    /// Runs `f` over the stored bytes of `key`.
    ///
    /// The bytes borrow the shard mapping, so `f` must copy out whatever it
    /// keeps.
    pub fn with_value<R>(
        &mut self,
        key: &Key,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, EngineError> {
        self.check_open()?;
        let record = match self.index.get(key)? {
            Some(record) if !record.is_vacant() => record,
            _ => return Err(EngineError::KeyNotFound(key.clone())),
        };
        match self.shards.read(&record, f) {
            Ok(value) => Ok(value),
            Err(e) if e.is_dangling() => {
                warn!(%key, ?record, error = %e, "index entry points outside the shards");
                Err(EngineError::KeyNotFound(key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy of the stored bytes of `key`.
    pub fn get_bytes(&mut self, key: &Key) -> Result<Vec<u8>, EngineError> {
        self.with_value(key, <[u8]>::to_vec)
    }

    pub fn keys(&self) -> Result<Vec<Key>, EngineError> {
        self.check_open()?;
        Ok(self.index.keys())
    }

    pub fn len(&self) -> Result<usize, EngineError> {
        self.check_open()?;
        Ok(self.index.len())
    }

    /// Grows a direct-indexing engine to `slots` vacant entries.
    pub fn presize(&mut self, slots: u32) -> Result<(), EngineError> {
        self.check_open()?;
        self.index.presize(slots)?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------------------------------

    /// Flushes shards and persists the index and the parameter record.
    pub fn save(&mut self) -> Result<(), EngineError> {
        self.check_open()?;
        fs::create_dir_all(&self.dir)?;
        self.shards.flush_all()?;
        self.index.save(&self.dir)?;
        StoreParams::new(
            self.index.backend(),
            self.shards.state().clone(),
            self.dir.clone(),
            self.index.key_map(),
        )
        .save(&self.dir)?;
        info!(dir = %self.dir.display(), keys = self.index.len(), "engine saved");
        Ok(())
    }

    /// Saves, then closes every shard and the index. Calling it again is a
    /// no-op; every other operation fails with [`EngineError::Closed`].
    pub fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.save()?;
        self.closed = true;
        self.shards.close_all()?;
        self.index.close()?;
        info!(dir = %self.dir.display(), "engine closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backend(&self) -> IndexBackend {
        self.index.backend()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.shard_count()
    }

    pub fn open_shard_count(&self) -> usize {
        self.shards.open_shard_count()
    }

    pub fn shard_evictions(&self) -> u64 {
        self.shards.evictions()
    }

    pub fn shard_path(&self, shard_id: u32) -> Option<PathBuf> {
        self.shards.shard_path(shard_id)
    }

    pub fn shard_state(&self) -> &ShardState {
        self.shards.state()
    }
}
