//! # shardkv
//!
//! An embeddable key-value store for serializable values. Value bytes are
//! appended to memory-mapped shard files; a compact offset index maps every
//! key to the `(shard, position, length)` triplet of its latest value, so a
//! read is one index lookup plus one slice of a mapping.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shardkv::{Store, StoreConfig};
//!
//! let mut store: Store<String> = Store::open("/tmp/my_store", StoreConfig::default()).unwrap();
//!
//! store.set("greeting", &"hello".to_string()).unwrap();
//! store.set(7, &"seven".to_string()).unwrap();
//! assert_eq!(store.get("greeting").unwrap(), "hello");
//!
//! // Persist the index and reopen later.
//! store.close().unwrap();
//! let mut store: Store<String> = Store::load("/tmp/my_store").unwrap();
//! assert_eq!(store.get(7).unwrap(), "seven");
//! ```
//!
//! ## Index backends
//!
//! - **In-memory** ([`IndexBackend::InMemory`]) with a key resolver: any mix
//!   of integer and string keys. The index lives in memory and is written to
//!   disk by [`Store::save`].
//! - **In-memory, direct**: integer keys are the slots themselves. Suited to
//!   dense `0..n` key spaces; pre-size with [`Store::presize`].
//! - **Durable integer / string** ([`IndexBackend::DurableInt`],
//!   [`IndexBackend::DurableStr`]): the index lives in a WAL-backed
//!   dictionary and survives restarts on its own.
//!
//! ## Features
//!
//! - **Same-length overwrites in place**: updating a value with one of the
//!   same serialized size never grows the shard.
//! - **Bounded file handles**: at most `max_open_shards` shards are open.
//! - **CRC32 integrity** on every metadata file.
//! - **Pluggable codecs** via [`ValueCodec`].
//!
//! A store is single-writer and not internally synchronized. Share one across
//! threads through a [`StoreRegistry`] or your own lock.

pub mod codec;
pub mod dict;
pub mod encoding;
pub mod engine;
pub mod index;
pub mod key;
pub mod persist;
pub mod registry;
pub mod shard;

use std::marker::PhantomData;
use std::path::Path;

use engine::{Engine, EngineConfig, EngineError};
use index::IndexError;
use shard::ShardError;
use thiserror::Error;
use tracing::{error, info};

pub use codec::{CodecError, EncodingCodec, RawCodec, ValueCodec};
pub use index::IndexBackend;
pub use key::{Key, KeyKind};
pub use registry::StoreRegistry;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`].
///
/// Validated when a store is created or opened. When an existing store is
/// loaded, its persisted backend and shard size win over `index` and
/// `shard_size`.
///
/// # Example
///
/// ```rust
/// use shardkv::{IndexBackend, StoreConfig};
///
/// let config = StoreConfig {
///     shard_size: 64 * 1024 * 1024,
///     index: IndexBackend::InMemory { direct: true },
///     initial_slots: 1_000,
///     ..StoreConfig::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Bytes written to a shard before writes move to the next one.
    ///
    /// Default: 1 GiB. Must be ≥ 1.
    pub shard_size: u64,

    /// Most shard files kept open at once.
    ///
    /// Default: 10. Must be ≥ 1.
    pub max_open_shards: usize,

    /// Index backend for a new store.
    pub index: IndexBackend,

    /// Vacant slots allocated up front in direct-indexing mode.
    ///
    /// Default: 0. Only valid with `InMemory { direct: true }`.
    pub initial_slots: u32,

    /// Inserts the durable integer index accepts before committing by itself.
    ///
    /// Default: 100 000. Must be ≥ 1.
    pub commit_interval: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            shard_size: engine.shard_size,
            max_open_shards: engine.max_open_shards,
            index: engine.backend,
            initial_slots: engine.initial_slots,
            commit_interval: engine.commit_interval,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.shard_size == 0 {
            return Err(StoreError::InvalidConfig("shard_size must be >= 1".into()));
        }
        if self.max_open_shards == 0 {
            return Err(StoreError::InvalidConfig(
                "max_open_shards must be >= 1".into(),
            ));
        }
        if self.commit_interval == 0 {
            return Err(StoreError::InvalidConfig(
                "commit_interval must be >= 1".into(),
            ));
        }
        if self.initial_slots > 0 && self.index != (IndexBackend::InMemory { direct: true }) {
            return Err(StoreError::InvalidConfig(
                "initial_slots requires the direct in-memory index".into(),
            ));
        }
        Ok(())
    }

    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            shard_size: self.shard_size,
            max_open_shards: self.max_open_shards,
            backend: self.index,
            initial_slots: self.initial_slots,
            commit_interval: self.commit_interval,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key was never written (or its index entry is unusable).
    #[error("key not found: {0}")]
    KeyNotFound(Key),

    /// The key is of a kind the index backend does not accept.
    #[error("key type mismatch: {0}")]
    KeyTypeMismatch(String),

    /// A direct-indexing slot that cannot be addressed.
    #[error("slot {slot} out of range (len {len})")]
    IndexOutOfRange { slot: u64, len: u32 },

    /// Persisted parameters were written by an incompatible layout.
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Value or argument constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The value codec failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(EngineError),
}

impl From<EngineError> for StoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::KeyNotFound(key) => StoreError::KeyNotFound(key),
            EngineError::FormatMismatch(msg) => StoreError::FormatMismatch(msg),
            EngineError::Closed => StoreError::Closed,
            EngineError::InvalidArgument(msg)
            | EngineError::Index(IndexError::Unsupported(msg)) => StoreError::InvalidArgument(msg),
            EngineError::Io(e) | EngineError::Shard(ShardError::Io(e)) => StoreError::Io(e),
            EngineError::Index(IndexError::KeyTypeMismatch { expected, found }) => {
                StoreError::KeyTypeMismatch(format!("index accepts {expected} keys, got {found}"))
            }
            EngineError::Index(IndexError::NegativeKey(n)) => StoreError::KeyTypeMismatch(
                format!("direct indexing needs a non-negative integer key, got {n}"),
            ),
            EngineError::Index(IndexError::OutOfRange { slot, len }) => {
                StoreError::IndexOutOfRange { slot, len }
            }
            other => StoreError::Engine(other),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// A key-value store of `V` values serialized by codec `C`.
///
/// Mutating and reading methods take `&mut self`: reads may open, map or
/// evict shard files.
///
/// # Shutdown
///
/// Call [`Store::close`] to persist the index and release every file. If the
/// handle is dropped without it, the destructor attempts the same and logs
/// failures.
pub struct Store<V, C = EncodingCodec> {
    engine: Engine,
    codec: C,
    _value: PhantomData<fn() -> V>,
}

impl<V, C> std::fmt::Debug for Store<V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.engine.dir())
            .field("backend", &self.engine.backend())
            .field("closed", &self.engine.is_closed())
            .finish_non_exhaustive()
    }
}

impl<V, C: ValueCodec<V> + Default> Store<V, C> {
    /// Creates a new store in `path`.
    pub fn create(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        Self::create_with_codec(path, config, C::default())
    }

    /// Loads the store in `path` if there is one, otherwise creates it.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_codec(path, config, C::default())
    }

    /// Loads the store saved in `path` with default settings.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::load_with_codec(path, StoreConfig::default(), C::default())
    }
}

impl<V, C: ValueCodec<V>> Store<V, C> {
    pub fn create_with_codec(
        path: impl AsRef<Path>,
        config: StoreConfig,
        codec: C,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let engine = Engine::create(&path, &config.to_engine_config())?;
        info!(path = %path.as_ref().display(), backend = %config.index, "store created");
        Ok(Self::with_engine(engine, codec))
    }

    pub fn open_with_codec(
        path: impl AsRef<Path>,
        config: StoreConfig,
        codec: C,
    ) -> Result<Self, StoreError> {
        if Engine::exists(&path) {
            Self::load_with_codec(path, config, codec)
        } else {
            Self::create_with_codec(path, config, codec)
        }
    }

    /// Loads the store in `path`. The persisted backend and shard size are
    /// used; `config` supplies the handle budget and commit interval.
    pub fn load_with_codec(
        path: impl AsRef<Path>,
        config: StoreConfig,
        codec: C,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let engine = Engine::load(&path, &config.to_engine_config())?;
        info!(path = %path.as_ref().display(), backend = %engine.backend(), "store loaded");
        Ok(Self::with_engine(engine, codec))
    }

    fn with_engine(engine: Engine, codec: C) -> Self {
        Self {
            engine,
            codec,
            _value: PhantomData,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// - [`StoreError::KeyTypeMismatch`] if the backend does not accept the key.
    /// - [`StoreError::InvalidArgument`] if the value serializes to no bytes.
    pub fn set(&mut self, key: impl Into<Key>, value: &V) -> Result<(), StoreError> {
        let key = key.into();
        let bytes = self.codec.serialize(value)?;
        self.engine.set_bytes(&key, &bytes)?;
        Ok(())
    }

    /// Grows a direct-indexing store to `slots` vacant entries.
    pub fn presize(&mut self, slots: u32) -> Result<(), StoreError> {
        self.engine.presize(slots)?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] if the key was never written.
    pub fn get(&mut self, key: impl Into<Key>) -> Result<V, StoreError> {
        let key = key.into();
        let codec = &self.codec;
        Ok(self.engine.with_value(&key, |bytes| codec.deserialize(bytes))??)
    }

    /// Like [`get`](Self::get) but returns `default` for a missing key.
    pub fn get_or(&mut self, key: impl Into<Key>, default: V) -> Result<V, StoreError> {
        match self.get(key) {
            Err(StoreError::KeyNotFound(_)) => Ok(default),
            other => other,
        }
    }

    /// Keys in enumeration order (see [`IndexBackend`]).
    pub fn keys(&self) -> Result<Vec<Key>, StoreError> {
        Ok(self.engine.keys()?)
    }

    /// `(key, value)` pairs in [`keys`](Self::keys) order. Slots of a
    /// direct-indexing store that were never written are skipped.
    pub fn items(&mut self) -> Result<Items<'_, V, C>, StoreError> {
        let keys = self.keys()?;
        Ok(Items {
            store: self,
            keys: keys.into_iter(),
        })
    }

    /// Number of slots (in-memory backends) or stored keys (durable backends).
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.engine.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Flushes shards and persists the index and store parameters.
    pub fn save(&mut self) -> Result<(), StoreError> {
        self.engine.save()?;
        Ok(())
    }

    /// Saves and releases every file. Subsequent operations return
    /// [`StoreError::Closed`]; calling `close` again is harmless.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.engine.is_closed() {
            return Ok(());
        }
        self.engine.close()?;
        info!(path = %self.engine.dir().display(), "store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        self.engine.dir()
    }

    pub fn backend(&self) -> IndexBackend {
        self.engine.backend()
    }

    /// Number of shard files created so far.
    pub fn shard_count(&self) -> usize {
        self.engine.shard_count()
    }

    /// Number of shard files currently open.
    pub fn open_shard_count(&self) -> usize {
        self.engine.open_shard_count()
    }
}

impl<V, C> Drop for Store<V, C> {
    fn drop(&mut self) {
        if self.engine.is_closed() {
            return;
        }
        if let Err(e) = self.engine.close() {
            error!("failed to close store {}: {}", self.engine.dir().display(), e);
        }
    }
}

/// Iterator returned by [`Store::items`].
pub struct Items<'a, V, C> {
    store: &'a mut Store<V, C>,
    keys: std::vec::IntoIter<Key>,
}

impl<V, C: ValueCodec<V>> Iterator for Items<'_, V, C> {
    type Item = Result<(Key, V), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            match self.store.get(key.clone()) {
                Ok(value) => return Some(Ok((key, value))),
                Err(StoreError::KeyNotFound(_)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
