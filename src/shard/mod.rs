//! # Shard files
//!
//! Values live in append-only files named `store_shard_NNNN` inside the store
//! directory. The [`ShardManager`] owns them:
//!
//! - **Placement.** New bytes go to the current write shard. Once at least
//!   `shard_size` bytes were written to it, the target moves to the next id.
//!   Ids only grow.
//! - **Modes.** A shard is open either for appending ([`File`]) or for
//!   random access ([`MmapMut`]), never both. Asking for the other mode
//!   closes the handle and reopens it.
//! - **Handle budget.** Open shards are kept in access order. After a request
//!   is served, the least recently used shards are closed until at most
//!   `max_open` remain.
//!
//! Handles open lazily; nothing is opened when a store is loaded.

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::index::IndexRecord;

/// Prefix of every shard file name.
pub const SHARD_PREFIX: &str = "store_shard_";

/// Default rotation threshold (1 GiB).
pub const DEFAULT_SHARD_SIZE: u64 = 1 << 30;

/// Default number of shards kept open at once.
pub const DEFAULT_MAX_OPEN_SHARDS: usize = 10;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("shard {0} is not registered")]
    UnknownShard(u32),

    #[error("record {position}+{length} is outside shard {shard_id} ({size} bytes)")]
    OutOfBounds {
        shard_id: u32,
        position: u64,
        length: u32,
        size: u64,
    },

    #[error("value of {0} bytes does not fit a record")]
    ValueTooLarge(usize),

    #[error("in-place overwrite of {expected} bytes given {found}")]
    LengthMismatch { expected: u32, found: usize },
}

impl ShardError {
    /// Whether the error means the index points somewhere no value lives.
    pub fn is_dangling(&self) -> bool {
        matches!(
            self,
            ShardError::UnknownShard(_) | ShardError::OutOfBounds { .. }
        )
    }
}

/// `store_shard_0007` for id 7.
pub fn shard_file_name(shard_id: u32) -> String {
    format!("{SHARD_PREFIX}{shard_id:04}")
}

/// Placement state persisted with the store parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardState {
    pub file_index: BTreeMap<u32, String>,
    pub shard_for_write: u32,
    pub written: u64,
    pub shard_size: u64,
}

impl ShardState {
    pub fn new(shard_size: u64) -> Self {
        Self {
            file_index: BTreeMap::new(),
            shard_for_write: 0,
            written: 0,
            shard_size,
        }
    }

    /// Folds in placement rebuilt from the files on disk: shards this state
    /// does not list are registered, and the write position moves forward
    /// when the disk is ahead of it. Returns whether anything changed.
    pub fn catch_up(&mut self, on_disk: ShardState) -> bool {
        let mut changed = false;
        for (id, name) in on_disk.file_index {
            if let Entry::Vacant(slot) = self.file_index.entry(id) {
                slot.insert(name);
                changed = true;
            }
        }
        if (on_disk.shard_for_write, on_disk.written) > (self.shard_for_write, self.written) {
            self.shard_for_write = on_disk.shard_for_write;
            self.written = on_disk.written;
            changed = true;
        }
        changed
    }
}

#[derive(Debug)]
enum Handle {
    Append(File),
    Mapped { _file: File, map: MmapMut },
}

impl Handle {
    fn mode(&self) -> &'static str {
        match self {
            Handle::Append(_) => "append",
            Handle::Mapped { .. } => "mapped",
        }
    }
}

#[derive(Debug)]
struct OpenShard {
    shard_id: u32,
    handle: Handle,
}

/// Owner of the shard files of one store. See the [module docs](self).
#[derive(Debug)]
pub struct ShardManager {
    dir: PathBuf,
    state: ShardState,
    max_open: usize,
    /// Least recently used first.
    open: Vec<OpenShard>,
    evictions: u64,
}

impl ShardManager {
    pub fn new(dir: impl Into<PathBuf>, shard_size: u64, max_open: usize) -> Self {
        Self::restore(dir, ShardState::new(shard_size), max_open)
    }

    /// Resumes from persisted placement state.
    pub fn restore(dir: impl Into<PathBuf>, state: ShardState, max_open: usize) -> Self {
        Self {
            dir: dir.into(),
            state,
            max_open: max_open.max(1),
            open: Vec::new(),
            evictions: 0,
        }
    }

    pub fn state(&self) -> &ShardState {
        &self.state
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of shards ever created.
    pub fn shard_count(&self) -> usize {
        self.state.file_index.len()
    }

    /// Number of shards with an open handle right now.
    pub fn open_shard_count(&self) -> usize {
        self.open.len()
    }

    /// Handles closed to stay within the budget since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn shard_path(&self, shard_id: u32) -> Option<PathBuf> {
        self.state
            .file_index
            .get(&shard_id)
            .map(|name| self.dir.join(name))
    }

    // --------------------------------------------------------------------------------------------
    // Handle table
    // --------------------------------------------------------------------------------------------

    /// Moves `shard_id` to the most-recent end and returns its position.
    fn touch(&mut self, shard_id: u32) -> Option<usize> {
        let pos = self.open.iter().position(|s| s.shard_id == shard_id)?;
        let entry = self.open.remove(pos);
        self.open.push(entry);
        Some(self.open.len() - 1)
    }

    fn close_entry(entry: OpenShard, sync: bool) -> Result<(), ShardError> {
        match entry.handle {
            Handle::Mapped { map, .. } => map.flush()?,
            Handle::Append(file) => {
                if sync {
                    file.sync_data()?;
                }
            }
        }
        debug!(shard_id = entry.shard_id, "shard closed");
        Ok(())
    }

    /// Closes least recently used shards until the budget holds.
    fn enforce_budget(&mut self) -> Result<(), ShardError> {
        while self.open.len() > self.max_open {
            let oldest = self.open.remove(0);
            debug!(
                shard_id = oldest.shard_id,
                mode = oldest.handle.mode(),
                "evicting least recently used shard"
            );
            self.evictions += 1;
            Self::close_entry(oldest, false)?;
        }
        Ok(())
    }

    /// Registers a freshly opened shard as most recent. It is never the one
    /// evicted, since the budget is at least one.
    fn push_and_enforce(&mut self, entry: OpenShard) -> Result<(), ShardError> {
        self.open.push(entry);
        self.enforce_budget()
    }

    /// Append handle for `shard_id`, registering and creating the file if new.
    pub fn writing_handle(&mut self, shard_id: u32) -> Result<&mut File, ShardError> {
        if let Some(pos) = self.touch(shard_id) {
            if matches!(self.open[pos].handle, Handle::Mapped { .. }) {
                let entry = self.open.remove(pos);
                trace!(shard_id, "switching shard from mapped to append");
                Self::close_entry(entry, false)?;
            }
        }

        if !matches!(
            self.open.last(),
            Some(OpenShard { shard_id: id, handle: Handle::Append(_) }) if *id == shard_id
        ) {
            let name = self
                .state
                .file_index
                .entry(shard_id)
                .or_insert_with(|| shard_file_name(shard_id))
                .clone();
            fs::create_dir_all(&self.dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(&name))?;
            debug!(shard_id, file = %name, "shard opened for append");
            self.push_and_enforce(OpenShard {
                shard_id,
                handle: Handle::Append(file),
            })?;
        }

        match self.open.last_mut() {
            Some(OpenShard {
                handle: Handle::Append(file),
                ..
            }) => Ok(file),
            _ => Err(ShardError::UnknownShard(shard_id)),
        }
    }

    /// Path of `shard_id`. A shard missing from the placement table is
    /// adopted under its standard name when that file exists on disk.
    fn locate(&mut self, shard_id: u32) -> Result<PathBuf, ShardError> {
        if let Some(path) = self.shard_path(shard_id) {
            return Ok(path);
        }
        let name = shard_file_name(shard_id);
        let path = self.dir.join(&name);
        if !path.is_file() {
            return Err(ShardError::UnknownShard(shard_id));
        }
        info!(shard_id, file = %name, "adopting unregistered shard found on disk");
        self.state.file_index.insert(shard_id, name);
        Ok(path)
    }

    /// Mapping of `shard_id` for random access.
    ///
    /// Fails with [`ShardError::UnknownShard`] when the shard is neither
    /// registered nor on disk, and with an I/O error when a registered
    /// shard's file is gone.
    pub fn reading_handle(&mut self, shard_id: u32) -> Result<&mut MmapMut, ShardError> {
        if let Some(pos) = self.touch(shard_id) {
            if matches!(self.open[pos].handle, Handle::Append(_)) {
                let entry = self.open.remove(pos);
                trace!(shard_id, "switching shard from append to mapped");
                Self::close_entry(entry, false)?;
            }
        }

        if !matches!(
            self.open.last(),
            Some(OpenShard { shard_id: id, handle: Handle::Mapped { .. } }) if *id == shard_id
        ) {
            let path = self.locate(shard_id)?;
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            // SAFETY: the store is the only writer of its shard files and a
            // shard is never appended to while it is mapped, so the mapping
            // does not change size under us.
            let map = unsafe { MmapMut::map_mut(&file)? };
            debug!(shard_id, bytes = map.len(), "shard mapped");
            self.push_and_enforce(OpenShard {
                shard_id,
                handle: Handle::Mapped { _file: file, map },
            })?;
        }

        match self.open.last_mut() {
            Some(OpenShard {
                handle: Handle::Mapped { map, .. },
                ..
            }) => Ok(map),
            _ => Err(ShardError::UnknownShard(shard_id)),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Value I/O
    // --------------------------------------------------------------------------------------------

    /// Appends `bytes` to the current write shard and returns where they went.
    pub fn append(&mut self, bytes: &[u8]) -> Result<IndexRecord, ShardError> {
        let length = u32::try_from(bytes.len()).map_err(|_| ShardError::ValueTooLarge(bytes.len()))?;
        let shard_id = self.state.shard_for_write;
        let file = self.writing_handle(shard_id)?;
        let position = file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        trace!(shard_id, position, length, "value appended");
        self.record_write(u64::from(length));
        Ok(IndexRecord::new(shard_id, position, length))
    }

    /// Advances the byte counter, rotating to the next shard at the threshold.
    pub fn record_write(&mut self, bytes_written: u64) {
        self.state.written += bytes_written;
        if self.state.written >= self.state.shard_size {
            info!(
                from = self.state.shard_for_write,
                to = self.state.shard_for_write + 1,
                written = self.state.written,
                "rotating write shard"
            );
            self.state.shard_for_write += 1;
            self.state.written = 0;
        }
    }

    fn window(map_len: usize, record: &IndexRecord) -> Result<(usize, usize), ShardError> {
        let out_of_bounds = || ShardError::OutOfBounds {
            shard_id: record.shard_id,
            position: record.position,
            length: record.length,
            size: map_len as u64,
        };
        let end = record
            .end()
            .filter(|end| *end <= map_len as u64)
            .ok_or_else(out_of_bounds)?;
        // Both bounds lie within the mapping, so they fit a usize.
        Ok((record.position as usize, end as usize))
    }

    /// Runs `f` over the bytes `record` points at while the mapping is held.
    pub fn read<R>(
        &mut self,
        record: &IndexRecord,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ShardError> {
        let map = self.reading_handle(record.shard_id)?;
        let (start, end) = Self::window(map.len(), record)?;
        Ok(f(&map[start..end]))
    }

    /// Patches a value in place. `bytes` must be exactly `record.length` long.
    pub fn overwrite(&mut self, record: &IndexRecord, bytes: &[u8]) -> Result<(), ShardError> {
        if bytes.len() != record.length as usize {
            return Err(ShardError::LengthMismatch {
                expected: record.length,
                found: bytes.len(),
            });
        }
        let map = self.reading_handle(record.shard_id)?;
        let (start, end) = Self::window(map.len(), record)?;
        map[start..end].copy_from_slice(bytes);
        trace!(
            shard_id = record.shard_id,
            position = record.position,
            length = record.length,
            "value overwritten in place"
        );
        Ok(())
    }

    /// Flushes every mapped shard without closing it.
    pub fn flush_all(&mut self) -> Result<(), ShardError> {
        for entry in &self.open {
            match &entry.handle {
                Handle::Mapped { map, .. } => map.flush()?,
                Handle::Append(file) => file.sync_data()?,
            }
        }
        debug!(open = self.open.len(), "shards flushed");
        Ok(())
    }

    /// Flushes and closes every handle.
    pub fn close_all(&mut self) -> Result<(), ShardError> {
        let count = self.open.len();
        let mut first_err = None;
        for entry in self.open.drain(..) {
            if let Err(e) = Self::close_entry(entry, true) {
                error!("failed to close shard: {}", e);
                first_err.get_or_insert(e);
            }
        }
        debug!(closed = count, "all shards closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
