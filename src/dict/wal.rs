//! Append-only, CRC-protected record log backing [`LogDict`](super::LogDict).
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! The record CRC covers `len || record_bytes`. Appends go straight to the
//! file but are only fsynced by [`Wal::sync`], so a batch of appends costs
//! one fsync. Replay stops at the first truncated or corrupt record; the
//! owner decides whether to cut the tail off with [`Wal::truncate_at`].

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    #[error("truncated record at offset {0}")]
    UnexpectedEof(u64),

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// Identity and limits written at the start of every WAL file.
#[derive(Debug, Clone, PartialEq)]
pub struct WalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub max_record_size: u32,
}

impl WalHeader {
    pub const MAGIC: [u8; 4] = *b"SKWL";
    pub const VERSION: u32 = 1;
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;
    pub const ENCODED_LEN: usize = 12;

    fn new(max_record_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
        }
    }

    fn sealed_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = encoding::encode_to_vec(self)?;
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(buf)
    }
}

impl Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.magic);
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)
    }
}

impl Decode for WalHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (magic, mut offset) = <[u8; 4]>::decode_from(buf)?;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (max_record_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                max_record_size,
            },
            offset,
        ))
    }
}

/// A typed append-only log of `T` records.
#[derive(Debug)]
pub struct Wal<T> {
    file: File,
    path: PathBuf,
    header: WalHeader,
    /// End of the last record this handle wrote or kept.
    end: u64,
    _record: PhantomData<T>,
}

impl<T: Encode + Decode + std::fmt::Debug> Wal<T> {
    /// Opens `path`, writing a fresh header if the file is new or empty.
    pub fn open(path: impl AsRef<Path>, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let header = if file.metadata()?.len() == 0 {
            let header =
                WalHeader::new(max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE));
            file.write_all(&header.sealed_bytes()?)?;
            file.sync_all()?;
            info!(path = %path.display(), "created WAL");
            header
        } else {
            Self::read_header(&mut file)?
        };

        let end = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            header,
            end,
            _record: PhantomData,
        })
    }

    fn read_header(file: &mut File) -> Result<WalHeader, WalError> {
        file.seek(SeekFrom::Start(0))?;
        let mut raw = [0u8; WalHeader::ENCODED_LEN + U32_SIZE];
        file.read_exact(&mut raw)
            .map_err(|_| WalError::InvalidHeader("header truncated".into()))?;

        let (body, crc) = raw.split_at(WalHeader::ENCODED_LEN);
        let mut hasher = Crc32::new();
        hasher.update(body);
        let mut stored = [0u8; U32_SIZE];
        stored.copy_from_slice(crc);
        if hasher.finalize() != u32::from_le_bytes(stored) {
            return Err(WalError::InvalidHeader("header checksum mismatched".into()));
        }

        let header = encoding::decode_exact::<WalHeader>(body)?;
        if header.magic != WalHeader::MAGIC {
            return Err(WalError::InvalidHeader("bad magic".into()));
        }
        if header.version != WalHeader::VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        Ok(header)
    }

    fn data_start() -> u64 {
        (WalHeader::ENCODED_LEN + U32_SIZE) as u64
    }

    /// Appends one record. Not durable until [`sync`](Self::sync).
    ///
    /// Bytes past the last known record end are cut first, so a frame torn by
    /// an earlier failed write never hides the records that follow it. A
    /// failed write is rolled back the same way.
    pub fn append(&mut self, record: &T) -> Result<(), WalError> {
        let bytes = encoding::encode_to_vec(record)?;
        if bytes.len() > self.header.max_record_size as usize {
            return Err(WalError::RecordTooLarge(bytes.len()));
        }
        let len = bytes.len() as u32;

        let mut hasher = Crc32::new();
        hasher.update(&len.to_le_bytes());
        hasher.update(&bytes);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(bytes.len() + 2 * U32_SIZE);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&bytes);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let actual = self.file.metadata()?.len();
        if actual != self.end {
            warn!(
                path = %self.path.display(),
                expected = self.end,
                actual,
                "WAL length drifted; cutting stray tail"
            );
            self.file.set_len(self.end)?;
        }
        if let Err(e) = self.file.write_all(&frame) {
            error!(path = %self.path.display(), error = %e, "WAL append failed; rolling back");
            if let Err(rollback) = self.file.set_len(self.end) {
                error!(path = %self.path.display(), error = %rollback, "WAL rollback failed");
            }
            return Err(e.into());
        }
        self.end += frame.len() as u64;

        trace!(?record, len, "WAL append");
        Ok(())
    }

    /// Fsyncs everything appended so far.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Iterates the log from the first record.
    pub fn replay(&mut self) -> WalIter<'_, T> {
        WalIter {
            file: &mut self.file,
            offset: Self::data_start(),
            max_record_size: self.header.max_record_size as usize,
            done: false,
            _record: PhantomData,
        }
    }

    /// Drops everything from `offset` on (used to cut a torn tail).
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), WalError> {
        let offset = offset.max(Self::data_start());
        self.file.set_len(offset)?;
        self.file.sync_all()?;
        self.end = offset;
        debug!(path = %self.path.display(), offset, "WAL tail truncated");
        Ok(())
    }

    /// Clears the log back to a bare header.
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.truncate_at(Self::data_start())?;
        info!(path = %self.path.display(), "WAL reset");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> Drop for Wal<T> {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_all() {
            error!("failed to sync WAL {} on drop: {}", self.path.display(), e);
        }
    }
}

/// Replay iterator over the records of a [`Wal`]. After iteration,
/// [`offset`](WalIter::offset) tells where the last good record ends.
pub struct WalIter<'a, T> {
    file: &'a mut File,
    offset: u64,
    max_record_size: usize,
    done: bool,
    _record: PhantomData<T>,
}

impl<T> WalIter<'_, T> {
    /// Offset just past the last record returned successfully.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<T: Decode> Iterator for WalIter<'_, T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<T: Decode> WalIter<'_, T> {
    fn read_record(&mut self) -> Result<Option<T>, WalError> {
        let start = self.offset;
        self.file.seek(SeekFrom::Start(start))?;

        let mut len_bytes = [0u8; U32_SIZE];
        match self.file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                // A partial length prefix is a torn write, a clean EOF is the end.
                let end = self.file.seek(SeekFrom::End(0))?;
                if end > start {
                    return Err(WalError::UnexpectedEof(start));
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.max_record_size {
            return Err(WalError::RecordTooLarge(len));
        }

        let mut body = vec![0u8; len + U32_SIZE];
        self.file.read_exact(&mut body).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                WalError::UnexpectedEof(start)
            } else {
                WalError::Io(e)
            }
        })?;

        let (bytes, crc) = body.split_at(len);
        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(bytes);
        let mut stored = [0u8; U32_SIZE];
        stored.copy_from_slice(crc);
        if hasher.finalize() != u32::from_le_bytes(stored) {
            error!(offset = start, len, "WAL checksum mismatch");
            return Err(WalError::ChecksumMismatch(start));
        }

        let record = encoding::decode_exact::<T>(bytes)?;
        self.offset = start + (len + 2 * U32_SIZE) as u64;
        Ok(Some(record))
    }
}
