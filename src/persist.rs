//! Checksummed, atomically replaced metadata files.
//!
//! Used for the offset index blob, the store parameters and the durable
//! dictionary snapshots. Layout:
//!
//! ```text
//! [MAGIC: 4 bytes][FORMAT_VERSION: u32 LE][PAYLOAD_LEN: u32 LE][PAYLOAD][CRC32 LE]
//! ```
//!
//! The CRC covers everything before it. Writes go to `<name>.tmp`, are
//! fsynced, renamed over the target and followed by a directory fsync, so a
//! reader sees either the previous file or the new one.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::Path,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::debug;

/// Version of the sealed-file container, bumped on incompatible changes.
pub const FORMAT_VERSION: u32 = 1;

const TMP_SUFFIX: &str = "tmp";
const HEADER_LEN: usize = 12;
const CRC_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad magic in {file}: expected {expected:?}, found {found:?}")]
    BadMagic {
        file: String,
        expected: [u8; 4],
        found: [u8; 4],
    },

    #[error("unsupported format version {found} (this build reads {FORMAT_VERSION})")]
    UnsupportedVersion { found: u32 },

    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(String),

    #[error("truncated file {0}")]
    Truncated(String),
}

/// Seals `payload` under `magic` and atomically replaces `path` with it.
pub fn write_sealed(path: &Path, magic: [u8; 4], payload: &[u8]) -> Result<(), PersistError> {
    let payload_len = u32::try_from(payload.len()).map_err(|_| {
        PersistError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "sealed payload exceeds 4 GiB",
        ))
    })?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    bytes.extend_from_slice(&magic);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload_len.to_le_bytes());
    bytes.extend_from_slice(payload);

    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    bytes.extend_from_slice(&hasher.finalize().to_le_bytes());

    let tmp_path = path.with_extension(TMP_SUFFIX);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        fsync_dir(dir)?;
    }

    debug!(path = %path.display(), bytes = bytes.len(), "sealed file written");
    Ok(())
}

/// Reads and verifies a sealed file, returning its payload.
pub fn read_sealed(path: &Path, magic: [u8; 4]) -> Result<Vec<u8>, PersistError> {
    let name = path.display().to_string();

    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < HEADER_LEN + CRC_LEN {
        return Err(PersistError::Truncated(name));
    }

    let body_len = bytes.len() - CRC_LEN;
    let mut stored = [0u8; CRC_LEN];
    stored.copy_from_slice(&bytes[body_len..]);
    let mut hasher = Crc32::new();
    hasher.update(&bytes[..body_len]);
    if hasher.finalize() != u32::from_le_bytes(stored) {
        return Err(PersistError::ChecksumMismatch(name));
    }

    let mut found = [0u8; 4];
    found.copy_from_slice(&bytes[..4]);
    if found != magic {
        return Err(PersistError::BadMagic {
            file: name,
            expected: magic,
            found,
        });
    }

    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(word);
    if version != FORMAT_VERSION {
        return Err(PersistError::UnsupportedVersion { found: version });
    }

    word.copy_from_slice(&bytes[8..12]);
    let payload_len = u32::from_le_bytes(word) as usize;
    if HEADER_LEN + payload_len != body_len {
        return Err(PersistError::Truncated(name));
    }

    bytes.truncate(body_len);
    bytes.drain(..HEADER_LEN);
    Ok(bytes)
}

/// Fsyncs a directory so renames inside it are durable.
pub fn fsync_dir(dir: &Path) -> Result<(), io::Error> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAGIC: [u8; 4] = *b"TEST";

    #[test]
    fn sealed_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        write_sealed(&path, MAGIC, b"payload").unwrap();
        assert_eq!(read_sealed(&path, MAGIC).unwrap(), b"payload");
        assert!(!path.with_extension(TMP_SUFFIX).exists());
    }

    #[test]
    fn rewrite_replaces_previous_payload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        write_sealed(&path, MAGIC, b"first").unwrap();
        write_sealed(&path, MAGIC, b"second, longer").unwrap();
        assert_eq!(read_sealed(&path, MAGIC).unwrap(), b"second, longer");
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        write_sealed(&path, MAGIC, b"payload").unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_LEN + 2] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = read_sealed(&path, MAGIC).unwrap_err();
        assert!(matches!(err, PersistError::ChecksumMismatch(_)));
    }

    #[test]
    fn wrong_magic_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        write_sealed(&path, MAGIC, b"x").unwrap();
        let err = read_sealed(&path, *b"OTHR").unwrap_err();
        assert!(matches!(err, PersistError::BadMagic { .. }));
    }

    #[test]
    fn short_file_is_truncated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        fs::write(&path, b"TES").unwrap();
        let err = read_sealed(&path, MAGIC).unwrap_err();
        assert!(matches!(err, PersistError::Truncated(_)));
    }
}
