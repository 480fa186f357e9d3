//! The `store_params` record.
//!
//! Everything needed to resume a store besides the index itself: which
//! backend it runs on, the shard placement state and, for resolver-backed
//! stores, the key map in slot order. The record starts with a format tag and
//! a class tag; [`StoreParams::check_compatible`] refuses anything written by
//! a different layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::EngineError;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::index::IndexBackend;
use crate::key::Key;
use crate::persist;
use crate::shard::ShardState;

/// File name of the parameter record.
pub const PARAMS_FILE: &str = "store_params";

/// Layout version of the record payload.
pub const FORMAT_TAG: u32 = 1;

/// Identifies the kind of store that wrote the record.
pub const CLASS_TAG: &str = "shardkv.store";

const PARAMS_MAGIC: [u8; 4] = *b"SKPM";

#[derive(Debug, Clone, PartialEq)]
pub struct StoreParams {
    pub format_tag: u32,
    pub class_tag: String,
    pub backend: IndexBackend,
    pub shards: ShardState,
    pub path: PathBuf,
    pub key_map: Option<Vec<Key>>,
}

impl StoreParams {
    pub fn new(
        backend: IndexBackend,
        shards: ShardState,
        path: PathBuf,
        key_map: Option<Vec<Key>>,
    ) -> Self {
        Self {
            format_tag: FORMAT_TAG,
            class_tag: CLASS_TAG.to_owned(),
            backend,
            shards,
            path,
            key_map,
        }
    }

    pub fn check_compatible(&self) -> Result<(), EngineError> {
        check_tags(self.format_tag, &self.class_tag)
    }

    pub fn save(&self, dir: &Path) -> Result<(), EngineError> {
        let payload = encoding::encode_to_vec(self)?;
        persist::write_sealed(&dir.join(PARAMS_FILE), PARAMS_MAGIC, &payload)?;
        debug!(dir = %dir.display(), backend = %self.backend, "store parameters saved");
        Ok(())
    }

    /// Reads the record. Tags are decoded first so an unknown layout is
    /// reported as a format mismatch rather than a decoding failure.
    pub fn load(dir: &Path) -> Result<Self, EngineError> {
        let payload = persist::read_sealed(&dir.join(PARAMS_FILE), PARAMS_MAGIC)?;
        let (format_tag, n) = u32::decode_from(&payload)?;
        let (class_tag, _) = String::decode_from(&payload[n..])?;
        check_tags(format_tag, &class_tag)?;
        let params = encoding::decode_exact::<StoreParams>(&payload)?;
        Ok(params)
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(PARAMS_FILE).is_file()
    }
}

fn check_tags(format_tag: u32, class_tag: &str) -> Result<(), EngineError> {
    if format_tag != FORMAT_TAG || class_tag != CLASS_TAG {
        return Err(EngineError::FormatMismatch(format!(
            "found format {format_tag} class {class_tag:?}, expected format {FORMAT_TAG} class {CLASS_TAG:?}"
        )));
    }
    Ok(())
}

impl Encode for StoreParams {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.format_tag.encode_to(buf)?;
        self.class_tag.encode_to(buf)?;
        self.backend.tag().encode_to(buf)?;

        let count = u32::try_from(self.shards.file_index.len())
            .map_err(|_| EncodingError::LengthOverflow("too many shards".into()))?;
        count.encode_to(buf)?;
        for (id, name) in &self.shards.file_index {
            id.encode_to(buf)?;
            name.encode_to(buf)?;
        }
        self.shards.shard_for_write.encode_to(buf)?;
        self.shards.written.encode_to(buf)?;
        self.shards.shard_size.encode_to(buf)?;
        self.path.encode_to(buf)?;

        match &self.key_map {
            None => 0u8.encode_to(buf),
            Some(keys) => {
                1u8.encode_to(buf)?;
                encoding::encode_vec(keys, buf)
            }
        }
    }
}

impl Decode for StoreParams {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (format_tag, mut offset) = u32::decode_from(buf)?;
        let (class_tag, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (backend_tag, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let backend = IndexBackend::from_tag(backend_tag).ok_or(EncodingError::InvalidTag {
            tag: u32::from(backend_tag),
            type_name: "IndexBackend",
        })?;

        let (count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let mut file_index = BTreeMap::new();
        for _ in 0..count {
            let (id, n) = u32::decode_from(&buf[offset..])?;
            offset += n;
            let (name, n) = String::decode_from(&buf[offset..])?;
            offset += n;
            file_index.insert(id, name);
        }
        let (shard_for_write, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (written, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (shard_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (path, n) = PathBuf::decode_from(&buf[offset..])?;
        offset += n;

        let (has_keys, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let key_map = match has_keys {
            0 => None,
            1 => {
                let (keys, n) = encoding::decode_vec::<Key>(&buf[offset..])?;
                offset += n;
                Some(keys)
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "key map",
                });
            }
        };

        Ok((
            Self {
                format_tag,
                class_tag,
                backend,
                shards: ShardState {
                    file_index,
                    shard_for_write,
                    written,
                    shard_size,
                },
                path,
                key_map,
            },
            offset,
        ))
    }
}
