//! Pluggable value serialization.
//!
//! A store never interprets value bytes itself: it hands them to a
//! [`ValueCodec`] on the way in and on the way out. Deserialization receives
//! a slice borrowed straight from the shard mapping, so a codec that only
//! reads the bytes it needs avoids any intermediate copy.

use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Failure reported by a codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("{0}")]
    Custom(String),
}

/// A serializer/deserializer pair for values of type `V`.
///
/// `deserialize(serialize(v))` must equal `v`.
pub trait ValueCodec<V> {
    fn serialize(&self, value: &V) -> Result<Vec<u8>, CodecError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<V, CodecError>;
}

/// Default codec: the crate's own binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodingCodec;

impl<V: Encode + Decode> ValueCodec<V> for EncodingCodec {
    fn serialize(&self, value: &V) -> Result<Vec<u8>, CodecError> {
        Ok(encoding::encode_to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<V, CodecError> {
        Ok(encoding::decode_exact(bytes)?)
    }
}

/// Identity codec for callers that already hold serialized bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ValueCodec<Vec<u8>> for RawCodec {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}
