//! Deterministic little-endian binary encoding for everything shardkv persists.
//!
//! The index blob, the parameter record, the durable dictionary WAL and its
//! snapshots are all written through the [`Encode`] / [`Decode`] traits in
//! this module. The format is owned by this crate, so the bytes on disk only
//! change when the crate decides so. The same traits back the default value
//! codec ([`crate::codec::EncodingCodec`]).
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                     |
//! |--------------------|----------------------------------------------|
//! | `u8`               | 1 byte                                       |
//! | `u32` / `u64`      | 4 / 8 bytes, little-endian                   |
//! | `i64`              | 8 bytes, little-endian two's complement      |
//! | `bool`             | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `Vec<u8>` / bytes  | `[u32 len][bytes]`                           |
//! | `String`           | `[u32 len][utf-8 bytes]`                     |
//! | `PathBuf`          | `[u32 len][raw OS bytes]`                    |
//! | `Option<T>`        | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//! | `Vec<T>`           | `[u32 count][T₁][T₂]…` via [`encode_vec`]    |
//!
//! Variable-length decoders are bounded by [`MAX_BYTE_LEN`] and
//! [`MAX_VEC_ELEMENTS`] so a corrupted length prefix cannot trigger a huge
//! allocation. Nothing in this module panics on malformed input.


use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use thiserror::Error;

/// Upper bound for a decoded byte string, string or path (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Upper bound for a decoded element count in [`decode_vec`] (16 M).
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

/// Errors produced while encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Input ended before the value was complete.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof { needed: usize, available: usize },

    /// Unknown enum discriminant.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag { tag: u32, type_name: &'static str },

    /// A bool byte other than `0x00` / `0x01`.
    #[error("invalid bool byte: 0x{0:02X}")]
    InvalidBool(u8),

    /// String payload was not UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count is above its limit or does not fit the format.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Application-level decode failure.
    #[error("{0}")]
    Custom(String),
}

/// Serialize `self` by appending to a buffer. Output must be deterministic.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a slice.
///
/// Returns the value and the number of bytes consumed, so composite decoders
/// can walk a buffer field by field.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a fresh `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the start of `buf`, returning `(value, consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// Decode a value that must occupy the whole of `buf`.
///
/// Trailing bytes are reported as corruption rather than silently ignored.
pub fn decode_exact<T: Decode>(buf: &[u8]) -> Result<T, EncodingError> {
    let (value, consumed) = T::decode_from(buf)?;
    if consumed != buf.len() {
        return Err(EncodingError::Custom(format!(
            "{} trailing bytes after decoded value",
            buf.len() - consumed
        )));
    }
    Ok(value)
}

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        return Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

/// Reads a `[u32 len]` prefix and checks it against [`MAX_BYTE_LEN`] and the
/// remaining input. Returns `(payload_start, payload_len)`.
#[inline]
fn byte_run(buf: &[u8], what: &str) -> Result<(usize, usize), EncodingError> {
    let (len, header) = u32::decode_from(buf)?;
    if len > MAX_BYTE_LEN {
        return Err(EncodingError::LengthOverflow(format!(
            "{what} length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
        )));
    }
    let len = len as usize;
    require(&buf[header..], len)?;
    Ok((header, len))
}

// ------------------------------------------------------------------------------------------------
// Fixed-width integers
// ------------------------------------------------------------------------------------------------

macro_rules! fixed_width {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            #[inline]
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                buf.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                const WIDTH: usize = std::mem::size_of::<$ty>();
                require(buf, WIDTH)?;
                let mut raw = [0u8; WIDTH];
                raw.copy_from_slice(&buf[..WIDTH]);
                Ok((<$ty>::from_le_bytes(raw), WIDTH))
            }
        }
    )*};
}

fixed_width!(u8, u16, u32, u64, i64);

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

// Fixed-size arrays carry no length prefix.
impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&buf[..N]);
        Ok((out, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed byte runs
// ------------------------------------------------------------------------------------------------

impl Encode for [u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (start, len) = byte_run(buf, "byte vector")?;
        Ok((buf[start..start + len].to_vec(), start + len))
    }
}

impl Encode for str {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode_to(buf)
    }
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_str().encode_to(buf)
    }
}

impl Decode for String {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(raw)?, consumed))
    }
}

// Paths are stored as raw OS bytes; they round-trip on the platform that
// wrote them.
impl Encode for PathBuf {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_os_str().as_bytes().encode_to(buf)
    }
}

impl Decode for PathBuf {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (start, len) = byte_run(buf, "path")?;
        let os = OsStr::from_bytes(&buf[start..start + len]);
        Ok((PathBuf::from(os), start + len))
    }
}

// ------------------------------------------------------------------------------------------------
// Option<T>
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => buf.push(0),
            Some(inner) => {
                buf.push(1);
                inner.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0 => Ok((None, 1)),
            1 => {
                let (inner, n) = T::decode_from(&buf[1..])?;
                Ok((Some(inner), 1 + n))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Option<T>",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Sequences
//
// `Vec<u8>` already has a byte-run impl, so element sequences go through
// free functions instead of a conflicting blanket impl.
// ------------------------------------------------------------------------------------------------

/// Encode a slice as `[u32 count][T₁][T₂]…`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode `[u32 count][T₁][T₂]…`, capped at [`MAX_VEC_ELEMENTS`].
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut offset) = u32::decode_from(buf)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "element count {count} exceeds MAX_VEC_ELEMENTS ({MAX_VEC_ELEMENTS})"
        )));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, n) = T::decode_from(&buf[offset..])?;
        offset += n;
        items.push(item);
    }
    Ok((items, offset))
}
