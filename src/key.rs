//! External keys accepted by a store.

use std::fmt;

use crate::encoding::{Decode, Encode, EncodingError};

/// Kind of key a backend accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Int,
    Str,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Int => f.write_str("int"),
            KeyKind::Str => f.write_str("str"),
        }
    }
}

/// An external key.
///
/// Resolver-backed stores accept both variants side by side. Direct-indexing
/// stores and the durable backends accept exactly one [`KeyKind`] and reject
/// the other with a key-type mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    pub fn kind(&self) -> KeyKind {
        match self {
            Key::Int(_) => KeyKind::Int,
            Key::Str(_) => KeyKind::Str,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(n) => Some(*n),
            Key::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Int(_) => None,
            Key::Str(s) => Some(s),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Int(i64::from(n))
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Int(i64::from(n))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_owned())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key::Str(s.clone())
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Self {
        k.clone()
    }
}

impl Encode for Key {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Key::Int(n) => {
                0u8.encode_to(buf)?;
                n.encode_to(buf)
            }
            Key::Str(s) => {
                1u8.encode_to(buf)?;
                s.encode_to(buf)
            }
        }
    }
}

impl Decode for Key {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        match tag {
            0 => {
                let (n, used) = i64::decode_from(&buf[offset..])?;
                offset += used;
                Ok((Key::Int(n), offset))
            }
            1 => {
                let (s, used) = String::decode_from(&buf[offset..])?;
                offset += used;
                Ok((Key::Str(s), offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Key",
            }),
        }
    }
}
