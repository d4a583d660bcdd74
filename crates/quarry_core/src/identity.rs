//! Canonical byte forms of keys.
//!
//! Keys are compared as raw bytes by the engine, so every value is encoded so
//! that byte order matches the natural order of the value: GUIDs as their 16
//! raw bytes, integers big-endian with the sign bit flipped, text as UTF-8.

use crate::catalog::IdentityShape;
use std::fmt;
use uuid::Uuid;

/// A primary-key or indexed field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    /// Opaque byte array.
    Bytes(Vec<u8>),
    /// GUID.
    Guid(Uuid),
    /// 64-bit integer.
    Int64(i64),
    /// 32-bit integer.
    Int32(i32),
    /// UTF-8 text. Only valid for indexed fields, not identities.
    Text(String),
}

impl KeyValue {
    /// Canonical key bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes.clone(),
            Self::Guid(id) => id.as_bytes().to_vec(),
            Self::Int64(v) => ((*v as u64) ^ (1 << 63)).to_be_bytes().to_vec(),
            Self::Int32(v) => ((*v as u32) ^ (1 << 31)).to_be_bytes().to_vec(),
            Self::Text(s) => s.as_bytes().to_vec(),
        }
    }
}

impl KeyValue {
    /// Identity shape of the value. Text is never an identity.
    #[must_use]
    pub fn identity_shape(&self) -> Option<IdentityShape> {
        match self {
            Self::Bytes(_) => Some(IdentityShape::Bytes),
            Self::Guid(_) => Some(IdentityShape::Guid),
            Self::Int64(_) => Some(IdentityShape::Int64),
            Self::Int32(_) => Some(IdentityShape::Int32),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "{} bytes", bytes.len()),
            Self::Guid(id) => write!(f, "{id}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<Uuid> for KeyValue {
    fn from(id: Uuid) -> Self {
        Self::Guid(id)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<Vec<u8>> for KeyValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for KeyValue {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}
