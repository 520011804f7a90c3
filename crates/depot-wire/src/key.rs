//! Content fingerprints
//!
//! A [`CacheKey`] identifies a unit of cached content by digest, never by
//! filename. Two artifacts with the same bytes share a key regardless of
//! where they came from.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 16-byte MD5 content fingerprint.
///
/// Equality and ordering are bytewise, so keys sort deterministically and
/// can serve as map keys on both the client and the server store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey([u8; Self::LEN]);

impl CacheKey {
    pub const LEN: usize = 16;

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Fingerprint of a byte slice.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    /// Parse from exactly [`CacheKey::LEN`] raw bytes (wire form).
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; Self::LEN] = bytes.try_into().map_err(|_| Error::InvalidKeyLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}
