//! Cache protocol messages
//!
//! Requests and responses are carried as archives with two reserved keys:
//! `op` names the operation and `seq` is the correlation id echoed back by
//! the server, so a connection can keep several requests in flight and
//! still match each reply. Everything else is per-operation fields.

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::item::CachedItemValue;
use crate::key::CacheKey;
use bytes::Bytes;

const OP_GET: &str = "get";
const OP_PUT: &str = "put";
const OP_STATUS: &str = "status";

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRequest {
    /// Look up a fingerprint. A miss is a normal response, not an error.
    Get { key: CacheKey },
    /// Insert or overwrite a value. Overwriting an existing fingerprint is
    /// idempotent and refreshes its recency.
    Put {
        key: CacheKey,
        value: CachedItemValue,
    },
    /// Query entry count / size / capacity of the store.
    Status,
}

impl CacheRequest {
    pub fn to_archive(&self, seq: u64) -> Archive {
        let mut archive = Archive::new();
        archive.set_u64("seq", seq);
        match self {
            Self::Get { key } => {
                archive.set_string("op", OP_GET);
                archive.set_bytes("key", Bytes::copy_from_slice(key.as_bytes()));
            }
            Self::Put { key, value } => {
                archive.set_string("op", OP_PUT);
                archive.set_bytes("key", Bytes::copy_from_slice(key.as_bytes()));
                archive.set_archive("value", value.to_archive());
            }
            Self::Status => {
                archive.set_string("op", OP_STATUS);
            }
        }
        archive
    }

    /// Decode a request, returning its correlation id alongside it.
    pub fn from_archive(archive: &Archive) -> Result<(u64, Self)> {
        let seq = archive
            .get_u64("seq")
            .ok_or_else(|| Error::missing_field("seq"))?;
        let op = archive
            .get_str("op")
            .ok_or_else(|| Error::missing_field("op"))?;
        let request = match op {
            OP_GET => Self::Get {
                key: required_key(archive)?,
            },
            OP_PUT => Self::Put {
                key: required_key(archive)?,
                value: CachedItemValue::from_archive(
                    archive
                        .get_archive("value")
                        .ok_or_else(|| Error::missing_field("value"))?,
                )?,
            },
            OP_STATUS => Self::Status,
            other => {
                return Err(Error::UnknownOp {
                    op: other.to_string(),
                });
            }
        };
        Ok((seq, request))
    }
}

/// Server → client message, mirroring [`CacheRequest`] kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheResponse {
    Get {
        found: bool,
        value: Option<CachedItemValue>,
    },
    Put {
        accepted: bool,
    },
    Status {
        entry_count: u64,
        total_size: u64,
        capacity: u64,
    },
}

impl CacheResponse {
    pub fn to_archive(&self, seq: u64) -> Archive {
        let mut archive = Archive::new();
        archive.set_u64("seq", seq);
        match self {
            Self::Get { found, value } => {
                archive.set_string("op", OP_GET);
                archive.set_bool("found", *found);
                if let Some(value) = value {
                    archive.set_archive("value", value.to_archive());
                }
            }
            Self::Put { accepted } => {
                archive.set_string("op", OP_PUT);
                archive.set_bool("accepted", *accepted);
            }
            Self::Status {
                entry_count,
                total_size,
                capacity,
            } => {
                archive.set_string("op", OP_STATUS);
                archive.set_u64("entry_count", *entry_count);
                archive.set_u64("total_size", *total_size);
                archive.set_u64("capacity", *capacity);
            }
        }
        archive
    }

    pub fn from_archive(archive: &Archive) -> Result<(u64, Self)> {
        let seq = archive
            .get_u64("seq")
            .ok_or_else(|| Error::missing_field("seq"))?;
        let op = archive
            .get_str("op")
            .ok_or_else(|| Error::missing_field("op"))?;
        let response = match op {
            OP_GET => {
                let found = archive
                    .get_bool("found")
                    .ok_or_else(|| Error::missing_field("found"))?;
                let value = match archive.get_archive("value") {
                    Some(value) => Some(CachedItemValue::from_archive(value)?),
                    None => None,
                };
                Self::Get { found, value }
            }
            OP_PUT => Self::Put {
                accepted: archive
                    .get_bool("accepted")
                    .ok_or_else(|| Error::missing_field("accepted"))?,
            },
            OP_STATUS => Self::Status {
                entry_count: archive
                    .get_u64("entry_count")
                    .ok_or_else(|| Error::missing_field("entry_count"))?,
                total_size: archive
                    .get_u64("total_size")
                    .ok_or_else(|| Error::missing_field("total_size"))?,
                capacity: archive
                    .get_u64("capacity")
                    .ok_or_else(|| Error::missing_field("capacity"))?,
            },
            other => {
                return Err(Error::UnknownOp {
                    op: other.to_string(),
                });
            }
        };
        Ok((seq, response))
    }
}

fn required_key(archive: &Archive) -> Result<CacheKey> {
    CacheKey::from_slice(
        archive
            .get_bytes("key")
            .ok_or_else(|| Error::missing_field("key"))?,
    )
}
