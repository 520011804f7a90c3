//! Error types for the wire format

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Archive decoding errors
    #[error("archive truncated while reading {context}")]
    Truncated { context: &'static str },

    #[error("unknown value tag {tag:#04x}")]
    UnknownTag { tag: u8 },

    #[error("archive key is not valid UTF-8")]
    InvalidKey,

    #[error("{len} trailing bytes after archive")]
    TrailingBytes { len: usize },

    // Message-level errors
    #[error("message is missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("unknown operation `{op}`")]
    UnknownOp { op: String },

    #[error("cache key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid hex in cache key: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("checksum mismatch for `{path}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl Error {
    pub fn truncated(context: &'static str) -> Self {
        Self::Truncated { context }
    }

    pub fn missing_field(field: &'static str) -> Self {
        Self::MissingField { field }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
