//! Error types for the cache store and endpoints

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Net(#[from] depot_net::Error),

    #[error("wire format error: {0}")]
    Wire(#[from] depot_wire::Error),

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("no response within {timeout_ms} ms")]
    ResponseTimeout { timeout_ms: u64 },

    #[error("value of {size} bytes exceeds cache capacity of {capacity} bytes")]
    ValueTooLarge { size: u64, capacity: u64 },

    #[error("cache index is corrupt: {0}")]
    CorruptIndex(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
