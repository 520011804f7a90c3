//! Error types for pack management

use thiserror::Error;

/// Errors that can occur during pack download and mounting
#[derive(Debug, Error)]
pub enum Error {
    /// An operation was attempted before `initialize` was called
    #[error("pack manager is not initialized")]
    NotInitialized,

    /// `initialize` was called twice
    #[error("pack manager is already initialized")]
    AlreadyInitialized,

    /// A pack name was not found in the catalog
    #[error("unknown pack: {name}")]
    UnknownPack {
        /// Requested pack name
        name: String,
    },

    /// The server manifest could not be parsed
    #[error("invalid manifest at line {line}: {reason}")]
    InvalidManifest {
        /// 1-based line number within the manifest
        line: usize,
        /// What went wrong on that line
        reason: String,
    },

    /// The server manifest could not be fetched
    #[error("failed to fetch manifest from {url}: {reason}")]
    ManifestFetch {
        /// Manifest URL
        url: String,
        /// Transport-level failure description
        reason: String,
    },

    /// An archive transfer could not proceed
    #[error("transfer from {url} failed: {reason}")]
    TransferFailed {
        /// Archive URL
        url: String,
        /// What stopped the transfer
        reason: String,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local file system error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pack database serialization error
    #[error("pack database error: {0}")]
    Db(#[from] serde_json::Error),
}

/// Result type for pack operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an [`Error::InvalidManifest`] for the given line
    pub fn invalid_manifest(line: usize, reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            line,
            reason: reason.into(),
        }
    }
}
