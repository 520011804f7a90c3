//! Store configuration

use std::path::{Path, PathBuf};

/// Default resident-size limit: 8 GiB.
pub const DEFAULT_CAPACITY_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Configuration for a [`crate::CacheStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Total payload bytes the store may keep before evicting.
    pub capacity_bytes: u64,
    /// JSON index persisted across restarts.
    pub index_path: PathBuf,
    /// Directory holding the sharded content blobs.
    pub data_dir: PathBuf,
}

impl StoreConfig {
    /// Conventional layout under one root: `index.json` + `data/`.
    pub fn in_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            index_path: root.join("index.json"),
            data_dir: root.join("data"),
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_dir_layout() {
        let config = StoreConfig::in_dir("/var/cache/depot").with_capacity(1024);
        assert_eq!(config.index_path, PathBuf::from("/var/cache/depot/index.json"));
        assert_eq!(config.data_dir, PathBuf::from("/var/cache/depot/data"));
        assert_eq!(config.capacity_bytes, 1024);
    }
}
