//! Cached item values
//!
//! A [`CachedItemValue`] is one build artifact's file set: an ordered list
//! of relative paths with their bytes and per-file checksums. It travels
//! inside PUT requests and GET responses and is what the server store holds
//! per fingerprint.

use crate::archive::{Archive, Value};
use crate::error::{Error, Result};
use crate::key::CacheKey;
use bytes::Bytes;

/// One file of a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFile {
    /// Path relative to the artifact root, `/`-separated.
    pub path: String,
    pub data: Bytes,
    /// Fingerprint of `data`, computed when the file is added and
    /// re-verified on decode.
    pub checksum: CacheKey,
}

impl ItemFile {
    pub fn new(path: impl Into<String>, data: Bytes) -> Self {
        let checksum = CacheKey::for_bytes(&data);
        Self {
            path: path.into(),
            data,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        CacheKey::for_bytes(&self.data) == self.checksum
    }
}

/// Ordered file set of one cached artifact plus a validity flag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachedItemValue {
    files: Vec<ItemFile>,
    valid: bool,
}

impl CachedItemValue {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            valid: true,
        }
    }

    /// Append a file; order is preserved on the wire and in the store.
    pub fn add_file(&mut self, path: impl Into<String>, data: Bytes) -> &mut Self {
        self.files.push(ItemFile::new(path, data));
        self
    }

    pub fn files(&self) -> &[ItemFile] {
        &self.files
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Sum of file payload sizes in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }

    pub fn to_archive(&self) -> Archive {
        let mut archive = Archive::new();
        archive.set_bool("valid", self.valid);
        archive.set_u64("count", self.files.len() as u64);
        for (index, file) in self.files.iter().enumerate() {
            let mut entry = Archive::new();
            entry.set_string("path", file.path.clone());
            entry.set_bytes("data", file.data.clone());
            entry.set_bytes("checksum", Bytes::copy_from_slice(file.checksum.as_bytes()));
            archive.set(format!("file{index}"), Value::Archive(entry));
        }
        archive
    }

    /// Rebuild from an archive, re-verifying every file checksum.
    pub fn from_archive(archive: &Archive) -> Result<Self> {
        let valid = archive
            .get_bool("valid")
            .ok_or_else(|| Error::missing_field("valid"))?;
        let count = archive
            .get_u64("count")
            .ok_or_else(|| Error::missing_field("count"))? as usize;

        let mut files = Vec::with_capacity(count.min(1024));
        for index in 0..count {
            let entry = archive
                .get_archive(&format!("file{index}"))
                .ok_or_else(|| Error::missing_field("file entry"))?;
            let path = entry
                .get_str("path")
                .ok_or_else(|| Error::missing_field("path"))?
                .to_string();
            let data = entry
                .get_bytes("data")
                .ok_or_else(|| Error::missing_field("data"))?
                .clone();
            let checksum = CacheKey::from_slice(
                entry
                    .get_bytes("checksum")
                    .ok_or_else(|| Error::missing_field("checksum"))?,
            )?;

            let actual = CacheKey::for_bytes(&data);
            if actual != checksum {
                return Err(Error::ChecksumMismatch {
                    path,
                    expected: checksum.to_hex(),
                    actual: actual.to_hex(),
                });
            }
            files.push(ItemFile {
                path,
                data,
                checksum,
            });
        }
        Ok(Self { files, valid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> CachedItemValue {
        let mut value = CachedItemValue::new();
        value.add_file("shaders/water.bin", Bytes::from_static(b"compiled shader"));
        value.add_file("shaders/water.meta", Bytes::from_static(b"{}"));
        value
    }

    #[test]
    fn test_roundtrip_preserves_order_and_data() {
        let value = sample();
        let decoded = CachedItemValue::from_archive(&value.to_archive()).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(decoded.files()[0].path, "shaders/water.bin");
        assert_eq!(decoded.files()[1].path, "shaders/water.meta");
    }

    #[test]
    fn test_total_size() {
        assert_eq!(sample().total_size(), 15 + 2);
    }

    #[test]
    fn test_corrupted_data_fails_decode() {
        let mut archive = sample().to_archive();
        // Swap one file's data without fixing its checksum.
        let mut entry = archive.get_archive("file0").unwrap().clone();
        entry.set_bytes("data", Bytes::from_static(b"tampered"));
        archive.set_archive("file0", entry);

        assert!(matches!(
            CachedItemValue::from_archive(&archive),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_validity_flag_travels() {
        let mut value = sample();
        value.invalidate();
        let decoded = CachedItemValue::from_archive(&value.to_archive()).unwrap();
        assert!(!decoded.is_valid());
    }
}
