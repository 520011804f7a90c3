//! Persistent pack database
//!
//! A small JSON file that records what the manager knows about every
//! pack across restarts. Transient pipeline states are normalized back
//! to something resumable on load, so a crash mid-download never leaves
//! a pack stranded in `Downloading`.

use crate::error::Result;
use crate::pack::{Pack, PackState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Serialized form of one pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackRecord {
    /// Catalog name
    pub name: String,
    /// Last observed lifecycle state
    pub state: PackState,
    /// Scheduling priority
    pub priority: f32,
    /// Archive size from the manifest
    pub size: u64,
    /// Expected MD5 of the archive, lowercase hex
    pub checksum: String,
    /// Dependency pack names
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Where the mounted archive lives, when mounted
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Whether the pack was absent from the latest manifest
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct DbFile {
    version: u32,
    packs: Vec<PackRecord>,
}

const DB_VERSION: u32 = 1;

/// JSON-backed pack database at a fixed path
#[derive(Debug)]
pub struct PackDb {
    path: PathBuf,
}

impl PackDb {
    /// Create a database handle for `path`. Nothing is read until
    /// [`PackDb::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all records, normalizing states that cannot survive a
    /// restart. A missing file is an empty database; a corrupt file is
    /// discarded with a warning rather than failing initialization.
    pub fn load(&self) -> Result<Vec<PackRecord>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no pack database yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let file: DbFile = match serde_json::from_slice(&data) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding corrupt pack database");
                return Ok(Vec::new());
            }
        };

        let mut records = file.packs;
        for record in &mut records {
            normalize(record);
        }
        Ok(records)
    }

    /// Write all records, replacing the previous contents atomically
    /// via a rename from a temp file in the same directory.
    pub fn save(&self, records: &[PackRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = DbFile {
            version: DB_VERSION,
            packs: records.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), packs = records.len(), "saved pack database");
        Ok(())
    }
}

/// Transient states roll back to the nearest resumable one. Bytes on
/// disk are rediscovered from the partial file when the download
/// restarts, so no progress is recorded here.
fn normalize(record: &mut PackRecord) {
    match record.state {
        PackState::Requesting | PackState::Downloading => {
            record.state = PackState::Requesting;
        }
        PackState::Downloaded | PackState::Mounting => {
            // The partial file is still verified, re-running the mount
            // from Downloaded is safe.
            record.state = PackState::Downloaded;
        }
        PackState::Mounted => {
            let present = record
                .local_path
                .as_ref()
                .is_some_and(|p| p.exists());
            if !present {
                warn!(pack = %record.name, "mounted archive missing on disk, resetting");
                record.state = PackState::NotRequested;
                record.local_path = None;
            }
        }
        PackState::NotRequested | PackState::OtherError => {}
    }
}

impl PackRecord {
    /// Build a record from the live pack
    #[must_use]
    pub fn from_pack(pack: &Pack) -> Self {
        Self {
            name: pack.name.clone(),
            state: pack.state,
            priority: pack.priority,
            size: pack.total,
            checksum: pack.checksum.clone(),
            dependencies: pack.dependencies.clone(),
            local_path: pack.local_path.clone(),
            stale: pack.stale,
        }
    }

    /// Rehydrate a live pack from this record
    #[must_use]
    pub fn into_pack(self) -> Pack {
        Pack {
            name: self.name,
            state: self.state,
            priority: self.priority,
            dependencies: self.dependencies,
            downloaded: 0,
            total: self.size,
            checksum: self.checksum,
            error: None,
            stale: self.stale,
            local_path: self.local_path,
        }
    }
}
