//! Pack catalog entries and their lifecycle states

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of a pack.
///
/// States only advance forward along the download pipeline; the sole
/// way back to [`PackState::NotRequested`] is an explicit delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackState {
    /// Known from the catalog, nothing requested yet
    NotRequested,
    /// Queued for download, waiting for a transfer slot
    Requesting,
    /// Bytes are being fetched (or a retry is pending)
    Downloading,
    /// All bytes on disk, checksum verified
    Downloaded,
    /// Archive is being attached to the virtual file system
    Mounting,
    /// Fully available for reads
    Mounted,
    /// Terminal failure; requires delete + re-request to recover
    OtherError,
}

impl PackState {
    /// Position along the pipeline, used to assert forward-only motion.
    ///
    /// [`PackState::OtherError`] is reachable from anywhere and ranks last.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::NotRequested => 0,
            Self::Requesting => 1,
            Self::Downloading => 2,
            Self::Downloaded => 3,
            Self::Mounting => 4,
            Self::Mounted => 5,
            Self::OtherError => 6,
        }
    }

    /// Whether the pipeline has finished with this pack
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Mounted | Self::OtherError)
    }
}

impl std::fmt::Display for PackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotRequested => "not-requested",
            Self::Requesting => "requesting",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::OtherError => "error",
        };
        f.write_str(s)
    }
}

/// A single pack tracked by the manager
#[derive(Debug, Clone, PartialEq)]
pub struct Pack {
    /// Catalog name, unique within the manifest
    pub name: String,
    /// Current lifecycle state
    pub state: PackState,
    /// Scheduling priority; higher downloads first
    pub priority: f32,
    /// Names of packs this one depends on
    pub dependencies: Vec<String>,
    /// Bytes on disk so far
    pub downloaded: u64,
    /// Expected archive size in bytes from the manifest
    pub total: u64,
    /// Expected MD5 of the archive, lowercase hex
    pub checksum: String,
    /// Failure description when `state` is [`PackState::OtherError`]
    pub error: Option<String>,
    /// Set when the pack vanished from the latest server manifest
    pub stale: bool,
    /// Location of the mounted archive, if any
    pub local_path: Option<PathBuf>,
}

impl Pack {
    /// Where to read the archive from, once the pack is mounted
    #[must_use]
    pub fn mounted_path(&self) -> Option<&std::path::Path> {
        if self.state == PackState::Mounted {
            self.local_path.as_deref()
        } else {
            None
        }
    }

    /// Fraction of the archive already on disk, in `0.0..=1.0`
    #[must_use]
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.downloaded as f32 / self.total as f32;
        ratio.min(1.0)
    }
}

/// What changed about a pack during an update
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// The pack moved to a new lifecycle state
    StateChanged(PackState),
    /// More bytes arrived for an in-flight download
    Progress {
        /// Bytes on disk after this update
        downloaded: u64,
        /// Expected archive size
        total: u64,
    },
}

/// Notification delivered to the change listener
#[derive(Debug, Clone, PartialEq)]
pub struct PackChange {
    /// Name of the pack that changed
    pub name: String,
    /// What happened
    pub kind: ChangeKind,
}
