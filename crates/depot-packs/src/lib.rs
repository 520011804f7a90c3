//! Priority-ordered, resumable pack downloads for depot
//!
//! This crate keeps a catalog of content packs in sync with a server
//! manifest, downloads requested packs over HTTP with resume and
//! retry, verifies each archive against its MD5 from the manifest, and
//! mounts verified archives for use. All progress happens inside an
//! explicit update tick driven by the caller, so integration into a
//! frame loop needs no background coordination.
//!
//! # Example
//!
//! ```no_run
//! use depot_packs::{PackManager, PackManagerConfig};
//! use std::path::Path;
//!
//! # async fn run() -> depot_packs::Result<()> {
//! let mut packs = PackManager::with_http(PackManagerConfig::default())?;
//! packs.initialize(Path::new("packs.json"), Path::new("install/packs"), "x64")?;
//! packs
//!     .sync_with_server("http://cdn.example/depot/manifest.psv", Path::new("cache/packs"))
//!     .await?;
//! packs.request_pack("gfx")?;
//! loop {
//!     let changes = packs.update()?;
//!     if changes.is_empty() {
//!         // idle tick
//!     }
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod downloader;
pub mod error;
pub mod manifest;
pub mod pack;
pub mod retry;

mod manager;

pub use config::PackManagerConfig;
pub use downloader::{Downloader, HttpDownloader, Transfer, TransferEvent};
pub use error::{Error, Result};
pub use manager::ChangeListener;
pub use pack::{ChangeKind, Pack, PackChange, PackState};
pub use retry::RetryPolicy;

use manager::PackManagerImpl;
use std::path::Path;
use std::sync::Arc;

/// Facade over the pack pipeline.
///
/// Construction picks the transfer backend; everything else forwards
/// to the scheduler. Methods other than [`PackManager::initialize`]
/// return [`Error::NotInitialized`] until initialization succeeds.
pub struct PackManager {
    inner: PackManagerImpl,
}

impl PackManager {
    /// Create a manager with a custom transfer backend
    #[must_use]
    pub fn new(config: PackManagerConfig, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            inner: PackManagerImpl::new(config, downloader),
        }
    }

    /// Create a manager that downloads over HTTP
    pub fn with_http(config: PackManagerConfig) -> Result<Self> {
        Ok(Self::new(config, Arc::new(HttpDownloader::new()?)))
    }

    /// Load the pack database and remember the read-only install dir.
    /// Must be called exactly once before anything else.
    pub fn initialize(
        &mut self,
        db_path: &Path,
        readonly_dir: &Path,
        arch: &str,
    ) -> Result<()> {
        self.inner.initialize(db_path, readonly_dir, arch)
    }

    /// Fetch the server manifest and reconcile the local catalog
    pub async fn sync_with_server(
        &mut self,
        manifest_url: &str,
        download_dir: &Path,
    ) -> Result<()> {
        self.inner.sync_with_server(manifest_url, download_dir).await
    }

    /// Queue a pack and its dependencies for download
    pub fn request_pack(&mut self, name: &str) -> Result<Pack> {
        self.inner.request_pack(name)
    }

    /// Adjust a pack's download priority
    pub fn change_download_order(&mut self, name: &str, priority: f32) -> Result<()> {
        self.inner.change_download_order(name, priority)
    }

    /// Remove a pack's local files and forget its request
    pub fn delete_pack(&mut self, name: &str) -> Result<()> {
        self.inner.delete_pack(name)
    }

    /// Resume the transfer scheduler after [`PackManager::disable_requesting`]
    pub fn enable_requesting(&mut self) {
        self.inner.set_requesting_enabled(true);
    }

    /// Pause the transfer scheduler. In-flight transfers keep running;
    /// no new transfers start while disabled.
    pub fn disable_requesting(&mut self) {
        self.inner.set_requesting_enabled(false);
    }

    /// Whether the scheduler is currently filling transfer slots
    #[must_use]
    pub fn is_requesting_enabled(&self) -> bool {
        self.inner.is_requesting_enabled()
    }

    /// Install a callback that observes every pack change
    pub fn set_listener(&mut self, listener: Option<ChangeListener>) {
        self.inner.set_listener(listener);
    }

    /// Snapshot of every known pack, ordered by name
    pub fn get_packs(&self) -> Result<Vec<Pack>> {
        self.inner.get_packs()
    }

    /// Snapshot of one pack
    pub fn get_pack(&self, name: &str) -> Result<Pack> {
        self.inner.get_pack(name)
    }

    /// Advance the pipeline one tick and return the changes applied
    pub fn update(&mut self) -> Result<Vec<PackChange>> {
        self.inner.update()
    }
}
