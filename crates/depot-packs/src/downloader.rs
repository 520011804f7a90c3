//! Transfer abstraction and the HTTP implementation
//!
//! The manager never talks to the network directly. It drives
//! [`Downloader`] to open transfers and polls each [`Transfer`] for
//! events from its own update loop, which keeps scheduling decisions
//! single-threaded and easy to test with scripted transfers.

use crate::error::{Error, Result};
use futures_util::StreamExt;
use reqwest::StatusCode;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Progress reported by an in-flight transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A chunk of this many bytes was written to the destination
    Bytes(u64),
    /// The transfer finished and the destination file is complete
    Completed,
    /// The transfer failed; the destination keeps whatever arrived
    Failed(String),
}

/// An in-flight download of a single archive
pub trait Transfer: Send {
    /// Drain all events produced since the last poll. Never blocks.
    fn poll_events(&mut self) -> Vec<TransferEvent>;

    /// Stop the transfer. Bytes already written stay on disk so a
    /// later transfer can resume from the same file.
    fn cancel(&mut self);
}

/// Factory for transfers and manifest fetches
pub trait Downloader: Send + Sync {
    /// Fetch the manifest document at `url`
    fn fetch_manifest(
        &self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'static>>;

    /// Begin (or resume) downloading `url` into `dest`, appending from
    /// byte `offset`
    fn begin(&self, url: &str, dest: &Path, offset: u64) -> Box<dyn Transfer>;
}

/// Downloader backed by HTTP range requests.
///
/// Resume works by asking the server for `bytes=offset-`; a server
/// that ignores the range header fails the transfer and the retry
/// starts over from an empty file.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    /// Create a downloader with its own connection pool
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn fetch_manifest(
        &self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'static>> {
        let client = self.client.clone();
        let url = url.to_string();
        Box::pin(async move {
            let response = client.get(&url).send().await.map_err(|e| {
                Error::ManifestFetch {
                    url: url.clone(),
                    reason: e.to_string(),
                }
            })?;
            if !response.status().is_success() {
                return Err(Error::ManifestFetch {
                    url: url.clone(),
                    reason: format!("HTTP {}", response.status()),
                });
            }
            Ok(response.text().await?)
        })
    }

    fn begin(&self, url: &str, dest: &Path, offset: u64) -> Box<dyn Transfer> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = url.to_string();
        let dest = dest.to_path_buf();
        debug!(%url, dest = %dest.display(), offset, "starting HTTP transfer");
        let task = tokio::spawn(async move {
            if let Err(e) = run_transfer(&client, &url, &dest, offset, &tx).await {
                warn!(%url, error = %e, "transfer failed");
                let _ = tx.send(TransferEvent::Failed(e.to_string()));
            }
        });
        Box::new(HttpTransfer {
            events: rx,
            task: Some(task),
        })
    }
}

async fn run_transfer(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    offset: u64,
    tx: &mpsc::UnboundedSender<TransferEvent>,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dest)
        .await?;
    // Drop any stale tail beyond the resume point before appending.
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
    }
    let response = request.send().await?;

    match response.status() {
        StatusCode::PARTIAL_CONTENT => {}
        StatusCode::OK if offset == 0 => {}
        StatusCode::OK => {
            // Server ignored the range header. Discard the partial
            // file so the retry restarts cleanly from zero.
            file.set_len(0).await?;
            return Err(Error::TransferFailed {
                url: url.to_string(),
                reason: "server does not support range requests".to_string(),
            });
        }
        status => {
            return Err(Error::TransferFailed {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
    }

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        trace!(bytes = chunk.len(), "chunk written");
        if tx.send(TransferEvent::Bytes(chunk.len() as u64)).is_err() {
            // Receiver dropped, the transfer was cancelled.
            return Ok(());
        }
    }
    file.flush().await?;
    let _ = tx.send(TransferEvent::Completed);
    Ok(())
}

struct HttpTransfer {
    events: mpsc::UnboundedReceiver<TransferEvent>,
    task: Option<JoinHandle<()>>,
}

impl Transfer for HttpTransfer {
    fn poll_events(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for HttpTransfer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Derive the archive URL for `name` from the manifest URL by replacing
/// the final path segment
#[must_use]
pub fn pack_url(manifest_url: &str, name: &str) -> String {
    match manifest_url.rsplit_once('/') {
        Some((base, _)) => format!("{base}/{name}.dpk"),
        None => format!("{name}.dpk"),
    }
}

/// Partial-download path next to the final archive
#[must_use]
pub fn part_path(download_dir: &Path, name: &str) -> PathBuf {
    download_dir.join(format!("{name}.dpk.part"))
}

/// Final archive path for a fully mounted pack
#[must_use]
pub fn archive_path(download_dir: &Path, name: &str) -> PathBuf {
    download_dir.join(format!("{name}.dpk"))
}
