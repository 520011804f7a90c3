//! Pack lifecycle scheduler
//!
//! All state lives behind [`PackManagerImpl`] and only mutates inside
//! its methods, driven by a caller-owned update tick. Each pack moves
//! at most one lifecycle step per tick, so observers always see every
//! intermediate state.

use crate::config::PackManagerConfig;
use crate::db::{PackDb, PackRecord};
use crate::downloader::{Downloader, Transfer, TransferEvent, archive_path, pack_url, part_path};
use crate::error::{Error, Result};
use crate::manifest;
use crate::pack::{ChangeKind, Pack, PackChange, PackState};
use crate::retry::RetryPolicy;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Callback invoked for every pack change, after the mutation that
/// produced it has been applied
pub type ChangeListener = Box<dyn FnMut(&PackChange) + Send>;

struct Slot {
    pack: Pack,
    transfer: Option<Box<dyn Transfer>>,
    attempts: u32,
    next_attempt_at: Option<Instant>,
    preempt: bool,
}

impl Slot {
    fn new(pack: Pack) -> Self {
        Self {
            pack,
            transfer: None,
            attempts: 0,
            next_attempt_at: None,
            preempt: false,
        }
    }
}

struct State {
    db: PackDb,
    readonly_dir: PathBuf,
    arch: String,
    manifest_url: Option<String>,
    download_dir: Option<PathBuf>,
    packs: BTreeMap<String, Slot>,
}

enum Verify {
    Ok,
    Short(String),
    Corrupt(String),
}

/// The manager behind the [`PackManager`](crate::PackManager) facade
pub(crate) struct PackManagerImpl {
    config: PackManagerConfig,
    downloader: Arc<dyn Downloader>,
    listener: Option<ChangeListener>,
    requesting_enabled: bool,
    state: Option<State>,
}

impl PackManagerImpl {
    pub(crate) fn new(config: PackManagerConfig, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            config,
            downloader,
            listener: None,
            requesting_enabled: true,
            state: None,
        }
    }

    pub(crate) fn initialize(
        &mut self,
        db_path: &Path,
        readonly_dir: &Path,
        arch: &str,
    ) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let db = PackDb::new(db_path);
        let mut packs = BTreeMap::new();
        for record in db.load()? {
            let pack = record.into_pack();
            packs.insert(pack.name.clone(), Slot::new(pack));
        }
        info!(
            db = %db_path.display(),
            packs = packs.len(),
            arch,
            "pack manager initialized"
        );
        self.state = Some(State {
            db,
            readonly_dir: readonly_dir.to_path_buf(),
            arch: arch.to_string(),
            manifest_url: None,
            download_dir: None,
            packs,
        });
        Ok(())
    }

    pub(crate) fn set_listener(&mut self, listener: Option<ChangeListener>) {
        self.listener = listener;
    }

    pub(crate) fn set_requesting_enabled(&mut self, enabled: bool) {
        if self.requesting_enabled != enabled {
            debug!(enabled, "requesting toggled");
        }
        self.requesting_enabled = enabled;
    }

    pub(crate) fn is_requesting_enabled(&self) -> bool {
        self.requesting_enabled
    }

    /// Fetch the manifest and reconcile the local catalog against it.
    ///
    /// New packs appear as `NotRequested` unless a matching archive of
    /// the advertised size sits in the read-only install dir, in which
    /// case they mount immediately. Known packs absent from the
    /// manifest are flagged stale but otherwise untouched.
    pub(crate) async fn sync_with_server(
        &mut self,
        manifest_url: &str,
        download_dir: &Path,
    ) -> Result<()> {
        if self.state.is_none() {
            return Err(Error::NotInitialized);
        }
        let text = self.downloader.fetch_manifest(manifest_url).await?;
        let entries = manifest::parse(&text)?;

        let state = self.state.as_mut().ok_or(Error::NotInitialized)?;
        std::fs::create_dir_all(download_dir)?;

        for slot in state.packs.values_mut() {
            slot.pack.stale = true;
        }

        let mut changes = Vec::new();
        let mut seen = 0usize;
        for entry in entries.into_iter().filter(|e| e.arch == state.arch) {
            seen += 1;
            if let Some(slot) = state.packs.get_mut(&entry.name) {
                slot.pack.stale = false;
                slot.pack.total = entry.size;
                slot.pack.checksum = entry.checksum;
                slot.pack.dependencies = entry.dependencies;
                continue;
            }

            let mut pack = Pack {
                name: entry.name.clone(),
                state: PackState::NotRequested,
                priority: 0.0,
                dependencies: entry.dependencies,
                downloaded: 0,
                total: entry.size,
                checksum: entry.checksum,
                error: None,
                stale: false,
                local_path: None,
            };

            let installed = state.readonly_dir.join(format!("{}.dpk", entry.name));
            if std::fs::metadata(&installed).map(|m| m.len()).ok() == Some(entry.size) {
                debug!(pack = %entry.name, "found in read-only install");
                pack.state = PackState::Mounted;
                pack.downloaded = entry.size;
                pack.local_path = Some(installed);
                changes.push(PackChange {
                    name: entry.name.clone(),
                    kind: ChangeKind::StateChanged(PackState::Mounted),
                });
            }
            state.packs.insert(entry.name, Slot::new(pack));
        }

        state.manifest_url = Some(manifest_url.to_string());
        state.download_dir = Some(download_dir.to_path_buf());
        save(state)?;
        info!(packs = seen, url = manifest_url, "synced with server");
        self.fire(&changes);
        Ok(())
    }

    /// Mark a pack (and, transitively, its dependencies) as wanted.
    ///
    /// Idempotent: a pack already past `NotRequested` is left alone.
    pub(crate) fn request_pack(&mut self, name: &str) -> Result<Pack> {
        let state = self.state.as_mut().ok_or(Error::NotInitialized)?;
        if !state.packs.contains_key(name) {
            return Err(Error::UnknownPack {
                name: name.to_string(),
            });
        }

        let mut changes = Vec::new();
        let mut queue = vec![name.to_string()];
        while let Some(current) = queue.pop() {
            let Some(slot) = state.packs.get_mut(&current) else {
                warn!(pack = current, "unknown dependency, skipping");
                continue;
            };
            if slot.pack.state != PackState::NotRequested {
                continue;
            }
            slot.pack.state = PackState::Requesting;
            slot.pack.error = None;
            slot.attempts = 0;
            slot.next_attempt_at = None;
            queue.extend(slot.pack.dependencies.iter().cloned());
            changes.push(PackChange {
                name: current,
                kind: ChangeKind::StateChanged(PackState::Requesting),
            });
        }

        if !changes.is_empty() {
            save(state)?;
        }
        self.fire(&changes);

        let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
        state
            .packs
            .get(name)
            .map(|s| s.pack.clone())
            .ok_or_else(|| Error::UnknownPack {
                name: name.to_string(),
            })
    }

    /// Change a pack's scheduling priority. Takes effect at the next
    /// update tick; an in-flight lower-priority transfer yields at its
    /// next chunk boundary if slots are contended.
    pub(crate) fn change_download_order(&mut self, name: &str, priority: f32) -> Result<()> {
        let state = self.state.as_mut().ok_or(Error::NotInitialized)?;
        let slot = state.packs.get_mut(name).ok_or_else(|| Error::UnknownPack {
            name: name.to_string(),
        })?;
        slot.pack.priority = priority;
        save(state)
    }

    /// Remove a pack's local files and return it to `NotRequested`.
    ///
    /// Refused (with a warning, not an error) while the pack is
    /// downloading; archives in the read-only install dir are never
    /// deleted.
    pub(crate) fn delete_pack(&mut self, name: &str) -> Result<()> {
        let state = self.state.as_mut().ok_or(Error::NotInitialized)?;
        let readonly_dir = state.readonly_dir.clone();
        let download_dir = state.download_dir.clone();
        let slot = state.packs.get_mut(name).ok_or_else(|| Error::UnknownPack {
            name: name.to_string(),
        })?;

        if slot.transfer.is_some() || slot.pack.state == PackState::Downloading {
            warn!(pack = name, "cannot delete while downloading");
            return Ok(());
        }

        if let Some(dir) = &download_dir {
            remove_quietly(&part_path(dir, name));
            remove_quietly(&archive_path(dir, name));
        }
        if let Some(path) = slot.pack.local_path.take() {
            if !path.starts_with(&readonly_dir) {
                remove_quietly(&path);
            }
        }

        let notify = slot.pack.state != PackState::NotRequested;
        slot.pack.state = PackState::NotRequested;
        slot.pack.downloaded = 0;
        slot.pack.error = None;
        slot.attempts = 0;
        slot.next_attempt_at = None;
        slot.preempt = false;
        save(state)?;
        info!(pack = name, "pack deleted");
        if notify {
            let change = PackChange {
                name: name.to_string(),
                kind: ChangeKind::StateChanged(PackState::NotRequested),
            };
            self.fire(std::slice::from_ref(&change));
        }
        Ok(())
    }

    pub(crate) fn get_packs(&self) -> Result<Vec<Pack>> {
        let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
        Ok(state.packs.values().map(|s| s.pack.clone()).collect())
    }

    pub(crate) fn get_pack(&self, name: &str) -> Result<Pack> {
        let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
        state
            .packs
            .get(name)
            .map(|s| s.pack.clone())
            .ok_or_else(|| Error::UnknownPack {
                name: name.to_string(),
            })
    }

    /// Advance the pipeline one tick: drain transfer events, move each
    /// pack at most one lifecycle step, then fill free transfer slots
    /// in priority order. Returns the changes applied this tick.
    pub(crate) fn update(&mut self) -> Result<Vec<PackChange>> {
        let retry = self.config.retry.clone();
        let max_concurrent = self.config.max_concurrent.max(1);
        let requesting_enabled = self.requesting_enabled;
        let state = self.state.as_mut().ok_or(Error::NotInitialized)?;

        let mut changes = Vec::new();
        let mut moved: HashSet<String> = HashSet::new();
        let mut dirty = false;
        let names: Vec<String> = state.packs.keys().cloned().collect();

        // Phase 1: drain events from in-flight transfers.
        let download_dir = state.download_dir.clone();
        for name in &names {
            let Some(slot) = state.packs.get_mut(name) else {
                continue;
            };
            let events = match slot.transfer.as_mut() {
                Some(transfer) => transfer.poll_events(),
                None => continue,
            };

            // A batch that already carries a terminal event outranks a pending
            // yield: finishing now is strictly better than cancelling and
            // restarting at an offset equal to the full size.
            let has_terminal = events
                .iter()
                .any(|e| matches!(e, TransferEvent::Completed | TransferEvent::Failed(_)));

            let mut progressed = false;
            for event in events {
                match event {
                    TransferEvent::Bytes(n) => {
                        slot.pack.downloaded += n;
                        progressed = true;
                        if slot.preempt && !has_terminal {
                            if let Some(mut transfer) = slot.transfer.take() {
                                transfer.cancel();
                            }
                            slot.preempt = false;
                            slot.next_attempt_at = None;
                            debug!(pack = %name, "transfer yielded at chunk boundary");
                            break;
                        }
                    }
                    TransferEvent::Completed => {
                        slot.transfer = None;
                        slot.preempt = false;
                        slot.next_attempt_at = None;
                        let verdict = match download_dir.as_deref() {
                            Some(dir) => verify_archive(
                                &part_path(dir, name),
                                slot.pack.total,
                                &slot.pack.checksum,
                            ),
                            None => Verify::Corrupt("no download directory".to_string()),
                        };
                        match verdict {
                            Verify::Ok => {
                                slot.pack.state = PackState::Downloaded;
                                changes.push(PackChange {
                                    name: name.clone(),
                                    kind: ChangeKind::StateChanged(PackState::Downloaded),
                                });
                                moved.insert(name.clone());
                                dirty = true;
                            }
                            Verify::Short(reason) => {
                                fail_attempt(slot, &retry, name, reason, &mut changes, &mut moved, &mut dirty);
                            }
                            Verify::Corrupt(reason) => {
                                if let Some(dir) = download_dir.as_deref() {
                                    remove_quietly(&part_path(dir, name));
                                }
                                slot.pack.downloaded = 0;
                                warn!(pack = %name, reason, "archive failed verification");
                                slot.pack.state = PackState::OtherError;
                                slot.pack.error = Some(reason);
                                changes.push(PackChange {
                                    name: name.clone(),
                                    kind: ChangeKind::StateChanged(PackState::OtherError),
                                });
                                moved.insert(name.clone());
                                dirty = true;
                            }
                        }
                        break;
                    }
                    TransferEvent::Failed(reason) => {
                        slot.transfer = None;
                        slot.preempt = false;
                        fail_attempt(slot, &retry, name, reason, &mut changes, &mut moved, &mut dirty);
                        break;
                    }
                }
            }

            if progressed {
                changes.push(PackChange {
                    name: name.clone(),
                    kind: ChangeKind::Progress {
                        downloaded: slot.pack.downloaded,
                        total: slot.pack.total,
                    },
                });
            }
        }

        // Phase 2: advance verified downloads toward mounted.
        for name in &names {
            if moved.contains(name) {
                continue;
            }
            let Some(slot) = state.packs.get_mut(name) else {
                continue;
            };
            match slot.pack.state {
                PackState::Downloaded => {
                    let Some(dir) = download_dir.as_deref() else {
                        continue;
                    };
                    let part = part_path(dir, name);
                    let dest = archive_path(dir, name);
                    let staged = if part.exists() {
                        std::fs::rename(&part, &dest)
                    } else if dest.exists() {
                        Ok(())
                    } else {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "downloaded archive missing",
                        ))
                    };
                    match staged {
                        Ok(()) => {
                            slot.pack.state = PackState::Mounting;
                            slot.pack.local_path = Some(dest);
                            changes.push(PackChange {
                                name: name.clone(),
                                kind: ChangeKind::StateChanged(PackState::Mounting),
                            });
                        }
                        Err(e) => {
                            warn!(pack = %name, error = %e, "cannot stage archive");
                            slot.pack.state = PackState::OtherError;
                            slot.pack.error = Some(format!("cannot stage archive: {e}"));
                            changes.push(PackChange {
                                name: name.clone(),
                                kind: ChangeKind::StateChanged(PackState::OtherError),
                            });
                        }
                    }
                    moved.insert(name.clone());
                    dirty = true;
                }
                PackState::Mounting => {
                    slot.pack.state = PackState::Mounted;
                    info!(pack = %name, "pack mounted");
                    changes.push(PackChange {
                        name: name.clone(),
                        kind: ChangeKind::StateChanged(PackState::Mounted),
                    });
                    moved.insert(name.clone());
                    dirty = true;
                }
                _ => {}
            }
        }

        // Phase 3: fill free transfer slots in priority order.
        if requesting_enabled && state.manifest_url.is_some() && state.download_dir.is_some() {
            let now = Instant::now();
            let mut candidates: Vec<(String, f32)> = state
                .packs
                .iter()
                .filter(|(name, slot)| {
                    slot.transfer.is_none()
                        && !moved.contains(*name)
                        && match slot.pack.state {
                            PackState::Requesting => true,
                            PackState::Downloading => {
                                slot.next_attempt_at.is_none_or(|at| at <= now)
                            }
                            _ => false,
                        }
                })
                .map(|(name, slot)| (name.clone(), slot.pack.priority))
                .collect();
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

            let active = state
                .packs
                .values()
                .filter(|s| s.transfer.is_some())
                .count();
            let mut free = max_concurrent.saturating_sub(active);
            let mut waiting: Option<f32> = None;
            for (name, priority) in candidates {
                if free == 0 {
                    waiting.get_or_insert(priority);
                    continue;
                }
                start_transfer(state, &self.downloader, &name, &mut changes, &mut dirty);
                free -= 1;
            }

            // A higher-priority pack is stuck behind a full slot table:
            // ask the lowest-priority transfer to yield.
            if let Some(waiting_priority) = waiting {
                let victim = state
                    .packs
                    .iter()
                    .filter(|(_, s)| s.transfer.is_some() && !s.preempt)
                    .min_by(|a, b| {
                        a.1.pack
                            .priority
                            .total_cmp(&b.1.pack.priority)
                            .then_with(|| a.0.cmp(b.0))
                    })
                    .map(|(n, s)| (n.clone(), s.pack.priority));
                if let Some((victim, victim_priority)) = victim {
                    if waiting_priority > victim_priority {
                        debug!(pack = %victim, "marking transfer for preemption");
                        if let Some(slot) = state.packs.get_mut(&victim) {
                            slot.preempt = true;
                        }
                    }
                }
            }
        }

        if dirty {
            save(state)?;
        }
        self.fire(&changes);
        Ok(changes)
    }

    fn fire(&mut self, changes: &[PackChange]) {
        if let Some(listener) = self.listener.as_mut() {
            for change in changes {
                listener(change);
            }
        }
    }
}

fn save(state: &State) -> Result<()> {
    let records: Vec<PackRecord> = state
        .packs
        .values()
        .map(|s| PackRecord::from_pack(&s.pack))
        .collect();
    state.db.save(&records)
}

fn start_transfer(
    state: &mut State,
    downloader: &Arc<dyn Downloader>,
    name: &str,
    changes: &mut Vec<PackChange>,
    dirty: &mut bool,
) {
    let (Some(base), Some(dir)) = (state.manifest_url.clone(), state.download_dir.clone()) else {
        return;
    };
    let url = pack_url(&base, name);
    let part = part_path(&dir, name);
    let offset = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
    let Some(slot) = state.packs.get_mut(name) else {
        return;
    };
    slot.pack.downloaded = offset;
    slot.next_attempt_at = None;
    slot.preempt = false;
    slot.transfer = Some(downloader.begin(&url, &part, offset));
    debug!(pack = %name, offset, "transfer started");
    if slot.pack.state == PackState::Requesting {
        slot.pack.state = PackState::Downloading;
        changes.push(PackChange {
            name: name.to_string(),
            kind: ChangeKind::StateChanged(PackState::Downloading),
        });
        *dirty = true;
    }
}

fn fail_attempt(
    slot: &mut Slot,
    retry: &RetryPolicy,
    name: &str,
    reason: String,
    changes: &mut Vec<PackChange>,
    moved: &mut HashSet<String>,
    dirty: &mut bool,
) {
    slot.attempts += 1;
    if slot.attempts >= retry.max_attempts {
        warn!(pack = %name, attempts = slot.attempts, reason, "giving up on transfer");
        slot.pack.state = PackState::OtherError;
        slot.pack.error = Some(reason);
        changes.push(PackChange {
            name: name.to_string(),
            kind: ChangeKind::StateChanged(PackState::OtherError),
        });
        moved.insert(name.to_string());
        *dirty = true;
    } else {
        let delay = retry.delay_for(slot.attempts);
        debug!(pack = %name, attempt = slot.attempts, ?delay, reason, "transfer failed, will retry");
        slot.next_attempt_at = Some(Instant::now() + delay);
    }
}

fn verify_archive(path: &Path, expected_size: u64, expected_md5: &str) -> Verify {
    // Hash in fixed-size chunks; archives can be far too large to buffer.
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => return Verify::Corrupt(format!("cannot read archive: {e}")),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut context = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    let mut len: u64 = 0;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                context.consume(&buf[..n]);
                len += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Verify::Corrupt(format!("cannot read archive: {e}")),
        }
    }
    if len < expected_size {
        return Verify::Short(format!("short archive: {len} of {expected_size} bytes"));
    }
    if len > expected_size {
        return Verify::Corrupt(format!("oversized archive: {len} of {expected_size} bytes"));
    }
    let digest = hex::encode(context.finalize().0);
    if digest != expected_md5 {
        return Verify::Corrupt(format!("checksum mismatch: got {digest}"));
    }
    Verify::Ok
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove file");
        }
    }
}
