//! End-to-end pack pipeline tests against a scripted downloader

use depot_packs::{
    ChangeKind, Downloader, PackChange, PackManager, PackManagerConfig, PackState, Result,
    RetryPolicy, Transfer, TransferEvent,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const ARCH: &str = "x64";
const MANIFEST_URL: &str = "http://cdn.test/depot/manifest.psv";

struct ScriptedTransfer {
    events: VecDeque<TransferEvent>,
    per_poll: usize,
}

impl Transfer for ScriptedTransfer {
    fn poll_events(&mut self) -> Vec<TransferEvent> {
        let take = self.per_poll.min(self.events.len());
        self.events.drain(..take).collect()
    }

    fn cancel(&mut self) {
        self.events.clear();
    }
}

/// Serves canned manifests and delivers pack bytes on a script instead
/// of a network.
struct MockDownloader {
    manifest: Mutex<String>,
    contents: HashMap<String, Vec<u8>>,
    failing: Mutex<HashSet<String>>,
    begun: Mutex<Vec<(String, u64)>>,
    chunk: usize,
    per_poll: usize,
}

impl MockDownloader {
    fn new(packs: &[(&str, &[u8])], chunk: usize, per_poll: usize) -> Self {
        let mut rows = String::from("## test manifest\n");
        rows.push_str(depot_packs::manifest::HEADER);
        rows.push('\n');
        let mut contents = HashMap::new();
        for (name, data) in packs {
            let digest = hex::encode(md5::compute(data).0);
            rows.push_str(&format!("{name}|{ARCH}|{}|{digest}|\n", data.len()));
            contents.insert((*name).to_string(), data.to_vec());
        }
        Self {
            manifest: Mutex::new(rows),
            contents,
            failing: Mutex::new(HashSet::new()),
            begun: Mutex::new(Vec::new()),
            chunk,
            per_poll,
        }
    }

    fn set_manifest(&self, text: String) {
        *self.manifest.lock().unwrap() = text;
    }

    fn set_failing(&self, name: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    fn begun(&self) -> Vec<(String, u64)> {
        self.begun.lock().unwrap().clone()
    }

    fn begun_names(&self) -> Vec<String> {
        self.begun().into_iter().map(|(n, _)| n).collect()
    }
}

fn pack_name_of(url: &str) -> String {
    url.rsplit('/')
        .next()
        .and_then(|f| f.strip_suffix(".dpk"))
        .unwrap_or(url)
        .to_string()
}

impl Downloader for MockDownloader {
    fn fetch_manifest(
        &self,
        _url: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'static>> {
        let text = self.manifest.lock().unwrap().clone();
        Box::pin(async move { Ok(text) })
    }

    fn begin(&self, url: &str, dest: &Path, offset: u64) -> Box<dyn Transfer> {
        let name = pack_name_of(url);
        self.begun.lock().unwrap().push((name.clone(), offset));

        if self.failing.lock().unwrap().contains(&name) {
            return Box::new(ScriptedTransfer {
                events: VecDeque::from([TransferEvent::Failed("connection reset".to_string())]),
                per_poll: self.per_poll,
            });
        }

        let content = self.contents.get(&name).cloned().unwrap_or_default();
        std::fs::write(dest, &content).unwrap();

        let mut events = VecDeque::new();
        let mut remaining = content.len().saturating_sub(usize::try_from(offset).unwrap());
        while remaining > 0 {
            let n = remaining.min(self.chunk);
            events.push_back(TransferEvent::Bytes(n as u64));
            remaining -= n;
        }
        events.push_back(TransferEvent::Completed);
        Box::new(ScriptedTransfer {
            events,
            per_poll: self.per_poll,
        })
    }
}

struct Fixture {
    mgr: PackManager,
    dir: TempDir,
    observed: Arc<Mutex<Vec<PackChange>>>,
}

impl Fixture {
    async fn new(downloader: Arc<MockDownloader>, max_concurrent: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let config = PackManagerConfig::default()
            .with_max_concurrent(max_concurrent)
            .with_retry(RetryPolicy::immediate(3));
        let mut mgr = PackManager::new(config, downloader.clone());
        mgr.initialize(
            &dir.path().join("packs.json"),
            &dir.path().join("install"),
            ARCH,
        )
        .unwrap();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        mgr.set_listener(Some(Box::new(move |change| {
            sink.lock().unwrap().push(change.clone());
        })));
        mgr.sync_with_server(MANIFEST_URL, &dir.path().join("downloads"))
            .await
            .unwrap();
        Fixture { mgr, dir, observed }
    }

    fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    fn drive_until(&mut self, name: &str, state: PackState, max_ticks: usize) {
        for _ in 0..max_ticks {
            if self.mgr.get_pack(name).unwrap().state == state {
                return;
            }
            self.mgr.update().unwrap();
        }
        panic!(
            "{name} never reached {state}, stuck at {}",
            self.mgr.get_pack(name).unwrap().state
        );
    }

    fn state_changes_for(&self, name: &str) -> Vec<PackState> {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name == name)
            .filter_map(|c| match c.kind {
                ChangeKind::StateChanged(s) => Some(s),
                ChangeKind::Progress { .. } => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn full_lifecycle_reaches_mounted() {
    let payload = b"graphics pack payload bytes";
    let downloader = Arc::new(MockDownloader::new(&[("gfx", payload)], 8, 16));
    let mut fx = Fixture::new(downloader, 2).await;

    let pack = fx.mgr.request_pack("gfx").unwrap();
    assert_eq!(pack.state, PackState::Requesting);

    fx.drive_until("gfx", PackState::Mounted, 16);

    let pack = fx.mgr.get_pack("gfx").unwrap();
    assert_eq!(pack.downloaded, payload.len() as u64);
    let archive = pack.local_path.clone().unwrap();
    assert_eq!(archive, fx.download_dir().join("gfx.dpk"));
    assert_eq!(std::fs::read(&archive).unwrap(), payload);

    // Every intermediate state was observable, in order.
    assert_eq!(
        fx.state_changes_for("gfx"),
        vec![
            PackState::Requesting,
            PackState::Downloading,
            PackState::Downloaded,
            PackState::Mounting,
            PackState::Mounted,
        ]
    );
}

#[tokio::test]
async fn states_only_move_forward_one_step_per_tick() {
    let downloader = Arc::new(MockDownloader::new(&[("gfx", b"some payload")], 4, 1));
    let mut fx = Fixture::new(downloader, 1).await;
    fx.mgr.request_pack("gfx").unwrap();

    let mut last_rank = fx.mgr.get_pack("gfx").unwrap().state.rank();
    for _ in 0..32 {
        let changes = fx.mgr.update().unwrap();
        let state_changes = changes
            .iter()
            .filter(|c| {
                c.name == "gfx" && matches!(c.kind, ChangeKind::StateChanged(_))
            })
            .count();
        assert!(state_changes <= 1, "more than one state change in a tick");
        let rank = fx.mgr.get_pack("gfx").unwrap().state.rank();
        assert!(rank >= last_rank, "state moved backward");
        last_rank = rank;
    }
    assert_eq!(fx.mgr.get_pack("gfx").unwrap().state, PackState::Mounted);
}

#[tokio::test]
async fn transfers_start_in_priority_order() {
    let downloader = Arc::new(MockDownloader::new(
        &[("alpha", b"aaaa"), ("beta", b"bbbb"), ("gamma", b"gggg")],
        16,
        16,
    ));
    let mut fx = Fixture::new(downloader.clone(), 1).await;
    for name in ["alpha", "beta", "gamma"] {
        fx.mgr.request_pack(name).unwrap();
    }
    fx.mgr.change_download_order("beta", 5.0).unwrap();
    fx.mgr.change_download_order("alpha", 3.0).unwrap();
    fx.mgr.change_download_order("gamma", 1.0).unwrap();

    for name in ["beta", "alpha", "gamma"] {
        fx.drive_until(name, PackState::Mounted, 32);
    }
    assert_eq!(downloader.begun_names(), vec!["beta", "alpha", "gamma"]);
}

#[tokio::test]
async fn higher_priority_preempts_at_chunk_boundary() {
    let big = vec![0xabu8; 64];
    let downloader = Arc::new(MockDownloader::new(
        &[("big", big.as_slice()), ("small", b"tiny")],
        8,
        1,
    ));
    let mut fx = Fixture::new(downloader.clone(), 1).await;

    fx.mgr.request_pack("big").unwrap();
    fx.mgr.update().unwrap();
    assert_eq!(fx.mgr.get_pack("big").unwrap().state, PackState::Downloading);
    fx.mgr.update().unwrap();

    fx.mgr.request_pack("small").unwrap();
    fx.mgr.change_download_order("small", 10.0).unwrap();

    fx.drive_until("small", PackState::Mounted, 32);
    fx.drive_until("big", PackState::Mounted, 64);

    let begun = downloader.begun();
    assert_eq!(begun[0].0, "big");
    assert_eq!(begun[1].0, "small");
    assert_eq!(begun[2].0, "big", "preempted transfer resumed");
    assert!(begun[2].1 > 0, "resume should start past byte zero");
}

#[tokio::test]
async fn completion_wins_over_pending_preemption() {
    // 40 bytes in 8-byte chunks, four events per poll: the tick after the
    // preemption is marked drains the last chunk and the completion in the
    // same batch. The finished transfer must not be cancelled and restarted
    // at an offset equal to its full size.
    let payload = vec![0x5au8; 40];
    let downloader = Arc::new(MockDownloader::new(
        &[("big", payload.as_slice()), ("small", b"tiny")],
        8,
        4,
    ));
    let mut fx = Fixture::new(downloader.clone(), 1).await;

    fx.mgr.request_pack("big").unwrap();
    fx.mgr.update().unwrap();
    fx.mgr.request_pack("small").unwrap();
    fx.mgr.change_download_order("small", 10.0).unwrap();
    fx.mgr.update().unwrap();
    fx.mgr.update().unwrap();

    assert_eq!(fx.mgr.get_pack("big").unwrap().state, PackState::Downloaded);

    fx.drive_until("small", PackState::Mounted, 32);
    fx.drive_until("big", PackState::Mounted, 32);

    let begun = downloader.begun();
    assert_eq!(
        begun,
        vec![("big".to_string(), 0), ("small".to_string(), 0)],
        "completed transfer must not restart"
    );
}

#[tokio::test]
async fn repeated_failures_end_in_error_and_delete_recovers() {
    let downloader = Arc::new(MockDownloader::new(&[("gfx", b"payload")], 16, 16));
    downloader.set_failing("gfx", true);
    let mut fx = Fixture::new(downloader.clone(), 1).await;

    fx.mgr.request_pack("gfx").unwrap();
    fx.drive_until("gfx", PackState::OtherError, 16);

    let pack = fx.mgr.get_pack("gfx").unwrap();
    assert!(pack.error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(downloader.begun().len(), 3, "three attempts before giving up");

    // The error is terminal until an explicit delete + re-request.
    for _ in 0..4 {
        fx.mgr.update().unwrap();
    }
    assert_eq!(downloader.begun().len(), 3);

    downloader.set_failing("gfx", false);
    fx.mgr.delete_pack("gfx").unwrap();
    assert_eq!(
        fx.mgr.get_pack("gfx").unwrap().state,
        PackState::NotRequested
    );
    fx.mgr.request_pack("gfx").unwrap();
    fx.drive_until("gfx", PackState::Mounted, 16);
}

#[tokio::test]
async fn corrupt_archive_fails_verification_without_retry() {
    let downloader = Arc::new(MockDownloader::new(&[("gfx", b"actual bytes")], 16, 16));
    // Right size, wrong digest: the download completes but verification
    // must reject the archive and discard the partial file.
    let mut text = String::from(depot_packs::manifest::HEADER);
    text.push('\n');
    text.push_str(&format!(
        "gfx|{ARCH}|12|{}|\n",
        hex::encode(md5::compute(b"expected byt").0)
    ));
    downloader.set_manifest(text);

    let mut fx = Fixture::new(downloader.clone(), 1).await;
    fx.mgr.request_pack("gfx").unwrap();
    fx.drive_until("gfx", PackState::OtherError, 16);

    let pack = fx.mgr.get_pack("gfx").unwrap();
    assert!(pack.error.as_deref().unwrap().contains("checksum mismatch"));
    assert_eq!(pack.downloaded, 0);
    assert_eq!(downloader.begun().len(), 1, "corruption is not retried");
    assert!(!fx.download_dir().join("gfx.dpk.part").exists());
}

#[tokio::test]
async fn requesting_a_pack_pulls_its_dependencies() {
    let downloader = Arc::new(MockDownloader::new(
        &[("maps", b"mm"), ("gfx", b"gg"), ("sound", b"ss")],
        16,
        16,
    ));
    // maps depends on gfx and sound
    let mut text = String::from(depot_packs::manifest::HEADER);
    text.push('\n');
    for (name, data) in [("gfx", b"gg".as_slice()), ("sound", b"ss")] {
        text.push_str(&format!(
            "{name}|{ARCH}|{}|{}|\n",
            data.len(),
            hex::encode(md5::compute(data).0)
        ));
    }
    text.push_str(&format!(
        "maps|{ARCH}|2|{}|gfx sound\n",
        hex::encode(md5::compute(b"mm").0)
    ));
    downloader.set_manifest(text);

    let mut fx = Fixture::new(downloader, 2).await;
    fx.mgr.request_pack("maps").unwrap();
    for name in ["gfx", "sound"] {
        assert_eq!(
            fx.mgr.get_pack(name).unwrap().state,
            PackState::Requesting,
            "dependency {name} should be requested"
        );
    }
    for name in ["maps", "gfx", "sound"] {
        fx.drive_until(name, PackState::Mounted, 32);
    }
}

#[tokio::test]
async fn disabled_requesting_starts_nothing() {
    let downloader = Arc::new(MockDownloader::new(&[("gfx", b"payload")], 16, 16));
    let mut fx = Fixture::new(downloader.clone(), 2).await;

    fx.mgr.disable_requesting();
    fx.mgr.request_pack("gfx").unwrap();
    for _ in 0..4 {
        fx.mgr.update().unwrap();
    }
    assert_eq!(fx.mgr.get_pack("gfx").unwrap().state, PackState::Requesting);
    assert!(downloader.begun().is_empty());

    fx.mgr.enable_requesting();
    fx.drive_until("gfx", PackState::Mounted, 16);
}

#[tokio::test]
async fn readonly_install_mounts_without_download() {
    let payload = b"preinstalled archive";
    let downloader = Arc::new(MockDownloader::new(&[("base", payload)], 16, 16));

    let dir = TempDir::new().unwrap();
    let install = dir.path().join("install");
    std::fs::create_dir_all(&install).unwrap();
    std::fs::write(install.join("base.dpk"), payload).unwrap();

    let config = PackManagerConfig::default().with_retry(RetryPolicy::immediate(3));
    let mut mgr = PackManager::new(config, downloader.clone());
    mgr.initialize(&dir.path().join("packs.json"), &install, ARCH)
        .unwrap();
    mgr.sync_with_server(MANIFEST_URL, &dir.path().join("downloads"))
        .await
        .unwrap();

    let pack = mgr.get_pack("base").unwrap();
    assert_eq!(pack.state, PackState::Mounted);
    assert_eq!(pack.local_path, Some(install.join("base.dpk")));
    assert!(downloader.begun().is_empty());

    // Deleting never touches the read-only install.
    mgr.delete_pack("base").unwrap();
    assert!(install.join("base.dpk").exists());
    assert_eq!(mgr.get_pack("base").unwrap().state, PackState::NotRequested);
}

#[tokio::test]
async fn packs_missing_from_manifest_become_stale() {
    let downloader = Arc::new(MockDownloader::new(
        &[("alpha", b"aa"), ("beta", b"bb")],
        16,
        16,
    ));
    let mut fx = Fixture::new(downloader.clone(), 2).await;
    assert!(!fx.mgr.get_pack("beta").unwrap().stale);

    let mut text = String::from(depot_packs::manifest::HEADER);
    text.push('\n');
    text.push_str(&format!(
        "alpha|{ARCH}|2|{}|\n",
        hex::encode(md5::compute(b"aa").0)
    ));
    downloader.set_manifest(text);
    let download_dir = fx.download_dir();
    fx.mgr
        .sync_with_server(MANIFEST_URL, &download_dir)
        .await
        .unwrap();

    assert!(!fx.mgr.get_pack("alpha").unwrap().stale);
    assert!(fx.mgr.get_pack("beta").unwrap().stale);
}

#[tokio::test]
async fn mounted_state_survives_restart() {
    let payload = b"persistent payload";
    let downloader = Arc::new(MockDownloader::new(&[("gfx", payload)], 16, 16));
    let mut fx = Fixture::new(downloader.clone(), 2).await;
    fx.mgr.request_pack("gfx").unwrap();
    fx.drive_until("gfx", PackState::Mounted, 16);
    let db_path = fx.dir.path().join("packs.json");
    let install = fx.dir.path().join("install");

    let config = PackManagerConfig::default();
    let mut restarted = PackManager::new(config, downloader);
    restarted.initialize(&db_path, &install, ARCH).unwrap();
    let pack = restarted.get_pack("gfx").unwrap();
    assert_eq!(pack.state, PackState::Mounted);
    assert!(pack.local_path.unwrap().exists());
}

#[tokio::test]
async fn progress_is_reported_in_chunks() {
    let payload = vec![7u8; 40];
    let downloader = Arc::new(MockDownloader::new(&[("gfx", payload.as_slice())], 10, 1));
    let mut fx = Fixture::new(downloader, 1).await;
    fx.mgr.request_pack("gfx").unwrap();
    fx.drive_until("gfx", PackState::Mounted, 32);

    let progress: Vec<u64> = fx
        .observed
        .lock()
        .unwrap()
        .iter()
        .filter_map(|c| match c.kind {
            ChangeKind::Progress { downloaded, .. } if c.name == "gfx" => Some(downloaded),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10, 20, 30, 40]);
}
