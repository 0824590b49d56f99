// tests/common/mod.rs

//! Shared fixtures for the integration tests
//!
//! The fakes here replace the external collaborators: a solver that returns a
//! scripted plan, a transport whose transfers finish only when a test says so,
//! and an observer that records every notification.

#![allow(dead_code)]

use parking_lot::Mutex;
use pkgqueue::catalog::{MemoryCatalog, Repository, normalize_repo_url};
use pkgqueue::download::{
    DownloadManagerBuilder, DownloadSnapshot, EventSink, QueueObserver, TransferEvent,
    TransferHandle, Transport,
};
use pkgqueue::packages::{Origin, Package};
use pkgqueue::solver::{Conflict, Solver, SolverOperation, SolverOutput};
use pkgqueue::{Config, DownloadManager, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use url::Url;

/// SHA256 of the bytes `hello`
pub const SHA256_HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

// -- Solver --

/// Solver returning whatever plan the test scripted last
#[derive(Default)]
pub struct ScriptedSolver {
    output: Mutex<Option<SolverOutput>>,
    calls: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

impl ScriptedSolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, operations: Vec<SolverOperation>, conflicts: Vec<Conflict>) {
        *self.output.lock() = Some(SolverOutput {
            operations,
            conflicts,
        });
    }

    /// Make the next calls fail
    pub fn fail(&self) {
        *self.output.lock() = None;
    }

    /// Install and remove identifiers of every call so far
    pub fn calls(&self) -> Vec<(Vec<String>, Vec<String>)> {
        self.calls.lock().clone()
    }
}

impl Solver for ScriptedSolver {
    fn operation_list(
        &self,
        install: &[Arc<Package>],
        remove: &[Arc<Package>],
    ) -> Result<SolverOutput> {
        self.calls.lock().push((
            install.iter().map(|p| p.id.clone()).collect(),
            remove.iter().map(|p| p.id.clone()).collect(),
        ));
        self.output
            .lock()
            .clone()
            .ok_or_else(|| Error::SolverError("scripted failure".to_string()))
    }
}

// -- Transport --

pub struct ManualHandle(Arc<AtomicBool>);

impl TransferHandle for ManualHandle {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct Transfer {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub sink: EventSink,
    pub cancelled: Arc<AtomicBool>,
}

/// Transport that records transfers and lets the test drive their events
#[derive(Default)]
pub struct ManualTransport {
    transfers: Mutex<Vec<Transfer>>,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of transfers started so far
    pub fn started(&self) -> usize {
        self.transfers.lock().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.transfers
            .lock()
            .iter()
            .map(|t| t.url.to_string())
            .collect()
    }

    pub fn headers(&self, index: usize) -> Vec<(String, String)> {
        self.transfers.lock()[index].headers.clone()
    }

    pub fn is_cancelled(&self, index: usize) -> bool {
        self.transfers.lock()[index].cancelled.load(Ordering::SeqCst)
    }

    /// Index of the first transfer whose URL ends with `suffix`
    pub fn index_of(&self, suffix: &str) -> usize {
        self.transfers
            .lock()
            .iter()
            .position(|t| t.url.as_str().ends_with(suffix))
            .unwrap_or_else(|| panic!("no transfer for {}", suffix))
    }

    /// Deliver an event through a transfer's sink
    pub fn emit(&self, index: usize, event: TransferEvent) {
        let sink = Arc::clone(&self.transfers.lock()[index].sink);
        sink(event);
    }

    /// Finish a transfer successfully with a file holding `contents`
    pub fn succeed(&self, index: usize, dir: &Path, contents: &[u8]) -> PathBuf {
        let path = dir.join(format!("transfer-{}.tmp", index));
        std::fs::write(&path, contents).unwrap();
        self.emit(
            index,
            TransferEvent::Progress {
                bytes_delta: contents.len() as u64,
                total_written: contents.len() as u64,
                total_expected: Some(contents.len() as u64),
            },
        );
        self.emit(index, TransferEvent::Success(path.clone()));
        path
    }

    pub fn fail(&self, index: usize, status: u16) {
        self.emit(
            index,
            TransferEvent::Failure {
                status: Some(status),
                error: None,
            },
        );
    }
}

impl Transport for ManualTransport {
    fn fetch(
        &self,
        url: &Url,
        headers: &[(String, String)],
        sink: EventSink,
    ) -> Box<dyn TransferHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.transfers.lock().push(Transfer {
            url: url.clone(),
            headers: headers.to_vec(),
            sink,
            cancelled: Arc::clone(&cancelled),
        });
        Box::new(ManualHandle(cancelled))
    }
}

// -- Observer --

#[derive(Default)]
pub struct RecordingObserver {
    pub errors: Mutex<Vec<String>>,
    pub updates: Mutex<Vec<(String, DownloadSnapshot)>>,
    pub ready: AtomicUsize,
    pub state_changes: AtomicUsize,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// Whether any update reported a successful download of `id`
    pub fn saw_success(&self, id: &str) -> bool {
        self.updates
            .lock()
            .iter()
            .any(|(package, snapshot)| package == id && snapshot.success)
    }
}

impl QueueObserver for RecordingObserver {
    fn display_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn download_updated(&self, package_id: &str, download: &DownloadSnapshot) {
        self.updates
            .lock()
            .push((package_id.to_string(), download.clone()));
    }

    fn queue_ready(&self) {
        self.ready.fetch_add(1, Ordering::SeqCst);
    }

    fn state_changed(&self) {
        self.state_changes.fetch_add(1, Ordering::SeqCst);
    }
}

// -- Packages and repositories --

pub fn repo_url(host: &str) -> Url {
    normalize_repo_url(Url::parse(&format!("https://{}/", host)).unwrap())
}

/// Control paragraph for a repository package with a `Filename` under `pool/`
pub fn control(id: &str, version: &str, extra: &str) -> String {
    format!(
        "Package: {id}\nVersion: {version}\nArchitecture: all\nFilename: pool/{id}_{version}_all.deb\n{extra}"
    )
}

/// Repository whose packages are given as `(id, version, extra control lines)`
pub fn repository(lists: &Path, host: &str, packages: &[(&str, &str, &str)]) -> Repository {
    let url = repo_url(host);
    let source_file = lists.join(format!("{}_Packages", host));
    let packages = packages
        .iter()
        .map(|(id, version, extra)| {
            Package::from_control(
                &control(id, version, extra),
                Origin::Repository {
                    repo_url: url.clone(),
                    source_file: source_file.clone(),
                },
            )
            .unwrap()
        })
        .collect();
    Repository::new(host.to_string(), url, source_file, packages)
}

pub fn installed(id: &str, version: &str, extra: &str) -> Package {
    installed_with_status(id, version, "install ok installed", extra)
}

/// Installed package with an explicit dpkg `Status` field
pub fn installed_with_status(id: &str, version: &str, status: &str, extra: &str) -> Package {
    Package::from_control(
        &format!("Package: {id}\nVersion: {version}\nStatus: {status}\n{extra}"),
        Origin::Installed,
    )
    .unwrap()
}

/// Solver install operation from a host
pub fn install_op(id: &str, version: &str, host: &str) -> SolverOperation {
    SolverOperation::install(id, version, Some(&format!("{} [all]", host)))
}

// -- Manager fixture --

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub catalog: Arc<MemoryCatalog>,
    pub solver: Arc<ScriptedSolver>,
    pub transport: Arc<ManualTransport>,
    pub observer: Arc<RecordingObserver>,
    pub manager: DownloadManager,
}

impl Fixture {
    pub fn archive_dir(&self) -> PathBuf {
        self.dir.path().join("archives")
    }

    pub fn scratch(&self) -> PathBuf {
        let scratch = self.dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        scratch
    }

    /// Newest repository package with this identifier
    pub fn package(&self, id: &str) -> Arc<Package> {
        use pkgqueue::catalog::Catalog;
        self.catalog
            .package_by_identifier(id, None)
            .unwrap_or_else(|| panic!("{} not in catalog", id))
    }
}

pub fn config(dir: &Path, max_parallel: usize) -> Config {
    Config {
        archive_dir: dir.join("archives"),
        staging_dir: dir.join("lists"),
        download_dir: dir.join("partial"),
        max_parallel_downloads: max_parallel,
        ..Config::default()
    }
}

/// Manager over the fakes, with `catalog` filled by `setup`
pub fn fixture_with(max_parallel: usize, setup: impl FnOnce(&Path, &MemoryCatalog)) -> Fixture {
    fixture_configured(max_parallel, setup, |_| {}, |builder| builder)
}

/// Like [`fixture_with`], with a last say over the config and the builder
pub fn fixture_configured(
    max_parallel: usize,
    setup: impl FnOnce(&Path, &MemoryCatalog),
    tweak: impl FnOnce(&mut Config),
    configure: impl FnOnce(DownloadManagerBuilder) -> DownloadManagerBuilder,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    setup(dir.path(), &catalog);

    let solver = ScriptedSolver::new();
    let transport = ManualTransport::new();
    let observer = RecordingObserver::new();

    let mut config = config(dir.path(), max_parallel);
    tweak(&mut config);
    let builder = DownloadManager::builder(config)
        .catalog(catalog.clone())
        .solver(solver.clone())
        .transport(transport.clone())
        .observer(observer.clone())
        .header("User-Agent", "pkgqueue-tests");
    let manager = configure(builder).build().unwrap();

    Fixture {
        dir,
        catalog,
        solver,
        transport,
        observer,
        manager,
    }
}
