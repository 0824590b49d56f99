// src/download/pipeline.rs

//! Dispatch loop and transfer event handling
//!
//! Everything in here runs on the operations queue. The in-flight counter is
//! the one piece of state outside a container and is only touched from that
//! queue.

use super::manager::QueueObserver;
use super::overrides::{OverrideDecision, OverrideRegistry};
use super::transport::{EventSink, TransferEvent, Transport};
use super::verify::{ArchiveCache, verify_archive, verify_size};
use super::{Download, DownloadSnapshot};
use crate::catalog::Catalog;
use crate::concurrent::{SafeVec, SerialQueue};
use crate::error::{Error, Result};
use crate::packages::Package;
use crate::queue::{OperationQueues, Queue};
use crate::reconcile::Reconciler;
use parking_lot::{Condvar, Mutex};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

/// Longest single wait between settle checks
const SETTLE_POLL: Duration = Duration::from_millis(100);

pub(super) struct Pipeline {
    pub(super) this: Weak<Pipeline>,
    pub(super) queue: SerialQueue,
    pub(super) registry: OperationQueues,
    pub(super) reconciler: Reconciler,
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) cache: ArchiveCache,
    pub(super) overrides: OverrideRegistry,
    pub(super) observer: Arc<dyn QueueObserver>,
    pub(super) cached_files: SafeVec<PathBuf>,
    pub(super) headers: Vec<(String, String)>,
    pub(super) max_parallel: usize,
    pub(super) start_on_reload: bool,
    pub(super) essential_hosts: Vec<String>,
    /// Missing essential packages found by the last repository refresh
    pub(super) refresh_roots: Mutex<Vec<Arc<Package>>>,
    pub(super) in_flight: AtomicUsize,
    pub(super) settle_lock: Mutex<()>,
    pub(super) settled: Condvar,
}

impl Pipeline {
    pub(super) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run the dispatch loop on the operations queue
    pub(super) fn start_more_downloads(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.queue.dispatch_or_run(move || this.dispatch_downloads());
    }

    /// Admit queued packages until the parallelism cap is reached
    fn dispatch_downloads(&self) {
        if self.registry.is_locked() {
            debug!("Locked for installation, not starting downloads");
            self.notify_settled();
            return;
        }

        for candidate in self.registry.packages_in(&Queue::DOWNLOADS) {
            if self.in_flight() >= self.max_parallel {
                break;
            }
            let download = self.registry.download_or_create(candidate.package());
            if !download.mark_queued() {
                continue;
            }
            self.start_download(&download);
        }

        if self.registry.installing_count() > 0 && self.registry.verify_complete() {
            info!("All {} downloads verified", self.registry.installing_count());
            self.observer.queue_ready();
        }
        self.notify_settled();
    }

    fn start_download(&self, download: &Arc<Download>) {
        if download.session() != self.registry.session() {
            return;
        }
        let package = Arc::clone(download.package());

        match self.verify_cached(&package) {
            Ok(true) => {
                debug!("{} already in the archive cache", package.id);
                download.update(|state| {
                    state.progress = 1.0;
                    state.success = true;
                    state.completed = true;
                    state.failure_reason = None;
                });
                self.report(download);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                self.fail(download, e.to_string());
                return;
            }
        }

        let url = match self.resolve_url(&package) {
            Ok(url) => url,
            Err(reason) => {
                self.fail(download, reason);
                return;
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        download.update(|state| {
            state.started = true;
            state.failure_reason = None;
        });
        debug!(
            "Starting download of {} from {} ({} in flight)",
            package.id,
            url,
            self.in_flight()
        );

        let handle = self
            .transport
            .fetch(&url, &self.headers, self.event_sink(download));
        download.set_task(handle);
        self.report(download);
    }

    /// Short-circuit for archives already on disk
    ///
    /// A local archive is trusted only once it has been moved into the cache;
    /// a file already sitting at the destination does not count.
    /// A repository package counts as cached when the cache holds a file
    /// matching its declared digests.
    fn verify_cached(&self, package: &Arc<Package>) -> Result<bool> {
        let dest = self.cache.cache_path(package);

        if package.is_local() {
            let Some(source) = package.local_archive() else {
                return Err(Error::UntrustedPackage(package.id.clone()));
            };
            if source != dest {
                match self.cache.place(package, &source) {
                    Ok(placed) => {
                        self.cached_files.push(placed.clone());
                        package.set_local_archive(placed);
                    }
                    Err(e) => {
                        warn!("Failed to cache local archive of {}: {}", package.id, e);
                        return Err(Error::UntrustedPackage(package.id.clone()));
                    }
                }
            }
            return if dest.exists() {
                Ok(true)
            } else {
                Err(Error::UntrustedPackage(package.id.clone()))
            };
        }

        if self.cache.has_verified(package) {
            package.set_local_archive(dest);
            return Ok(true);
        }
        Ok(false)
    }

    /// Download URL: override provider, absolute filename, or repository-relative
    fn resolve_url(&self, package: &Package) -> std::result::Result<Url, String> {
        let repo = self.catalog.repository_for(package);

        if let Some(repo) = &repo {
            match self.overrides.decide(package, repo) {
                OverrideDecision::Url(url) => return Ok(url),
                OverrideDecision::Fail(message) => return Err(message),
                OverrideDecision::Decline => {}
            }
        }

        let filename = package
            .filename
            .as_deref()
            .ok_or_else(|| format!("{} has no Filename field", package.id))?;

        if filename.starts_with("http://") || filename.starts_with("https://") {
            return Url::parse(filename)
                .map_err(|e| format!("Invalid download URL {}: {}", filename, e));
        }

        let repo = repo.ok_or_else(|| format!("No repository known for {}", package.id))?;
        repo.url
            .join(filename)
            .map_err(|e| format!("Invalid filename {} in {}: {}", filename, repo.name, e))
    }

    fn event_sink(&self, download: &Arc<Download>) -> EventSink {
        let this = self.this.clone();
        let download = Arc::clone(download);
        Arc::new(move |event| {
            let Some(pipeline) = this.upgrade() else {
                return;
            };
            let download = Arc::clone(&download);
            let queue = pipeline.queue.clone();
            queue.dispatch(move || pipeline.handle_event(&download, event));
        })
    }

    fn handle_event(&self, download: &Arc<Download>, event: TransferEvent) {
        let package_id = download.package().id.clone();

        if download.session() != self.registry.session() {
            debug!(
                "Dropping stale event for {} (session {} != {})",
                package_id,
                download.session(),
                self.registry.session()
            );
            discard_download(&event);
            return;
        }

        let is_current = self
            .registry
            .download(&package_id)
            .is_some_and(|current| Arc::ptr_eq(&current, download));
        if !is_current {
            debug!("Dropping event for replaced download of {}", package_id);
            if event.is_terminal() {
                discard_download(&event);
                self.finish_in_flight();
                self.dispatch_downloads();
            }
            return;
        }

        if download.snapshot().completed {
            debug!("Ignoring event after completion of {}", package_id);
            discard_download(&event);
            return;
        }

        match event {
            TransferEvent::Progress {
                total_written,
                total_expected,
                ..
            } => {
                download.update(|state| {
                    state.message = None;
                    state.total_bytes_written = total_written;
                    state.total_bytes_expected = total_expected;
                    state.progress = match total_expected {
                        Some(total) if total > 0 => (total_written as f64 / total as f64).min(1.0),
                        _ => 0.0,
                    };
                });
                self.report(download);
            }
            TransferEvent::Waiting(message) => {
                download.update(|state| state.message = Some(message));
                self.report(download);
            }
            TransferEvent::Success(path) => {
                self.finish_in_flight();
                download.clear_task();
                self.complete(download, &path);
                self.dispatch_downloads();
            }
            TransferEvent::Failure { status, error } => {
                self.finish_in_flight();
                download.clear_task();
                let reason = error.unwrap_or_else(|| match status {
                    Some(code) => format!("Download failed with status code {}", code),
                    None => "Download failed".to_string(),
                });
                self.fail(download, reason);
                self.dispatch_downloads();
            }
        }
    }

    /// Verify a finished transfer and move it into the cache
    fn complete(&self, download: &Download, path: &Path) {
        let package = download.package();

        let placed = verify_size(package, path)
            .and_then(|()| verify_archive(package, path))
            .and_then(|()| self.cache.place(package, path));

        match placed {
            Ok(dest) => {
                package.set_local_archive(dest.clone());
                self.cached_files.push(dest);
                download.update(|state| {
                    state.success = true;
                    state.progress = 1.0;
                    state.completed = true;
                    state.message = None;
                    state.failure_reason = None;
                });
                info!("Downloaded and verified {} {}", package.id, package.version);
                self.report(download);
            }
            Err(e) => {
                if let Err(remove_error) = fs::remove_file(path) {
                    debug!("Failed to remove {}: {}", path.display(), remove_error);
                }
                self.fail(download, e.to_string());
            }
        }
    }

    fn fail(&self, download: &Download, reason: String) {
        warn!("Download of {} failed: {}", download.package().id, reason);
        download.update(|state| {
            state.success = false;
            state.progress = 0.0;
            state.completed = true;
            state.message = None;
            state.failure_reason = Some(reason);
        });
        self.report(download);
    }

    fn finish_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn report(&self, download: &Download) {
        let snapshot: DownloadSnapshot = download.snapshot();
        self.observer
            .download_updated(&download.package().id, &snapshot);
    }

    /// Cancel every transfer and start a new session
    pub(super) fn cancel_downloads(&self) {
        self.registry.cancel_downloads();
        self.in_flight.store(0, Ordering::SeqCst);
        self.notify_settled();
    }

    /// Clear all queues, conflicts and downloads
    pub(super) fn remove_all_items(&self) {
        self.refresh_roots.lock().clear();
        self.registry.reset();
        self.in_flight.store(0, Ordering::SeqCst);
        self.notify_settled();
    }

    /// Sweep installed state, then recheck
    ///
    /// A failed recheck resets the queues. A successful one starts downloads.
    pub(super) fn reload(&self, recheck: bool) -> Result<()> {
        let mut result = Ok(());

        if recheck {
            self.reconciler.check_installed(&self.registry);
            let extra: Vec<Arc<Package>> = self
                .refresh_roots
                .lock()
                .iter()
                .filter(|p| self.catalog.installed_package(&p.id).is_none())
                .cloned()
                .collect();
            match self.reconciler.recheck_with(&self.registry, &extra) {
                Ok(()) if self.start_on_reload => self.dispatch_downloads(),
                Ok(()) => {}
                Err(e) => {
                    error!("Recheck failed: {}", e);
                    self.remove_all_items();
                    self.reconciler.check_installed(&self.registry);
                    self.observer.display_error(&e.to_string());
                    result = Err(e);
                }
            }
        }

        self.observer.state_changed();
        result
    }

    /// Re-request essential packages missing after a repository refresh
    ///
    /// Returns whether a recheck ran.
    pub(super) fn repo_refresh(&self) -> bool {
        if self.registry.is_locked() {
            debug!("Locked for installation, ignoring repository refresh");
            return false;
        }

        let missing = self.missing_essentials();
        let changed = {
            let mut roots = self.refresh_roots.lock();
            let changed = !same_packages(&roots, &missing);
            *roots = missing;
            changed
        };
        let conflicts = !self.registry.conflicts().is_empty();
        if !changed && !conflicts {
            debug!("Repository refresh changed nothing to recheck");
            return false;
        }

        info!(
            "Rechecking after repository refresh ({} missing essential packages)",
            self.refresh_roots.lock().len()
        );
        let _ = self.reload(true);
        true
    }

    /// Essential packages from trusted hosts that are not installed or requested
    fn missing_essentials(&self) -> Vec<Arc<Package>> {
        if self.essential_hosts.is_empty() {
            return Vec::new();
        }

        let repositories = self.catalog.repositories();
        let trusted = repositories.iter().filter(|repo| {
            repo.host()
                .is_some_and(|host| self.essential_hosts.iter().any(|h| h == host))
        });

        let mut missing: Vec<Arc<Package>> = Vec::new();
        for repo in trusted {
            for package in repo.packages().filter(|p| p.essential) {
                if self.catalog.installed_package(&package.id).is_some() {
                    continue;
                }
                let requested = matches!(
                    self.registry.find(&package.id),
                    Some(Queue::Installations | Queue::Upgrades | Queue::Uninstallations)
                );
                if !requested {
                    missing.push(Arc::clone(package));
                }
            }
        }
        missing.sort_by(|a, b| a.id.cmp(&b.id));
        missing.dedup_by(|a, b| a.id == b.id);
        missing
    }

    /// Discard a finished download record so the package is fetched again
    pub(super) fn retry(&self, package_id: &str) -> bool {
        let Some(download) = self.registry.download(package_id) else {
            return false;
        };
        let state = download.snapshot();
        if state.success || (state.queued && !state.completed) {
            return false;
        }
        info!("Retrying download of {}", package_id);
        self.registry.remove_download(package_id);
        true
    }

    /// Nothing in flight, and every package needing an archive has a result
    pub(super) fn is_settled(&self) -> bool {
        if self.in_flight() > 0 {
            return false;
        }
        if self.registry.is_locked() {
            return true;
        }
        self.registry
            .packages_in(&Queue::DOWNLOADS)
            .iter()
            .all(|package| {
                self.registry
                    .download(package.id())
                    .is_some_and(|download| download.snapshot().completed)
            })
    }

    pub(super) fn wait_until_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = match self.this.upgrade() {
                Some(this) => self.queue.dispatch_sync(move || this.is_settled()),
                None => return true,
            };
            if settled {
                return true;
            }
            if self.queue.is_current() {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let mut guard = self.settle_lock.lock();
            self.settled
                .wait_for(&mut guard, (deadline - now).min(SETTLE_POLL));
        }
    }

    fn notify_settled(&self) {
        self.settled.notify_all();
    }
}

fn same_packages(a: &[Arc<Package>], b: &[Arc<Package>]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(a, b)| a.id == b.id && a.version == b.version)
}

/// Remove the file a success event handed over
fn discard_download(event: &TransferEvent) {
    if let TransferEvent::Success(path) = event {
        if let Err(e) = fs::remove_file(path) {
            debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
