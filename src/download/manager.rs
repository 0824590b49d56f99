// src/download/manager.rs

//! Public facade over the operation queues, recheck and downloads
//!
//! `DownloadManager` owns one serial operations queue. Registry mutations,
//! rechecks and every download event run on it, so callers on any thread see
//! a consistent view.

use super::overrides::{DownloadOverrideProvider, OverrideRegistry, OverrideToken};
use super::pipeline::Pipeline;
use super::transport::{HttpTransport, Transport};
use super::verify::{ArchiveCache, ArchiveMover, FsMover};
use super::DownloadSnapshot;
use crate::catalog::{Catalog, MemoryCatalog};
use crate::concurrent::{SafeVec, SerialQueue};
use crate::config::Config;
use crate::error::Result;
use crate::packages::Package;
use crate::preflight::PreflightAccelerator;
use crate::queue::{AddOutcome, EssentialCheck, HostEssentialCheck, OperationQueues, Queue};
use crate::reconcile::Reconciler;
use crate::solver::{AptSolver, Conflict, Solver};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Label of the operations queue and its worker thread
pub const OPERATIONS_QUEUE_LABEL: &str = "pkgqueue.operations";

/// Receives queue and download notifications
///
/// Called on the operations queue; implementations should return quickly.
pub trait QueueObserver: Send + Sync {
    /// A recheck failed and the queues were reset
    fn display_error(&self, _message: &str) {}

    fn download_updated(&self, _package_id: &str, _download: &DownloadSnapshot) {}

    /// Every queued install and upgrade has a verified archive
    fn queue_ready(&self) {}

    /// Queue contents changed after a reload
    fn state_changed(&self) {}
}

struct SilentObserver;

impl QueueObserver for SilentObserver {}

/// Builder for [`DownloadManager`]
///
/// Collaborators not set explicitly fall back to an empty in-memory catalog,
/// the apt solver, the HTTP transport and a plain filesystem move.
pub struct DownloadManagerBuilder {
    config: Config,
    catalog: Option<Arc<dyn Catalog>>,
    solver: Option<Arc<dyn Solver>>,
    transport: Option<Arc<dyn Transport>>,
    mover: Arc<dyn ArchiveMover>,
    observer: Arc<dyn QueueObserver>,
    essential: Option<Arc<dyn EssentialCheck>>,
    headers: Vec<(String, String)>,
    start_on_reload: bool,
}

impl DownloadManagerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            catalog: None,
            solver: None,
            transport: None,
            mover: Arc::new(FsMover),
            observer: Arc::new(SilentObserver),
            essential: None,
            headers: Vec::new(),
            start_on_reload: true,
        }
    }

    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn solver(mut self, solver: Arc<dyn Solver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn archive_mover(mut self, mover: Arc<dyn ArchiveMover>) -> Self {
        self.mover = mover;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn essential_check(mut self, essential: Arc<dyn EssentialCheck>) -> Self {
        self.essential = Some(essential);
        self
    }

    /// Extra header sent with every download request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Whether a successful recheck starts downloads (the default)
    ///
    /// Turn off to inspect a plan without fetching anything; downloads then
    /// wait for [`DownloadManager::start_more_downloads`].
    pub fn start_downloads_on_reload(mut self, start: bool) -> Self {
        self.start_on_reload = start;
        self
    }

    pub fn build(self) -> Result<DownloadManager> {
        let config = self.config;
        config.validate()?;

        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(MemoryCatalog::new()));
        let solver = match self.solver {
            Some(solver) => solver,
            None => Arc::new(AptSolver::new(&config.solver, &config.staging_dir)),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        let essential = self
            .essential
            .unwrap_or_else(|| Arc::new(HostEssentialCheck::new(config.essential_hosts.clone())));

        let queue = SerialQueue::new(OPERATIONS_QUEUE_LABEL)?;
        let preflight = Arc::new(PreflightAccelerator::new(
            &config.staging_dir,
            Arc::clone(&catalog),
        )?);

        let pipeline = Arc::new_cyclic(|this| Pipeline {
            this: this.clone(),
            registry: OperationQueues::new(&queue, essential),
            reconciler: Reconciler::new(Arc::clone(&catalog), solver, preflight),
            catalog,
            transport,
            cache: ArchiveCache::new(&config.archive_dir, self.mover),
            overrides: OverrideRegistry::new(&queue),
            observer: self.observer,
            cached_files: SafeVec::new(&queue),
            headers: self.headers,
            max_parallel: config.max_parallel_downloads,
            start_on_reload: self.start_on_reload,
            essential_hosts: config.essential_hosts.clone(),
            refresh_roots: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            settle_lock: Mutex::new(()),
            settled: Condvar::new(),
            queue,
        });

        info!(
            "Download manager ready (cache {}, {} parallel downloads)",
            config.archive_dir.display(),
            config.max_parallel_downloads
        );
        Ok(DownloadManager { pipeline })
    }
}

/// Queue of pending package operations and their downloads
pub struct DownloadManager {
    pipeline: Arc<Pipeline>,
}

impl DownloadManager {
    pub fn builder(config: Config) -> DownloadManagerBuilder {
        DownloadManagerBuilder::new(config)
    }

    /// Run `job` on the operations queue and wait for it
    fn on_queue<R, F>(&self, job: F) -> R
    where
        F: FnOnce(&Pipeline) -> R + Send + 'static,
        R: Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        self.pipeline.queue.dispatch_sync(move || job(&pipeline))
    }

    // -- Registry --

    /// Queue a package operation
    ///
    /// Removing an essential package without `approved` returns
    /// [`AddOutcome::NeedsApproval`] and changes nothing.
    pub fn add(&self, package: Arc<Package>, queue: Queue, approved: bool) -> AddOutcome {
        self.pipeline.registry.add(package, queue, approved)
    }

    pub fn remove(&self, id: &str) {
        self.pipeline.registry.remove(id);
    }

    pub fn find(&self, id: &str) -> Option<Queue> {
        self.pipeline.registry.find(id)
    }

    /// Members of one queue, sorted by identifier
    pub fn members(&self, queue: Queue) -> Vec<Arc<Package>> {
        self.pipeline
            .registry
            .packages_in(&[queue])
            .into_iter()
            .map(|member| member.into_package())
            .collect()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.pipeline.registry.conflicts()
    }

    /// Queue an upgrade for every package not already queued
    pub fn upgrade_all(&self, packages: Vec<Arc<Package>>) -> usize {
        self.pipeline.registry.upgrade_all(packages)
    }

    // -- Recheck --

    /// Recheck on the operations queue without waiting
    ///
    /// With `recheck` false only observers are notified. A successful recheck
    /// admits downloads up to the parallelism cap unless the manager was
    /// built without [`DownloadManagerBuilder::start_downloads_on_reload`].
    /// The completion runs on the operations queue after the observers.
    pub fn reload_data(&self, recheck: bool, completion: Option<Box<dyn FnOnce() + Send>>) {
        let pipeline = Arc::clone(&self.pipeline);
        self.pipeline.queue.dispatch(move || {
            let _ = pipeline.reload(recheck);
            if let Some(completion) = completion {
                completion();
            }
        });
    }

    /// Recheck and wait for the result
    pub fn reload_data_and_wait(&self, recheck: bool) -> Result<()> {
        self.on_queue(move |pipeline| pipeline.reload(recheck))
    }

    /// Re-request missing essential packages after repositories were refreshed
    ///
    /// Essential packages from `essential_hosts` that are neither installed
    /// nor requested are handed to the solver and end up in install-deps.
    /// Does nothing while locked. A recheck runs only when that set changed
    /// or conflicts are pending; returns whether one ran.
    pub fn repo_refresh(&self) -> bool {
        self.on_queue(|pipeline| pipeline.repo_refresh())
    }

    // -- Downloads --

    /// Admit queued packages up to the parallelism cap
    pub fn start_more_downloads(&self) {
        self.pipeline.start_more_downloads();
    }

    /// Cancel every transfer and forget all download records
    ///
    /// Events still arriving from cancelled transfers are dropped.
    pub fn cancel_downloads(&self) {
        self.on_queue(|pipeline| pipeline.cancel_downloads());
    }

    /// Empty every queue and cancel all downloads
    pub fn remove_all_items(&self) {
        self.on_queue(|pipeline| pipeline.remove_all_items());
    }

    /// While locked the dispatch loop admits nothing; unlocking resumes it
    pub fn set_locked_for_installation(&self, locked: bool) {
        self.pipeline.registry.set_locked(locked);
        if !locked {
            self.start_more_downloads();
        }
    }

    pub fn is_locked_for_installation(&self) -> bool {
        self.pipeline.registry.is_locked()
    }

    /// Drop a failed download record and try again
    ///
    /// Returns false when there is nothing to retry.
    pub fn retry_download(&self, id: &str) -> bool {
        let id = id.to_string();
        let retried = self.on_queue(move |pipeline| pipeline.retry(&id));
        if retried {
            self.start_more_downloads();
        }
        retried
    }

    pub fn queued_download(&self, id: &str) -> Option<DownloadSnapshot> {
        self.pipeline.registry.download_snapshot(id)
    }

    /// Archives placed into the cache, in placement order
    pub fn cached_download_files(&self) -> Vec<PathBuf> {
        self.pipeline.cached_files.raw()
    }

    // -- Counters --

    pub fn operation_count(&self) -> usize {
        self.pipeline.registry.operation_count()
    }

    pub fn installing_packages(&self) -> usize {
        self.pipeline.registry.installing_count()
    }

    pub fn uninstalling_packages(&self) -> usize {
        self.pipeline.registry.uninstalling_count()
    }

    pub fn downloading_packages(&self) -> usize {
        self.pipeline.registry.downloading_count()
    }

    pub fn ready_packages(&self) -> usize {
        self.pipeline.registry.ready_count()
    }

    /// Every queued install and upgrade has a verified archive
    pub fn verify_complete(&self) -> bool {
        self.pipeline.registry.verify_complete()
    }

    pub fn in_flight(&self) -> usize {
        self.on_queue(|pipeline| pipeline.in_flight())
    }

    pub fn session(&self) -> u32 {
        self.pipeline.registry.session()
    }

    // -- Override providers --

    pub fn register_override_provider(
        &self,
        provider: Arc<dyn DownloadOverrideProvider>,
        repo_url: &Url,
    ) -> OverrideToken {
        self.pipeline.overrides.register(provider, repo_url)
    }

    pub fn deregister_override_provider(&self, token: OverrideToken) {
        debug!("Deregistering download override {:?}", token);
        self.pipeline.overrides.deregister(token);
    }

    // -- Synchronisation --

    /// Wait for every job queued so far, including pending download events
    pub fn barrier(&self) {
        self.pipeline.queue.barrier();
    }

    /// Block until nothing is in flight and every package needing an archive
    /// has a result, or `timeout` passes
    pub fn wait_until_settled(&self, timeout: Duration) -> bool {
        self.pipeline.wait_until_settled(timeout)
    }

    // -- Collaborators --

    pub fn preflight(&self) -> &Arc<PreflightAccelerator> {
        self.pipeline.reconciler.preflight()
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.pipeline.catalog
    }

    pub fn archive_cache(&self) -> &ArchiveCache {
        &self.pipeline.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::solver::SolverOutput;

    struct NoSolver;

    impl Solver for NoSolver {
        fn operation_list(
            &self,
            _install: &[Arc<Package>],
            _remove: &[Arc<Package>],
        ) -> Result<SolverOutput> {
            Ok(SolverOutput::default())
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        Config {
            archive_dir: dir.join("archives"),
            staging_dir: dir.join("lists"),
            download_dir: dir.join("partial"),
            ..Config::default()
        }
    }

    #[test]
    fn test_build_rejects_zero_parallelism() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            max_parallel_downloads: 0,
            ..config(dir.path())
        };
        let result = DownloadManager::builder(config).build();
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_lock_flag() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::builder(config(dir.path()))
            .solver(Arc::new(NoSolver))
            .build()
            .unwrap();

        assert!(!manager.is_locked_for_installation());
        manager.set_locked_for_installation(true);
        assert!(manager.is_locked_for_installation());
        manager.set_locked_for_installation(false);
        manager.barrier();
        assert!(!manager.is_locked_for_installation());
        assert_eq!(manager.in_flight(), 0);
    }

    #[test]
    fn test_reload_completion_runs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::builder(config(dir.path()))
            .solver(Arc::new(NoSolver))
            .build()
            .unwrap();

        let (tx, rx) = crossbeam::channel::bounded(1);
        manager.reload_data(
            true,
            Some(Box::new(move || {
                let _ = tx.send(());
            })),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(manager.operation_count(), 0);
    }
}
