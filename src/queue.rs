// src/queue.rs

//! Operation queue registry
//!
//! Tracks why each package is pending: user-requested installs, upgrades and
//! removals, plus the dependency installs/removals the solver derived from
//! them. State is one map from package identifier to its queue, so a package
//! can never sit in two queues at once.
//!
//! The registry also owns the per-package `Download` records and the download
//! session counter used to invalidate callbacks after a cancel.

use crate::concurrent::{SafeMap, SafeSet, SerialQueue};
use crate::download::{Download, DownloadSnapshot};
use crate::packages::{DownloadPackage, Package};
use crate::solver::Conflict;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// The five operation queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Queue {
    Upgrades,
    Installations,
    Uninstallations,
    InstallDeps,
    UninstallDeps,
}

impl Queue {
    /// Lookup precedence used by `find`
    pub const ALL: [Queue; 5] = [
        Queue::Installations,
        Queue::Uninstallations,
        Queue::Upgrades,
        Queue::InstallDeps,
        Queue::UninstallDeps,
    ];

    /// Queues whose packages need an archive downloaded
    pub const DOWNLOADS: [Queue; 3] = [Queue::Upgrades, Queue::Installations, Queue::InstallDeps];

    /// Whether the queue is filled by the solver rather than by requests
    pub fn is_derived(self) -> bool {
        matches!(self, Queue::InstallDeps | Queue::UninstallDeps)
    }

    pub fn needs_download(self) -> bool {
        Self::DOWNLOADS.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Queue::Upgrades => "upgrades",
            Queue::Installations => "installations",
            Queue::Uninstallations => "uninstallations",
            Queue::InstallDeps => "install-deps",
            Queue::UninstallDeps => "uninstall-deps",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`OperationQueues::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Same package and version already in the requested queue
    AlreadyQueued,
    /// Essential package; retry with `approved = true` once the user agrees
    NeedsApproval,
    /// Queue is locked while an installation runs
    Locked,
}

/// Decides whether removing a package needs explicit approval
pub trait EssentialCheck: Send + Sync {
    fn is_essential(&self, package: &Package) -> bool;
}

/// Essential when the package says so and comes from a trusted host
///
/// An empty host list trusts every origin.
#[derive(Debug, Clone, Default)]
pub struct HostEssentialCheck {
    hosts: Vec<String>,
}

impl HostEssentialCheck {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

impl EssentialCheck for HostEssentialCheck {
    fn is_essential(&self, package: &Package) -> bool {
        if !package.essential {
            return false;
        }
        if self.hosts.is_empty() {
            return true;
        }
        package
            .origin_host()
            .is_some_and(|host| self.hosts.iter().any(|h| h == host))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    queue: Queue,
    package: DownloadPackage,
}

/// Complete queue contents computed by the reconciler
#[derive(Debug, Clone, Default)]
pub struct QueuePlan {
    pub upgrades: HashSet<DownloadPackage>,
    pub installations: HashSet<DownloadPackage>,
    pub uninstallations: HashSet<DownloadPackage>,
    pub install_deps: HashSet<DownloadPackage>,
    pub uninstall_deps: HashSet<DownloadPackage>,
    pub conflicts: HashSet<Conflict>,
}

/// The registry of pending operations
pub struct OperationQueues {
    entries: SafeMap<String, Entry>,
    conflicts: SafeSet<Conflict>,
    downloads: SafeMap<String, Arc<Download>>,
    session: AtomicU32,
    locked: AtomicBool,
    essential: Arc<dyn EssentialCheck>,
}

impl OperationQueues {
    /// Create a registry whose containers are bound to `queue`
    pub fn new(queue: &SerialQueue, essential: Arc<dyn EssentialCheck>) -> Self {
        Self {
            entries: SafeMap::new(queue),
            conflicts: SafeSet::new(queue),
            downloads: SafeMap::new(queue),
            session: AtomicU32::new(0),
            locked: AtomicBool::new(false),
            essential,
        }
    }

    /// Queue a package, moving it out of whichever queue held it
    ///
    /// Adding a different version of a package already in `queue` replaces
    /// the queued version.
    pub fn add(&self, package: Arc<Package>, queue: Queue, approved: bool) -> AddOutcome {
        if self.is_locked() {
            warn!("Queue is locked for installation, not adding {}", package.id);
            return AddOutcome::Locked;
        }

        let essential = Arc::clone(&self.essential);
        let outcome = self.entries.with_mut(move |map| {
            if let Some(existing) = map.get(&package.id) {
                if existing.queue == queue && existing.package.package().version == package.version {
                    return AddOutcome::AlreadyQueued;
                }
            }

            if queue == Queue::Uninstallations && !approved && essential.is_essential(&package) {
                return AddOutcome::NeedsApproval;
            }

            debug!("Queueing {} {} for {}", package.id, package.version, queue);
            map.insert(
                package.id.clone(),
                Entry {
                    queue,
                    package: DownloadPackage::new(package),
                },
            );
            AddOutcome::Added
        });

        if outcome == AddOutcome::NeedsApproval {
            warn!("Refusing to queue essential package for removal without approval");
        }
        outcome
    }

    /// Remove an identifier from every queue
    pub fn remove(&self, id: &str) {
        self.entries.remove(&id.to_string());
    }

    /// The queue currently holding `id`
    pub fn find(&self, id: &str) -> Option<Queue> {
        self.entries.get(&id.to_string()).map(|entry| entry.queue)
    }

    pub fn contains(&self, id: &str, queue: Queue) -> bool {
        self.find(id) == Some(queue)
    }

    /// Members of one queue
    pub fn members(&self, queue: Queue) -> HashSet<DownloadPackage> {
        self.entries.read(move |map| {
            map.values()
                .filter(|entry| entry.queue == queue)
                .map(|entry| entry.package.clone())
                .collect()
        })
    }

    /// Members of several queues, ordered by identifier
    pub fn packages_in(&self, queues: &[Queue]) -> Vec<DownloadPackage> {
        let queues = queues.to_vec();
        let mut packages: Vec<DownloadPackage> = self.entries.read(move |map| {
            map.values()
                .filter(|entry| queues.contains(&entry.queue))
                .map(|entry| entry.package.clone())
                .collect()
        });
        packages.sort_by(|a, b| a.id().cmp(b.id()));
        packages
    }

    pub fn count(&self, queue: Queue) -> usize {
        self.entries
            .read(move |map| map.values().filter(|entry| entry.queue == queue).count())
    }

    /// Packages in any queue
    pub fn operation_count(&self) -> usize {
        self.entries.len()
    }

    /// Packages that will be installed or upgraded
    pub fn installing_count(&self) -> usize {
        Queue::DOWNLOADS.iter().map(|q| self.count(*q)).sum()
    }

    /// Packages that will be removed
    pub fn uninstalling_count(&self) -> usize {
        self.count(Queue::Uninstallations) + self.count(Queue::UninstallDeps)
    }

    /// Move packages into the upgrade queue, returning how many moved
    pub fn upgrade_all(&self, packages: Vec<Arc<Package>>) -> usize {
        self.entries.with_mut(move |map| {
            let mut moved = 0;
            for package in packages {
                if map.get(&package.id).is_some_and(|e| e.queue == Queue::Upgrades) {
                    continue;
                }
                map.insert(
                    package.id.clone(),
                    Entry {
                        queue: Queue::Upgrades,
                        package: DownloadPackage::new(package),
                    },
                );
                moved += 1;
            }
            moved
        })
    }

    /// Drop the solver-derived queues and conflicts
    pub fn clear_derived(&self) {
        self.entries
            .with_mut(|map| map.retain(|_, entry| !entry.queue.is_derived()));
        self.conflicts.set_to(HashSet::new());
    }

    /// Replace every queue with a reconciled plan
    ///
    /// Requested queues are applied first; a derived entry is only kept for
    /// identifiers no requested queue holds.
    pub fn apply_plan(&self, plan: QueuePlan) {
        let QueuePlan {
            upgrades,
            installations,
            uninstallations,
            install_deps,
            uninstall_deps,
            conflicts,
        } = plan;

        let new_entries = {
            let mut map: HashMap<String, Entry> = HashMap::new();
            let groups = [
                (Queue::Installations, installations),
                (Queue::Uninstallations, uninstallations),
                (Queue::Upgrades, upgrades),
                (Queue::InstallDeps, install_deps),
                (Queue::UninstallDeps, uninstall_deps),
            ];
            for (queue, packages) in groups {
                for package in packages {
                    map.entry(package.id().to_string())
                        .or_insert(Entry { queue, package });
                }
            }
            map
        };

        self.entries.set_to(new_entries);
        self.conflicts.set_to(conflicts);

        info!(
            "Queues: upgrades={}, installations={}, install-deps={}, uninstallations={}, uninstall-deps={}, conflicts={}",
            self.count(Queue::Upgrades),
            self.count(Queue::Installations),
            self.count(Queue::InstallDeps),
            self.count(Queue::Uninstallations),
            self.count(Queue::UninstallDeps),
            self.conflicts.len()
        );
    }

    /// Conflicts reported by the last recheck
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self.conflicts.raw().into_iter().collect();
        conflicts.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        conflicts
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn set_locked(&self, locked: bool) {
        let previous = self.locked.swap(locked, Ordering::SeqCst);
        if previous != locked {
            info!("Locked for installation: {} -> {}", previous, locked);
        }
    }

    /// Current download session id
    pub fn session(&self) -> u32 {
        self.session.load(Ordering::SeqCst)
    }

    pub fn download(&self, id: &str) -> Option<Arc<Download>> {
        self.downloads.get(&id.to_string())
    }

    /// Existing `Download` for a package, or a new one in the current session
    ///
    /// A record for a different version of the package is replaced.
    pub fn download_or_create(&self, package: &Arc<Package>) -> Arc<Download> {
        let package = Arc::clone(package);
        let session = self.session();
        self.downloads.with_mut(move |map| {
            if let Some(existing) = map.get(&package.id) {
                if existing.package().version == package.version {
                    return Arc::clone(existing);
                }
                debug!("Replacing download of {} {}", package.id, existing.package().version);
            }
            let download = Arc::new(Download::new(Arc::clone(&package), session));
            map.insert(package.id.clone(), Arc::clone(&download));
            download
        })
    }

    pub fn remove_download(&self, id: &str) {
        self.downloads.remove(&id.to_string());
    }

    pub fn downloads(&self) -> Vec<Arc<Download>> {
        self.downloads.values()
    }

    pub fn download_snapshot(&self, id: &str) -> Option<DownloadSnapshot> {
        self.download(id).map(|download| download.snapshot())
    }

    /// Downloads still below full progress
    pub fn downloading_count(&self) -> usize {
        self.downloads()
            .iter()
            .filter(|d| d.snapshot().progress < 1.0)
            .count()
    }

    /// Downloads finished and verified
    pub fn ready_count(&self) -> usize {
        self.downloads()
            .iter()
            .filter(|d| {
                let snapshot = d.snapshot();
                snapshot.success && snapshot.progress >= 1.0
            })
            .count()
    }

    /// Whether every package needing an archive has a successful download
    pub fn verify_complete(&self) -> bool {
        self.packages_in(&Queue::DOWNLOADS).iter().all(|package| {
            self.download(package.id()).is_some_and(|download| {
                download.package().version == package.package().version
                    && download.snapshot().success
            })
        })
    }

    /// Cancel every download and start a new session
    ///
    /// Callbacks from downloads of the previous session become no-ops.
    pub fn cancel_downloads(&self) {
        let downloads = self.downloads.values();
        for download in &downloads {
            download.cancel();
        }
        self.downloads.set_to(HashMap::new());
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Cancelled {} downloads, session is now {}", downloads.len(), session);
    }

    /// Clear every queue and conflict and cancel all downloads
    pub fn reset(&self) {
        self.entries.set_to(HashMap::new());
        self.conflicts.set_to(HashSet::new());
        self.cancel_downloads();
    }
}
