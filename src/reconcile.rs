// src/reconcile.rs

//! Operation reconciliation
//!
//! Turns the requested queues into an authoritative plan: stage the
//! dependency closure, ask the solver for the operation list, map every
//! operation back onto a known package and rewrite all five queues.

use crate::catalog::Catalog;
use crate::concurrent::ensure_background;
use crate::error::{Error, Result};
use crate::packages::{DownloadPackage, InstallState, Package, StatusFlag, Want};
use crate::preflight::PreflightAccelerator;
use crate::queue::{AddOutcome, OperationQueues, Queue, QueuePlan};
use crate::solver::{LOCAL_ARCHIVE_HOST, Solver, SolverOutput};
use crate::version::compare_versions;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Reconciler {
    catalog: Arc<dyn Catalog>,
    solver: Arc<dyn Solver>,
    preflight: Arc<PreflightAccelerator>,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        solver: Arc<dyn Solver>,
        preflight: Arc<PreflightAccelerator>,
    ) -> Self {
        Self {
            catalog,
            solver,
            preflight,
        }
    }

    pub fn preflight(&self) -> &Arc<PreflightAccelerator> {
        &self.preflight
    }

    /// Recompute every queue from the requested installs, upgrades and removals
    ///
    /// On error the registry is left with its derived queues cleared; the
    /// caller decides whether to reset it.
    pub fn recheck(&self, registry: &OperationQueues) -> Result<()> {
        self.recheck_with(registry, &[])
    }

    /// Recheck with extra packages to install that no queue requested
    ///
    /// The solver sees `extra` alongside the requested installs; whatever it
    /// keeps of them lands in install-deps.
    pub fn recheck_with(&self, registry: &OperationQueues, extra: &[Arc<Package>]) -> Result<()> {
        ensure_background("Recheck");

        registry.clear_derived();

        let mut installs: Vec<Arc<Package>> = registry
            .packages_in(&[Queue::Installations, Queue::Upgrades])
            .into_iter()
            .map(DownloadPackage::into_package)
            .collect();
        for package in extra {
            if !installs.iter().any(|p| p.id == package.id) {
                installs.push(Arc::clone(package));
            }
        }
        let removals: Vec<Arc<Package>> = registry
            .packages_in(&[Queue::Uninstallations])
            .into_iter()
            .map(DownloadPackage::into_package)
            .collect();

        if installs.is_empty() && removals.is_empty() {
            debug!("Nothing queued, skipping recheck");
            return Ok(());
        }

        let roots: Vec<Arc<Package>> = installs.iter().chain(removals.iter()).cloned().collect();
        self.preflight.stage(&roots)?;

        let output = self.solver.operation_list(&installs, &removals)?;
        let has_conflicts = !output.conflicts.is_empty();
        if has_conflicts {
            warn!("Solver reported {} conflicts", output.conflicts.len());
        }

        let mut uninstall_deps = self.resolve_removals(&output)?;
        let mut install_deps = self.resolve_installs(&output, has_conflicts)?;

        let mut installations = registry.members(Queue::Installations);
        let mut upgrades = registry.members(Queue::Upgrades);
        let mut uninstallations = registry.members(Queue::Uninstallations);

        if !has_conflicts {
            installations.retain(|p| !uninstall_deps.contains(p));
            uninstallations.retain(|p| !install_deps.contains(p));

            installations.retain(|p| install_deps.contains(p));
            upgrades.retain(|p| install_deps.contains(p));
            uninstallations.retain(|p| uninstall_deps.contains(p));

            uninstall_deps.retain(|p| !uninstallations.contains(p));
            install_deps.retain(|p| !installations.contains(p) && !upgrades.contains(p));
        }

        registry.apply_plan(QueuePlan {
            upgrades,
            installations,
            uninstallations,
            install_deps,
            uninstall_deps,
            conflicts: output.conflicts.into_iter().collect(),
        });

        Ok(())
    }

    /// Installed package for every removal; any miss is a mismatch
    fn resolve_removals(&self, output: &SolverOutput) -> Result<HashSet<DownloadPackage>> {
        let ids: Vec<&str> = {
            let mut ids: Vec<&str> = output.removals().map(|op| op.package_id.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };

        let resolved: HashSet<DownloadPackage> = ids
            .iter()
            .filter_map(|id| self.catalog.installed_package(id))
            .map(DownloadPackage::new)
            .collect();

        if resolved.len() != ids.len() {
            let missing: Vec<&str> = ids
                .iter()
                .filter(|id| !resolved.iter().any(|p| p.id() == **id))
                .copied()
                .collect();
            return Err(Error::ReconciliationMismatch(format!(
                "solver removes packages that are not installed: {}",
                missing.join(", ")
            )));
        }

        Ok(resolved)
    }

    /// Known package for every install operation
    ///
    /// Unresolvable identifiers are tolerated only when the solver already
    /// reported conflicts.
    fn resolve_installs(
        &self,
        output: &SolverOutput,
        has_conflicts: bool,
    ) -> Result<HashSet<DownloadPackage>> {
        let operations: BTreeMap<&str, (&str, Vec<String>)> = output
            .installs()
            .map(|op| (op.package_id.as_str(), (op.version.as_str(), op.origin_hosts())))
            .collect();

        let mut resolved = HashSet::with_capacity(operations.len());
        let mut missing = Vec::new();

        for (id, (version, hosts)) in &operations {
            match self.resolve_install(id, version, hosts) {
                Some(package) => {
                    resolved.insert(DownloadPackage::new(package));
                }
                None => missing.push(*id),
            }
        }

        if !missing.is_empty() {
            let message = format!("no known package for {}", missing.join(", "));
            if !has_conflicts {
                return Err(Error::ReconciliationMismatch(message));
            }
            warn!("Ignoring unresolved installs because of conflicts: {}", message);
        }

        Ok(resolved)
    }

    fn resolve_install(&self, id: &str, version: &str, hosts: &[String]) -> Option<Arc<Package>> {
        if let Some(local) = self.catalog.local_package(id) {
            if compare_versions(&local.version, version) == Ordering::Equal {
                debug!("Using local archive for {} {}", id, version);
                return Some(local);
            }
            if hosts.iter().any(|h| h == LOCAL_ARCHIVE_HOST) {
                warn!("Local archive of {} is {}, solver wants {}", id, local.version, version);
            }
        }

        let repositories = self.catalog.repositories();
        for host in hosts {
            for repo in repositories.iter().filter(|r| r.host() == Some(host.as_str())) {
                if let Some(package) = repo.package_version(id, version) {
                    return Some(package);
                }
            }
        }

        for repo in &repositories {
            if let Some(package) = repo.package_version(id, version) {
                debug!(
                    "No {} {} from {:?}, found it in {}",
                    id,
                    version,
                    hosts,
                    repo.host().unwrap_or("an unnamed repository")
                );
                return Some(package);
            }
        }

        let fallback = self.catalog.package_by_identifier(id, None);
        if let Some(package) = &fallback {
            debug!(
                "No {} {} from {:?}, using newest known {}",
                id, version, hosts, package.version
            );
        }
        fallback
    }

    /// Queue repairs the installed-package database asks for
    ///
    /// Packages flagged reinstall-required are queued for installation at
    /// the newest known version. Packages marked for removal, or stuck
    /// unpacked or half-configured, are queued for uninstallation. Returns
    /// how many packages were queued.
    pub fn check_installed(&self, registry: &OperationQueues) -> usize {
        let mut queued = 0;

        for package in self.catalog.installed_packages() {
            let Some(status) = package.status() else {
                continue;
            };
            let current = registry.find(&package.id);
            if matches!(
                current,
                Some(Queue::Installations) | Some(Queue::Uninstallations)
            ) {
                continue;
            }

            match status.flag {
                StatusFlag::ReinstReq => {
                    let Some(newest) = self.catalog.package_by_identifier(&package.id, None) else {
                        continue;
                    };
                    if registry.add(Arc::clone(&newest), Queue::Installations, false)
                        == AddOutcome::Added
                    {
                        info!("Queueing reinstall of {}", newest.id);
                        queued += 1;
                        if let Err(e) = self.preflight.stage(&[newest]) {
                            warn!("Failed to preflight {}: {}", package.id, e);
                        }
                    }
                }
                StatusFlag::Ok => {
                    let wants_removal = matches!(status.want, Want::Deinstall | Want::Purge)
                        || matches!(
                            status.state,
                            InstallState::HalfConfigured | InstallState::Unpacked
                        );
                    if wants_removal
                        && registry.add(Arc::clone(&package), Queue::Uninstallations, true)
                            == AddOutcome::Added
                    {
                        info!("Queueing removal of {} ({:?})", package.id, status.want);
                        queued += 1;
                    }
                }
            }
        }

        queued
    }
}
