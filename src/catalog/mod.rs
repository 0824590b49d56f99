// src/catalog/mod.rs

//! Package catalog
//!
//! This module provides the lookup capability the queue consumes:
//! - Repositories with their package index and version chains
//! - The installed-package database
//! - Archives supplied on the local filesystem
//!
//! [`MemoryCatalog`] is the stock implementation, filled from Debian
//! `Packages`/`status` files and probed `.deb` archives.

pub mod archive;
pub mod debian;

use crate::packages::Package;
use crate::version::compare_versions;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Read access to every package the queue may need to resolve
pub trait Catalog: Send + Sync {
    /// All configured repositories
    fn repositories(&self) -> Vec<Arc<Repository>>;

    /// Installed package by identifier
    fn installed_package(&self, id: &str) -> Option<Arc<Package>>;

    /// Every installed package
    fn installed_packages(&self) -> Vec<Arc<Package>>;

    /// Package backed by a local archive, by identifier
    fn local_package(&self, id: &str) -> Option<Arc<Package>>;

    /// Repository a package was read from
    fn repository_for(&self, package: &Package) -> Option<Arc<Repository>> {
        let url = package.repo_url()?;
        self.repositories().into_iter().find(|repo| &repo.url == url)
    }

    /// Newest package with this identifier, optionally restricted to one repository
    fn package_by_identifier(&self, id: &str, repo: Option<&Repository>) -> Option<Arc<Package>> {
        match repo {
            Some(repo) => repo.package(id).cloned(),
            None => self
                .repositories()
                .iter()
                .filter_map(|repo| repo.package(id).cloned())
                .max_by(|a, b| compare_versions(&a.version, &b.version)),
        }
    }

    /// Newest package for each identifier that any repository knows
    fn packages_by_identifiers(&self, ids: &[String]) -> Vec<Arc<Package>> {
        ids.iter()
            .filter_map(|id| self.package_by_identifier(id, None))
            .collect()
    }
}

/// A repository and its parsed package index
#[derive(Debug)]
pub struct Repository {
    pub name: String,
    pub url: Url,
    /// Local copy of the repository's Packages file
    pub source_file: PathBuf,
    packages: HashMap<String, Arc<Package>>,
    providers: Vec<Arc<Package>>,
}

impl Repository {
    /// Build a repository index, chaining multiple versions of one identifier
    ///
    /// The newest version becomes the index entry; older ones hang off it.
    ///
    /// `url` should already be normalized with [`normalize_repo_url`] so it
    /// matches the origins of `packages`.
    pub fn new(name: String, url: Url, source_file: PathBuf, packages: Vec<Package>) -> Self {
        let url = normalize_repo_url(url);

        let mut by_id: HashMap<String, Vec<Package>> = HashMap::new();
        for package in packages {
            by_id.entry(package.id.clone()).or_default().push(package);
        }

        let mut index = HashMap::with_capacity(by_id.len());
        for (id, mut versions) in by_id {
            versions.sort_by(|a, b| compare_versions(&b.version, &a.version));
            let mut versions = versions.into_iter();
            let Some(newest) = versions.next() else {
                continue;
            };
            let older: Vec<Arc<Package>> = versions.map(Arc::new).collect();
            index.insert(id, Arc::new(newest.with_older_versions(older)));
        }

        let providers = index
            .values()
            .filter(|p| p.control("provides").is_some())
            .cloned()
            .collect();

        debug!("Indexed {} packages for repository {}", index.len(), name);

        Self {
            name,
            url,
            source_file,
            packages: index,
            providers,
        }
    }

    /// Newest package with this identifier
    pub fn package(&self, id: &str) -> Option<&Arc<Package>> {
        self.packages.get(id)
    }

    /// Exact version of a package, searching the version chain
    pub fn package_version(&self, id: &str, version: &str) -> Option<Arc<Package>> {
        self.packages.get(id)?.version_of(version)
    }

    /// Packages that declare a `Provides` field
    pub fn packages_providing(&self) -> &[Arc<Package>] {
        &self.providers
    }

    pub fn packages(&self) -> impl Iterator<Item = &Arc<Package>> {
        self.packages.values()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Give a repository URL a trailing slash so relative filenames join under it
pub fn normalize_repo_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// In-memory catalog
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    repositories: RwLock<Vec<Arc<Repository>>>,
    installed: RwLock<HashMap<String, Arc<Package>>>,
    local: RwLock<HashMap<String, Arc<Package>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a repository, replacing any repository with the same URL
    pub fn add_repository(&self, repo: Repository) -> Arc<Repository> {
        let repo = Arc::new(repo);
        let mut repos = self.repositories.write();
        repos.retain(|r| r.url != repo.url);
        repos.push(Arc::clone(&repo));
        info!("Added repository {} ({} packages)", repo.name, repo.len());
        repo
    }

    /// Remove a repository by URL, returning it if present
    pub fn remove_repository(&self, url: &Url) -> Option<Arc<Repository>> {
        let mut repos = self.repositories.write();
        let position = repos.iter().position(|r| &r.url == url)?;
        Some(repos.remove(position))
    }

    /// Replace the installed-package database
    pub fn set_installed(&self, packages: Vec<Package>) {
        let installed = packages
            .into_iter()
            .map(|p| (p.id.clone(), Arc::new(p)))
            .collect();
        *self.installed.write() = installed;
    }

    /// Register a package backed by a local archive
    pub fn add_local(&self, package: Package) -> Arc<Package> {
        let package = Arc::new(package);
        self.local
            .write()
            .insert(package.id.clone(), Arc::clone(&package));
        package
    }
}

impl Catalog for MemoryCatalog {
    fn repositories(&self) -> Vec<Arc<Repository>> {
        self.repositories.read().clone()
    }

    fn installed_package(&self, id: &str) -> Option<Arc<Package>> {
        self.installed.read().get(id).cloned()
    }

    fn installed_packages(&self) -> Vec<Arc<Package>> {
        self.installed.read().values().cloned().collect()
    }

    fn local_package(&self, id: &str) -> Option<Arc<Package>> {
        self.local.read().get(id).cloned()
    }
}
