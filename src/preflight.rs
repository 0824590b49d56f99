// src/preflight.rs

//! Dependency preflight
//!
//! The solver only sees packages whose control paragraphs sit in its staging
//! directory. Before a recheck, the accelerator walks the relation closure of
//! the queued packages over every repository and appends each newly reached
//! paragraph to a staging file that mirrors the repository's index file.
//! Anything staged once is never written again.

use crate::catalog::Catalog;
use crate::concurrent::ensure_background;
use crate::error::{Error, Result};
use crate::packages::Package;
use crate::packages::control::RELATION_FIELDS;
use parking_lot::ReentrantMutex;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Staging identity of a package: identifier plus version
#[derive(Debug, Clone)]
struct PreflightedPackage {
    package: Arc<Package>,
}

impl PreflightedPackage {
    fn new(package: &Arc<Package>) -> Self {
        Self {
            package: Arc::clone(package),
        }
    }

    /// Control paragraph terminated by exactly one blank line
    fn staged_block(&self) -> String {
        let mut block = self.package.raw_data().trim_end_matches('\n').to_string();
        block.push_str("\n\n");
        block
    }
}

impl PartialEq for PreflightedPackage {
    fn eq(&self, other: &Self) -> bool {
        self.package.id == other.package.id && self.package.version == other.package.version
    }
}

impl Eq for PreflightedPackage {}

impl Hash for PreflightedPackage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.package.id.hash(state);
        self.package.version.hash(state);
    }
}

/// Index file a package belongs to; `None` for local and installed packages
type SourceKey = Option<PathBuf>;

/// Compression suffixes dropped from staging names; staged data is plain text
const COMPRESSED_SUFFIXES: &[&str] = &[".gz", ".xz", ".zst"];

#[derive(Default)]
struct StagingState {
    staged: HashMap<SourceKey, HashSet<PreflightedPackage>>,
    pending: HashMap<SourceKey, HashSet<PreflightedPackage>>,
}

/// Stages dependency closures for the solver
pub struct PreflightAccelerator {
    staging_dir: PathBuf,
    catalog: Arc<dyn Catalog>,
    state: ReentrantMutex<RefCell<StagingState>>,
}

impl PreflightAccelerator {
    /// Create an accelerator, emptying `staging_dir`
    pub fn new(staging_dir: impl Into<PathBuf>, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let staging_dir = staging_dir.into();

        match fs::remove_dir_all(&staging_dir) {
            Ok(()) => debug!("Cleared staging directory {}", staging_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::InitError(format!(
                    "Failed to clear staging directory {}: {}",
                    staging_dir.display(),
                    e
                )));
            }
        }
        fs::create_dir_all(&staging_dir).map_err(|e| {
            Error::InitError(format!(
                "Failed to create staging directory {}: {}",
                staging_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            staging_dir,
            catalog,
            state: ReentrantMutex::new(RefCell::new(StagingState::default())),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Staging file that mirrors an index file
    ///
    /// The name is the index file's name behind a digest of its full path, so
    /// two repositories with identically named indexes never share a file.
    pub fn staging_file(&self, source_file: &Path) -> Option<PathBuf> {
        let name = source_file.file_name()?.to_string_lossy();
        let name = COMPRESSED_SUFFIXES
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix))
            .unwrap_or(name.as_ref());

        let digest = format!(
            "{:x}",
            Sha256::digest(source_file.to_string_lossy().as_bytes())
        );
        Some(self.staging_dir.join(format!("{}_{}", &digest[..16], name)))
    }

    /// Stage the relation closure of `roots`
    ///
    /// Must not be called from the main context. On a write failure the
    /// error is returned; files already flushed in this call stay written.
    pub fn stage(&self, roots: &[Arc<Package>]) -> Result<()> {
        ensure_background("Dependency preflight");

        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        debug!(
            "Preflighting {} packages: {:?}",
            roots.len(),
            roots.iter().map(|p| p.id.as_str()).collect::<Vec<_>>()
        );

        self.collect(&mut state, roots);
        self.flush(&mut state)
    }

    /// Stage the closure of every installed package
    pub fn preflight_installed(&self) -> Result<()> {
        let guard = self.state.lock();
        let installed = self.catalog.installed_packages();
        info!("Preflighting {} installed packages", installed.len());
        let result = self.stage(&installed);
        drop(guard);
        result
    }

    /// Forget a repository and delete its staging file
    pub fn remove_repository(&self, source_file: &Path) -> Result<()> {
        let guard = self.state.lock();
        {
            let mut state = guard.borrow_mut();
            let key = Some(source_file.to_path_buf());
            state.pending.remove(&key);
            state.staged.remove(&key);
        }

        let Some(staging_file) = self.staging_file(source_file) else {
            return Ok(());
        };
        match fs::remove_file(&staging_file) {
            Ok(()) => {
                info!("Removed staging file {}", staging_file.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::IoError(format!(
                "Failed to remove {}: {}",
                staging_file.display(),
                e
            ))),
        }
    }

    /// Number of packages already written for an index file
    pub fn staged_count(&self, source_file: &Path) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .staged
            .get(&Some(source_file.to_path_buf()))
            .map_or(0, HashSet::len)
    }

    /// Staging files written so far
    pub fn staging_files(&self) -> Vec<PathBuf> {
        let guard = self.state.lock();
        let state = guard.borrow();
        let mut files: Vec<PathBuf> = state
            .staged
            .keys()
            .flatten()
            .filter_map(|source| self.staging_file(source))
            .collect();
        files.sort();
        files
    }

    /// Walk the closure, collecting unstaged packages into `pending`
    fn collect(&self, state: &mut StagingState, roots: &[Arc<Package>]) {
        let repositories = self.catalog.repositories();
        let mut worklist: Vec<Arc<Package>> = roots.iter().rev().cloned().collect();

        while let Some(package) = worklist.pop() {
            let key: SourceKey = package.source_file().map(Path::to_path_buf);

            let already_staged = state
                .staged
                .get(&key)
                .is_some_and(|staged| staged.contains(&PreflightedPackage::new(&package)));
            if already_staged {
                continue;
            }

            for version in package.all_versions() {
                let pending = state.pending.entry(key.clone()).or_default();
                if !pending.insert(PreflightedPackage::new(&version)) {
                    continue;
                }

                let referenced = referenced_ids(&version);
                if referenced.is_empty() {
                    continue;
                }

                for repo in &repositories {
                    for id in &referenced {
                        if let Some(dependency) = repo.package(id) {
                            worklist.push(Arc::clone(dependency));
                        }
                    }

                    for provider in repo.packages_providing() {
                        let provides = provider.relation_ids("provides");
                        if referenced.iter().any(|id| provides.contains(id)) {
                            worklist.push(Arc::clone(provider));
                        }
                    }
                }
            }
        }
    }

    /// Append pending packages to their staging files
    fn flush(&self, state: &mut StagingState) -> Result<()> {
        let mut keys: Vec<SourceKey> = state.pending.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let Some(packages) = state.pending.remove(&key) else {
                continue;
            };

            let Some(source_file) = key.as_deref() else {
                continue;
            };
            if source_file.file_name().is_some_and(|name| name == "status") {
                continue;
            }
            let Some(staging_file) = self.staging_file(source_file) else {
                warn!("Index path {} has no file name, not staging", source_file.display());
                continue;
            };

            let mut ordered: Vec<&PreflightedPackage> = packages.iter().collect();
            ordered.sort_by(|a, b| {
                (&a.package.id, &a.package.version).cmp(&(&b.package.id, &b.package.version))
            });
            let data: String = ordered.iter().map(|p| p.staged_block()).collect();

            append_to(&staging_file, data.as_bytes()).map_err(|source| Error::PreflightError {
                path: staging_file.clone(),
                source,
            })?;

            debug!(
                "Staged {} packages into {}",
                packages.len(),
                staging_file.display()
            );
            state.staged.entry(key).or_default().extend(packages);
        }

        Ok(())
    }
}

/// Every identifier mentioned in a package's relation fields
fn referenced_ids(package: &Package) -> Vec<String> {
    let mut ids: Vec<String> = RELATION_FIELDS
        .iter()
        .flat_map(|field| package.relation_ids(field))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

fn append_to(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data)?;
    file.flush()
}
