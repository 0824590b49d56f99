// src/packages/package.rs

use super::control::{parse_control, relation_identifiers};
use crate::error::{Error, Result};
use crate::version::compare_versions;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Where a package record came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A remote repository; `source_file` is the local copy of its index
    Repository { repo_url: Url, source_file: PathBuf },
    /// An archive supplied on the local filesystem
    Local { path: PathBuf },
    /// The installed-package database
    Installed,
}

/// Package record as seen by the queue
///
/// Immutable after construction except for the resolved local archive path,
/// which the download pipeline updates once an archive lands in the cache.
#[derive(Debug)]
pub struct Package {
    pub id: String,
    pub version: String,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub essential: bool,
    pub size: Option<u64>,
    pub filename: Option<String>,
    pub origin: Origin,
    raw_control: HashMap<String, String>,
    raw_data: String,
    older_versions: Vec<Arc<Package>>,
    local_archive: RwLock<Option<PathBuf>>,
}

impl Package {
    /// Build a package from its raw control paragraph
    pub fn from_control(paragraph: &str, origin: Origin) -> Result<Self> {
        let raw_control = parse_control(paragraph);

        let id = raw_control
            .get("package")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::ParseError("control paragraph has no Package field".to_string()))?;
        let version = raw_control
            .get("version")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::ParseError(format!("package {} has no Version field", id)))?;

        let size = match raw_control.get("size") {
            Some(size) => Some(size.trim().parse::<u64>().map_err(|e| {
                Error::ParseError(format!("Invalid size '{}' for {}: {}", size, id, e))
            })?),
            None => None,
        };

        let local_archive = match &origin {
            Origin::Local { path } => Some(path.clone()),
            _ => None,
        };

        Ok(Self {
            architecture: raw_control.get("architecture").cloned(),
            name: raw_control.get("name").cloned(),
            essential: raw_control
                .get("essential")
                .is_some_and(|v| v.eq_ignore_ascii_case("yes")),
            size,
            filename: raw_control.get("filename").cloned(),
            origin,
            raw_data: paragraph.to_string(),
            raw_control,
            id,
            version,
            older_versions: Vec::new(),
            local_archive: RwLock::new(local_archive),
        })
    }

    /// Attach older versions of the same identifier
    pub fn with_older_versions(mut self, older: Vec<Arc<Package>>) -> Self {
        self.older_versions = older;
        self
    }

    /// Raw control field, looked up case-insensitively
    pub fn control(&self, key: &str) -> Option<&str> {
        self.raw_control
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn raw_control(&self) -> &HashMap<String, String> {
        &self.raw_control
    }

    /// The paragraph this package was parsed from
    pub fn raw_data(&self) -> &str {
        &self.raw_data
    }

    /// Identifiers referenced by a relation field (depends, provides, ...)
    pub fn relation_ids(&self, field: &str) -> Vec<String> {
        self.control(field)
            .map(relation_identifiers)
            .unwrap_or_default()
    }

    pub fn older_versions(&self) -> &[Arc<Package>] {
        &self.older_versions
    }

    /// This package followed by every older version known for it
    pub fn all_versions(self: &Arc<Self>) -> Vec<Arc<Package>> {
        let mut versions = Vec::with_capacity(self.older_versions.len() + 1);
        versions.push(Arc::clone(self));
        versions.extend(self.older_versions.iter().cloned());
        versions
    }

    /// Find a specific version in this package's version chain
    pub fn version_of(self: &Arc<Self>, version: &str) -> Option<Arc<Package>> {
        self.all_versions()
            .into_iter()
            .find(|p| compare_versions(&p.version, version) == Ordering::Equal)
    }

    pub fn is_local(&self) -> bool {
        matches!(self.origin, Origin::Local { .. })
    }

    /// Archive path on disk, if the package has one
    pub fn local_archive(&self) -> Option<PathBuf> {
        self.local_archive.read().clone()
    }

    pub fn set_local_archive(&self, path: PathBuf) {
        *self.local_archive.write() = Some(path);
    }

    /// Index file the package was read from
    pub fn source_file(&self) -> Option<&Path> {
        match &self.origin {
            Origin::Repository { source_file, .. } => Some(source_file),
            _ => None,
        }
    }

    pub fn repo_url(&self) -> Option<&Url> {
        match &self.origin {
            Origin::Repository { repo_url, .. } => Some(repo_url),
            _ => None,
        }
    }

    /// Host of the repository the package came from
    pub fn origin_host(&self) -> Option<&str> {
        self.repo_url().and_then(|url| url.host_str())
    }

    /// dpkg status triple, for installed packages
    pub fn status(&self) -> Option<PackageStatus> {
        self.control("status").and_then(PackageStatus::parse)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Desired action recorded by dpkg (`Status:` first word)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Unknown,
    Install,
    Hold,
    Deinstall,
    Purge,
}

/// Error flag recorded by dpkg (`Status:` second word)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlag {
    Ok,
    ReinstReq,
}

/// Package state recorded by dpkg (`Status:` third word)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    NotInstalled,
    ConfigFiles,
    HalfInstalled,
    Unpacked,
    HalfConfigured,
    TriggersAwaited,
    TriggersPending,
    Installed,
}

/// Parsed `Status: want flag state` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageStatus {
    pub want: Want,
    pub flag: StatusFlag,
    pub state: InstallState,
}

impl PackageStatus {
    pub fn parse(status: &str) -> Option<Self> {
        let mut words = status.split_whitespace();

        let want = match words.next()? {
            "unknown" => Want::Unknown,
            "install" => Want::Install,
            "hold" => Want::Hold,
            "deinstall" => Want::Deinstall,
            "purge" => Want::Purge,
            _ => return None,
        };
        let flag = match words.next()? {
            "ok" => StatusFlag::Ok,
            "reinstreq" => StatusFlag::ReinstReq,
            _ => return None,
        };
        let state = match words.next()? {
            "not-installed" => InstallState::NotInstalled,
            "config-files" => InstallState::ConfigFiles,
            "half-installed" => InstallState::HalfInstalled,
            "unpacked" => InstallState::Unpacked,
            "half-configured" => InstallState::HalfConfigured,
            "triggers-awaited" => InstallState::TriggersAwaited,
            "triggers-pending" => InstallState::TriggersPending,
            "installed" => InstallState::Installed,
            _ => return None,
        };

        Some(Self { want, flag, state })
    }
}

/// Queue membership key for a package
///
/// Equality and hashing use only the package identifier: a queue holds at
/// most one entry per identifier, whatever its version or architecture.
#[derive(Debug, Clone)]
pub struct DownloadPackage {
    package: Arc<Package>,
}

impl DownloadPackage {
    pub fn new(package: Arc<Package>) -> Self {
        Self { package }
    }

    pub fn id(&self) -> &str {
        &self.package.id
    }

    pub fn package(&self) -> &Arc<Package> {
        &self.package
    }

    pub fn into_package(self) -> Arc<Package> {
        self.package
    }
}

impl PartialEq for DownloadPackage {
    fn eq(&self, other: &Self) -> bool {
        self.package.id == other.package.id
    }
}

impl Eq for DownloadPackage {}

impl Hash for DownloadPackage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.package.id.hash(state);
    }
}

impl From<Arc<Package>> for DownloadPackage {
    fn from(package: Arc<Package>) -> Self {
        Self::new(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn repo_origin() -> Origin {
        Origin::Repository {
            repo_url: Url::parse("https://repo.example.com/").unwrap(),
            source_file: PathBuf::from("/tmp/lists/repo.example.com_Packages"),
        }
    }

    #[test]
    fn test_from_control() {
        let pkg = Package::from_control(
            "Package: zsh\nVersion: 5.9-4\nArchitecture: amd64\nEssential: yes\nSize: 1024\nFilename: pool/z/zsh.deb\nSHA256: abc",
            repo_origin(),
        )
        .unwrap();

        assert_eq!(pkg.id, "zsh");
        assert_eq!(pkg.version, "5.9-4");
        assert!(pkg.essential);
        assert_eq!(pkg.size, Some(1024));
        assert_eq!(pkg.control("SHA256"), Some("abc"));
        assert_eq!(pkg.origin_host(), Some("repo.example.com"));
        assert!(pkg.local_archive().is_none());
    }

    #[test]
    fn test_missing_version_is_rejected() {
        let result = Package::from_control("Package: zsh\n", Origin::Installed);
        assert!(matches!(result, Err(Error::ParseError(_))));
    }

    #[test]
    fn test_invalid_size_is_rejected() {
        let result = Package::from_control("Package: a\nVersion: 1\nSize: big", Origin::Installed);
        assert!(result.is_err());
    }

    #[test]
    fn test_local_origin_sets_archive() {
        let pkg = Package::from_control(
            "Package: a\nVersion: 1",
            Origin::Local {
                path: PathBuf::from("/tmp/a.deb"),
            },
        )
        .unwrap();
        assert!(pkg.is_local());
        assert_eq!(pkg.local_archive(), Some(PathBuf::from("/tmp/a.deb")));
    }

    #[test]
    fn test_version_chain() {
        let old = Arc::new(Package::from_control("Package: a\nVersion: 1.0", repo_origin()).unwrap());
        let new = Arc::new(
            Package::from_control("Package: a\nVersion: 2.0", repo_origin())
                .unwrap()
                .with_older_versions(vec![old]),
        );

        assert_eq!(new.all_versions().len(), 2);
        assert_eq!(new.version_of("1.0").unwrap().version, "1.0");
        assert!(new.version_of("3.0").is_none());
    }

    #[test]
    fn test_status_parse() {
        let status = PackageStatus::parse("install reinstreq half-installed").unwrap();
        assert_eq!(status.want, Want::Install);
        assert_eq!(status.flag, StatusFlag::ReinstReq);
        assert_eq!(status.state, InstallState::HalfInstalled);
        assert!(PackageStatus::parse("install ok").is_none());
    }

    #[test]
    fn test_download_package_identity_is_identifier_only() {
        let a1 = Arc::new(Package::from_control("Package: a\nVersion: 1", repo_origin()).unwrap());
        let a2 = Arc::new(Package::from_control("Package: a\nVersion: 2", repo_origin()).unwrap());

        let mut set = HashSet::new();
        set.insert(DownloadPackage::new(a1));
        set.insert(DownloadPackage::new(a2));

        assert_eq!(set.len(), 1);
    }
}
