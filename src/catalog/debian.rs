// src/catalog/debian.rs

//! Debian/Ubuntu index loading
//!
//! Reads Packages files (plain, `.gz` or `.xz`) and the dpkg `status`
//! database into package records.

use super::{Repository, normalize_repo_url};
use crate::error::{Error, Result};
use crate::packages::control::split_paragraphs;
use crate::packages::{InstallState, Origin, Package};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};
use url::Url;
use xz2::read::XzDecoder;

/// Read an index file, decompressing based on its extension
pub fn read_index(path: &Path) -> Result<String> {
    let file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut reader: Box<dyn Read> = match path.extension().and_then(|e| e.to_str()) {
        Some("gz") => Box::new(GzDecoder::new(file)),
        Some("xz") => Box::new(XzDecoder::new(file)),
        _ => Box::new(file),
    };

    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(|e| Error::ParseError(format!("Failed to read {}: {}", path.display(), e)))?;

    debug!("Read index {}: {} bytes", path.display(), content.len());
    Ok(content)
}

/// Parse Packages file content into records from one repository
///
/// Paragraphs without a package name or version are skipped with a warning.
pub fn parse_packages(content: &str, repo_url: &Url, source_file: &Path) -> Vec<Package> {
    let mut packages = Vec::new();

    for paragraph in split_paragraphs(content) {
        let origin = Origin::Repository {
            repo_url: repo_url.clone(),
            source_file: source_file.to_path_buf(),
        };
        match Package::from_control(paragraph, origin) {
            Ok(package) => packages.push(package),
            Err(e) => warn!("Skipping entry in {}: {}", source_file.display(), e),
        }
    }

    packages
}

/// Load a repository from its local Packages file
pub fn load_repository(name: &str, url: &str, packages_file: &Path) -> Result<Repository> {
    info!("Loading Debian repository {} from {}", name, packages_file.display());

    let url = Url::parse(url)
        .map_err(|e| Error::ParseError(format!("Invalid repository URL '{}': {}", url, e)))?;
    let url = normalize_repo_url(url);

    let content = read_index(packages_file)?;
    let packages = parse_packages(&content, &url, packages_file);

    info!("Parsed {} packages from {}", packages.len(), name);
    Ok(Repository::new(
        name.to_string(),
        url,
        packages_file.to_path_buf(),
        packages,
    ))
}

/// Load the dpkg status database
///
/// Entries dpkg only remembers (not installed, config files left) are dropped.
pub fn load_status(status_file: &Path) -> Result<Vec<Package>> {
    let content = read_index(status_file)?;

    let mut installed = Vec::new();
    for paragraph in split_paragraphs(&content) {
        let package = match Package::from_control(paragraph, Origin::Installed) {
            Ok(package) => package,
            Err(e) => {
                warn!("Skipping status entry: {}", e);
                continue;
            }
        };

        let present = package.status().is_some_and(|status| {
            !matches!(
                status.state,
                InstallState::NotInstalled | InstallState::ConfigFiles
            )
        });
        if present {
            installed.push(package);
        }
    }

    info!("Loaded {} installed packages", installed.len());
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const PACKAGES: &str = "\
Package: curl
Version: 8.5.0-2
Architecture: amd64
Depends: libc6 (>= 2.34), libcurl4 (= 8.5.0-2)
Filename: pool/main/c/curl/curl_8.5.0-2_amd64.deb
Size: 315000
SHA256: 0123abcd

Package: libcurl4
Version: 8.5.0-2
Architecture: amd64
Filename: pool/main/c/curl/libcurl4_8.5.0-2_amd64.deb
Size: 390000

Version: 1.0
Architecture: all
";

    #[test]
    fn test_parse_packages_skips_invalid_entries() {
        let url = Url::parse("https://deb.example.org/debian/").unwrap();
        let packages = parse_packages(PACKAGES, &url, Path::new("/tmp/Packages"));

        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].id, "curl");
        assert_eq!(packages[0].relation_ids("depends"), vec!["libc6", "libcurl4"]);
        assert_eq!(packages[1].size, Some(390000));
    }

    #[test]
    fn test_load_gzipped_repository() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deb.example.org_Packages.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(PACKAGES.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let repo = load_repository("example", "https://deb.example.org/debian", &path).unwrap();
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.url.as_str(), "https://deb.example.org/debian/");
        let curl = repo.package("curl").unwrap();
        assert_eq!(curl.repo_url(), Some(&repo.url));
    }

    #[test]
    fn test_load_status_filters_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        std::fs::write(
            &path,
            "Package: bash\nStatus: install ok installed\nVersion: 5.2-1\n\n\
             Package: old\nStatus: deinstall ok config-files\nVersion: 1\n\n\
             Package: broken\nStatus: install reinstreq half-installed\nVersion: 2\n",
        )
        .unwrap();

        let installed = load_status(&path).unwrap();
        let ids: Vec<_> = installed.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["bash", "broken"]);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Packages");
        std::fs::write(&path, PACKAGES).unwrap();
        assert!(matches!(
            load_repository("bad", "not a url", &path),
            Err(Error::ParseError(_))
        ));
    }
}
