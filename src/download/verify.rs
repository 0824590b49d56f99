// src/download/verify.rs

//! Archive verification and the archive cache

use crate::error::{Error, Result};
use crate::packages::Package;
use sha2::{Digest, Sha256, Sha512};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Digest algorithms accepted in package metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 2] = [HashAlgorithm::Sha256, HashAlgorithm::Sha512];

    /// Control field carrying this digest
    pub fn field(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Lowercase hex digest of a file
    pub fn digest_file(self, path: &Path) -> Result<String> {
        let mut file = File::open(path).map_err(|e| {
            Error::IoError(format!("Failed to open {} for hashing: {}", path.display(), e))
        })?;

        let digest = match self {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                io::copy(&mut file, &mut hasher)
                    .map_err(|e| Error::IoError(format!("Failed to read file for hashing: {}", e)))?;
                format!("{:x}", hasher.finalize())
            }
            HashAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                io::copy(&mut file, &mut hasher)
                    .map_err(|e| Error::IoError(format!("Failed to read file for hashing: {}", e)))?;
                format!("{:x}", hasher.finalize())
            }
        };
        Ok(digest)
    }
}

/// Digests declared in a package's control data
pub fn declared_hashes(package: &Package) -> Vec<(HashAlgorithm, String)> {
    HashAlgorithm::ALL
        .iter()
        .filter_map(|algorithm| {
            package
                .control(algorithm.field())
                .map(|digest| (*algorithm, digest.trim().to_ascii_lowercase()))
        })
        .collect()
}

/// Check every declared digest against a file
///
/// A package that declares no supported digest is untrusted.
pub fn verify_archive(package: &Package, path: &Path) -> Result<()> {
    let hashes = declared_hashes(package);
    if hashes.is_empty() {
        return Err(Error::UntrustedPackage(package.id.clone()));
    }

    for (algorithm, expected) in hashes {
        let actual = algorithm.digest_file(path)?;
        if actual != expected {
            return Err(Error::HashMismatch { expected, actual });
        }
        debug!("{} of {} verified", algorithm.field(), package.id);
    }

    Ok(())
}

/// Compare a download's size with the declared `Size`
///
/// Local archives and packages without a declared size are not checked.
pub fn verify_size(package: &Package, path: &Path) -> Result<()> {
    if package.is_local() {
        return Ok(());
    }
    let Some(expected) = package.size else {
        return Ok(());
    };

    let actual = fs::metadata(path)
        .map_err(|e| Error::IoError(format!("Failed to stat {}: {}", path.display(), e)))?
        .len();
    if actual != expected {
        return Err(Error::SizeMismatch { expected, actual });
    }
    Ok(())
}

/// Escape a filename component the way apt names cached archives
pub fn apt_encoded(value: &str, is_arch: bool) -> String {
    let encoded = value.replace('_', "%5f").replace(':', "%3a");
    if is_arch {
        encoded.replace('.', "%2e")
    } else {
        encoded
    }
}

/// Places verified archives into the cache directory
///
/// The destination may need elevated privileges, so this is pluggable.
pub trait ArchiveMover: Send + Sync {
    fn move_into_cache(&self, source: &Path, dest: &Path) -> Result<()>;
}

/// Plain filesystem move, copying when a rename is not possible
#[derive(Debug, Clone, Copy, Default)]
pub struct FsMover;

impl ArchiveMover for FsMover {
    fn move_into_cache(&self, source: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        if fs::rename(source, dest).is_ok() {
            return Ok(());
        }

        fs::copy(source, dest).map_err(|e| {
            Error::IoError(format!(
                "Failed to move {} to {}: {}",
                source.display(),
                dest.display(),
                e
            ))
        })?;
        fs::remove_file(source).map_err(|e| {
            Error::IoError(format!("Failed to remove {}: {}", source.display(), e))
        })?;
        Ok(())
    }
}

/// The canonical archive cache
#[derive(Clone)]
pub struct ArchiveCache {
    dir: PathBuf,
    mover: Arc<dyn ArchiveMover>,
}

impl ArchiveCache {
    pub fn new(dir: impl Into<PathBuf>, mover: Arc<dyn ArchiveMover>) -> Self {
        Self {
            dir: dir.into(),
            mover,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{id}_{version}_{arch}.deb` with apt escaping
    pub fn cache_path(&self, package: &Package) -> PathBuf {
        let name = format!(
            "{}_{}_{}.deb",
            apt_encoded(&package.id, false),
            apt_encoded(&package.version, false),
            apt_encoded(package.architecture.as_deref().unwrap_or_default(), true)
        );
        self.dir.join(name)
    }

    /// Move a file into the cache under the package's canonical name
    pub fn place(&self, package: &Package, source: &Path) -> Result<PathBuf> {
        let dest = self.cache_path(package);
        if source != dest {
            self.mover.move_into_cache(source, &dest)?;
        }
        info!("Cached {} at {}", package.id, dest.display());
        Ok(dest)
    }

    /// Whether the cache already holds a verified archive for the package
    pub fn has_verified(&self, package: &Package) -> bool {
        let dest = self.cache_path(package);
        dest.exists() && verify_archive(package, &dest).is_ok()
    }
}
