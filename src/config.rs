// src/config.rs

//! Configuration
//!
//! Every field has a default, so an empty (or missing) TOML file is a valid
//! configuration.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default number of simultaneous package downloads
pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 5;

/// Default timeout for HTTP requests (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Canonical archive cache verified downloads are moved into
    pub archive_dir: PathBuf,
    /// Directory holding the index files staged for the solver
    pub staging_dir: PathBuf,
    /// Scratch directory for in-flight downloads
    pub download_dir: PathBuf,
    pub max_parallel_downloads: usize,
    pub request_timeout_secs: u64,
    /// Hosts whose essential packages need approval before removal.
    /// Empty means every origin counts.
    pub essential_hosts: Vec<String>,
    pub solver: SolverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("/var/cache/apt/archives"),
            staging_dir: PathBuf::from("/var/lib/pkgqueue/lists"),
            download_dir: std::env::temp_dir().join("pkgqueue"),
            max_parallel_downloads: DEFAULT_MAX_PARALLEL_DOWNLOADS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            essential_hosts: Vec::new(),
            solver: SolverConfig::default(),
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("apt-get"),
            extra_args: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::ConfigError(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Load from `path` when given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_downloads == 0 {
            return Err(Error::ConfigError(
                "max_parallel_downloads must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
