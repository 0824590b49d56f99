// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Core error types for pkgqueue
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O errors with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Component initialization error
    #[error("Failed to initialize: {0}")]
    InitError(String),

    /// Malformed control data, solver output or configuration text
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Requested item does not exist
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Transport-level download failure
    #[error("Download failed: {0}")]
    DownloadError(String),

    /// Solver output could not be mapped back onto known packages
    #[error("Reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    /// The external solver failed or produced unusable output
    #[error("Solver failed: {0}")]
    SolverError(String),

    /// Writing staged control data for the solver failed
    #[error("Failed to stage dependency metadata in {path}: {source}")]
    PreflightError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No recognized digest, or a local archive that never reached the cache
    #[error("Package {0} is untrusted")]
    UntrustedPackage(String),

    /// Archive digest differs from the one declared in package metadata
    #[error("Hash mismatch: downloaded archive has {actual}, expected {expected}")]
    HashMismatch { expected: String, actual: String },

    /// Archive size differs from the one declared in package metadata
    #[error("Size mismatch: expected {expected} bytes, downloaded {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Result type alias using pkgqueue's Error type
pub type Result<T> = std::result::Result<T, Error>;
