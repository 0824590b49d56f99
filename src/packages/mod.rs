// src/packages/mod.rs

//! Package records
//!
//! This module provides the package model the queue works on: control
//! paragraph parsing, the `Package` record with its version chain and dpkg
//! status, and the identifier-keyed `DownloadPackage` used for queue
//! membership.

pub mod control;
mod package;

pub use package::{
    DownloadPackage, InstallState, Origin, Package, PackageStatus, StatusFlag, Want,
};
