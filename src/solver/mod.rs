// src/solver/mod.rs

//! External dependency solver
//!
//! The queue never resolves dependencies itself. It hands the requested
//! install and remove sets to a solver and maps the returned operation list
//! back onto known packages (see `reconcile`).

mod apt;

pub use apt::{AptSolver, parse_simulation};

use crate::error::Result;
use crate::packages::Package;
use serde::Serialize;
use std::sync::Arc;

/// Release annotation naming a locally supplied archive
pub const LOCAL_ARCHIVE_HOST: &str = "local-deb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Install,
    Remove,
}

/// One step of the solver's plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverOperation {
    pub package_id: String,
    pub version: String,
    pub kind: OperationType,
    /// Origin annotation, e.g. `"repo.example.com, local-deb [all]"`
    pub release: Option<String>,
}

impl SolverOperation {
    pub fn install(package_id: &str, version: &str, release: Option<&str>) -> Self {
        Self {
            package_id: package_id.to_string(),
            version: version.to_string(),
            kind: OperationType::Install,
            release: release.map(str::to_string),
        }
    }

    pub fn remove(package_id: &str, version: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            version: version.to_string(),
            kind: OperationType::Remove,
            release: None,
        }
    }

    /// Hosts named by the release annotation
    ///
    /// The annotation is a comma-separated list of origins, each optionally
    /// followed by labels; only the first word of each origin is the host.
    pub fn origin_hosts(&self) -> Vec<String> {
        let Some(release) = &self.release else {
            return Vec::new();
        };
        release
            .split(',')
            .filter_map(|origin| origin.split_whitespace().next())
            .filter(|host| !host.starts_with('['))
            .map(str::to_string)
            .collect()
    }
}

/// A package the solver could not satisfy, with the failing relations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Conflict {
    pub package_id: String,
    pub relations: Vec<String>,
}

/// Operation list and conflicts returned by a solver run
#[derive(Debug, Clone, Default)]
pub struct SolverOutput {
    pub operations: Vec<SolverOperation>,
    pub conflicts: Vec<Conflict>,
}

impl SolverOutput {
    pub fn installs(&self) -> impl Iterator<Item = &SolverOperation> {
        self.operations
            .iter()
            .filter(|op| op.kind == OperationType::Install)
    }

    pub fn removals(&self) -> impl Iterator<Item = &SolverOperation> {
        self.operations
            .iter()
            .filter(|op| op.kind == OperationType::Remove)
    }
}

/// Computes the concrete operation plan for requested installs and removals
pub trait Solver: Send + Sync {
    /// Fails with `Error::SolverError` when the tool cannot run or its
    /// output is unusable.
    fn operation_list(
        &self,
        install: &[Arc<Package>],
        remove: &[Arc<Package>],
    ) -> Result<SolverOutput>;
}
