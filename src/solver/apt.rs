// src/solver/apt.rs

//! apt-get simulation driver
//!
//! Runs `apt-get -s install` against the preflight staging directory and
//! parses the simulated `Inst`/`Remv` lines. Unmet dependencies are reported
//! as conflicts rather than as a failure.

use super::{Conflict, Solver, SolverOperation, SolverOutput};
use crate::config::SolverConfig;
use crate::error::{Error, Result};
use crate::packages::Package;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

/// Solver backed by `apt-get` in simulation mode
#[derive(Debug, Clone)]
pub struct AptSolver {
    binary: PathBuf,
    staging_dir: PathBuf,
    extra_args: Vec<String>,
}

impl AptSolver {
    pub fn new(config: &SolverConfig, staging_dir: &Path) -> Self {
        Self {
            binary: config.binary.clone(),
            staging_dir: staging_dir.to_path_buf(),
            extra_args: config.extra_args.clone(),
        }
    }

    /// Full argument list for one simulation run
    fn arguments(&self, install: &[Arc<Package>], remove: &[Arc<Package>]) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            "-q".to_string(),
            "-o".to_string(),
            format!("Dir::State::Lists={}", self.staging_dir.display()),
            "-o".to_string(),
            "Debug::NoLocking=1".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push("install".to_string());
        args.extend(install.iter().map(|p| format!("{}={}", p.id, p.version)));
        args.extend(remove.iter().map(|p| format!("{}-", p.id)));
        args
    }
}

impl Solver for AptSolver {
    fn operation_list(
        &self,
        install: &[Arc<Package>],
        remove: &[Arc<Package>],
    ) -> Result<SolverOutput> {
        let args = self.arguments(install, remove);
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .map_err(|e| {
                Error::SolverError(format!("Failed to run {}: {}", self.binary.display(), e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_simulation(&stdout)?;

        if !output.status.success() {
            if !parsed.conflicts.is_empty() {
                warn!("Solver reported {} conflicts", parsed.conflicts.len());
                return Ok(parsed);
            }
            return Err(Error::SolverError(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(
            "Solver returned {} operations, {} conflicts",
            parsed.operations.len(),
            parsed.conflicts.len()
        );
        Ok(parsed)
    }
}

/// Parse `apt-get -s` output
///
/// ```text
/// Inst libfoo [1.0] (1.2 repo.example.com [amd64])
/// Remv oldpkg [0.9]
///  app : Depends: libbar (>= 2) but it is not installable
/// ```
pub fn parse_simulation(stdout: &str) -> Result<SolverOutput> {
    let mut output = SolverOutput::default();
    let mut in_unmet = false;

    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Inst ") {
            output.operations.push(parse_inst(rest)?);
            in_unmet = false;
        } else if let Some(rest) = line.strip_prefix("Remv ") {
            output.operations.push(parse_remv(rest)?);
            in_unmet = false;
        } else if line.contains("have unmet dependencies") {
            in_unmet = true;
        } else if in_unmet && line.starts_with(' ') {
            parse_unmet_line(line, &mut output.conflicts);
        } else {
            in_unmet = false;
        }
    }

    Ok(output)
}

fn parse_inst(rest: &str) -> Result<SolverOperation> {
    let malformed = || Error::SolverError(format!("Malformed Inst line: {}", rest));

    let (package_id, remainder) = rest.split_once(' ').ok_or_else(malformed)?;
    let open = remainder.find('(').ok_or_else(malformed)?;
    let close = remainder.rfind(')').ok_or_else(malformed)?;
    if close <= open {
        return Err(malformed());
    }

    let inner = &remainder[open + 1..close];
    let (version, release) = match inner.split_once(' ') {
        Some((version, release)) => (version, Some(release.trim())),
        None => (inner, None),
    };
    if version.is_empty() {
        return Err(malformed());
    }

    Ok(SolverOperation::install(
        package_id,
        version,
        release.filter(|r| !r.is_empty()),
    ))
}

fn parse_remv(rest: &str) -> Result<SolverOperation> {
    let mut words = rest.split_whitespace();
    let package_id = words
        .next()
        .ok_or_else(|| Error::SolverError(format!("Malformed Remv line: {}", rest)))?;
    let version = words
        .next()
        .map(|v| v.trim_start_matches('[').trim_end_matches(']'))
        .unwrap_or_default();
    Ok(SolverOperation::remove(package_id, version))
}

/// ` pkg : Depends: x` starts a conflict; indented `Relation: y` continues it
fn parse_unmet_line(line: &str, conflicts: &mut Vec<Conflict>) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    if let Some((package_id, relation)) = trimmed.split_once(" : ") {
        conflicts.push(Conflict {
            package_id: package_id.trim().to_string(),
            relations: vec![relation.trim().to_string()],
        });
    } else if let Some(last) = conflicts.last_mut() {
        last.relations.push(trimmed.to_string());
    }
}
