// src/lib.rs

//! pkgqueue
//!
//! Package operation queue for apt-style package managers: tracks pending
//! install, upgrade and removal requests, stages dependency metadata for an
//! external solver, reconciles the solver's plan back onto known packages and
//! downloads the resulting archives with bounded parallelism and hash
//! verification.
//!
//! # Architecture
//!
//! - Serial queues: registry state is owned by one execution queue, with a
//!   reentrant fast path for code already running on it
//! - One queue per identifier: every package is in at most one of the five
//!   operation queues
//! - Session ids: cancelling bumps a counter, stale download callbacks are
//!   dropped
//! - Collaborators behind traits: catalog, solver, transport and archive
//!   placement are pluggable

pub mod catalog;
pub mod concurrent;
pub mod config;
pub mod download;
mod error;
pub mod packages;
pub mod preflight;
pub mod queue;
pub mod reconcile;
pub mod solver;
pub mod version;

pub use config::Config;
pub use download::DownloadManager;
pub use error::{Error, Result};
pub use queue::{AddOutcome, Queue};
