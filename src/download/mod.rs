// src/download/mod.rs

//! Download pipeline
//!
//! This module provides:
//! - The per-package `Download` record and its snapshot
//! - The transport seam and the reqwest-backed HTTP transport
//! - Archive verification and the canonical archive cache
//! - Per-repository download URL override providers
//! - `DownloadManager`, the public facade over queue, recheck and downloads

mod manager;
mod overrides;
mod pipeline;
mod transport;
mod verify;

pub use manager::{DownloadManager, DownloadManagerBuilder, QueueObserver};
pub use overrides::{DownloadOverrideProvider, OverrideDecision, OverrideToken};
pub use transport::{EventSink, HttpTransport, TransferEvent, TransferHandle, Transport};
pub use verify::{
    ArchiveCache, ArchiveMover, FsMover, HashAlgorithm, apt_encoded, verify_archive, verify_size,
};

use crate::packages::Package;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Observable state of one download
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadSnapshot {
    /// Fraction in `0.0..=1.0`
    pub progress: f64,
    pub total_bytes_written: u64,
    pub total_bytes_expected: Option<u64>,
    pub success: bool,
    /// Admitted by the dispatch loop; set once per record
    pub queued: bool,
    pub started: bool,
    /// A terminal result was recorded
    pub completed: bool,
    pub failure_reason: Option<String>,
    /// Transient transport message, e.g. while waiting for a connection
    pub message: Option<String>,
}

/// Download record for one package in one session
pub struct Download {
    package: Arc<Package>,
    session: u32,
    state: Mutex<DownloadSnapshot>,
    task: Mutex<Option<Box<dyn TransferHandle>>>,
}

impl Download {
    pub fn new(package: Arc<Package>, session: u32) -> Self {
        Self {
            package,
            session,
            state: Mutex::new(DownloadSnapshot::default()),
            task: Mutex::new(None),
        }
    }

    pub fn package(&self) -> &Arc<Package> {
        &self.package
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        self.state.lock().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut DownloadSnapshot) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Set the queued flag, returning false if it was already set
    pub fn mark_queued(&self) -> bool {
        let mut state = self.state.lock();
        if state.queued {
            return false;
        }
        state.queued = true;
        true
    }

    pub fn set_task(&self, task: Box<dyn TransferHandle>) {
        *self.task.lock() = Some(task);
    }

    /// Drop the transport handle once the transfer has finished
    pub fn clear_task(&self) {
        self.task.lock().take();
    }

    /// Ask the transport to stop; late events are still filtered by session
    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel();
        }
    }
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("package", &self.package.id)
            .field("session", &self.session)
            .field("state", &*self.state.lock())
            .finish()
    }
}
