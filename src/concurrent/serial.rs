// src/concurrent/serial.rs

use crate::error::{Error, Result};
use crossbeam::channel::{self, Sender};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_QUEUE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// A named serial execution context backed by one worker thread
///
/// Jobs run one at a time in submission order. Clones share the same worker;
/// the worker exits once every clone is dropped and the backlog is drained.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    id: u64,
    label: String,
    sender: Sender<Job>,
}

impl SerialQueue {
    /// Spawn a new queue whose worker thread is named `label`
    pub fn new(label: &str) -> Result<Self> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = channel::unbounded::<Job>();

        let thread_label = label.to_string();
        thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                CURRENT_QUEUE.with(|current| current.set(Some(id)));
                for job in receiver.iter() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Job panicked on queue {}", thread_label);
                    }
                }
                debug!("Queue {} shut down", thread_label);
            })
            .map_err(|e| Error::InitError(format!("Failed to spawn queue {}: {}", label, e)))?;

        Ok(Self {
            inner: Arc::new(QueueInner {
                id,
                label: label.to_string(),
                sender,
            }),
        })
    }

    /// Queue label, also the worker thread's name
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the calling thread is this queue's worker
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == Some(self.inner.id))
    }

    /// Submit a job without waiting for it
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.sender.send(Box::new(job)).is_err() {
            error!("Queue {} is gone, dropping job", self.inner.label);
        }
    }

    /// Run `job` on the queue and wait for its result
    ///
    /// Runs inline when already on the queue, so nested calls never deadlock.
    pub fn dispatch_sync<F, R>(&self, job: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return job();
        }

        let (tx, rx) = channel::bounded(1);
        self.dispatch(move || {
            let _ = tx.send(job());
        });

        match rx.recv() {
            Ok(value) => value,
            Err(_) => panic!("job on queue {} did not complete", self.inner.label),
        }
    }

    /// Run `job` inline when on the queue, otherwise submit it asynchronously
    pub fn dispatch_or_run<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            job();
        } else {
            self.dispatch(job);
        }
    }

    /// Block until every job submitted before this call has run
    pub fn barrier(&self) {
        self.dispatch_sync(|| ());
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish()
    }
}
