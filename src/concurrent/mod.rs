// src/concurrent/mod.rs

//! Serial execution queues and the shared containers bound to them
//!
//! Every piece of shared registry state lives in a container bound to one
//! [`SerialQueue`]. Code already running on that queue touches the container
//! directly; code on any other thread goes through the queue, so all writes
//! to a container are applied in FIFO order.

mod containers;
mod serial;

pub use containers::{SafeMap, SafeSet, SafeVec};
pub use serial::SerialQueue;

use std::cell::Cell;

thread_local! {
    static MAIN_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Mark the calling thread as the interactive (UI) context
///
/// Blocking operations such as preflight staging and solver rechecks refuse to
/// run on a thread marked this way.
pub fn mark_main_context() {
    MAIN_CONTEXT.with(|flag| flag.set(true));
}

/// Whether the calling thread was marked with [`mark_main_context`]
pub fn is_main_context() -> bool {
    MAIN_CONTEXT.with(|flag| flag.get())
}

/// Abort if a blocking operation is attempted from the interactive context
pub fn ensure_background(operation: &str) {
    if is_main_context() {
        panic!("{operation} performs blocking I/O and must not run on the main context");
    }
}
