//! Interactive device console sessions for lab nodes.
//!
//! `manager::ConsoleManager` is the entry point: it opens one console
//! session at a time against a `backend::ConsoleBackend`, polls the
//! device log into a deduplicated buffer, dispatches or queues typed
//! commands, and watches link quality. Everything user-visible is reported
//! through an `event::ConsoleEventSink`.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod log_buffer;
pub mod manager;
pub mod mock;
pub mod pacing;
pub mod poller;
pub mod quality;
pub mod queue;
pub mod rest;
pub mod scope;
pub mod session;
pub mod types;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
