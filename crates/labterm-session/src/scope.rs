//! Per-session task scope.
//!
//! Every background task that belongs to an open session (steady polling,
//! post-command bursts, link probes) is spawned through the session's
//! `SessionScope`. Cancelling the scope, or dropping it, stops all of them:
//! a task that is mid-await is aborted and a task that already finished its
//! remote call observes the token before touching shared state.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::lock_unpoisoned;

pub struct SessionScope {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for SessionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionScope {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a task bound to this scope. The task stops at its next await
    /// point once the scope is cancelled.
    pub fn spawn<F>(&self, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
        let abort = handle.abort_handle();

        let mut tasks = lock_unpoisoned(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        if self.token.is_cancelled() {
            handle.abort();
        } else {
            tasks.push(handle);
        }
        abort
    }

    /// Number of scope tasks that have not finished yet.
    pub fn live_tasks(&self) -> usize {
        lock_unpoisoned(&self.tasks)
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }

    pub fn cancel(&self) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *lock_unpoisoned(&self.tasks));
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        self.cancel();
    }
}
