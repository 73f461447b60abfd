//! Command dispatch.
//!
//! Commands go straight to the open session or wait in the `CommandQueue`.
//! All writes serialize on the dispatch gate: the manager holds the gate
//! while it flips a session to open and flushes the queue, so a queued
//! command always reaches the device before any command typed afterwards.

use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backend::ConsoleBackend;
use crate::config::BurstConfig;
use crate::error::ConsoleError;
use crate::event::{ConsoleEvent, ConsoleEventKind, ConsoleEventSink};
use crate::lock_unpoisoned;
use crate::log_buffer::LogBuffer;
use crate::poller::{PollOutcome, Poller};
use crate::queue::CommandQueue;
use crate::scope::SessionScope;
use crate::types::{PendingCommand, SendOutcome, Session};

/// Everything needed to write into the currently open session.
#[derive(Clone)]
pub struct DispatchTarget {
    pub backend: Arc<dyn ConsoleBackend>,
    pub session: Session,
    pub poller: Arc<Poller>,
    pub buffer: Arc<Mutex<LogBuffer>>,
    pub scope: Arc<SessionScope>,
}

/// Proof that the dispatch gate is held.
pub struct DispatchGuard<'a> {
    _inner: tokio::sync::MutexGuard<'a, ()>,
}

/// Result of flushing the command queue into a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub requeued: usize,
    pub error: Option<ConsoleError>,
}

/// Result of one post-command poll burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BurstReport {
    pub attempts: u32,
    pub new_lines: usize,
    pub settled_early: bool,
}

pub struct Dispatcher {
    queue: Mutex<CommandQueue>,
    gate: tokio::sync::Mutex<()>,
    burst: BurstConfig,
    events: Arc<dyn ConsoleEventSink>,
    current_burst: Mutex<Option<AbortHandle>>,
}

impl Dispatcher {
    pub fn new(burst: BurstConfig, events: Arc<dyn ConsoleEventSink>) -> Self {
        Self {
            queue: Mutex::new(CommandQueue::new()),
            gate: tokio::sync::Mutex::new(()),
            burst,
            events,
            current_burst: Mutex::new(None),
        }
    }

    pub async fn lock(&self) -> DispatchGuard<'_> {
        DispatchGuard {
            _inner: self.gate.lock().await,
        }
    }

    pub fn pending(&self) -> Vec<PendingCommand> {
        lock_unpoisoned(&self.queue).pending()
    }

    pub fn queue_len(&self) -> usize {
        lock_unpoisoned(&self.queue).len()
    }

    pub fn clear_queue(&self) -> usize {
        lock_unpoisoned(&self.queue).clear()
    }

    /// Send `command` to `target`, or queue it when no session is open.
    ///
    /// A backlog left by an earlier failed flush goes out first; if it still
    /// cannot be delivered the new command joins the end of the queue.
    pub async fn submit(
        &self,
        gate: &DispatchGuard<'_>,
        target: Option<&DispatchTarget>,
        command: &str,
    ) -> Result<SendOutcome, ConsoleError> {
        let Some(target) = target else {
            return Ok(self.enqueue(command));
        };
        if self.queue_len() > 0 && self.flush(gate, target).await.error.is_some() {
            return Ok(self.enqueue(command));
        }
        self.dispatch(target, command).await?;
        Ok(SendOutcome::Accepted)
    }

    fn enqueue(&self, command: &str) -> SendOutcome {
        let (pending, position) = {
            let mut queue = lock_unpoisoned(&self.queue);
            let pending = queue.enqueue(command);
            (pending, queue.len())
        };
        debug!(queue_len = position, "command queued until a session opens");
        self.events.record(ConsoleEvent::new(
            None,
            None,
            ConsoleEventKind::CommandQueued {
                command: pending.text.clone(),
                queue_len: position,
            },
        ));
        SendOutcome::Queued {
            pending_id: pending.id,
            position,
        }
    }

    /// Send every queued command to `target`, oldest first. Stops at the
    /// first failure and puts the unsent remainder back at the front.
    pub async fn flush(&self, _gate: &DispatchGuard<'_>, target: &DispatchTarget) -> FlushReport {
        let pending = lock_unpoisoned(&self.queue).drain();
        if pending.is_empty() {
            return FlushReport::default();
        }
        info!(
            node_id = %target.session.node_id,
            count = pending.len(),
            "flushing queued commands"
        );

        let mut report = FlushReport::default();
        let mut remaining = pending.into_iter();
        while let Some(command) = remaining.next() {
            match self.dispatch(target, &command.text).await {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    warn!(
                        node_id = %target.session.node_id,
                        error = %err,
                        "queued command failed, keeping the rest queued"
                    );
                    let mut unsent = vec![command];
                    unsent.extend(remaining);
                    report.requeued = unsent.len();
                    lock_unpoisoned(&self.queue).requeue_front(unsent);
                    report.error = Some(err);
                    break;
                }
            }
        }
        report
    }

    async fn dispatch(&self, target: &DispatchTarget, command: &str) -> Result<(), ConsoleError> {
        if target.scope.is_cancelled() {
            return Err(ConsoleError::Cancelled {
                operation: "command send".into(),
            });
        }
        target.backend.send_command(&target.session, command).await?;
        if target.scope.is_cancelled() {
            // Delivered, but the session is gone; nothing left to echo into.
            return Ok(());
        }

        let echo = lock_unpoisoned(&target.buffer).push_command(command);
        self.emit(
            target,
            ConsoleEventKind::CommandSent {
                command: command.to_string(),
            },
        );
        self.emit(target, ConsoleEventKind::LogAppended { lines: vec![echo] });
        self.start_burst(target);
        Ok(())
    }

    /// Start a poll burst for the latest command, replacing any burst still
    /// running for an earlier one.
    fn start_burst(&self, target: &DispatchTarget) {
        let poller = target.poller.clone();
        let cfg = self.burst.clone();
        let handle = target.scope.spawn(async move {
            let report = run_burst(&poller, &cfg).await;
            debug!(
                node_id = %poller.session().node_id,
                attempts = report.attempts,
                new_lines = report.new_lines,
                settled_early = report.settled_early,
                "poll burst finished"
            );
        });
        if let Some(previous) = lock_unpoisoned(&self.current_burst).replace(handle) {
            previous.abort();
        }
    }

    fn emit(&self, target: &DispatchTarget, kind: ConsoleEventKind) {
        self.events.record(ConsoleEvent::new(
            Some(target.session.node_id.clone()),
            Some(target.session.session_id.clone()),
            kind,
        ));
    }
}

/// Extra polls after a command, spaced at the poller's current interval.
///
/// Ends after `max_polls` attempts, once new output shows up at or after
/// attempt `min_attempts`, or when polling stops. The early exit is a
/// heuristic for "the command probably finished"; slow commands simply
/// fall back to the steady cadence.
pub async fn run_burst(poller: &Poller, cfg: &BurstConfig) -> BurstReport {
    let mut report = BurstReport::default();
    while report.attempts < cfg.max_polls {
        if !poller.sleep_unless_cancelled(poller.current_interval()).await {
            break;
        }
        report.attempts += 1;
        match poller.poll_once().await {
            PollOutcome::Fetched { new_lines } => report.new_lines += new_lines,
            PollOutcome::Stopped => break,
            PollOutcome::Skipped(_) | PollOutcome::Failed => {}
        }
        if report.attempts >= cfg.min_attempts && report.new_lines > 0 {
            report.settled_early = report.attempts < cfg.max_polls;
            break;
        }
    }
    report
}
